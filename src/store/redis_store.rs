//! Redis counter store, shared across processes.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use rust_decimal::Decimal;

use super::{CounterStore, StoreError, StoreResult};

#[derive(Clone, Debug)]
pub struct RedisStoreConfig {
    pub key_prefix: String,
    pub connection_timeout: Duration,
    /// Maximum retry attempts for transient connection failures.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "governor:".to_string(),
            connection_timeout: Duration::from_secs(5),
            max_retries: 2,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
        }
    }
}

impl RedisStoreConfig {
    pub fn prefix(mut self, prefix: impl Into<String>) -> StoreResult<Self> {
        let prefix = prefix.into();
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
        {
            return Err(StoreError::Unavailable {
                message: format!(
                    "Invalid key prefix '{}': only ASCII alphanumeric, underscore, and colon allowed",
                    prefix
                ),
            });
        }
        self.key_prefix = prefix;
        Ok(self)
    }
}

pub struct RedisCounterStore {
    client: Arc<redis::Client>,
    config: RedisStoreConfig,
}

impl RedisCounterStore {
    pub fn new(redis_url: &str) -> Result<Self, redis::RedisError> {
        Self::from_config(redis_url, RedisStoreConfig::default())
    }

    pub fn from_config(redis_url: &str, config: RedisStoreConfig) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self {
            client: Arc::new(client),
            config,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        let mut attempt = 0;
        let mut backoff = self.config.initial_backoff;

        loop {
            let result = tokio::time::timeout(
                self.config.connection_timeout,
                self.client.get_multiplexed_async_connection(),
            )
            .await;

            let error = match result {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => unavailable(e),
                Err(_) => StoreError::Unavailable {
                    message: "connection timeout".into(),
                },
            };

            if attempt >= self.config.max_retries {
                return Err(error);
            }
            attempt += 1;
            tracing::warn!(attempt, error = %error, "Retrying counter store connection");
            let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
            tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }
}

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable {
        message: e.to_string(),
    }
}

fn parse(key: &str, raw: &str) -> StoreResult<Decimal> {
    Decimal::from_str(raw)
        .or_else(|_| Decimal::from_scientific(raw))
        .map_err(|_| StoreError::InvalidValue {
            key: key.to_string(),
            value: raw.to_string(),
        })
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn increment(&self, key: &str, amount: Decimal) -> StoreResult<Decimal> {
        let mut conn = self.connection().await?;
        let raw: String = redis::cmd("INCRBYFLOAT")
            .arg(self.key(key))
            .arg(amount.to_string())
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        parse(key, &raw)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Decimal>> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn.get(self.key(key)).await.map_err(unavailable)?;
        raw.map(|r| parse(key, &r)).transpose()
    }

    async fn reset(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.key(key))
            .await
            .map_err(unavailable)
    }

    async fn write(&self, key: &str, value: Decimal, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.key(key)).arg(value.to_string());
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        cmd.query_async::<()>(&mut conn).await.map_err(unavailable)
    }

    async fn increment_many(
        &self,
        entries: &[(String, Decimal)],
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.connection().await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        for (key, amount) in entries {
            let key = self.key(key);
            pipe.cmd("INCRBYFLOAT")
                .arg(&key)
                .arg(amount.to_string())
                .ignore();
            if let Some(ttl) = ttl {
                // NX: keep the expiry set when the key was created.
                pipe.cmd("PEXPIRE")
                    .arg(&key)
                    .arg(ttl.as_millis() as u64)
                    .arg("NX")
                    .ignore();
            }
        }

        pipe.query_async::<()>(&mut conn).await.map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_validation() {
        assert!(RedisStoreConfig::default().prefix("tenant_budget:").is_ok());
        assert!(RedisStoreConfig::default().prefix("bad prefix").is_err());
    }

    #[test]
    fn test_parse_redis_float_replies() {
        assert_eq!(parse("k", "10.5").unwrap(), Decimal::new(105, 1));
        assert_eq!(parse("k", "3").unwrap(), Decimal::from(3));
        assert!(parse("k", "nan-ish").is_err());
    }
}
