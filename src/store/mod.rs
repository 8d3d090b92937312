//! Atomic counter stores backing budget spend.
//!
//! Any key-value store with atomic increment semantics can implement
//! [`CounterStore`]. The in-memory backend serializes writers behind a lock;
//! the Redis backend relies on `INCRBYFLOAT` and `MULTI`/`EXEC`.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis_store;

pub use memory::MemoryCounterStore;
#[cfg(feature = "redis-backend")]
pub use redis_store::{RedisCounterStore, RedisStoreConfig};

use std::time::Duration;

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{message}")]
    Unavailable { message: String },

    #[error("Invalid counter value at {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait::async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &str;

    /// Add `amount` to the counter at `key`, returning the new value.
    async fn increment(&self, key: &str, amount: Decimal) -> StoreResult<Decimal>;

    /// Current value, or `None` when the key has never been written (or expired).
    async fn get(&self, key: &str) -> StoreResult<Option<Decimal>>;

    async fn reset(&self, key: &str) -> StoreResult<()>;

    async fn write(&self, key: &str, value: Decimal, ttl: Option<Duration>) -> StoreResult<()>;

    /// Apply several increments as one logical unit.
    ///
    /// `ttl` applies to keys created by this call.
    async fn increment_many(
        &self,
        entries: &[(String, Decimal)],
        ttl: Option<Duration>,
    ) -> StoreResult<()>;

    async fn read(&self, key: &str) -> StoreResult<Decimal> {
        Ok(self.get(key).await?.unwrap_or(Decimal::ZERO))
    }
}
