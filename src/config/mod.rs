//! Layered configuration for the governor.
//!
//! ```rust,no_run
//! use agent_governor::ConfigLoader;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigLoader::new()
//!     .env()
//!     .file("governor.json")
//!     .load()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod source;

pub use source::{ConfigLoader, ConfigSource, EnvConfigSource, FileConfigSource, MemoryConfigSource};

use std::collections::HashMap;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{BudgetPolicy, LedgerConfig};
use crate::resilience::{Backoff, BackoffKind, CircuitConfig, FailureClassifier, RetryPolicy};

/// Errors that can occur while loading configuration
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A source failed to produce its layer
    #[error("Source '{provider}' failed: {message}")]
    Source { provider: String, message: String },

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

impl ConfigError {
    fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffKind,
    pub jitter: f64,
    pub attempt_timeout_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff: BackoffKind::Exponential,
            jitter: 0.1,
            attempt_timeout_ms: None,
        }
    }
}

impl RetrySettings {
    pub fn to_policy(&self) -> RetryPolicy {
        let backoff = Backoff::new(
            self.backoff,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_jitter(self.jitter);
        let policy = RetryPolicy::new(self.max_retries, backoff);
        match self.attempt_timeout_ms {
            Some(ms) => policy.with_attempt_timeout(Duration::from_millis(ms)),
            None => policy,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub cooldown_ms: u64,
    pub half_open_probe_limit: u32,
    pub failure_window_ms: Option<u64>,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        let defaults = CircuitConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            cooldown_ms: defaults.cooldown.as_millis() as u64,
            half_open_probe_limit: defaults.half_open_probe_limit,
            failure_window_ms: defaults.failure_window.map(|w| w.as_millis() as u64),
        }
    }
}

impl CircuitSettings {
    pub fn to_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_millis(self.cooldown_ms),
            half_open_probe_limit: self.half_open_probe_limit,
            failure_window: self.failure_window_ms.map(Duration::from_millis),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalySettings {
    pub cost_threshold: Option<Decimal>,
    pub token_threshold: Option<u64>,
}

/// Everything the governor reads from configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Global budget policy, the base layer for every tenant.
    pub budget: BudgetPolicy,
    pub tenants: HashMap<String, BudgetPolicy>,
    pub retry: RetrySettings,
    pub circuit: CircuitSettings,
    /// Error kinds added to the built-in non-fallback set.
    pub non_fallback_kinds: Vec<String>,
    /// Appended to every request's candidates, in priority order.
    pub fallback_backends: Vec<String>,
    pub anomaly: AnomalySettings,
    pub key_prefix: String,
    pub counter_ttl_days: Option<u32>,
    pub fail_closed_on_store_error: bool,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            budget: BudgetPolicy::default(),
            tenants: HashMap::new(),
            retry: RetrySettings::default(),
            circuit: CircuitSettings::default(),
            non_fallback_kinds: Vec::new(),
            fallback_backends: Vec::new(),
            anomaly: AnomalySettings::default(),
            key_prefix: "budget".into(),
            counter_ttl_days: Some(35),
            fail_closed_on_store_error: true,
        }
    }
}

impl GovernorConfig {
    pub fn from_json(json: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if let Err(message) = self.budget.validate() {
            errors.push(ConfigError::invalid("budget", message));
        }
        for (tenant_id, policy) in &self.tenants {
            if tenant_id.trim().is_empty() {
                errors.push(ConfigError::invalid("tenants", "tenant id must not be empty"));
            }
            if let Err(message) = policy.validate() {
                errors.push(ConfigError::invalid(format!("tenants.{tenant_id}"), message));
            }
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            errors.push(ConfigError::invalid(
                "retry.max_delay_ms",
                "must be at least retry.base_delay_ms",
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            errors.push(ConfigError::invalid("retry.jitter", "must be between 0.0 and 1.0"));
        }
        if self.retry.attempt_timeout_ms == Some(0) {
            errors.push(ConfigError::invalid("retry.attempt_timeout_ms", "must be > 0"));
        }

        if self.circuit.failure_threshold == 0 {
            errors.push(ConfigError::invalid("circuit.failure_threshold", "must be > 0"));
        }
        if self.circuit.half_open_probe_limit == 0 {
            errors.push(ConfigError::invalid("circuit.half_open_probe_limit", "must be > 0"));
        }
        if self.circuit.failure_window_ms == Some(0) {
            errors.push(ConfigError::invalid("circuit.failure_window_ms", "must be > 0"));
        }

        if self
            .anomaly
            .cost_threshold
            .is_some_and(|t| t <= Decimal::ZERO)
        {
            errors.push(ConfigError::invalid("anomaly.cost_threshold", "must be > 0"));
        }
        if self.anomaly.token_threshold == Some(0) {
            errors.push(ConfigError::invalid("anomaly.token_threshold", "must be > 0"));
        }
        if self.key_prefix.trim().is_empty() {
            errors.push(ConfigError::invalid("key_prefix", "must not be empty"));
        }
        if self.fallback_backends.iter().any(|b| b.trim().is_empty()) {
            errors.push(ConfigError::invalid(
                "fallback_backends",
                "backend ids must not be empty",
            ));
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }

    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            key_prefix: self.key_prefix.clone(),
            counter_ttl: self
                .counter_ttl_days
                .map(|days| Duration::from_secs(u64::from(days) * 24 * 60 * 60)),
            fail_closed_on_store_error: self.fail_closed_on_store_error,
            anomaly_cost_threshold: self.anomaly.cost_threshold,
            anomaly_token_threshold: self.anomaly.token_threshold,
        }
    }

    pub fn classifier(&self) -> FailureClassifier {
        FailureClassifier::new().with_non_fallback(self.non_fallback_kinds.iter().cloned())
    }

    /// `primary` followed by the configured fallbacks it does not already name.
    pub fn with_fallbacks(&self, primary: &[String]) -> Vec<String> {
        let mut candidates = primary.to_vec();
        for backend in &self.fallback_backends {
            if !candidates.contains(backend) {
                candidates.push(backend.clone());
            }
        }
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::Enforcement;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults_are_valid() {
        let config = GovernorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.to_policy().max_retries, 3);
        assert_eq!(config.circuit.to_config(), CircuitConfig::default());
        assert_eq!(
            config.ledger_config().counter_ttl,
            Some(Duration::from_secs(35 * 86_400))
        );
    }

    #[test]
    fn test_from_json() {
        let config = GovernorConfig::from_json(
            r#"{
                "budget": {"daily_limit": "10.00", "enforcement": "hard"},
                "tenants": {"acme": {"daily_limit": 5, "per_agent_daily": {"chat": "1.5"}}},
                "retry": {"max_retries": 2, "backoff": "linear", "attempt_timeout_ms": 2000},
                "circuit": {"failure_threshold": 3, "cooldown_ms": 10000},
                "non_fallback_kinds": ["schema_violation"],
                "fallback_backends": ["claude-haiku"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.budget.daily_limit, Some(dec!(10.00)));
        assert_eq!(config.budget.enforcement, Some(Enforcement::Hard));
        assert_eq!(config.tenants["acme"].daily_limit, Some(dec!(5)));
        assert_eq!(config.tenants["acme"].per_agent_daily["chat"], dec!(1.5));

        let retry = config.retry.to_policy();
        assert_eq!(retry.max_retries, 2);
        assert_eq!(retry.backoff.kind(), BackoffKind::Linear);
        assert_eq!(retry.attempt_timeout, Some(Duration::from_secs(2)));

        assert_eq!(config.circuit.to_config().cooldown, Duration::from_secs(10));
        assert_eq!(config.circuit.half_open_probe_limit, 1);
        assert!(
            config
                .classifier()
                .non_fallback_kinds()
                .any(|k| k == "schema_violation")
        );
    }

    #[test]
    fn test_unknown_enforcement_rejected() {
        let result = GovernorConfig::from_json(r#"{"budget": {"enforcement": "strict"}}"#);
        assert!(matches!(result, Err(ConfigError::Serialization(_))));
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = GovernorConfig::default();
        config.circuit.failure_threshold = 0;
        config.retry.jitter = 2.0;
        config.budget.daily_limit = Some(dec!(-1));

        match config.validate() {
            Err(ConfigError::ValidationErrors(errors)) => assert_eq!(errors.0.len(), 3),
            other => panic!("expected validation errors, got {other:?}"),
        }
    }

    #[test]
    fn test_fallback_candidates_deduplicated() {
        let config = GovernorConfig {
            fallback_backends: vec!["b".into(), "c".into()],
            ..Default::default()
        };
        assert_eq!(
            config.with_fallbacks(&["a".into(), "b".into()]),
            vec!["a", "b", "c"]
        );
    }
}
