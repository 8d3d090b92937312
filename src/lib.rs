//! # agent-governor
//!
//! Budget enforcement and reliable execution for LLM-backed agents.
//!
//! The crate combines two subsystems that every multi-tenant agent platform
//! ends up needing:
//!
//! - a **budget ledger** that gates calls against per-tenant daily/monthly
//!   cost, token and execution limits, with lazy period rollover over a
//!   pluggable atomic [`CounterStore`](store::CounterStore);
//! - a **retry/fallback executor** that walks an ordered list of backend
//!   candidates, consulting a per-(backend, tenant) circuit breaker and a
//!   failure classifier to decide between retrying, falling back and failing
//!   fast, all under a total deadline.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use agent_governor::{Billable, Governor, GovernorConfig, RunRequest};
//! use rust_decimal::Decimal;
//! use rust_decimal_macros::dec;
//!
//! struct Reply {
//!     text: String,
//!     cost: Decimal,
//!     tokens: u64,
//! }
//!
//! impl Billable for Reply {
//!     fn cost(&self) -> Decimal {
//!         self.cost
//!     }
//!     fn tokens(&self) -> u64 {
//!         self.tokens
//!     }
//! }
//!
//! # async fn example() -> agent_governor::Result<()> {
//! let governor = Governor::builder().config(GovernorConfig::default()).build()?;
//!
//! let request = RunRequest::new("chat", ["gpt-4o", "claude-sonnet-4-5"]).tenant("acme");
//! let outcome = governor
//!     .run(request, |ctx| async move {
//!         Ok(Reply {
//!             text: format!("answered by {}", ctx.backend),
//!             cost: dec!(0.02),
//!             tokens: 512,
//!         })
//!     })
//!     .await?;
//!
//! println!("{} after {} attempts", outcome.value.text, outcome.attempts_count());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod budget;
pub mod clock;
pub mod config;
pub mod events;
pub mod governor;
pub mod inheritance;
pub mod observability;
pub mod resilience;
pub mod store;

pub use budget::{
    BudgetLedger, BudgetPolicy, BudgetStatus, DimensionStatus, Enforcement, ExecutionRecord,
    ExecutionStatus, ExecutionStore, GLOBAL_TENANT, LedgerConfig, LimitDimension, LimitKind,
    MemoryExecutionStore, Period, ResolvedPolicy, Spend, Tenant, TenantIdentity, TenantRef,
    TenantRegistry, TenantUsage,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, ConfigLoader, GovernorConfig};
pub use events::{Event, EventCollector, EventKind, EventObserver, SharedObserver};
pub use governor::{Billable, Governor, GovernorBuilder, RunRequest};
pub use inheritance::{InheritedLimits, ParentScope, ScopeTracker};
pub use observability::{MetricsRegistry, MetricsSummary};
pub use resilience::{
    AttemptContext, AttemptOutcome, Backoff, BackoffKind, CandidateFailure, CircuitBreaker,
    CircuitConfig, CircuitRegistry, CircuitState, ExecutionPlan, FailureClass,
    FailureClassifier, Outcome, RetryAttempt, RetryFallbackExecutor, RetryPolicy,
};
pub use store::{CounterStore, MemoryCounterStore, StoreError};

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

/// Error type for agent-governor operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Backend returned an error response.
    #[error("API error (HTTP {status}): {message}", status = status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into()))]
    Api {
        message: String,
        status: Option<u16>,
        error_type: Option<String>,
    },

    /// Backend rate limit exceeded.
    #[error("Rate limit exceeded{}", match retry_after {
        Some(d) => format!(", retry in {:.0}s", d.as_secs_f64()),
        None => String::new(),
    })]
    RateLimit { retry_after: Option<Duration> },

    /// Transport-level failure talking to a backend.
    #[error("Network request failed: {0}")]
    Network(String),

    /// A single attempt exceeded its timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    /// Backend is temporarily overloaded.
    #[error("Model {model} is overloaded, try again later")]
    ModelOverloaded { model: String },

    /// Caller passed an argument the engine cannot work with.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A value had an unexpected shape or type.
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    /// A required operation is missing on a collaborator.
    #[error("Missing method: {0}")]
    MissingMethod(String),

    /// Feature not implemented by a collaborator.
    #[error("Not implemented: {0}")]
    NotImplemented(String),

    /// Caller-defined failure, classified by `kind`.
    #[error("{kind}: {message}")]
    Custom { kind: String, message: String },

    /// Hard-enforced budget limit breached.
    #[error("Budget exceeded for tenant '{tenant_id}': {dimension} at {current} (limit {limit})")]
    BudgetExceeded {
        tenant_id: String,
        dimension: budget::LimitDimension,
        limit: Decimal,
        current: Decimal,
    },

    /// Tenant exists but has been deactivated.
    #[error("Tenant '{0}' is inactive")]
    TenantInactive(String),

    /// Counter store could not be reached.
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// Candidate skipped because its circuit breaker is open.
    #[error("Circuit breaker open for backend '{backend}'")]
    CircuitOpen { backend: String },

    /// Every backend candidate was exhausted.
    #[error("All {} backend candidates failed after {attempts} attempts: {}", failures.len(), resilience::summarize_failures(failures))]
    AllModelsFailed {
        failures: Vec<resilience::CandidateFailure>,
        /// Invocations of the work closure, excluding skipped candidates.
        attempts: u32,
    },

    /// The total deadline passed before the next candidate or retry.
    #[error("Deadline {deadline} exceeded after {attempts} attempts")]
    TotalTimeout {
        deadline: DateTime<Utc>,
        attempts: u32,
    },

    /// Nested call has no cost budget left.
    #[error("Workflow cost budget exhausted: spent {spent} of {max_cost}")]
    WorkflowCostExceeded { max_cost: Decimal, spent: Decimal },

    /// Nested call has no time left.
    #[error("Workflow timeout exhausted: {:.1}s elapsed of {:.1}s", elapsed.as_secs_f64(), timeout.as_secs_f64())]
    WorkflowTimeoutExceeded { timeout: Duration, elapsed: Duration },

    /// Self-referential nesting went too deep.
    #[error("Recursion depth {depth} exceeds maximum {max}")]
    RecursionDepthExceeded { depth: u32, max: u32 },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization or deserialization failed.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Defects in the calling code; never retried or routed around.
    Programming,
    /// Rate limit, timeout, overload or 5xx; may succeed on retry.
    Transient,
    /// Non-transient backend failure.
    Backend,
    /// Budget, deadline and recursion guards.
    ResourceLimit,
    /// Counter store or configuration trouble.
    Infrastructure,
    /// Aggregate of exhausted candidates.
    Exhausted,
}

impl Error {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Error::Api {
            message: message.into(),
            status: Some(status),
            error_type: None,
        }
    }

    pub fn custom(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Custom {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Stable snake_case name of this error, used for classifier registration.
    pub fn kind(&self) -> &str {
        match self {
            Error::Api {
                error_type: Some(t),
                ..
            } => t,
            Error::Api { .. } => "api",
            Error::RateLimit { .. } => "rate_limit",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::ModelOverloaded { .. } => "overloaded",
            Error::InvalidArgument(_) => "invalid_argument",
            Error::TypeMismatch(_) => "type_mismatch",
            Error::MissingMethod(_) => "missing_method",
            Error::NotImplemented(_) => "not_implemented",
            Error::Custom { kind, .. } => kind,
            Error::BudgetExceeded { .. } => "budget_exceeded",
            Error::TenantInactive(_) => "tenant_inactive",
            Error::StoreUnavailable(_) => "store_unavailable",
            Error::CircuitOpen { .. } => "circuit_open",
            Error::AllModelsFailed { .. } => "all_models_failed",
            Error::TotalTimeout { .. } => "total_timeout",
            Error::WorkflowCostExceeded { .. } => "workflow_cost_exceeded",
            Error::WorkflowTimeoutExceeded { .. } => "workflow_timeout_exceeded",
            Error::RecursionDepthExceeded { .. } => "recursion_depth_exceeded",
            Error::Config(_) => "config",
            Error::Json(_) => "json",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::InvalidArgument(_)
            | Error::TypeMismatch(_)
            | Error::MissingMethod(_)
            | Error::NotImplemented(_) => ErrorCategory::Programming,

            Error::RateLimit { .. }
            | Error::Network(_)
            | Error::Timeout(_)
            | Error::ModelOverloaded { .. } => ErrorCategory::Transient,
            Error::Api {
                status: Some(408 | 429 | 500..=599),
                ..
            } => ErrorCategory::Transient,

            Error::Api { .. } | Error::Custom { .. } | Error::CircuitOpen { .. } => {
                ErrorCategory::Backend
            }

            Error::BudgetExceeded { .. }
            | Error::TenantInactive(_)
            | Error::TotalTimeout { .. }
            | Error::WorkflowCostExceeded { .. }
            | Error::WorkflowTimeoutExceeded { .. }
            | Error::RecursionDepthExceeded { .. } => ErrorCategory::ResourceLimit,

            Error::StoreUnavailable(_) | Error::Config(_) | Error::Json(_) => {
                ErrorCategory::Infrastructure
            }

            Error::AllModelsFailed { .. } => ErrorCategory::Exhausted,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_resource_limit(&self) -> bool {
        self.category() == ErrorCategory::ResourceLimit
    }

    pub fn is_programming_error(&self) -> bool {
        self.category() == ErrorCategory::Programming
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Api { status, .. } => *status,
            _ => None,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimit { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<store::StoreError> for Error {
    fn from(err: store::StoreError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        match err {
            config::ConfigError::Serialization(e) => Error::Json(e),
            other => Error::Config(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
