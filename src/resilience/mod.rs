//! Retry, fallback and circuit breaking around backend calls.

mod backoff;
mod circuit;
mod classifier;
mod executor;

pub use backoff::{Backoff, BackoffKind};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitRegistry, CircuitSnapshot, CircuitState};
pub use classifier::{DEFAULT_NON_FALLBACK_KINDS, FailureClass, FailureClassifier};
pub use executor::{
    AttemptContext, AttemptOutcome, CandidateFailure, ExecutionPlan, Outcome, RetryAttempt,
    RetryFallbackExecutor, RetryPolicy,
};

pub(crate) use executor::summarize_failures;
