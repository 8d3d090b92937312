//! Retry and fallback across an ordered list of backend candidates.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::Instrument;

use super::backoff::Backoff;
use super::circuit::CircuitRegistry;
use super::classifier::{FailureClass, FailureClassifier};
use crate::budget::GLOBAL_TENANT;
use crate::clock::{self, SharedClock, SystemClock};
use crate::observability::{AttemptSpan, SharedMetrics};
use crate::{Error, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Retries of the same backend after the first attempt.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Bound on a single attempt, further clamped to the remaining deadline.
    pub attempt_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            attempt_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self {
            max_retries,
            backoff,
            attempt_timeout: None,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }
}

/// Candidates, deadline and retry policy for one call.
#[derive(Clone, Debug)]
pub struct ExecutionPlan {
    pub candidates: Vec<String>,
    pub tenant_id: String,
    pub deadline: Option<DateTime<Utc>>,
    /// Falls back to the executor's default policy when unset.
    pub retry: Option<RetryPolicy>,
}

impl ExecutionPlan {
    pub fn new<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            candidates: candidates.into_iter().map(Into::into).collect(),
            tenant_id: GLOBAL_TENANT.to_string(),
            deadline: None,
            retry: None,
        }
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = tenant_id.into();
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }
}

/// Passed to the work closure for every attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttemptContext {
    pub backend: String,
    pub tenant_id: String,
    /// 1-based attempt number against this backend.
    pub attempt: u32,
    /// Time the attempt may take, when bounded.
    pub timeout: Option<Duration>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success,
    RetryableFailure,
    NonRetryableFailure,
    SkippedCircuitOpen,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryAttempt {
    pub backend: String,
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub classification: Option<FailureClass>,
    /// Delay slept before this attempt.
    pub delay: Duration,
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct Outcome<T> {
    pub value: T,
    pub backend: String,
    pub attempts: Vec<RetryAttempt>,
}

impl<T> Outcome<T> {
    /// Invocations of the work closure, excluding skipped candidates.
    pub fn attempts_count(&self) -> u32 {
        self.attempts
            .iter()
            .filter(|a| a.outcome != AttemptOutcome::SkippedCircuitOpen)
            .count() as u32
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        Outcome {
            value: f(self.value),
            backend: self.backend,
            attempts: self.attempts,
        }
    }
}

/// Last error seen for one candidate.
#[derive(Debug)]
pub struct CandidateFailure {
    pub backend: String,
    pub error: Box<Error>,
}

pub(crate) fn summarize_failures(failures: &[CandidateFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.backend, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct RetryFallbackExecutor {
    circuits: Arc<CircuitRegistry>,
    classifier: FailureClassifier,
    clock: SharedClock,
    default_retry: RetryPolicy,
    metrics: Option<SharedMetrics>,
}

impl RetryFallbackExecutor {
    pub fn new(circuits: Arc<CircuitRegistry>) -> Self {
        Self {
            circuits,
            classifier: FailureClassifier::default(),
            clock: SystemClock::shared(),
            default_retry: RetryPolicy::default(),
            metrics: None,
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn classifier(&self) -> &FailureClassifier {
        &self.classifier
    }

    /// Run `work` against the plan's candidates in order.
    ///
    /// Non-fallback errors propagate unchanged after a single attempt. While
    /// another candidate remains, any other failure moves on to it; the last
    /// candidate retries transient failures with backoff. Sleeps never run
    /// past the deadline.
    pub async fn execute<T, F, Fut>(&self, plan: &ExecutionPlan, mut work: F) -> Result<Outcome<T>>
    where
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if plan.candidates.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one backend candidate is required".into(),
            ));
        }

        let retry = plan.retry.as_ref().unwrap_or(&self.default_retry);
        let tenant_id = plan.tenant_id.as_str();
        let mut attempts: Vec<RetryAttempt> = Vec::new();
        let mut failures: Vec<CandidateFailure> = Vec::with_capacity(plan.candidates.len());
        let mut invocations: u32 = 0;

        for (index, backend) in plan.candidates.iter().enumerate() {
            let has_fallback = index + 1 < plan.candidates.len();
            let mut attempt: u32 = 0;
            let mut delay = Duration::ZERO;
            let mut last_error: Option<Error> = None;

            loop {
                let remaining = clock::remaining(self.clock.as_ref(), plan.deadline);
                if let Some(deadline) = plan.deadline
                    && remaining == Some(Duration::ZERO)
                {
                    tracing::warn!(backend = %backend, tenant_id, invocations, "Deadline exceeded");
                    return Err(Error::TotalTimeout {
                        deadline,
                        attempts: invocations,
                    });
                }

                if !self.circuits.allow(backend, tenant_id).await {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_breaker_skip();
                    }
                    attempts.push(RetryAttempt {
                        backend: backend.clone(),
                        attempt: attempt + 1,
                        outcome: AttemptOutcome::SkippedCircuitOpen,
                        classification: None,
                        delay,
                        error: None,
                    });
                    let error = last_error.take().unwrap_or_else(|| Error::CircuitOpen {
                        backend: backend.clone(),
                    });
                    failures.push(CandidateFailure {
                        backend: backend.clone(),
                        error: Box::new(error),
                    });
                    break;
                }

                attempt += 1;
                invocations += 1;
                let timeout = match (retry.attempt_timeout, remaining) {
                    (Some(limit), Some(left)) => Some(limit.min(left)),
                    (limit, left) => limit.or(left),
                };
                let context = AttemptContext {
                    backend: backend.clone(),
                    tenant_id: tenant_id.to_string(),
                    attempt,
                    timeout,
                };

                let span = AttemptSpan::new(backend, attempt);
                let future = work(context).instrument(span.span().clone());
                let result = match retry.attempt_timeout.and(timeout) {
                    Some(limit) => match tokio::time::timeout(limit, future).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Timeout(limit)),
                    },
                    None => future.await,
                };
                let latency_ms = span.finish(result.is_ok());
                if let Some(metrics) = &self.metrics {
                    metrics.record_attempt(result.is_ok(), latency_ms);
                }

                let error = match result {
                    Ok(value) => {
                        self.circuits.record_success(backend, tenant_id).await;
                        attempts.push(RetryAttempt {
                            backend: backend.clone(),
                            attempt,
                            outcome: AttemptOutcome::Success,
                            classification: None,
                            delay,
                            error: None,
                        });
                        tracing::debug!(backend = %backend, attempt, invocations, "Attempt succeeded");
                        return Ok(Outcome {
                            value,
                            backend: backend.clone(),
                            attempts,
                        });
                    }
                    Err(error) => error,
                };

                self.circuits.record_failure(backend, tenant_id).await;
                let class = self.classifier.classify(&error, has_fallback);
                attempts.push(RetryAttempt {
                    backend: backend.clone(),
                    attempt,
                    outcome: if error.is_retryable() && class != FailureClass::NonFallback {
                        AttemptOutcome::RetryableFailure
                    } else {
                        AttemptOutcome::NonRetryableFailure
                    },
                    classification: Some(class),
                    delay,
                    error: Some(error.to_string()),
                });

                match class {
                    FailureClass::NonFallback => {
                        tracing::warn!(backend = %backend, attempt, error = %error, "Non-fallback error, propagating");
                        return Err(error);
                    }
                    FailureClass::Retryable if attempt <= retry.max_retries => {
                        let backoff = retry.backoff.delay_for(attempt);
                        let wanted = error.retry_after().map_or(backoff, |after| after.max(backoff));
                        let remaining = clock::remaining(self.clock.as_ref(), plan.deadline);
                        if let Some(deadline) = plan.deadline
                            && remaining == Some(Duration::ZERO)
                        {
                            return Err(Error::TotalTimeout {
                                deadline,
                                attempts: invocations,
                            });
                        }
                        delay = remaining.map_or(wanted, |left| wanted.min(left));

                        tracing::warn!(
                            backend = %backend,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying backend"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_retry();
                        }
                        last_error = Some(error);
                        self.clock.sleep(delay).await;
                    }
                    _ => {
                        if has_fallback {
                            tracing::info!(backend = %backend, attempt, error = %error, "Falling back to next candidate");
                            if let Some(metrics) = &self.metrics {
                                metrics.record_fallback();
                            }
                        } else {
                            tracing::warn!(backend = %backend, attempt, error = %error, "Last candidate failed");
                        }
                        failures.push(CandidateFailure {
                            backend: backend.clone(),
                            error: Box::new(error),
                        });
                        break;
                    }
                }
            }
        }

        tracing::warn!(tenant_id, invocations, "All backend candidates failed");
        Err(Error::AllModelsFailed {
            failures,
            attempts: invocations,
        })
    }
}

impl std::fmt::Debug for RetryFallbackExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryFallbackExecutor")
            .field("classifier", &self.classifier)
            .field("default_retry", &self.default_retry)
            .finish()
    }
}
