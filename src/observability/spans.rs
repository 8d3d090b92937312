//! Structured spans for governed executions.

use std::time::Instant;

use tracing::{Level, Span, field, span};

pub fn execute_span(tenant_id: &str, agent_type: &str, candidates: usize) -> Span {
    span!(
        Level::INFO,
        "governor.execute",
        tenant_id = tenant_id,
        agent_type = agent_type,
        candidates = candidates,
        otel.name = "governor.execute",
        backend = field::Empty,
        attempts = field::Empty,
    )
}

pub fn budget_check_span(tenant_id: &str, agent_type: &str) -> Span {
    span!(
        Level::DEBUG,
        "governor.budget_check",
        tenant_id = tenant_id,
        agent_type = agent_type,
        enforcement = field::Empty,
    )
}

/// Span for one attempt against one backend, with latency recorded on finish.
pub struct AttemptSpan {
    span: Span,
    start: Instant,
}

impl AttemptSpan {
    pub fn new(backend: &str, attempt: u32) -> Self {
        let span = span!(
            Level::DEBUG,
            "governor.attempt",
            backend = backend,
            attempt = attempt,
            otel.name = "governor.attempt",
            success = field::Empty,
            latency_ms = field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Records the outcome and returns the attempt latency in milliseconds.
    pub fn finish(self, success: bool) -> f64 {
        let latency_ms = self.start.elapsed().as_secs_f64() * 1000.0;
        self.span.record("success", success);
        self.span.record("latency_ms", latency_ms as u64);
        latency_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attempt_span_latency() {
        let span = AttemptSpan::new("gpt-4o", 1);
        let latency = span.finish(true);
        assert!(latency >= 0.0);
    }

    #[test]
    fn test_spans_build_without_subscriber() {
        let execute = execute_span("acme", "chat", 2);
        execute.record("backend", "gpt-4o");
        let _check = budget_check_span("acme", "chat");
    }
}
