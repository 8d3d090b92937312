//! Metrics and tracing spans.
//!
//! The crate only emits `tracing` events and spans; installing a subscriber
//! is left to the host application.

mod metrics;
mod spans;

pub use metrics::{Counter, Gauge, Histogram, MetricsRegistry, MetricsSummary};
pub use spans::{AttemptSpan, budget_check_span, execute_span};

use std::sync::Arc;

pub type SharedMetrics = Arc<MetricsRegistry>;
