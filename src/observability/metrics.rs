//! Atomic in-process metrics.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::budget::COST_SCALE_FACTOR;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram.
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<AtomicU64>,
    bucket_bounds: Vec<f64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    pub fn new(bucket_bounds: Vec<f64>) -> Self {
        let buckets = (0..=bucket_bounds.len())
            .map(|_| AtomicU64::new(0))
            .collect();
        Self {
            buckets,
            bucket_bounds,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn default_latency() -> Self {
        Self::new(vec![
            10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0, 30000.0,
        ])
    }

    pub fn observe(&self, value: f64) {
        let bucket_idx = self
            .bucket_bounds
            .iter()
            .position(|&bound| value <= bound)
            .unwrap_or(self.bucket_bounds.len());

        self.buckets[bucket_idx].fetch_add(1, Ordering::Relaxed);
        // Stored scaled by 1000 to keep sub-millisecond precision.
        self.sum
            .fetch_add((value.max(0.0) * 1000.0) as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Observations in the bucket at `index`; the last bucket is the overflow.
    pub fn bucket_count(&self, index: usize) -> u64 {
        self.buckets
            .get(index)
            .map(|b| b.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn sum_ms(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1000.0
    }
}

/// Counters for the ledger and the executor.
#[derive(Debug)]
pub struct MetricsRegistry {
    pub attempts_total: Counter,
    pub attempts_success: Counter,
    pub attempts_failed: Counter,
    pub retries: Counter,
    pub fallbacks: Counter,
    pub breaker_skips: Counter,
    pub breaker_opens: Counter,
    pub budget_checks: Counter,
    pub budget_blocks: Counter,
    pub budget_soft_caps: Counter,
    pub store_errors: Counter,
    pub spends_recorded: Counter,
    pub tokens_total: Counter,
    pub cost_total_micros: Counter,
    pub active_executions: Gauge,
    pub attempt_latency_ms: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            attempts_total: Counter::new(),
            attempts_success: Counter::new(),
            attempts_failed: Counter::new(),
            retries: Counter::new(),
            fallbacks: Counter::new(),
            breaker_skips: Counter::new(),
            breaker_opens: Counter::new(),
            budget_checks: Counter::new(),
            budget_blocks: Counter::new(),
            budget_soft_caps: Counter::new(),
            store_errors: Counter::new(),
            spends_recorded: Counter::new(),
            tokens_total: Counter::new(),
            cost_total_micros: Counter::new(),
            active_executions: Gauge::new(),
            attempt_latency_ms: Histogram::default_latency(),
        }
    }

    pub fn record_execution_start(&self) {
        self.active_executions.inc();
    }

    pub fn record_execution_end(&self) {
        self.active_executions.dec();
    }

    pub fn record_attempt(&self, success: bool, latency_ms: f64) {
        self.attempts_total.inc();
        self.attempt_latency_ms.observe(latency_ms);
        if success {
            self.attempts_success.inc();
        } else {
            self.attempts_failed.inc();
        }
    }

    pub fn record_retry(&self) {
        self.retries.inc();
    }

    pub fn record_fallback(&self) {
        self.fallbacks.inc();
    }

    pub fn record_breaker_skip(&self) {
        self.breaker_skips.inc();
    }

    pub fn record_breaker_open(&self) {
        self.breaker_opens.inc();
    }

    pub fn record_budget_check(&self, blocked: bool) {
        self.budget_checks.inc();
        if blocked {
            self.budget_blocks.inc();
        }
    }

    pub fn record_soft_cap(&self) {
        self.budget_soft_caps.inc();
    }

    pub fn record_store_error(&self) {
        self.store_errors.inc();
    }

    pub fn record_spend(&self, cost: Decimal, tokens: u64) {
        self.spends_recorded.inc();
        self.tokens_total.add(tokens);
        let micros = (cost * COST_SCALE_FACTOR)
            .trunc()
            .to_u64()
            .unwrap_or(0);
        self.cost_total_micros.add(micros);
    }

    pub fn total_cost(&self) -> Decimal {
        Decimal::from(self.cost_total_micros.get()) / COST_SCALE_FACTOR
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time snapshot of a [`MetricsRegistry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSummary {
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub failed_attempts: u64,
    pub retries: u64,
    pub fallbacks: u64,
    pub breaker_skips: u64,
    pub breaker_opens: u64,
    pub budget_checks: u64,
    pub budget_blocks: u64,
    pub budget_soft_caps: u64,
    pub store_errors: u64,
    pub spends_recorded: u64,
    pub total_tokens: u64,
    pub total_cost: Decimal,
    pub avg_attempt_latency_ms: f64,
}

impl MetricsSummary {
    pub fn from_registry(registry: &MetricsRegistry) -> Self {
        let count = registry.attempt_latency_ms.count();
        let avg_latency = if count > 0 {
            registry.attempt_latency_ms.sum_ms() / count as f64
        } else {
            0.0
        };

        Self {
            total_attempts: registry.attempts_total.get(),
            successful_attempts: registry.attempts_success.get(),
            failed_attempts: registry.attempts_failed.get(),
            retries: registry.retries.get(),
            fallbacks: registry.fallbacks.get(),
            breaker_skips: registry.breaker_skips.get(),
            breaker_opens: registry.breaker_opens.get(),
            budget_checks: registry.budget_checks.get(),
            budget_blocks: registry.budget_blocks.get(),
            budget_soft_caps: registry.budget_soft_caps.get(),
            store_errors: registry.store_errors.get(),
            spends_recorded: registry.spends_recorded.get(),
            total_tokens: registry.tokens_total.get(),
            total_cost: registry.total_cost(),
            avg_attempt_latency_ms: avg_latency,
        }
    }
}
