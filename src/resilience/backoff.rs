//! Delay schedules between retries of the same backend.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `initial * factor^(attempt - 1)`
    #[default]
    Exponential,
    /// `initial * attempt`
    Linear,
    Constant,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(kind: BackoffKind, initial: Duration, max: Duration) -> Self {
        Self {
            kind,
            initial,
            max,
            factor: 2.0,
            jitter: 0.1,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::Exponential, initial, max)
    }

    pub fn linear(initial: Duration, max: Duration) -> Self {
        Self::new(BackoffKind::Linear, initial, max)
    }

    pub fn constant(delay: Duration) -> Self {
        Self::new(BackoffKind::Constant, delay, delay)
    }

    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor.max(1.0);
        self
    }

    /// Symmetric jitter as a fraction of the delay, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn kind(&self) -> BackoffKind {
        self.kind
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let initial = self.initial.as_millis() as f64;
        let base = match self.kind {
            BackoffKind::Exponential => initial * self.factor.powi(attempt as i32 - 1),
            BackoffKind::Linear => initial * attempt as f64,
            BackoffKind::Constant => initial,
        };
        let clamped = base.min(self.max.as_millis() as f64);

        let jittered = if self.jitter > 0.0 {
            let jitter_range = clamped * self.jitter;
            let jitter_offset = rand::random::<f64>() * jitter_range * 2.0 - jitter_range;
            (clamped + jitter_offset).max(0.0)
        } else {
            clamped
        };

        Duration::from_millis(jittered as u64)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(30))
    }
}
