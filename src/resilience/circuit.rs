//! Circuit breaker implementation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use crate::budget::GLOBAL_TENANT;
use crate::clock::{SharedClock, SystemClock};
use crate::events::{self, Event, EventKind, SharedObserver};
use crate::observability::SharedMetrics;
use crate::store::{CounterStore, StoreResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    /// Time spent open before a probe is allowed.
    pub cooldown: Duration,
    pub half_open_probe_limit: u32,
    /// Count only failures within this window. `None` counts consecutive
    /// failures until the next success.
    pub failure_window: Option<Duration>,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
            half_open_probe_limit: 1,
            failure_window: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub half_open_probe_count: u32,
}

pub struct CircuitBreaker {
    config: CircuitConfig,
    clock: SharedClock,
    state: RwLock<CircuitState>,
    failure_count: AtomicU32,
    failure_times: Mutex<VecDeque<u64>>,
    opened_at_ms: AtomicU64,
    half_open_probes: AtomicU32,
    probe_claimed_at_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, SystemClock::shared())
    }

    pub fn with_clock(config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            state: RwLock::new(CircuitState::Closed),
            failure_count: AtomicU32::new(0),
            failure_times: Mutex::new(VecDeque::new()),
            opened_at_ms: AtomicU64::new(0),
            half_open_probes: AtomicU32::new(0),
            probe_claimed_at_ms: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether an attempt may proceed.
    ///
    /// Once the cooldown has elapsed the breaker moves to half-open and at
    /// most `half_open_probe_limit` concurrent callers are admitted.
    pub fn allow(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let opened_at = self.opened_at_ms.load(Ordering::Acquire);
                let elapsed =
                    Duration::from_millis(self.clock.now_millis().saturating_sub(opened_at));
                if elapsed < self.config.cooldown {
                    return false;
                }
                self.transition_to_half_open();
                self.claim_probe()
            }
            CircuitState::HalfOpen => self.claim_probe(),
        }
    }

    fn claim_probe(&self) -> bool {
        let limit = self.config.half_open_probe_limit.max(1);
        loop {
            if self.state() != CircuitState::HalfOpen {
                return false;
            }
            let current = self.half_open_probes.load(Ordering::Acquire);
            if current >= limit {
                return self.reclaim_stale_probe();
            }
            if self
                .half_open_probes
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                self.probe_claimed_at_ms
                    .store(self.clock.now_millis(), Ordering::Release);
                return true;
            }
        }
    }

    /// A half-open slot whose caller never reported back, e.g. because its
    /// future was dropped, is freed one cooldown after the last claim.
    fn reclaim_stale_probe(&self) -> bool {
        let claimed_at = self.probe_claimed_at_ms.load(Ordering::Acquire);
        let now = self.clock.now_millis();
        if Duration::from_millis(now.saturating_sub(claimed_at)) < self.config.cooldown {
            return false;
        }
        let reclaimed = self
            .probe_claimed_at_ms
            .compare_exchange(claimed_at, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if reclaimed {
            tracing::warn!("Reclaiming unreported half-open slot");
        }
        reclaimed
    }

    /// Returns the new state when this call changed it.
    pub fn record_success(&self) -> Option<CircuitState> {
        match self.state() {
            CircuitState::Closed => {
                self.clear_failures();
                None
            }
            CircuitState::HalfOpen => self.transition_to_closed().then_some(CircuitState::Closed),
            CircuitState::Open => None,
        }
    }

    /// Returns the new state when this call changed it.
    pub fn record_failure(&self) -> Option<CircuitState> {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.count_failure();
                if failures >= self.config.failure_threshold {
                    self.transition_to_open().then_some(CircuitState::Open)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => self.transition_to_open().then_some(CircuitState::Open),
            CircuitState::Open => None,
        }
    }

    fn count_failure(&self) -> u32 {
        let Some(window) = self.config.failure_window else {
            return self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
        };

        let now = self.clock.now_millis();
        let horizon = now.saturating_sub(window.as_millis() as u64);
        let mut times = self
            .failure_times
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        times.push_back(now);
        while times.front().is_some_and(|&t| t < horizon) {
            times.pop_front();
        }
        let count = times.len() as u32;
        self.failure_count.store(count, Ordering::Release);
        count
    }

    fn clear_failures(&self) {
        self.failure_count.store(0, Ordering::Release);
        self.failure_times
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn transition_to_open(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == CircuitState::Open {
            return false;
        }
        // Reopening from half-open restarts the cooldown.
        *state = CircuitState::Open;
        self.opened_at_ms
            .store(self.clock.now_millis(), Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        true
    }

    fn transition_to_half_open(&self) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state == CircuitState::Open {
            *state = CircuitState::HalfOpen;
            self.half_open_probes.store(0, Ordering::Release);
            self.probe_claimed_at_ms
                .store(self.clock.now_millis(), Ordering::Release);
            tracing::info!("Circuit breaker half-open");
        }
    }

    fn sync_failure_count(&self, count: u32) {
        self.failure_count.store(count, Ordering::Release);
    }

    /// Open a closed breaker regardless of its own failure count.
    pub fn trip(&self) -> bool {
        self.open_since(self.clock.now_millis())
    }

    /// Adopt an opening observed elsewhere; a no-op unless currently closed.
    fn open_since(&self, opened_at_ms: u64) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        if *state != CircuitState::Closed {
            return false;
        }
        *state = CircuitState::Open;
        self.opened_at_ms.store(opened_at_ms, Ordering::Release);
        self.half_open_probes.store(0, Ordering::Release);
        true
    }

    fn transition_to_closed(&self) -> bool {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        let changed = *state != CircuitState::Closed;
        *state = CircuitState::Closed;
        self.clear_failures();
        self.half_open_probes.store(0, Ordering::Release);
        changed
    }

    pub fn reset(&self) {
        self.transition_to_closed();
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state();
        let opened_at = match state {
            CircuitState::Closed => None,
            _ => Utc
                .timestamp_millis_opt(self.opened_at_ms.load(Ordering::Acquire) as i64)
                .single(),
        };
        CircuitSnapshot {
            state,
            failure_count: self.failure_count(),
            opened_at,
            half_open_probe_count: self.half_open_probes.load(Ordering::Acquire),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

/// Breaker state mirrored into a [`CounterStore`], so processes sharing the
/// store see each other's failures and openings.
///
/// Keys: `{prefix}:{backend}:{tenant}:failures` and `...:opened_at` (epoch
/// millis). With a failure window the shared count is a fixed window starting
/// at the first failure. Half-open trial calls are still admitted per process.
struct SharedCircuitState {
    store: Arc<dyn CounterStore>,
    prefix: String,
}

impl SharedCircuitState {
    fn failures_key(&self, backend: &str, tenant_id: &str) -> String {
        format!("{}:{}:{}:failures", self.prefix, backend, tenant_id)
    }

    fn opened_at_key(&self, backend: &str, tenant_id: &str) -> String {
        format!("{}:{}:{}:opened_at", self.prefix, backend, tenant_id)
    }

    async fn opened_at(&self, backend: &str, tenant_id: &str) -> StoreResult<Option<u64>> {
        let value = self
            .store
            .get(&self.opened_at_key(backend, tenant_id))
            .await?;
        Ok(value.and_then(|v| v.to_u64()))
    }

    async fn add_failure(
        &self,
        backend: &str,
        tenant_id: &str,
        window: Option<Duration>,
    ) -> StoreResult<u32> {
        let key = self.failures_key(backend, tenant_id);
        let count = match window {
            None => self.store.increment(&key, Decimal::ONE).await?,
            Some(window) => {
                self.store
                    .increment_many(&[(key.clone(), Decimal::ONE)], Some(window))
                    .await?;
                self.store.read(&key).await?
            }
        };
        Ok(count.to_u32().unwrap_or(u32::MAX))
    }

    async fn mark_open(&self, backend: &str, tenant_id: &str, at_ms: u64) -> StoreResult<()> {
        self.store
            .write(&self.opened_at_key(backend, tenant_id), Decimal::from(at_ms), None)
            .await?;
        self.store
            .reset(&self.failures_key(backend, tenant_id))
            .await
    }

    async fn clear_failures(&self, backend: &str, tenant_id: &str) -> StoreResult<()> {
        self.store
            .reset(&self.failures_key(backend, tenant_id))
            .await
    }

    async fn clear(&self, backend: &str, tenant_id: &str) -> StoreResult<()> {
        self.store
            .reset(&self.opened_at_key(backend, tenant_id))
            .await?;
        self.clear_failures(backend, tenant_id).await
    }
}

/// Lazily created breakers keyed by (backend, tenant).
pub struct CircuitRegistry {
    default_config: CircuitConfig,
    backend_configs: DashMap<String, CircuitConfig>,
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    shared: Option<SharedCircuitState>,
    clock: SharedClock,
    observer: Option<SharedObserver>,
    metrics: Option<SharedMetrics>,
}

impl CircuitRegistry {
    pub fn new(default_config: CircuitConfig) -> Self {
        Self {
            default_config,
            backend_configs: DashMap::new(),
            breakers: DashMap::new(),
            shared: None,
            clock: SystemClock::shared(),
            observer: None,
            metrics: None,
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Share failure counts and openings through `store`. The in-process
    /// breakers stay authoritative while the store is unreachable.
    pub fn with_store(mut self, store: Arc<dyn CounterStore>, prefix: impl Into<String>) -> Self {
        self.shared = Some(SharedCircuitState {
            store,
            prefix: prefix.into(),
        });
        self
    }

    pub fn with_observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Override the configuration for breakers created for `backend` from now on.
    pub fn configure_backend(&self, backend: impl Into<String>, config: CircuitConfig) {
        self.backend_configs.insert(backend.into(), config);
    }

    pub fn breaker(&self, backend: &str, tenant_id: &str) -> Arc<CircuitBreaker> {
        let key = (backend.to_string(), Self::tenant_key(tenant_id));
        if let Some(breaker) = self.breakers.get(&key) {
            return Arc::clone(&breaker);
        }
        let config = self
            .backend_configs
            .get(backend)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| self.default_config.clone());
        let entry = self
            .breakers
            .entry(key)
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::with_clock(config, Arc::clone(&self.clock)))
            });
        Arc::clone(&entry)
    }

    pub async fn allow(&self, backend: &str, tenant_id: &str) -> bool {
        let tenant_key = Self::tenant_key(tenant_id);
        let tenant_id = tenant_key.as_str();
        let breaker = self.breaker(backend, tenant_id);

        if let Some(shared) = &self.shared
            && breaker.state() == CircuitState::Closed
        {
            match shared.opened_at(backend, tenant_id).await {
                Ok(Some(opened_at)) => {
                    if breaker.open_since(opened_at) {
                        tracing::info!(backend, tenant_id, "Adopted circuit opened by another process");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(backend, tenant_id, error = %e, "Shared circuit state unavailable");
                }
            }
        }

        let allowed = breaker.allow();
        if !allowed {
            tracing::debug!(backend, tenant_id, "Circuit open, rejecting attempt");
        }
        allowed
    }

    pub async fn record_success(&self, backend: &str, tenant_id: &str) {
        let tenant_key = Self::tenant_key(tenant_id);
        let tenant_id = tenant_key.as_str();
        let breaker = self.breaker(backend, tenant_id);
        let closed = breaker.record_success() == Some(CircuitState::Closed);

        if let Some(shared) = &self.shared {
            let result = if closed {
                shared.clear(backend, tenant_id).await
            } else if breaker.config().failure_window.is_none()
                && breaker.state() == CircuitState::Closed
            {
                shared.clear_failures(backend, tenant_id).await
            } else {
                Ok(())
            };
            if let Err(e) = result {
                tracing::warn!(backend, tenant_id, error = %e, "Failed to update shared circuit state");
            }
        }

        if closed {
            tracing::info!(backend, tenant_id, "Circuit breaker closed");
            let event = Event::new(EventKind::BreakerClosed, tenant_id, self.clock.now())
                .with("backend", backend);
            events::emit(self.observer.as_ref(), event);
        }
    }

    pub async fn record_failure(&self, backend: &str, tenant_id: &str) {
        let tenant_key = Self::tenant_key(tenant_id);
        let tenant_id = tenant_key.as_str();
        let breaker = self.breaker(backend, tenant_id);

        // While the store answers, the shared count decides when a closed
        // breaker opens; the local count covers outages.
        let shared_count = match &self.shared {
            Some(shared) if breaker.state() == CircuitState::Closed => {
                match shared
                    .add_failure(backend, tenant_id, breaker.config().failure_window)
                    .await
                {
                    Ok(count) => Some(count),
                    Err(e) => {
                        tracing::warn!(backend, tenant_id, error = %e, "Failed to share circuit failure");
                        None
                    }
                }
            }
            _ => None,
        };
        let opened = match shared_count {
            Some(count) => {
                breaker.sync_failure_count(count);
                count >= breaker.config().failure_threshold && breaker.trip()
            }
            None => breaker.record_failure() == Some(CircuitState::Open),
        };
        if !opened {
            return;
        }

        if let Some(shared) = &self.shared
            && let Err(e) = shared
                .mark_open(backend, tenant_id, self.clock.now_millis())
                .await
        {
            tracing::warn!(backend, tenant_id, error = %e, "Failed to share circuit opening");
        }

        let failure_count = breaker.failure_count();
        let cooldown_ms = breaker.config().cooldown.as_millis() as u64;
        tracing::warn!(backend, tenant_id, failure_count, cooldown_ms, "Circuit breaker opened");
        if let Some(metrics) = &self.metrics {
            metrics.record_breaker_open();
        }
        let event = Event::new(EventKind::BreakerOpen, tenant_id, self.clock.now())
            .with("backend", backend)
            .with("failure_count", failure_count)
            .with("cooldown_ms", cooldown_ms);
        events::emit(self.observer.as_ref(), event);
    }

    /// `Closed` for pairs that have never been referenced.
    pub fn state(&self, backend: &str, tenant_id: &str) -> CircuitState {
        self.breakers
            .get(&(backend.to_string(), Self::tenant_key(tenant_id)))
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, backend: &str, tenant_id: &str) -> Option<CircuitSnapshot> {
        self.breakers
            .get(&(backend.to_string(), Self::tenant_key(tenant_id)))
            .map(|b| b.snapshot())
    }

    pub fn reset(&self, backend: &str, tenant_id: &str) {
        if let Some(breaker) = self
            .breakers
            .get(&(backend.to_string(), Self::tenant_key(tenant_id)))
        {
            breaker.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn tenant_key(tenant_id: &str) -> String {
        if tenant_id.is_empty() {
            GLOBAL_TENANT.to_string()
        } else {
            tenant_id.to_string()
        }
    }
}

impl Default for CircuitRegistry {
    fn default() -> Self {
        Self::new(CircuitConfig::default())
    }
}

impl std::fmt::Debug for CircuitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitRegistry")
            .field("default_config", &self.default_config)
            .field("breakers", &self.breakers.len())
            .field("shared", &self.shared.is_some())
            .finish()
    }
}
