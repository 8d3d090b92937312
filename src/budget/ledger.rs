//! Budget gate and spend recorder.
//!
//! Counters live in a [`CounterStore`] under period-scoped keys:
//!
//! ```text
//! {prefix}:{tenant}:{period}:{period_id}:{metric}
//! {prefix}:{tenant}:{period}:marker          -> period id the tenant was last touched in
//! ```
//!
//! A spend first advances the marker (resetting the previous period's
//! counters when it moved) and then applies every increment in one
//! `increment_many` call. Increments for the new period never share a key
//! with a concurrent reset of the old one, so rollover cannot lose them.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;

use super::execution::ExecutionStore;
use super::period::{Period, PeriodId};
use super::policy::{BudgetPolicy, Enforcement, LimitDimension, LimitKind, ResolvedPolicy};
use super::tenant::{Tenant, TenantRef, TenantRegistry};
use crate::clock::{SharedClock, SystemClock};
use crate::events::{self, Event, EventKind, SharedObserver};
use crate::observability::SharedMetrics;
use crate::store::CounterStore;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct LedgerConfig {
    pub key_prefix: String,
    /// TTL applied to counters and markers on write.
    pub counter_ttl: Option<Duration>,
    /// Deny hard-enforced calls while the counter store is unreachable.
    pub fail_closed_on_store_error: bool,
    pub anomaly_cost_threshold: Option<Decimal>,
    pub anomaly_token_threshold: Option<u64>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            key_prefix: "budget".into(),
            counter_ttl: Some(Duration::from_secs(35 * 24 * 60 * 60)),
            fail_closed_on_store_error: true,
            anomaly_cost_threshold: None,
            anomaly_token_threshold: None,
        }
    }
}

/// Outcome of one completed execution, as fed to [`BudgetLedger::record_spend`].
#[derive(Clone, Debug, PartialEq)]
pub struct Spend {
    pub agent_type: String,
    pub cost: Decimal,
    pub tokens: u64,
    pub succeeded: bool,
}

impl Spend {
    pub fn new(agent_type: impl Into<String>, cost: Decimal, tokens: u64) -> Self {
        Self {
            agent_type: agent_type.into(),
            cost,
            tokens,
            succeeded: true,
        }
    }

    /// A failed execution: counted as an execution and an error, at zero cost.
    pub fn failed(agent_type: impl Into<String>) -> Self {
        Self {
            agent_type: agent_type.into(),
            cost: Decimal::ZERO,
            tokens: 0,
            succeeded: false,
        }
    }

    pub fn succeeded(mut self, succeeded: bool) -> Self {
        self.succeeded = succeeded;
        self
    }
}

/// The tenant's rolling counters for the current day and month.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TenantUsage {
    pub tenant_id: String,
    pub daily_cost_spent: Decimal,
    pub monthly_cost_spent: Decimal,
    pub daily_tokens_used: u64,
    pub monthly_tokens_used: u64,
    pub daily_executions_count: u64,
    pub monthly_executions_count: u64,
    pub daily_error_count: u64,
    pub monthly_error_count: u64,
    pub daily_reset_date: NaiveDate,
    pub monthly_reset_date: NaiveDate,
}

impl TenantUsage {
    fn value_for(&self, dimension: &LimitDimension) -> Option<Decimal> {
        let value = match (&dimension.kind, dimension.period) {
            (LimitKind::Cost, Period::Daily) => self.daily_cost_spent,
            (LimitKind::Cost, Period::Monthly) => self.monthly_cost_spent,
            (LimitKind::Tokens, Period::Daily) => Decimal::from(self.daily_tokens_used),
            (LimitKind::Tokens, Period::Monthly) => Decimal::from(self.monthly_tokens_used),
            (LimitKind::Executions, Period::Daily) => Decimal::from(self.daily_executions_count),
            (LimitKind::Executions, Period::Monthly) => {
                Decimal::from(self.monthly_executions_count)
            }
            (LimitKind::AgentCost(_), _) => return None,
        };
        Some(value)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DimensionStatus {
    pub dimension: LimitDimension,
    /// `None` means unlimited.
    pub limit: Option<Decimal>,
    pub current: Decimal,
    pub percentage_used: f64,
    pub remaining: Option<Decimal>,
}

impl DimensionStatus {
    fn new(dimension: LimitDimension, limit: Option<Decimal>, current: Decimal) -> Self {
        let percentage_used = match limit {
            None => 0.0,
            Some(limit) if limit.is_zero() => 100.0,
            Some(limit) => (current / limit * Decimal::ONE_HUNDRED)
                .to_f64()
                .unwrap_or(0.0),
        };
        Self {
            dimension,
            limit,
            current,
            percentage_used,
            remaining: limit.map(|l| (l - current).max(Decimal::ZERO)),
        }
    }

    pub fn is_exceeded(&self) -> bool {
        self.limit.is_some_and(|l| self.current >= l)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BudgetStatus {
    pub tenant_id: String,
    pub enforcement: Enforcement,
    pub usage: TenantUsage,
    pub dimensions: Vec<DimensionStatus>,
}

impl BudgetStatus {
    pub fn dimension(&self, dimension: &LimitDimension) -> Option<&DimensionStatus> {
        self.dimensions.iter().find(|d| &d.dimension == dimension)
    }

    pub fn is_exceeded(&self) -> bool {
        self.dimensions.iter().any(DimensionStatus::is_exceeded)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Metric<'a> {
    Cost,
    Tokens,
    Executions,
    Errors,
    AgentCost(&'a str),
}

impl<'a> Metric<'a> {
    const RESETTABLE: [Metric<'static>; 4] =
        [Metric::Cost, Metric::Tokens, Metric::Executions, Metric::Errors];

    fn of(kind: &'a LimitKind) -> Self {
        match kind {
            LimitKind::Cost => Metric::Cost,
            LimitKind::Tokens => Metric::Tokens,
            LimitKind::Executions => Metric::Executions,
            LimitKind::AgentCost(agent) => Metric::AgentCost(agent),
        }
    }

    fn suffix(&self) -> String {
        match self {
            Metric::Cost => "cost".into(),
            Metric::Tokens => "tokens".into(),
            Metric::Executions => "executions".into(),
            Metric::Errors => "errors".into(),
            Metric::AgentCost(agent) => format!("agent_cost:{}", agent),
        }
    }
}

/// Gates and records tenant spend against layered budget policies.
pub struct BudgetLedger {
    store: Arc<dyn CounterStore>,
    clock: SharedClock,
    config: LedgerConfig,
    tenants: TenantRegistry,
    global_policy: RwLock<BudgetPolicy>,
    executions: Option<Arc<dyn ExecutionStore>>,
    observer: Option<SharedObserver>,
    metrics: Option<SharedMetrics>,
    recompute_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl BudgetLedger {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            clock: SystemClock::shared(),
            config: LedgerConfig::default(),
            tenants: TenantRegistry::new(),
            global_policy: RwLock::new(BudgetPolicy::default()),
            executions: None,
            observer: None,
            metrics: None,
            recompute_locks: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: LedgerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_tenants(mut self, tenants: TenantRegistry) -> Self {
        self.tenants = tenants;
        self
    }

    pub fn with_global_policy(self, policy: BudgetPolicy) -> Self {
        self.set_global_policy(policy);
        self
    }

    /// Enables recomputation from persisted executions on a cold counter.
    pub fn with_executions(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(executions);
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

    pub fn tenants(&self) -> &TenantRegistry {
        &self.tenants
    }

    pub fn global_policy(&self) -> BudgetPolicy {
        self.global_policy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_global_policy(&self, policy: BudgetPolicy) {
        *self
            .global_policy
            .write()
            .unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Merged policy layers: global, then tenant, then `call_site`.
    pub fn resolve_policy(&self, tenant: &Tenant, call_site: Option<&BudgetPolicy>) -> ResolvedPolicy {
        let global = self.global_policy();
        let own = if tenant.is_global() {
            None
        } else {
            tenant.policy()
        };
        ResolvedPolicy::resolve(std::iter::once(&global).chain(own.as_ref()).chain(call_site))
    }

    pub fn effective_enforcement<'a>(&self, tenant: impl Into<TenantRef<'a>>) -> Enforcement {
        let tenant = self.tenants.resolve(tenant.into());
        self.resolve_policy(&tenant, None).enforcement
    }

    pub async fn check<'a>(
        &self,
        tenant: impl Into<TenantRef<'a>>,
        agent_type: &str,
        estimated_cost: Option<Decimal>,
    ) -> Result<()> {
        let tenant = self.tenants.resolve(tenant.into());
        self.check_tenant(&tenant, agent_type, estimated_cost, None)
            .await
    }

    /// Gate a call. Hard enforcement rejects with [`Error::BudgetExceeded`]
    /// once any applicable limit is at or over 100%; soft enforcement only
    /// emits `budget_soft_cap`.
    pub async fn check_tenant(
        &self,
        tenant: &Tenant,
        agent_type: &str,
        estimated_cost: Option<Decimal>,
        call_site: Option<&BudgetPolicy>,
    ) -> Result<()> {
        let tenant_id = tenant.tenant_id.as_str();
        if !tenant.is_active() {
            tracing::warn!(tenant_id, "Rejecting call for inactive tenant");
            return Err(Error::TenantInactive(tenant_id.to_string()));
        }

        let policy = self.resolve_policy(tenant, call_site);
        if policy.enforcement == Enforcement::None || policy.is_unlimited() {
            self.record_check(false);
            return Ok(());
        }

        let now = self.clock.now();
        for limit in policy.applicable(agent_type) {
            let current = match self.current_value(tenant_id, &limit.dimension, now).await {
                Ok(value) => value,
                Err(e) => return self.on_store_error(tenant_id, policy.enforcement, e),
            };
            let projected = estimated_cost
                .filter(|_| limit.dimension.is_monetary())
                .map(|estimate| current + estimate);
            let breached =
                current >= limit.value || projected.is_some_and(|p| p >= limit.value);
            if !breached {
                continue;
            }

            match policy.enforcement {
                Enforcement::Hard => {
                    tracing::warn!(
                        tenant_id,
                        agent_type,
                        dimension = %limit.dimension,
                        limit = %limit.value,
                        current = %current,
                        "Budget exceeded, blocking call"
                    );
                    self.emit_cap(
                        EventKind::BudgetHardCap,
                        tenant_id,
                        agent_type,
                        &limit.dimension,
                        limit.value,
                        current,
                    );
                    self.record_check(true);
                    return Err(Error::BudgetExceeded {
                        tenant_id: tenant_id.to_string(),
                        dimension: limit.dimension.clone(),
                        limit: limit.value,
                        current,
                    });
                }
                Enforcement::Soft => {
                    tracing::info!(
                        tenant_id,
                        dimension = %limit.dimension,
                        current = %current,
                        "Soft budget cap reached"
                    );
                    self.emit_cap(
                        EventKind::BudgetSoftCap,
                        tenant_id,
                        agent_type,
                        &limit.dimension,
                        limit.value,
                        current,
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_soft_cap();
                    }
                }
                Enforcement::None => {}
            }
        }

        self.record_check(false);
        Ok(())
    }

    /// Record a completed execution. Never fails: store trouble is logged.
    pub async fn record_spend<'a>(&self, tenant: impl Into<TenantRef<'a>>, spend: Spend) {
        let tenant = self.tenants.resolve(tenant.into());
        self.record_tenant_spend(&tenant, &spend).await;
    }

    pub async fn record_tenant_spend(&self, tenant: &Tenant, spend: &Spend) {
        let tenant_id = tenant.tenant_id.as_str();
        if spend.cost.is_sign_negative() {
            tracing::warn!(tenant_id, cost = %spend.cost, "Ignoring negative cost");
        }

        if let Err(e) = self.apply_spend(tenant_id, spend).await {
            if let Some(metrics) = &self.metrics {
                metrics.record_store_error();
            }
            tracing::error!(tenant_id, agent_type = %spend.agent_type, error = %e, "Failed to record spend");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_spend(spend.cost.max(Decimal::ZERO), spend.tokens);
        }
        self.check_anomaly(tenant_id, spend);
    }

    pub async fn status<'a>(&self, tenant: impl Into<TenantRef<'a>>) -> Result<BudgetStatus> {
        let tenant = self.tenants.resolve(tenant.into());
        let tenant_id = tenant.tenant_id.as_str();
        let policy = self.resolve_policy(&tenant, None);
        let usage = self.tenant_usage(tenant_id).await?;
        let now = self.clock.now();

        let mut dimensions = Vec::new();
        for period in Period::ALL {
            for dimension in [
                LimitDimension::cost(period),
                LimitDimension::tokens(period),
                LimitDimension::executions(period),
            ] {
                let current = usage.value_for(&dimension).unwrap_or(Decimal::ZERO);
                let limit = policy.limit_for(&dimension);
                dimensions.push(DimensionStatus::new(dimension, limit, current));
            }
        }
        for limit in policy.limits() {
            if matches!(limit.dimension.kind, LimitKind::AgentCost(_)) {
                let current = self.current_value(tenant_id, &limit.dimension, now).await?;
                dimensions.push(DimensionStatus::new(
                    limit.dimension.clone(),
                    Some(limit.value),
                    current,
                ));
            }
        }

        Ok(BudgetStatus {
            tenant_id: tenant_id.to_string(),
            enforcement: policy.enforcement,
            usage,
            dimensions,
        })
    }

    pub async fn usage<'a>(&self, tenant: impl Into<TenantRef<'a>>) -> Result<TenantUsage> {
        let tenant_id = tenant.into().resolve();
        self.tenant_usage(&tenant_id).await
    }

    async fn tenant_usage(&self, tenant_id: &str) -> Result<TenantUsage> {
        let now = self.clock.now();
        let daily = self.ensure_period(tenant_id, Period::Daily, now).await?;
        let monthly = self.ensure_period(tenant_id, Period::Monthly, now).await?;

        let read = |period: Period, id: PeriodId, metric: Metric<'static>| {
            self.read_metric(tenant_id, period, id, metric, now)
        };
        let as_count = |value: Decimal| value.to_u64().unwrap_or(0);

        let (
            daily_cost,
            monthly_cost,
            daily_tokens,
            monthly_tokens,
            daily_executions,
            monthly_executions,
            daily_errors,
            monthly_errors,
        ) = futures::try_join!(
            read(Period::Daily, daily, Metric::Cost),
            read(Period::Monthly, monthly, Metric::Cost),
            read(Period::Daily, daily, Metric::Tokens),
            read(Period::Monthly, monthly, Metric::Tokens),
            read(Period::Daily, daily, Metric::Executions),
            read(Period::Monthly, monthly, Metric::Executions),
            read(Period::Daily, daily, Metric::Errors),
            read(Period::Monthly, monthly, Metric::Errors),
        )?;

        Ok(TenantUsage {
            tenant_id: tenant_id.to_string(),
            daily_cost_spent: daily_cost,
            monthly_cost_spent: monthly_cost,
            daily_tokens_used: as_count(daily_tokens),
            monthly_tokens_used: as_count(monthly_tokens),
            daily_executions_count: as_count(daily_executions),
            monthly_executions_count: as_count(monthly_executions),
            daily_error_count: as_count(daily_errors),
            monthly_error_count: as_count(monthly_errors),
            daily_reset_date: daily
                .start_date()
                .unwrap_or_else(|| Period::Daily.start_date(now)),
            monthly_reset_date: monthly
                .start_date()
                .unwrap_or_else(|| Period::Monthly.start_date(now)),
        })
    }

    async fn apply_spend(&self, tenant_id: &str, spend: &Spend) -> Result<()> {
        let now = self.clock.now();
        let cost = spend.cost.max(Decimal::ZERO);
        let mut targets = Vec::with_capacity(10);

        for period in Period::ALL {
            let id = self.ensure_period(tenant_id, period, now).await?;
            targets.push((period, id, Metric::Cost, cost));
            targets.push((period, id, Metric::Tokens, Decimal::from(spend.tokens)));
            targets.push((period, id, Metric::Executions, Decimal::ONE));
            if !spend.succeeded {
                targets.push((period, id, Metric::Errors, Decimal::ONE));
            }
            if !spend.agent_type.is_empty() {
                targets.push((period, id, Metric::AgentCost(&spend.agent_type), cost));
            }
        }

        // A cold key must be reseeded from history before it is incremented,
        // otherwise it would start the period over from zero.
        if self.executions.is_some() {
            futures::future::try_join_all(
                targets
                    .iter()
                    .map(|&(period, id, metric, _)| self.read_metric(tenant_id, period, id, metric, now)),
            )
            .await?;
        }

        let entries: Vec<(String, Decimal)> = targets
            .iter()
            .map(|&(period, id, metric, amount)| (self.counter_key(tenant_id, period, id, metric), amount))
            .collect();
        self.store
            .increment_many(&entries, self.config.counter_ttl)
            .await?;
        tracing::debug!(tenant_id, cost = %cost, tokens = spend.tokens, "Recorded spend");
        Ok(())
    }

    /// Advance the period marker, resetting the stale period's counters.
    async fn ensure_period(
        &self,
        tenant_id: &str,
        period: Period,
        now: DateTime<Utc>,
    ) -> Result<PeriodId> {
        let current = period.id_at(now);
        let marker_key = self.marker_key(tenant_id, period);
        let marker = self
            .store
            .get(&marker_key)
            .await?
            .and_then(PeriodId::from_decimal);

        match marker {
            Some(id) if id == current => return Ok(current),
            Some(stale) => {
                for metric in Metric::RESETTABLE {
                    self.store
                        .reset(&self.counter_key(tenant_id, period, stale, metric))
                        .await?;
                }
                tracing::debug!(tenant_id, %period, from = %stale, to = %current, "Rolled over budget period");
            }
            None => {}
        }

        self.store
            .write(&marker_key, current.to_decimal(), self.config.counter_ttl)
            .await?;
        Ok(current)
    }

    async fn current_value(
        &self,
        tenant_id: &str,
        dimension: &LimitDimension,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let period = dimension.period;
        self.read_metric(
            tenant_id,
            period,
            period.id_at(now),
            Metric::of(&dimension.kind),
            now,
        )
        .await
    }

    /// Counter value, recomputed from persisted executions when the cache is cold.
    async fn read_metric(
        &self,
        tenant_id: &str,
        period: Period,
        id: PeriodId,
        metric: Metric<'_>,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        let key = self.counter_key(tenant_id, period, id, metric);
        if let Some(value) = self.store.get(&key).await? {
            return Ok(value);
        }
        let Some(executions) = &self.executions else {
            return Ok(Decimal::ZERO);
        };

        // Single-flight per key within this process. Writers in other
        // processes may still race the reseed.
        let lock = Arc::clone(self.recompute_locks.entry(key.clone()).or_default().value());
        let _slot = RecomputeSlot {
            locks: &self.recompute_locks,
            key: &key,
        };
        let _guard = lock.lock().await;
        self.reseed(executions.as_ref(), tenant_id, period, metric, &key, now)
            .await
    }

    async fn reseed(
        &self,
        executions: &dyn ExecutionStore,
        tenant_id: &str,
        period: Period,
        metric: Metric<'_>,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Decimal> {
        if let Some(value) = self.store.get(key).await? {
            return Ok(value);
        }

        let since = period.start_of(now);
        let value = match metric {
            Metric::Cost => executions.sum_cost_since(tenant_id, since).await?,
            Metric::Tokens => Decimal::from(executions.sum_tokens_since(tenant_id, since).await?),
            Metric::Executions => Decimal::from(executions.count_since(tenant_id, since).await?),
            Metric::Errors => Decimal::from(executions.count_errors_since(tenant_id, since).await?),
            Metric::AgentCost(agent) => {
                executions
                    .sum_agent_cost_since(tenant_id, agent, since)
                    .await?
            }
        };

        self.store
            .write(key, value, self.config.counter_ttl)
            .await?;
        tracing::debug!(tenant_id, key, value = %value, "Reseeded cold counter");
        Ok(value)
    }

    fn on_store_error(&self, tenant_id: &str, enforcement: Enforcement, err: Error) -> Result<()> {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_error();
        }
        if enforcement == Enforcement::Hard && self.config.fail_closed_on_store_error {
            tracing::warn!(tenant_id, error = %err, "Counter store unavailable, denying call");
            self.record_check(true);
            return Err(match err {
                Error::StoreUnavailable(_) => err,
                other => Error::StoreUnavailable(other.to_string()),
            });
        }
        tracing::warn!(tenant_id, error = %err, "Counter store unavailable, allowing call");
        self.record_check(false);
        Ok(())
    }

    fn check_anomaly(&self, tenant_id: &str, spend: &Spend) {
        let cost_anomaly = self
            .config
            .anomaly_cost_threshold
            .is_some_and(|t| spend.cost > t);
        let token_anomaly = self
            .config
            .anomaly_token_threshold
            .is_some_and(|t| spend.tokens > t);
        if !cost_anomaly && !token_anomaly {
            return;
        }

        tracing::warn!(
            tenant_id,
            agent_type = %spend.agent_type,
            cost = %spend.cost,
            tokens = spend.tokens,
            "Anomalous execution"
        );
        let mut event = Event::new(EventKind::AgentAnomaly, tenant_id, self.clock.now())
            .with("agent_type", spend.agent_type.as_str())
            .with("cost", spend.cost.to_string())
            .with("tokens", spend.tokens);
        if let Some(threshold) = self.config.anomaly_cost_threshold {
            event = event.with("cost_threshold", threshold.to_string());
        }
        if let Some(threshold) = self.config.anomaly_token_threshold {
            event = event.with("token_threshold", threshold);
        }
        events::emit(self.observer.as_ref(), event);
    }

    fn emit_cap(
        &self,
        kind: EventKind,
        tenant_id: &str,
        agent_type: &str,
        dimension: &LimitDimension,
        limit: Decimal,
        current: Decimal,
    ) {
        let event = Event::new(kind, tenant_id, self.clock.now())
            .with("agent_type", agent_type)
            .with("dimension", dimension.to_string())
            .with("limit", limit.to_string())
            .with("current", current.to_string());
        events::emit(self.observer.as_ref(), event);
    }

    fn record_check(&self, blocked: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.record_budget_check(blocked);
        }
    }

    fn counter_key(&self, tenant_id: &str, period: Period, id: PeriodId, metric: Metric<'_>) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            self.config.key_prefix,
            tenant_id,
            period.label(),
            id,
            metric.suffix()
        )
    }

    fn marker_key(&self, tenant_id: &str, period: Period) -> String {
        format!("{}:{}:{}:marker", self.config.key_prefix, tenant_id, period.label())
    }
}

/// Drops the per-key recompute lock on every exit, including cancellation.
struct RecomputeSlot<'a> {
    locks: &'a DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    key: &'a str,
}

impl Drop for RecomputeSlot<'_> {
    fn drop(&mut self) {
        self.locks.remove(self.key);
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetLedger")
            .field("store", &self.store.name())
            .field("config", &self.config)
            .field("tenants", &self.tenants.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::execution::{ExecutionRecord, ExecutionStatus, MemoryExecutionStore};
    use crate::budget::tenant::Tenant;
    use crate::clock::ManualClock;
    use crate::events::EventCollector;
    use crate::observability::MetricsRegistry;
    use crate::store::{MemoryCounterStore, StoreError, StoreResult};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct DownStore;

    #[async_trait::async_trait]
    impl CounterStore for DownStore {
        fn name(&self) -> &str {
            "down"
        }

        async fn increment(&self, _key: &str, _amount: Decimal) -> StoreResult<Decimal> {
            Err(down())
        }

        async fn get(&self, _key: &str) -> StoreResult<Option<Decimal>> {
            Err(down())
        }

        async fn reset(&self, _key: &str) -> StoreResult<()> {
            Err(down())
        }

        async fn write(&self, _key: &str, _value: Decimal, _ttl: Option<Duration>) -> StoreResult<()> {
            Err(down())
        }

        async fn increment_many(
            &self,
            _entries: &[(String, Decimal)],
            _ttl: Option<Duration>,
        ) -> StoreResult<()> {
            Err(down())
        }
    }

    fn down() -> StoreError {
        StoreError::Unavailable {
            message: "connection refused".into(),
        }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, 10, 0, 0).unwrap()
    }

    fn ledger(clock: Arc<ManualClock>, policy: BudgetPolicy) -> BudgetLedger {
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        BudgetLedger::new(store)
            .with_clock(clock)
            .with_global_policy(policy)
    }

    #[tokio::test]
    async fn test_spend_accumulates_and_rolls_over_daily() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(clock.clone(), BudgetPolicy::default());

        for cost in [dec!(1.10), dec!(2.20), dec!(0.70)] {
            ledger.record_spend("acme", Spend::new("chat", cost, 100)).await;
        }
        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(4.00));
        assert_eq!(usage.daily_executions_count, 3);
        assert_eq!(usage.daily_tokens_used, 300);

        clock.advance(Duration::from_secs(24 * 60 * 60));
        ledger.record_spend("acme", Spend::new("chat", dec!(0.5), 10)).await;

        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(0.5));
        assert_eq!(usage.monthly_cost_spent, dec!(4.50));
        assert_eq!(usage.daily_reset_date, NaiveDate::from_ymd_opt(2026, 3, 15).unwrap());
        assert_eq!(usage.monthly_reset_date, NaiveDate::from_ymd_opt(2026, 3, 1).unwrap());
    }

    #[tokio::test]
    async fn test_failed_spend_counts_errors() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(clock, BudgetPolicy::default());

        ledger.record_spend("acme", Spend::failed("chat")).await;
        ledger.record_spend("acme", Spend::new("chat", dec!(1), 5)).await;

        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_error_count, 1);
        assert_eq!(usage.monthly_error_count, 1);
        assert_eq!(usage.daily_executions_count, 2);
        assert_eq!(usage.daily_cost_spent, dec!(1));
    }

    #[tokio::test]
    async fn test_hard_enforcement_blocks_at_limit() {
        let clock = ManualClock::shared(start());
        let collector = EventCollector::shared();
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .daily_limit(dec!(10.0))
                .enforcement(Enforcement::Hard),
        )
        .with_observer(collector.clone());

        ledger.record_spend("acme", Spend::new("chat", dec!(10.0), 1)).await;
        let err = ledger.check("acme", "chat", None).await.unwrap_err();

        match err {
            Error::BudgetExceeded {
                dimension,
                limit,
                current,
                ..
            } => {
                assert_eq!(dimension, LimitDimension::cost(Period::Daily));
                assert_eq!(limit, dec!(10.0));
                assert_eq!(current, dec!(10.0));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(collector.count(EventKind::BudgetHardCap), 1);
        assert_eq!(collector.count(EventKind::BudgetSoftCap), 0);
    }

    #[tokio::test]
    async fn test_soft_enforcement_alerts_without_blocking() {
        let clock = ManualClock::shared(start());
        let collector = EventCollector::shared();
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .daily_limit(dec!(10.0))
                .enforcement(Enforcement::Soft),
        )
        .with_observer(collector.clone());

        ledger.record_spend("acme", Spend::new("chat", dec!(10.0), 1)).await;
        ledger.check("acme", "chat", None).await.unwrap();

        assert_eq!(collector.count(EventKind::BudgetHardCap), 0);
        let soft = collector.of_kind(EventKind::BudgetSoftCap);
        assert_eq!(soft.len(), 1);
        assert_eq!(soft[0].field("dimension").unwrap(), "daily cost");
        assert_eq!(soft[0].tenant_id, "acme");
    }

    #[tokio::test]
    async fn test_estimated_cost_blocks_before_limit() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .daily_limit(dec!(5))
                .enforcement(Enforcement::Hard),
        );

        ledger.record_spend("acme", Spend::new("chat", dec!(4), 1)).await;
        assert!(ledger.check("acme", "chat", None).await.is_ok());
        assert!(ledger.check("acme", "chat", Some(dec!(0.5))).await.is_ok());
        assert!(matches!(
            ledger.check("acme", "chat", Some(dec!(1.5))).await,
            Err(Error::BudgetExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_per_agent_limit_only_applies_to_that_agent() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .per_agent_daily("image", dec!(1))
                .enforcement(Enforcement::Hard),
        );

        ledger.record_spend("acme", Spend::new("image", dec!(1), 0)).await;
        assert!(ledger.check("acme", "chat", None).await.is_ok());
        let err = ledger.check("acme", "image", None).await.unwrap_err();
        assert!(err.to_string().contains("daily cost for agent 'image'"));
    }

    #[tokio::test]
    async fn test_tenant_policy_overrides_global() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .daily_limit(dec!(100))
                .enforcement(Enforcement::Soft),
        );
        ledger.tenants().register(
            Tenant::new("acme").with_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(2))
                    .enforcement(Enforcement::Hard),
            ),
        );

        assert_eq!(ledger.effective_enforcement("acme"), Enforcement::Hard);
        assert_eq!(ledger.effective_enforcement("beta"), Enforcement::Soft);

        ledger.record_spend("acme", Spend::new("chat", dec!(2), 0)).await;
        ledger.record_spend("beta", Spend::new("chat", dec!(2), 0)).await;
        assert!(ledger.check("acme", "chat", None).await.is_err());
        assert!(ledger.check("beta", "chat", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_inactive_tenant_rejected() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(clock, BudgetPolicy::default());
        ledger.tenants().find_or_create("acme");
        ledger.tenants().deactivate("acme");

        assert!(matches!(
            ledger.check("acme", "chat", None).await,
            Err(Error::TenantInactive(id)) if id == "acme"
        ));
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed_under_hard() {
        let metrics = Arc::new(MetricsRegistry::new());
        let hard = BudgetLedger::new(Arc::new(DownStore))
            .with_global_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(1))
                    .enforcement(Enforcement::Hard),
            )
            .with_metrics(metrics.clone());
        assert!(matches!(
            hard.check("acme", "chat", None).await,
            Err(Error::StoreUnavailable(_))
        ));

        let soft = BudgetLedger::new(Arc::new(DownStore)).with_global_policy(
            BudgetPolicy::new()
                .daily_limit(dec!(1))
                .enforcement(Enforcement::Soft),
        );
        assert!(soft.check("acme", "chat", None).await.is_ok());

        // Recording never surfaces the outage.
        hard.record_spend("acme", Spend::new("chat", dec!(1), 1)).await;
        assert_eq!(metrics.store_errors.get(), 2);
    }

    #[tokio::test]
    async fn test_fail_open_when_configured() {
        let ledger = BudgetLedger::new(Arc::new(DownStore))
            .with_config(LedgerConfig {
                fail_closed_on_store_error: false,
                ..LedgerConfig::default()
            })
            .with_global_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(1))
                    .enforcement(Enforcement::Hard),
            );
        assert!(ledger.check("acme", "chat", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_cold_cache_recomputes_from_executions() {
        let clock = ManualClock::shared(start());
        let executions = Arc::new(MemoryExecutionStore::new());
        let earlier = start() - chrono::TimeDelta::hours(2);
        let yesterday = start() - chrono::TimeDelta::days(1);
        for (at, cost) in [(earlier, dec!(3)), (yesterday, dec!(4))] {
            executions
                .append(
                    ExecutionRecord::start("global", "chat", at).complete(
                        ExecutionStatus::Success,
                        at,
                        cost,
                        10,
                    ),
                )
                .await
                .unwrap();
        }

        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let ledger = BudgetLedger::new(store.clone())
            .with_clock(clock)
            .with_executions(executions)
            .with_global_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(3))
                    .enforcement(Enforcement::Hard),
            );

        // Tenant-less call resolves to the global tenant.
        let err = ledger.check(TenantRef::None, "chat", None).await.unwrap_err();
        assert!(matches!(err, Error::BudgetExceeded { current, .. } if current == dec!(3)));

        let status = ledger.status(TenantRef::None).await.unwrap();
        assert_eq!(status.usage.daily_cost_spent, dec!(3));
        assert_eq!(status.usage.monthly_cost_spent, dec!(7));
        assert!(store.keys().iter().any(|k| k.starts_with("budget:global:daily:20260314")));
    }

    #[tokio::test]
    async fn test_status_reports_percentages() {
        let clock = ManualClock::shared(start());
        let ledger = ledger(
            clock,
            BudgetPolicy::new()
                .daily_limit(dec!(8))
                .monthly_token_limit(1000)
                .per_agent_daily("chat", dec!(4)),
        );
        ledger.record_spend("acme", Spend::new("chat", dec!(2), 250)).await;

        let status = ledger.status("acme").await.unwrap();
        assert_eq!(status.enforcement, Enforcement::Soft);

        let daily = status.dimension(&LimitDimension::cost(Period::Daily)).unwrap();
        assert_eq!(daily.percentage_used, 25.0);
        assert_eq!(daily.remaining, Some(dec!(6)));

        let tokens = status
            .dimension(&LimitDimension::tokens(Period::Monthly))
            .unwrap();
        assert_eq!(tokens.percentage_used, 25.0);

        let unlimited = status
            .dimension(&LimitDimension::executions(Period::Daily))
            .unwrap();
        assert_eq!(unlimited.limit, None);
        assert_eq!(unlimited.percentage_used, 0.0);

        let agent = status
            .dimension(&LimitDimension::agent_cost(Period::Daily, "chat"))
            .unwrap();
        assert_eq!(agent.percentage_used, 50.0);
        assert!(!status.is_exceeded());
    }

    #[tokio::test]
    async fn test_anomaly_event() {
        let clock = ManualClock::shared(start());
        let collector = EventCollector::shared();
        let ledger = ledger(clock, BudgetPolicy::default())
            .with_config(LedgerConfig {
                anomaly_cost_threshold: Some(dec!(5)),
                ..LedgerConfig::default()
            })
            .with_observer(collector.clone());

        ledger.record_spend("acme", Spend::new("chat", dec!(1), 10)).await;
        ledger.record_spend("acme", Spend::new("chat", dec!(9), 10)).await;

        let anomalies = collector.of_kind(EventKind::AgentAnomaly);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].field("cost").unwrap(), "9");
        assert_eq!(anomalies[0].field("agent_type").unwrap(), "chat");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_spend_is_exact() {
        let clock = ManualClock::shared(start());
        let ledger = Arc::new(ledger(clock, BudgetPolicy::default()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    for _ in 0..25 {
                        ledger.record_spend("acme", Spend::new("chat", dec!(0.01), 1)).await;
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(2.00));
        assert_eq!(usage.monthly_executions_count, 200);
    }

    #[tokio::test]
    async fn test_cold_counter_is_reseeded_before_spend() {
        let clock = ManualClock::shared(start());
        let executions = Arc::new(MemoryExecutionStore::new());
        let earlier = start() - chrono::TimeDelta::hours(1);
        executions
            .append(
                ExecutionRecord::start("acme", "chat", earlier).complete(
                    ExecutionStatus::Success,
                    earlier,
                    dec!(4.00),
                    400,
                ),
            )
            .await
            .unwrap();

        // Fresh counter store, as after a restart or eviction.
        let ledger = BudgetLedger::new(Arc::new(MemoryCounterStore::with_clock(clock.clone())))
            .with_clock(clock)
            .with_executions(executions)
            .with_global_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(5))
                    .enforcement(Enforcement::Hard),
            );

        ledger.record_spend("acme", Spend::new("chat", dec!(1.5), 100)).await;

        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(5.5));
        assert_eq!(usage.daily_tokens_used, 500);
        assert_eq!(usage.daily_executions_count, 2);
        assert!(matches!(
            ledger.check("acme", "chat", None).await,
            Err(Error::BudgetExceeded { current, .. }) if current == dec!(5.5)
        ));
    }

    #[tokio::test]
    async fn test_month_rollover_resets_daily_and_monthly() {
        let clock = ManualClock::shared(Utc.with_ymd_and_hms(2026, 3, 31, 22, 0, 0).unwrap());
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let ledger = BudgetLedger::new(store.clone()).with_clock(clock.clone());

        ledger.record_spend("acme", Spend::new("chat", dec!(3), 30)).await;
        ledger.record_spend("acme", Spend::failed("chat")).await;
        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.monthly_cost_spent, dec!(3));
        assert_eq!(usage.monthly_error_count, 1);

        clock.advance(Duration::from_secs(3 * 60 * 60));
        ledger.record_spend("acme", Spend::new("chat", dec!(1), 10)).await;

        let usage = ledger.usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(1));
        assert_eq!(usage.monthly_cost_spent, dec!(1));
        assert_eq!(usage.monthly_tokens_used, 10);
        assert_eq!(usage.monthly_executions_count, 1);
        assert_eq!(usage.monthly_error_count, 0);
        assert_eq!(usage.daily_reset_date, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());
        assert_eq!(usage.monthly_reset_date, NaiveDate::from_ymd_opt(2026, 4, 1).unwrap());

        let keys = store.keys();
        for stale in [
            "budget:acme:monthly:202603:cost",
            "budget:acme:monthly:202603:errors",
            "budget:acme:daily:20260331:cost",
            "budget:acme:daily:20260331:executions",
        ] {
            assert!(!keys.iter().any(|k| k == stale), "{stale} survived rollover");
        }
        assert!(keys.iter().any(|k| k == "budget:acme:monthly:202604:cost"));
    }

    struct BrokenExecutions;

    #[async_trait::async_trait]
    impl ExecutionStore for BrokenExecutions {
        async fn append(&self, _record: ExecutionRecord) -> Result<()> {
            Err(Error::StoreUnavailable("history offline".into()))
        }

        async fn sum_cost_since(&self, _tenant_id: &str, _since: DateTime<Utc>) -> Result<Decimal> {
            Err(Error::StoreUnavailable("history offline".into()))
        }

        async fn sum_tokens_since(&self, _tenant_id: &str, _since: DateTime<Utc>) -> Result<u64> {
            Err(Error::StoreUnavailable("history offline".into()))
        }

        async fn count_since(&self, _tenant_id: &str, _since: DateTime<Utc>) -> Result<u64> {
            Err(Error::StoreUnavailable("history offline".into()))
        }

        async fn count_errors_since(&self, _tenant_id: &str, _since: DateTime<Utc>) -> Result<u64> {
            Err(Error::StoreUnavailable("history offline".into()))
        }

        async fn sum_agent_cost_since(
            &self,
            _tenant_id: &str,
            _agent_type: &str,
            _since: DateTime<Utc>,
        ) -> Result<Decimal> {
            Err(Error::StoreUnavailable("history offline".into()))
        }
    }

    #[tokio::test]
    async fn test_failed_recompute_releases_its_lock() {
        let clock = ManualClock::shared(start());
        let ledger = BudgetLedger::new(Arc::new(MemoryCounterStore::with_clock(clock.clone())))
            .with_clock(clock)
            .with_executions(Arc::new(BrokenExecutions))
            .with_global_policy(
                BudgetPolicy::new()
                    .daily_limit(dec!(5))
                    .enforcement(Enforcement::Hard),
            );

        assert!(ledger.usage("acme").await.is_err());
        assert!(matches!(
            ledger.check("acme", "chat", None).await,
            Err(Error::StoreUnavailable(_))
        ));
        ledger.record_spend("acme", Spend::new("chat", dec!(1), 1)).await;
        assert!(ledger.recompute_locks.is_empty());
    }
}
