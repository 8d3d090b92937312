//! The caller-facing pipeline: budget check, governed execution, spend.
//!
//! ```text
//! run(request, work)
//!   -> BudgetLedger::check_tenant      (BudgetExceeded / TenantInactive)
//!   -> RetryFallbackExecutor::execute  (retry, fallback, circuit breakers, deadline)
//!   -> BudgetLedger::record_spend      (never fails the call)
//!   -> ExecutionStore::append          (when configured)
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;
use tracing::{Instrument, Span};
use uuid::Uuid;

use crate::budget::{
    BudgetLedger, BudgetPolicy, BudgetStatus, ExecutionRecord, ExecutionStatus, ExecutionStore,
    Spend, Tenant, TenantRef, TenantRegistry,
};
use crate::clock::{SharedClock, SystemClock};
use crate::config::GovernorConfig;
use crate::events::SharedObserver;
use crate::inheritance::{InheritedLimits, ParentScope, ScopeTracker};
use crate::observability::{SharedMetrics, budget_check_span, execute_span};
use crate::resilience::{
    AttemptContext, CircuitRegistry, ExecutionPlan, Outcome, RetryFallbackExecutor, RetryPolicy,
};
use crate::store::{CounterStore, MemoryCounterStore};
use crate::{Error, Result};

/// Cost and usage reported by a successful unit of work.
pub trait Billable {
    fn cost(&self) -> Decimal;

    fn tokens(&self) -> u64;

    /// Whether the call produced a usable result. A `false` still records
    /// the cost, but counts as an error.
    fn succeeded(&self) -> bool {
        true
    }
}

/// One logical call to govern.
#[derive(Debug)]
pub struct RunRequest<'a> {
    tenant: TenantRef<'a>,
    agent_type: String,
    candidates: Vec<String>,
    deadline: Option<DateTime<Utc>>,
    timeout: Option<Duration>,
    estimated_cost: Option<Decimal>,
    retry: Option<RetryPolicy>,
    policy: Option<BudgetPolicy>,
    scope: Option<&'a ScopeTracker>,
    parent_execution_id: Option<Uuid>,
    root_execution_id: Option<Uuid>,
}

impl<'a> RunRequest<'a> {
    pub fn new<I, S>(agent_type: impl Into<String>, candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tenant: TenantRef::None,
            agent_type: agent_type.into(),
            candidates: candidates.into_iter().map(Into::into).collect(),
            deadline: None,
            timeout: None,
            estimated_cost: None,
            retry: None,
            policy: None,
            scope: None,
            parent_execution_id: None,
            root_execution_id: None,
        }
    }

    pub fn tenant(mut self, tenant: impl Into<TenantRef<'a>>) -> Self {
        self.tenant = tenant.into();
        self
    }

    pub fn deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Total time budget, measured from the start of `run`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn estimated_cost(mut self, cost: Decimal) -> Self {
        self.estimated_cost = Some(cost);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Call-site overrides, layered on top of the tenant policy.
    pub fn policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Run inside `scope`: the deadline is clamped to what the scope has
    /// left and the call's cost is charged to it.
    pub fn scope(mut self, scope: &'a ScopeTracker) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn parent(mut self, parent: Uuid, root: Option<Uuid>) -> Self {
        self.parent_execution_id = Some(parent);
        self.root_execution_id = root;
        self
    }

    pub fn agent_type(&self) -> &str {
        &self.agent_type
    }

    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }
}

pub struct Governor {
    config: GovernorConfig,
    ledger: Arc<BudgetLedger>,
    executor: RetryFallbackExecutor,
    circuits: Arc<CircuitRegistry>,
    metrics: SharedMetrics,
    clock: SharedClock,
    executions: Option<Arc<dyn ExecutionStore>>,
}

impl Governor {
    pub fn builder() -> GovernorBuilder {
        GovernorBuilder::default()
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<BudgetLedger> {
        &self.ledger
    }

    pub fn executor(&self) -> &RetryFallbackExecutor {
        &self.executor
    }

    pub fn circuits(&self) -> &Arc<CircuitRegistry> {
        &self.circuits
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    pub fn tenants(&self) -> &TenantRegistry {
        self.ledger.tenants()
    }

    pub async fn status<'a>(&self, tenant: impl Into<TenantRef<'a>>) -> Result<BudgetStatus> {
        self.ledger.status(tenant).await
    }

    /// A root scope starting now.
    pub fn scope(&self, timeout: Option<Duration>, max_cost: Option<Decimal>) -> ScopeTracker {
        ScopeTracker::new(self.clock.clone(), timeout, max_cost)
    }

    /// Nested scope bounded by what `parent` has left.
    pub fn child_scope(&self, parent: &ScopeTracker, self_referential: bool) -> Result<ScopeTracker> {
        parent.child(self_referential)
    }

    pub fn inherit(&self, parent: &ParentScope, self_referential: bool) -> Result<InheritedLimits> {
        parent.inherit(self_referential)
    }

    /// Check the budget, execute `work` across the request's candidates and
    /// record what it cost.
    ///
    /// Budget and scope violations fail before any backend is attempted.
    /// Recording the spend never turns a successful call into an error.
    pub async fn run<T, F, Fut>(&self, request: RunRequest<'_>, work: F) -> Result<Outcome<T>>
    where
        T: Billable,
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let tenant = self.ledger.tenants().resolve(request.tenant);
        let candidates = self.config.with_fallbacks(&request.candidates);
        let span = execute_span(&tenant.tenant_id, &request.agent_type, candidates.len());

        self.run_governed(&tenant, candidates, request, work)
            .instrument(span)
            .await
    }

    async fn run_governed<T, F, Fut>(
        &self,
        tenant: &Tenant,
        candidates: Vec<String>,
        request: RunRequest<'_>,
        work: F,
    ) -> Result<Outcome<T>>
    where
        T: Billable,
        F: FnMut(AttemptContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if candidates.is_empty() {
            return Err(Error::InvalidArgument(
                "at least one backend candidate is required".into(),
            ));
        }

        let started_at = self.clock.now();
        let mut deadline = earliest(
            request.deadline,
            request.timeout.and_then(|t| add(started_at, t)),
        );
        if let Some(scope) = request.scope {
            let limits = scope.snapshot().inherit(false)?;
            deadline = earliest(deadline, limits.deadline_from(started_at));
        }

        let agent_type = request.agent_type.as_str();
        self.ledger
            .check_tenant(
                tenant,
                agent_type,
                request.estimated_cost,
                request.policy.as_ref(),
            )
            .instrument(budget_check_span(&tenant.tenant_id, agent_type))
            .await?;

        let mut plan = ExecutionPlan::new(candidates).tenant(tenant.tenant_id.clone());
        if let Some(deadline) = deadline {
            plan = plan.deadline(deadline);
        }
        if let Some(retry) = request.retry.clone() {
            plan = plan.retry(retry);
        }

        let mut record = ExecutionRecord::start(&tenant.tenant_id, agent_type, started_at);
        if let Some(parent) = request.parent_execution_id {
            record = record.with_parent(parent, request.root_execution_id);
        }

        self.metrics.record_execution_start();
        let result = self.executor.execute(&plan, work).await;
        self.metrics.record_execution_end();
        let completed_at = self.clock.now();

        match result {
            Ok(outcome) => {
                let cost = outcome.value.cost();
                let tokens = outcome.value.tokens();
                let succeeded = outcome.value.succeeded();

                let spend = Spend::new(agent_type, cost, tokens).succeeded(succeeded);
                self.ledger.record_tenant_spend(tenant, &spend).await;
                if let Some(scope) = request.scope {
                    scope.add_cost(cost);
                }

                let status = if succeeded {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Error
                };
                self.persist(
                    record
                        .complete(status, completed_at, cost, tokens)
                        .model(&outcome.backend)
                        .attempts(outcome.attempts_count()),
                )
                .await;

                let span = Span::current();
                span.record("backend", outcome.backend.as_str());
                span.record("attempts", outcome.attempts_count());
                Ok(outcome)
            }
            Err(error) => {
                tracing::warn!(
                    tenant_id = %tenant.tenant_id,
                    agent_type,
                    error = %error,
                    "Governed execution failed"
                );
                self.ledger
                    .record_tenant_spend(tenant, &Spend::failed(agent_type))
                    .await;

                let (status, attempts) = match &error {
                    Error::TotalTimeout { attempts, .. } => (ExecutionStatus::Timeout, *attempts),
                    Error::Timeout(_) => (ExecutionStatus::Timeout, 1),
                    Error::AllModelsFailed { attempts, .. } => (ExecutionStatus::Error, *attempts),
                    _ => (ExecutionStatus::Error, 0),
                };
                self.persist(
                    record
                        .complete(status, completed_at, Decimal::ZERO, 0)
                        .attempts(attempts),
                )
                .await;
                Err(error)
            }
        }
    }

    async fn persist(&self, record: ExecutionRecord) {
        if let Some(executions) = &self.executions
            && let Err(e) = executions.append(record).await
        {
            tracing::warn!(error = %e, "Failed to persist execution record");
        }
    }
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor")
            .field("ledger", &self.ledger)
            .field("circuits", &self.circuits.len())
            .field("fallback_backends", &self.config.fallback_backends)
            .field("persists_executions", &self.executions.is_some())
            .finish()
    }
}

fn add(at: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Default)]
pub struct GovernorBuilder {
    config: Option<GovernorConfig>,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn CounterStore>>,
    observer: Option<SharedObserver>,
    executions: Option<Arc<dyn ExecutionStore>>,
    metrics: Option<SharedMetrics>,
    tenants: Option<TenantRegistry>,
    circuit_prefix: Option<String>,
}

impl GovernorBuilder {
    pub fn config(mut self, config: GovernorConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Counter backend. Defaults to an in-process [`MemoryCounterStore`].
    pub fn store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Persist execution records and recompute cold counters from them.
    pub fn executions(mut self, executions: Arc<dyn ExecutionStore>) -> Self {
        self.executions = Some(executions);
        self
    }

    pub fn metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn tenants(mut self, tenants: TenantRegistry) -> Self {
        self.tenants = Some(tenants);
        self
    }

    /// Share circuit breaker state through the counter store under `prefix`.
    pub fn shared_circuits(mut self, prefix: impl Into<String>) -> Self {
        self.circuit_prefix = Some(prefix.into());
        self
    }

    pub fn build(self) -> Result<Governor> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let metrics = self.metrics.unwrap_or_default();
        let store: Arc<dyn CounterStore> = match self.store {
            Some(store) => store,
            None => Arc::new(MemoryCounterStore::with_clock(clock.clone())),
        };

        let tenants = self.tenants.unwrap_or_default();
        for (tenant_id, policy) in &config.tenants {
            tenants.set_policy(tenant_id, policy.clone());
        }

        let mut circuits = CircuitRegistry::new(config.circuit.to_config())
            .with_clock(clock.clone())
            .with_metrics(metrics.clone());
        if let Some(prefix) = self.circuit_prefix {
            circuits = circuits.with_store(store.clone(), prefix);
        }
        let mut ledger = BudgetLedger::new(store)
            .with_clock(clock.clone())
            .with_config(config.ledger_config())
            .with_tenants(tenants)
            .with_global_policy(config.budget.clone())
            .with_metrics(metrics.clone());
        if let Some(observer) = self.observer {
            circuits = circuits.with_observer(observer.clone());
            ledger = ledger.with_observer(observer);
        }
        if let Some(executions) = &self.executions {
            ledger = ledger.with_executions(executions.clone());
        }

        let circuits = Arc::new(circuits);
        let executor = RetryFallbackExecutor::new(circuits.clone())
            .with_classifier(config.classifier())
            .with_clock(clock.clone())
            .with_retry(config.retry.to_policy())
            .with_metrics(metrics.clone());

        tracing::info!(
            tenants = config.tenants.len(),
            fallback_backends = config.fallback_backends.len(),
            "Governor initialised"
        );

        Ok(Governor {
            config,
            ledger: Arc::new(ledger),
            executor,
            circuits,
            metrics,
            clock,
            executions: self.executions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::{Enforcement, MemoryExecutionStore};
    use crate::clock::ManualClock;
    use crate::resilience::Backoff;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    struct Reply {
        cost: Decimal,
        tokens: u64,
    }

    impl Billable for Reply {
        fn cost(&self) -> Decimal {
            self.cost
        }

        fn tokens(&self) -> u64 {
            self.tokens
        }
    }

    fn reply(cost: Decimal) -> Reply {
        Reply { cost, tokens: 100 }
    }

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap()
    }

    fn governor(config: GovernorConfig, clock: Arc<ManualClock>) -> Governor {
        Governor::builder().config(config).clock(clock).build().unwrap()
    }

    #[tokio::test]
    async fn test_run_records_spend() {
        let clock = ManualClock::shared(start());
        let governor = governor(GovernorConfig::default(), clock);

        let outcome = governor
            .run(RunRequest::new("chat", ["gpt-4o"]).tenant("acme"), |_| async {
                Ok(reply(dec!(0.25)))
            })
            .await
            .unwrap();

        assert_eq!(outcome.backend, "gpt-4o");
        let usage = governor.ledger().usage("acme").await.unwrap();
        assert_eq!(usage.daily_cost_spent, dec!(0.25));
        assert_eq!(usage.daily_tokens_used, 100);
        assert_eq!(usage.daily_executions_count, 1);
        assert_eq!(governor.metrics().active_executions.get(), 0);
    }

    #[tokio::test]
    async fn test_budget_block_happens_before_any_attempt() {
        let clock = ManualClock::shared(start());
        let config = GovernorConfig {
            budget: BudgetPolicy::new()
                .daily_limit(dec!(1))
                .enforcement(Enforcement::Hard),
            ..Default::default()
        };
        let governor = governor(config, clock);
        governor
            .ledger()
            .record_spend("acme", Spend::new("chat", dec!(1), 10))
            .await;

        let mut calls = 0;
        let result = governor
            .run(RunRequest::new("chat", ["gpt-4o"]).tenant("acme"), |_| {
                calls += 1;
                async { Ok(reply(dec!(0.1))) }
            })
            .await;

        assert!(matches!(result, Err(Error::BudgetExceeded { .. })));
        assert_eq!(calls, 0);
    }

    #[tokio::test]
    async fn test_failed_run_counts_as_error() {
        let clock = ManualClock::shared(start());
        let executions = Arc::new(MemoryExecutionStore::new());
        let governor = Governor::builder()
            .clock(clock)
            .executions(executions.clone())
            .build()
            .unwrap();

        let request = RunRequest::new("chat", ["gpt-4o", "haiku"])
            .tenant("acme")
            .retry(RetryPolicy::no_retry());
        let result: Result<Outcome<Reply>> = governor
            .run(request, |_| async { Err(Error::api(400, "bad request")) })
            .await;

        assert!(matches!(result, Err(Error::AllModelsFailed { attempts: 2, .. })));
        let usage = governor.ledger().usage("acme").await.unwrap();
        assert_eq!(usage.daily_executions_count, 1);
        assert_eq!(usage.daily_error_count, 1);
        assert_eq!(usage.daily_cost_spent, Decimal::ZERO);

        let records = executions.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ExecutionStatus::Error);
        assert_eq!(records[0].attempts_count, 2);
    }

    #[tokio::test]
    async fn test_configured_fallbacks_are_appended() {
        let clock = ManualClock::shared(start());
        let config = GovernorConfig {
            fallback_backends: vec!["haiku".into()],
            ..Default::default()
        };
        let governor = governor(config, clock);

        let outcome = governor
            .run(RunRequest::new("chat", ["gpt-4o"]), |ctx| async move {
                if ctx.backend == "gpt-4o" {
                    Err(Error::ModelOverloaded {
                        model: ctx.backend.clone(),
                    })
                } else {
                    Ok(reply(dec!(0.01)))
                }
            })
            .await
            .unwrap();

        assert_eq!(outcome.backend, "haiku");
        assert_eq!(outcome.attempts_count(), 2);
    }

    #[tokio::test]
    async fn test_scope_clamps_deadline_and_collects_cost() {
        let clock = ManualClock::shared(start());
        let governor = governor(GovernorConfig::default(), clock.clone());
        let scope = governor.scope(Some(Duration::from_secs(2)), Some(dec!(1)));

        let request = RunRequest::new("chat", ["gpt-4o"])
            .timeout(Duration::from_secs(60))
            .scope(&scope)
            .retry(RetryPolicy::new(
                5,
                Backoff::constant(Duration::from_secs(10)).with_jitter(0.0),
            ));
        let result: Result<Outcome<Reply>> = governor
            .run(request, |_| async { Err(Error::Network("reset".into())) })
            .await;

        assert!(matches!(result, Err(Error::TotalTimeout { attempts: 1, .. })));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(2)]);

        let spent_scope = governor.scope(None, Some(dec!(0.5)));
        governor
            .run(
                RunRequest::new("chat", ["gpt-4o"]).scope(&spent_scope),
                |_| async { Ok(reply(dec!(0.5))) },
            )
            .await
            .unwrap();
        assert_eq!(spent_scope.spent(), dec!(0.5));

        let result = governor
            .run(
                RunRequest::new("chat", ["gpt-4o"]).scope(&spent_scope),
                |_| async { Ok(reply(dec!(0.1))) },
            )
            .await;
        assert!(matches!(result, Err(Error::WorkflowCostExceeded { .. })));
    }

    #[tokio::test]
    async fn test_sibling_scopes_draw_from_one_parent() {
        let clock = ManualClock::shared(start());
        let governor = governor(GovernorConfig::default(), clock);
        let root = governor.scope(None, Some(dec!(1.00)));
        let first = governor.child_scope(&root, false).unwrap();
        let second = governor.child_scope(&root, false).unwrap();

        governor
            .run(RunRequest::new("chat", ["gpt-4o"]).scope(&first), |_| async {
                Ok(reply(dec!(0.90)))
            })
            .await
            .unwrap();
        assert_eq!(root.spent(), dec!(0.90));

        governor
            .run(RunRequest::new("chat", ["gpt-4o"]).scope(&second), |_| async {
                Ok(reply(dec!(0.10)))
            })
            .await
            .unwrap();
        assert_eq!(root.spent(), dec!(1.00));

        let mut calls = 0;
        let result = governor
            .run(RunRequest::new("chat", ["gpt-4o"]).scope(&second), |_| {
                calls += 1;
                async { Ok(reply(dec!(0.01))) }
            })
            .await;
        assert!(matches!(result, Err(Error::WorkflowCostExceeded { .. })));
        assert_eq!(calls, 0);
        assert!(governor.child_scope(&root, false).is_err());
    }

    #[tokio::test]
    async fn test_shared_circuits_reach_other_governors() {
        let clock = ManualClock::shared(start());
        let store = Arc::new(MemoryCounterStore::with_clock(clock.clone()));
        let mut config = GovernorConfig::default();
        config.circuit.failure_threshold = 2;
        let build = || {
            Governor::builder()
                .config(config.clone())
                .clock(clock.clone())
                .store(store.clone())
                .shared_circuits("circuit")
                .build()
                .unwrap()
        };
        let first = build();
        let second = build();
        assert!(second.circuits().is_shared());

        first.circuits().record_failure("gpt-4o", "acme").await;
        first.circuits().record_failure("gpt-4o", "acme").await;

        let mut calls = 0;
        let result = second
            .run(RunRequest::new("chat", ["gpt-4o"]).tenant("acme"), |_| {
                calls += 1;
                async { Ok(reply(dec!(0.1))) }
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen { .. })));
        assert_eq!(calls, 0);
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = GovernorConfig::default();
        config.circuit.failure_threshold = 0;
        assert!(matches!(
            Governor::builder().config(config).build(),
            Err(Error::Config(_))
        ));
    }
}
