//! Execution records and the append-only sink the ledger recomputes from.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Success,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionStatus::Error | ExecutionStatus::Timeout)
    }
}

/// One logical call, as persisted by the instrumentation layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub agent_type: String,
    pub model_id: Option<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens: u64,
    pub cost: Decimal,
    pub attempts_count: u32,
    pub parent_execution_id: Option<Uuid>,
    pub root_execution_id: Option<Uuid>,
}

impl ExecutionRecord {
    pub fn start(
        tenant_id: impl Into<String>,
        agent_type: impl Into<String>,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            agent_type: agent_type.into(),
            model_id: None,
            status: ExecutionStatus::Running,
            started_at,
            completed_at: None,
            tokens: 0,
            cost: Decimal::ZERO,
            attempts_count: 0,
            parent_execution_id: None,
            root_execution_id: None,
        }
    }

    pub fn with_parent(mut self, parent: Uuid, root: Option<Uuid>) -> Self {
        self.parent_execution_id = Some(parent);
        self.root_execution_id = Some(root.unwrap_or(parent));
        self
    }

    pub fn complete(
        mut self,
        status: ExecutionStatus,
        completed_at: DateTime<Utc>,
        cost: Decimal,
        tokens: u64,
    ) -> Self {
        self.status = status;
        self.completed_at = Some(completed_at);
        self.cost = cost;
        self.tokens = tokens;
        self
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn attempts(mut self, attempts_count: u32) -> Self {
        self.attempts_count = attempts_count;
        self
    }

    fn counts_for(&self, tenant_id: &str, since: DateTime<Utc>) -> bool {
        self.tenant_id == tenant_id && self.started_at >= since
    }
}

/// Persisted executions, queried only when the counter cache is cold.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    async fn append(&self, record: ExecutionRecord) -> Result<()>;

    async fn sum_cost_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<Decimal>;

    async fn sum_tokens_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn count_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn count_errors_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64>;

    async fn sum_agent_cost_since(
        &self,
        tenant_id: &str,
        agent_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryExecutionStore {
    records: Arc<RwLock<Vec<ExecutionRecord>>>,
}

impl MemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExecutionRecord> {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn fold<T>(
        &self,
        tenant_id: &str,
        since: DateTime<Utc>,
        init: T,
        f: impl Fn(T, &ExecutionRecord) -> T,
    ) -> T {
        self.records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.counts_for(tenant_id, since))
            .fold(init, f)
    }
}

#[async_trait]
impl ExecutionStore for MemoryExecutionStore {
    async fn append(&self, record: ExecutionRecord) -> Result<()> {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
        Ok(())
    }

    async fn sum_cost_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<Decimal> {
        Ok(self.fold(tenant_id, since, Decimal::ZERO, |acc, r| acc + r.cost))
    }

    async fn sum_tokens_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.fold(tenant_id, since, 0u64, |acc, r| acc.saturating_add(r.tokens)))
    }

    async fn count_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.fold(tenant_id, since, 0u64, |acc, _| acc + 1))
    }

    async fn count_errors_since(&self, tenant_id: &str, since: DateTime<Utc>) -> Result<u64> {
        Ok(self.fold(tenant_id, since, 0u64, |acc, r| {
            acc + u64::from(r.status.is_failure())
        }))
    }

    async fn sum_agent_cost_since(
        &self,
        tenant_id: &str,
        agent_type: &str,
        since: DateTime<Utc>,
    ) -> Result<Decimal> {
        Ok(self.fold(tenant_id, since, Decimal::ZERO, |acc, r| {
            if r.agent_type == agent_type {
                acc + r.cost
            } else {
                acc
            }
        }))
    }
}
