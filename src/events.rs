//! Operational events delivered to a single caller-supplied observer.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Soft-enforced limit reached; execution continues.
    BudgetSoftCap,

    /// Hard-enforced limit reached; execution blocked.
    BudgetHardCap,

    /// Circuit breaker opened for a backend.
    BreakerOpen,

    /// Circuit breaker closed after a successful probe.
    BreakerClosed,

    /// Single execution far above the configured cost or token thresholds.
    AgentAnomaly,
}

impl EventKind {
    pub fn all() -> &'static [EventKind] {
        &[
            EventKind::BudgetSoftCap,
            EventKind::BudgetHardCap,
            EventKind::BreakerOpen,
            EventKind::BreakerClosed,
            EventKind::AgentAnomaly,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BudgetSoftCap => "budget_soft_cap",
            EventKind::BudgetHardCap => "budget_hard_cap",
            EventKind::BreakerOpen => "breaker_open",
            EventKind::BreakerClosed => "breaker_closed",
            EventKind::AgentAnomaly => "agent_anomaly",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: String,
    pub fields: Map<String, Value>,
}

impl Event {
    pub fn new(kind: EventKind, tenant_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            timestamp,
            tenant_id: tenant_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Flat payload: `event`, `timestamp`, `tenant_id` plus event-specific fields.
    pub fn payload(&self) -> Value {
        let mut payload = self.fields.clone();
        payload.insert("event".into(), Value::String(self.kind.to_string()));
        payload.insert("timestamp".into(), Value::String(self.timestamp.to_rfc3339()));
        payload.insert("tenant_id".into(), Value::String(self.tenant_id.clone()));
        Value::Object(payload)
    }
}

/// Synchronous observer hook.
pub trait EventObserver: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> EventObserver for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        self(event)
    }
}

pub type SharedObserver = Arc<dyn EventObserver>;

pub(crate) fn emit(observer: Option<&SharedObserver>, event: Event) {
    tracing::debug!(event = %event.kind, tenant_id = %event.tenant_id, "Emitting event");
    if let Some(observer) = observer {
        observer.on_event(&event);
    }
}

/// Observer that keeps every event in memory.
#[derive(Debug, Default)]
pub struct EventCollector {
    events: Mutex<Vec<Event>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_kind(&self, kind: EventKind) -> Vec<Event> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.of_kind(kind).len()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl EventObserver for EventCollector {
    fn on_event(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}
