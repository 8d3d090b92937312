//! Timeout, cost and recursion limits handed down to nested calls.
//!
//! A child call never gets more time or money than its parent has left:
//!
//! ```rust
//! use std::time::Duration;
//! use agent_governor::ParentScope;
//! use rust_decimal_macros::dec;
//!
//! let parent = ParentScope::new()
//!     .timeout(Duration::from_secs(10))
//!     .elapsed(Duration::from_secs(7))
//!     .max_cost(dec!(1.00))
//!     .accumulated_cost(dec!(0.80));
//!
//! let child = parent.inherit(false).unwrap();
//! assert_eq!(child.timeout, Some(Duration::from_secs(3)));
//! assert_eq!(child.max_cost, Some(dec!(0.20)));
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rust_decimal::Decimal;

use crate::clock::SharedClock;
use crate::{Error, Result};

/// Snapshot of a parent execution's limits and consumption.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParentScope {
    pub timeout: Option<Duration>,
    pub elapsed: Duration,
    pub max_cost: Option<Decimal>,
    pub accumulated_cost: Decimal,
    pub recursion_depth: u32,
    pub max_recursion_depth: Option<u32>,
}

impl ParentScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = elapsed;
        self
    }

    pub fn max_cost(mut self, max_cost: Decimal) -> Self {
        self.max_cost = Some(max_cost);
        self
    }

    pub fn accumulated_cost(mut self, cost: Decimal) -> Self {
        self.accumulated_cost = cost;
        self
    }

    pub fn recursion(mut self, depth: u32, max_depth: u32) -> Self {
        self.recursion_depth = depth;
        self.max_recursion_depth = Some(max_depth);
        self
    }

    pub fn remaining_timeout(&self) -> Option<Duration> {
        self.timeout.map(|t| t.saturating_sub(self.elapsed))
    }

    pub fn remaining_cost(&self) -> Option<Decimal> {
        self.max_cost
            .map(|max| (max - self.accumulated_cost).max(Decimal::ZERO))
    }

    /// Limits for a child call, failing fast when nothing is left.
    ///
    /// `self_referential` marks a nested call to the same workflow; only
    /// those count towards the recursion depth.
    pub fn inherit(&self, self_referential: bool) -> Result<InheritedLimits> {
        let timeout = self.remaining_timeout();
        if let Some(configured) = self.timeout
            && timeout.is_some_and(|t| t.is_zero())
        {
            return Err(Error::WorkflowTimeoutExceeded {
                timeout: configured,
                elapsed: self.elapsed,
            });
        }

        let max_cost = self.remaining_cost();
        if let Some(configured) = self.max_cost
            && max_cost.is_some_and(|c| c <= Decimal::ZERO)
        {
            return Err(Error::WorkflowCostExceeded {
                max_cost: configured,
                spent: self.accumulated_cost,
            });
        }

        let recursion_depth = self.recursion_depth + u32::from(self_referential);
        if let Some(max) = self.max_recursion_depth
            && recursion_depth > max
        {
            return Err(Error::RecursionDepthExceeded {
                depth: recursion_depth,
                max,
            });
        }

        Ok(InheritedLimits {
            timeout,
            max_cost,
            recursion_depth,
            max_recursion_depth: self.max_recursion_depth,
        })
    }
}

/// Upper bounds a child call must respect.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InheritedLimits {
    pub timeout: Option<Duration>,
    pub max_cost: Option<Decimal>,
    pub recursion_depth: u32,
    pub max_recursion_depth: Option<u32>,
}

impl InheritedLimits {
    /// The smaller of the child's own timeout and what the parent has left.
    pub fn clamp_timeout(&self, requested: Option<Duration>) -> Option<Duration> {
        match (requested, self.timeout) {
            (Some(requested), Some(left)) => Some(requested.min(left)),
            (requested, left) => requested.or(left),
        }
    }

    pub fn clamp_cost(&self, requested: Option<Decimal>) -> Option<Decimal> {
        match (requested, self.max_cost) {
            (Some(requested), Some(left)) => Some(requested.min(left)),
            (requested, left) => requested.or(left),
        }
    }

    pub fn deadline_from(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.timeout
            .and_then(|t| TimeDelta::from_std(t).ok())
            .and_then(|t| now.checked_add_signed(t))
    }
}

/// Cost ceiling and running spend of one scope level.
#[derive(Debug)]
struct CostBudget {
    max_cost: Option<Decimal>,
    spent: Mutex<Decimal>,
}

impl CostBudget {
    fn new(max_cost: Option<Decimal>) -> Arc<Self> {
        Arc::new(Self {
            max_cost,
            spent: Mutex::new(Decimal::ZERO),
        })
    }

    fn spent(&self) -> Decimal {
        *self.spent.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn charge(&self, cost: Decimal) {
        *self.spent.lock().unwrap_or_else(|e| e.into_inner()) += cost;
    }

    fn remaining(&self) -> Option<Decimal> {
        self.max_cost.map(|max| max - self.spent())
    }
}

/// Live tracker for a running scope; produces [`ParentScope`] snapshots for
/// its children.
///
/// Cost charged to a child is charged to every enclosing scope as well, so
/// siblings draw down one shared parent budget.
#[derive(Debug)]
pub struct ScopeTracker {
    clock: SharedClock,
    started_at: DateTime<Utc>,
    timeout: Option<Duration>,
    budget: Arc<CostBudget>,
    /// Enclosing scopes, outermost first.
    ancestors: Vec<Arc<CostBudget>>,
    recursion_depth: u32,
    max_recursion_depth: Option<u32>,
}

impl ScopeTracker {
    pub fn new(clock: SharedClock, timeout: Option<Duration>, max_cost: Option<Decimal>) -> Self {
        let started_at = clock.now();
        Self {
            clock,
            started_at,
            timeout,
            budget: CostBudget::new(max_cost),
            ancestors: Vec::new(),
            recursion_depth: 0,
            max_recursion_depth: None,
        }
    }

    /// A detached scope; its spend is not charged to anything else.
    pub fn from_limits(clock: SharedClock, limits: &InheritedLimits) -> Self {
        Self {
            recursion_depth: limits.recursion_depth,
            max_recursion_depth: limits.max_recursion_depth,
            ..Self::new(clock, limits.timeout, limits.max_cost)
        }
    }

    pub fn with_max_recursion_depth(mut self, max: u32) -> Self {
        self.max_recursion_depth = Some(max);
        self
    }

    pub fn add_cost(&self, cost: Decimal) {
        let cost = cost.max(Decimal::ZERO);
        self.budget.charge(cost);
        for ancestor in &self.ancestors {
            ancestor.charge(cost);
        }
    }

    /// Spend charged to this scope, including its children.
    pub fn spent(&self) -> Decimal {
        self.budget.spent()
    }

    pub fn elapsed(&self) -> Duration {
        (self.clock.now() - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.timeout
            .and_then(|t| TimeDelta::from_std(t).ok())
            .and_then(|t| self.started_at.checked_add_signed(t))
    }

    pub fn recursion_depth(&self) -> u32 {
        self.recursion_depth
    }

    /// Limits as seen from this scope. The cost figures come from whichever
    /// level in the chain has the least money left.
    pub fn snapshot(&self) -> ParentScope {
        let binding = std::iter::once(&self.budget)
            .chain(self.ancestors.iter())
            .filter_map(|level| level.remaining().map(|left| (left, level)))
            .min_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, level)| level)
            .unwrap_or(&self.budget);

        ParentScope {
            timeout: self.timeout,
            elapsed: self.elapsed(),
            max_cost: binding.max_cost,
            accumulated_cost: binding.spent(),
            recursion_depth: self.recursion_depth,
            max_recursion_depth: self.max_recursion_depth,
        }
    }

    /// Start a nested scope bounded by what this one has left.
    pub fn child(&self, self_referential: bool) -> Result<ScopeTracker> {
        let limits = self.snapshot().inherit(self_referential)?;
        tracing::debug!(
            timeout_ms = limits.timeout.map(|t| t.as_millis() as u64),
            max_cost = ?limits.max_cost,
            depth = limits.recursion_depth,
            "Entering child scope"
        );
        let mut ancestors = self.ancestors.clone();
        ancestors.push(Arc::clone(&self.budget));
        Ok(Self {
            ancestors,
            ..Self::from_limits(self.clock.clone(), &limits)
        })
    }
}
