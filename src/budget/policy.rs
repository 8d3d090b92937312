//! Budget policy layers and their resolution.

use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::period::Period;

/// What happens when a limit is reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Enforcement {
    /// Track spend only.
    None,
    /// Track spend and alert.
    #[default]
    Soft,
    /// Block calls once a limit is reached.
    Hard,
}

impl Enforcement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Enforcement::None => "none",
            Enforcement::Soft => "soft",
            Enforcement::Hard => "hard",
        }
    }
}

impl FromStr for Enforcement {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Enforcement::None),
            "soft" => Ok(Enforcement::Soft),
            "hard" => Ok(Enforcement::Hard),
            other => Err(format!(
                "unknown enforcement '{}', expected none, soft or hard",
                other
            )),
        }
    }
}

impl std::fmt::Display for Enforcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    Cost,
    Tokens,
    Executions,
    AgentCost(String),
}

/// A limited quantity within a period, e.g. "monthly tokens".
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LimitDimension {
    pub period: Period,
    pub kind: LimitKind,
}

impl LimitDimension {
    pub fn cost(period: Period) -> Self {
        Self {
            period,
            kind: LimitKind::Cost,
        }
    }

    pub fn tokens(period: Period) -> Self {
        Self {
            period,
            kind: LimitKind::Tokens,
        }
    }

    pub fn executions(period: Period) -> Self {
        Self {
            period,
            kind: LimitKind::Executions,
        }
    }

    pub fn agent_cost(period: Period, agent_type: impl Into<String>) -> Self {
        Self {
            period,
            kind: LimitKind::AgentCost(agent_type.into()),
        }
    }

    /// Whether an estimated call cost counts against this dimension.
    pub fn is_monetary(&self) -> bool {
        matches!(self.kind, LimitKind::Cost | LimitKind::AgentCost(_))
    }
}

impl std::fmt::Display for LimitDimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            LimitKind::Cost => write!(f, "{} cost", self.period),
            LimitKind::Tokens => write!(f, "{} tokens", self.period),
            LimitKind::Executions => write!(f, "{} executions", self.period),
            LimitKind::AgentCost(agent) => write!(f, "{} cost for agent '{}'", self.period, agent),
        }
    }
}

fn default_true() -> bool {
    true
}

/// One layer of budget configuration.
///
/// `None` means "not set at this layer"; an unset limit resolves to the
/// layer below, or to unlimited.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetPolicy {
    pub daily_limit: Option<Decimal>,
    pub monthly_limit: Option<Decimal>,
    pub daily_token_limit: Option<u64>,
    pub monthly_token_limit: Option<u64>,
    pub daily_execution_limit: Option<u64>,
    pub monthly_execution_limit: Option<u64>,
    pub per_agent_daily: HashMap<String, Decimal>,
    pub per_agent_monthly: HashMap<String, Decimal>,
    pub enforcement: Option<Enforcement>,
    /// When false, limits from lower layers are discarded.
    #[serde(default = "default_true")]
    pub inherit_global_defaults: bool,
}

impl Default for BudgetPolicy {
    fn default() -> Self {
        Self {
            daily_limit: None,
            monthly_limit: None,
            daily_token_limit: None,
            monthly_token_limit: None,
            daily_execution_limit: None,
            monthly_execution_limit: None,
            per_agent_daily: HashMap::new(),
            per_agent_monthly: HashMap::new(),
            enforcement: None,
            inherit_global_defaults: true,
        }
    }
}

impl BudgetPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn daily_limit(mut self, limit: Decimal) -> Self {
        self.daily_limit = Some(limit);
        self
    }

    pub fn monthly_limit(mut self, limit: Decimal) -> Self {
        self.monthly_limit = Some(limit);
        self
    }

    pub fn daily_token_limit(mut self, limit: u64) -> Self {
        self.daily_token_limit = Some(limit);
        self
    }

    pub fn monthly_token_limit(mut self, limit: u64) -> Self {
        self.monthly_token_limit = Some(limit);
        self
    }

    pub fn daily_execution_limit(mut self, limit: u64) -> Self {
        self.daily_execution_limit = Some(limit);
        self
    }

    pub fn monthly_execution_limit(mut self, limit: u64) -> Self {
        self.monthly_execution_limit = Some(limit);
        self
    }

    pub fn per_agent_daily(mut self, agent_type: impl Into<String>, limit: Decimal) -> Self {
        self.per_agent_daily.insert(agent_type.into(), limit);
        self
    }

    pub fn per_agent_monthly(mut self, agent_type: impl Into<String>, limit: Decimal) -> Self {
        self.per_agent_monthly.insert(agent_type.into(), limit);
        self
    }

    pub fn enforcement(mut self, enforcement: Enforcement) -> Self {
        self.enforcement = Some(enforcement);
        self
    }

    pub fn inherit_global_defaults(mut self, inherit: bool) -> Self {
        self.inherit_global_defaults = inherit;
        self
    }

    /// Lay `upper` over `self`; values set in `upper` win.
    pub fn overlay(&self, upper: &BudgetPolicy) -> BudgetPolicy {
        let enforcement = upper.enforcement.or(self.enforcement);
        if !upper.inherit_global_defaults {
            return BudgetPolicy {
                enforcement,
                inherit_global_defaults: true,
                ..upper.clone()
            };
        }

        let mut per_agent_daily = self.per_agent_daily.clone();
        per_agent_daily.extend(upper.per_agent_daily.clone());
        let mut per_agent_monthly = self.per_agent_monthly.clone();
        per_agent_monthly.extend(upper.per_agent_monthly.clone());

        BudgetPolicy {
            daily_limit: upper.daily_limit.or(self.daily_limit),
            monthly_limit: upper.monthly_limit.or(self.monthly_limit),
            daily_token_limit: upper.daily_token_limit.or(self.daily_token_limit),
            monthly_token_limit: upper.monthly_token_limit.or(self.monthly_token_limit),
            daily_execution_limit: upper.daily_execution_limit.or(self.daily_execution_limit),
            monthly_execution_limit: upper
                .monthly_execution_limit
                .or(self.monthly_execution_limit),
            per_agent_daily,
            per_agent_monthly,
            enforcement,
            inherit_global_defaults: true,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let negative = [
            ("daily_limit", self.daily_limit),
            ("monthly_limit", self.monthly_limit),
        ]
        .into_iter()
        .chain(
            self.per_agent_daily
                .values()
                .chain(self.per_agent_monthly.values())
                .map(|v| ("per_agent limit", Some(*v))),
        )
        .find(|(_, v)| v.is_some_and(|v| v.is_sign_negative()));

        match negative {
            Some((name, Some(value))) => Err(format!("{} must not be negative, got {}", name, value)),
            _ => Ok(()),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Limit {
    pub dimension: LimitDimension,
    pub value: Decimal,
}

/// Immutable policy after merging all layers for one call.
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedPolicy {
    pub enforcement: Enforcement,
    limits: Vec<Limit>,
}

impl ResolvedPolicy {
    /// Merge layers ordered from lowest (defaults) to highest (call-site).
    pub fn resolve<'a>(layers: impl IntoIterator<Item = &'a BudgetPolicy>) -> Self {
        let merged = layers
            .into_iter()
            .fold(BudgetPolicy::default(), |acc, layer| acc.overlay(layer));
        Self::from_policy(&merged)
    }

    pub fn from_policy(policy: &BudgetPolicy) -> Self {
        let mut limits = Vec::new();
        for period in Period::ALL {
            let (cost, tokens, executions, per_agent) = match period {
                Period::Daily => (
                    policy.daily_limit,
                    policy.daily_token_limit,
                    policy.daily_execution_limit,
                    &policy.per_agent_daily,
                ),
                Period::Monthly => (
                    policy.monthly_limit,
                    policy.monthly_token_limit,
                    policy.monthly_execution_limit,
                    &policy.per_agent_monthly,
                ),
            };
            if let Some(value) = cost {
                limits.push(Limit {
                    dimension: LimitDimension::cost(period),
                    value,
                });
            }
            if let Some(value) = tokens {
                limits.push(Limit {
                    dimension: LimitDimension::tokens(period),
                    value: Decimal::from(value),
                });
            }
            if let Some(value) = executions {
                limits.push(Limit {
                    dimension: LimitDimension::executions(period),
                    value: Decimal::from(value),
                });
            }
            let sorted: BTreeMap<_, _> = per_agent.iter().collect();
            for (agent, value) in sorted {
                limits.push(Limit {
                    dimension: LimitDimension::agent_cost(period, agent.clone()),
                    value: *value,
                });
            }
        }

        Self {
            enforcement: policy.enforcement.unwrap_or_default(),
            limits,
        }
    }

    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    pub fn limit_for(&self, dimension: &LimitDimension) -> Option<Decimal> {
        self.limits
            .iter()
            .find(|l| &l.dimension == dimension)
            .map(|l| l.value)
    }

    /// Limits that apply to a call by `agent_type`.
    pub fn applicable<'a>(&'a self, agent_type: &'a str) -> impl Iterator<Item = &'a Limit> + 'a {
        self.limits.iter().filter(move |l| match &l.dimension.kind {
            LimitKind::AgentCost(agent) => agent == agent_type,
            _ => true,
        })
    }

    pub fn is_unlimited(&self) -> bool {
        self.limits.is_empty()
    }
}
