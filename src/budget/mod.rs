//! Multi-tenant budget enforcement over atomic counters.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

mod execution;
mod ledger;
mod period;
mod policy;
mod tenant;

pub use execution::{ExecutionRecord, ExecutionStatus, ExecutionStore, MemoryExecutionStore};
pub use ledger::{BudgetLedger, BudgetStatus, DimensionStatus, LedgerConfig, Spend, TenantUsage};
pub use period::{Period, PeriodId};
pub use policy::{BudgetPolicy, Enforcement, Limit, LimitDimension, LimitKind, ResolvedPolicy};
pub use tenant::{Tenant, TenantIdentity, TenantRef, TenantRegistry};

/// Tenant id used for tenant-less calls.
pub const GLOBAL_TENANT: &str = "global";

/// Scale factor for storing Decimal costs as AtomicU64 (6 decimal places precision).
pub(crate) const COST_SCALE_FACTOR: Decimal = dec!(1_000_000);
