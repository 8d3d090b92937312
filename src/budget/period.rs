//! Budget periods and their identifiers.

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Daily,
    Monthly,
}

impl Period {
    pub const ALL: [Period; 2] = [Period::Daily, Period::Monthly];

    pub fn label(&self) -> &'static str {
        match self {
            Period::Daily => "daily",
            Period::Monthly => "monthly",
        }
    }

    /// Identifier of the period containing `at` (UTC).
    pub fn id_at(&self, at: DateTime<Utc>) -> PeriodId {
        let date = at.date_naive();
        match self {
            Period::Daily => PeriodId(date.year() as u32 * 10_000 + date.month() * 100 + date.day()),
            Period::Monthly => PeriodId(date.year() as u32 * 100 + date.month()),
        }
    }

    /// First day of the period containing `at`.
    pub fn start_date(&self, at: DateTime<Utc>) -> NaiveDate {
        let date = at.date_naive();
        match self {
            Period::Daily => date,
            Period::Monthly => date.with_day(1).unwrap_or(date),
        }
    }

    /// Midnight UTC at the start of the period containing `at`.
    pub fn start_of(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let start = self.start_date(at);
        Utc.from_utc_datetime(&start.and_hms_opt(0, 0, 0).unwrap_or_default())
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Compact numeric period identifier: `YYYYMMDD` for days, `YYYYMM` for months.
///
/// Stored as a counter value, so it doubles as the period's reset marker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriodId(pub u32);

impl PeriodId {
    pub fn to_decimal(self) -> Decimal {
        Decimal::from(self.0)
    }

    pub fn from_decimal(value: Decimal) -> Option<Self> {
        value.to_u32().map(PeriodId)
    }

    /// First calendar day the identifier denotes.
    pub fn start_date(self) -> Option<NaiveDate> {
        let raw = self.0;
        if raw >= 10_000_000 {
            NaiveDate::from_ymd_opt((raw / 10_000) as i32, (raw / 100) % 100, raw % 100)
        } else {
            NaiveDate::from_ymd_opt((raw / 100) as i32, raw % 100, 1)
        }
    }
}

impl std::fmt::Display for PeriodId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_ids() {
        let at = Utc.with_ymd_and_hms(2026, 10, 16, 23, 59, 59).unwrap();
        assert_eq!(Period::Daily.id_at(at), PeriodId(20261016));
        assert_eq!(Period::Monthly.id_at(at), PeriodId(202610));
    }

    #[test]
    fn test_period_start() {
        let at = Utc.with_ymd_and_hms(2026, 2, 14, 9, 30, 0).unwrap();
        assert_eq!(
            Period::Monthly.start_of(at),
            Utc.with_ymd_and_hms(2026, 2, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            Period::Daily.start_of(at),
            Utc.with_ymd_and_hms(2026, 2, 14, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_period_id_round_trips_through_marker() {
        let id = PeriodId(20260131);
        assert_eq!(PeriodId::from_decimal(id.to_decimal()), Some(id));
        assert_eq!(id.start_date(), NaiveDate::from_ymd_opt(2026, 1, 31));
        assert_eq!(PeriodId(202601).start_date(), NaiveDate::from_ymd_opt(2026, 1, 1));
    }
}
