//! Trading-day freshness: a cached index is fresh only while the trading
//! calendar date at build time equals today's trading calendar date.

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    timezone: Tz,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(chrono_tz::Asia::Kolkata)
    }
}

impl FreshnessPolicy {
    pub fn new(timezone: Tz) -> Self {
        Self { timezone }
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }

    /// Calendar date of an instant in the trading timezone
    pub fn trading_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.timezone).date_naive()
    }

    pub fn is_fresh(&self, built_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.trading_date(built_at) == self.trading_date(now)
    }

    pub fn is_fresh_now(&self, built_at: DateTime<Utc>) -> bool {
        self.is_fresh(built_at, Utc::now())
    }
}

pub fn is_fresh(built_at: DateTime<Utc>, now: DateTime<Utc>, timezone: Tz) -> bool {
    FreshnessPolicy::new(timezone).is_fresh(built_at, now)
}
