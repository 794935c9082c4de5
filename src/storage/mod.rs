// Storage layer for quota accounts, usage records and metering

pub mod cost_alerts;
pub mod database;
pub mod memory;
pub mod metering;
pub mod quota_store;

use chrono::{DateTime, Utc};

pub use cost_alerts::{AlertSeverity, CostAlert, CostAlertConfig, CostAlertType, QuotaAlerts};
pub use database::{decimal_helpers, Database, DatabaseStatistics};
pub use memory::{InMemoryMeter, InMemoryQuotaStore};
pub use metering::SqliteMeter;
pub use quota_store::SqliteQuotaStore;

/// Daily counter period, `YYYY-MM-DD` in UTC.
pub fn day_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

/// Monthly counter and billing period, `YYYY-MM` in UTC.
pub fn month_key(now: DateTime<Utc>) -> String {
    now.format("%Y-%m").to_string()
}
