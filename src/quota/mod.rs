//! Token quotas: admission before a request, accounting after it.

pub mod estimate;
pub mod manager;
pub mod policy;
pub mod tier;
pub mod types;

pub use estimate::estimate_tokens;
pub use manager::{PlanOverage, QuotaManager, QuotaSettings};
pub use tier::{TierLimits, UserTier};
pub use types::{
    AlertSink, DenialReason, MeteringOutcome, MeteringSink, OverageEligibility, QuotaCheckResult,
    QuotaSnapshot, QuotaStore, QuotaSubject, UsageContext, UsageOutcome, UsageRecord, UsageSummary,
};
