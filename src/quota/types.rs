use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::models::catalog::ModelId;
use crate::quota::tier::UserTier;

/// Who a request is billed to. Metering and alerts are per organization;
/// a user without one is their own billing account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSubject {
    pub user_id: String,
    pub org_id: Option<String>,
}

impl QuotaSubject {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            org_id: None,
        }
    }

    pub fn with_org(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn billing_account(&self) -> &str {
        self.org_id.as_deref().unwrap_or(&self.user_id)
    }
}

/// A user's tier, limits and current counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub user_id: String,
    pub tier: UserTier,
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub allowed_models: Vec<ModelId>,
    pub overage_enabled: bool,
}

impl QuotaSnapshot {
    /// A fresh account on `tier` with nothing used yet.
    pub fn fresh(user_id: impl Into<String>, tier: UserTier) -> Self {
        let limits = tier.limits();
        Self {
            user_id: user_id.into(),
            tier,
            daily_used: 0,
            daily_limit: limits.daily_tokens,
            monthly_used: 0,
            monthly_limit: limits.monthly_tokens,
            allowed_models: tier.allowed_models().to_vec(),
            overage_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    ModelNotAllowed,
    DailyLimit,
    MonthlyLimit,
}

impl DenialReason {
    /// Over-limit denials can be converted into overage; a model outside
    /// the plan cannot.
    pub fn is_over_limit(&self) -> bool {
        matches!(self, DenialReason::DailyLimit | DenialReason::MonthlyLimit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuotaCheckResult {
    pub allowed: bool,
    pub reason: Option<String>,
    pub denial: Option<DenialReason>,
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub is_overage: Option<bool>,
    pub overage_allowed: Option<bool>,
    pub estimated_cost_usd: Option<Decimal>,
}

impl QuotaCheckResult {
    pub fn allow(snapshot: &QuotaSnapshot) -> Self {
        Self {
            allowed: true,
            reason: None,
            denial: None,
            daily_used: snapshot.daily_used,
            daily_limit: snapshot.daily_limit,
            monthly_used: snapshot.monthly_used,
            monthly_limit: snapshot.monthly_limit,
            is_overage: None,
            overage_allowed: None,
            estimated_cost_usd: None,
        }
    }

    pub fn deny(snapshot: &QuotaSnapshot, denial: DenialReason, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            denial: Some(denial),
            ..Self::allow(snapshot)
        }
    }

    /// Admission when the store cannot be consulted. Counters are unknown.
    pub fn fail_open(reason: impl Into<String>) -> Self {
        Self {
            allowed: true,
            reason: Some(reason.into()),
            denial: None,
            daily_used: 0,
            daily_limit: 0,
            monthly_used: 0,
            monthly_limit: 0,
            is_overage: None,
            overage_allowed: None,
            estimated_cost_usd: None,
        }
    }
}

/// One generation's real usage. Append-only; `request_id` makes the write
/// idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub request_id: String,
    pub user_id: String,
    pub org_id: Option<String>,
    pub model: ModelId,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Decimal,
    pub conversation_id: Option<String>,
    pub task_type: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl UsageRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Caller-supplied correlation for a usage record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    pub request_id: String,
    pub conversation_id: Option<String>,
    pub task_type: Option<String>,
}

impl UsageContext {
    pub fn new() -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            conversation_id: None,
            task_type: None,
        }
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeteringOutcome {
    pub is_overage: bool,
    pub overage_cost: Decimal,
}

/// Metered usage for one billing account and period (`YYYY-MM`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub org_id: String,
    pub period: String,
    pub total_tokens: u64,
    pub premium_tokens: u64,
    pub overage_tokens: u64,
    pub overage_cost: Decimal,
}

/// What happened while recording usage. Failures are collected, never raised.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageOutcome {
    pub recorded: bool,
    /// The request id had already been recorded; nothing was counted twice.
    pub duplicate: bool,
    pub metering: Option<MeteringOutcome>,
    pub errors: Vec<String>,
}

impl UsageOutcome {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Per-user tiers, limits and counters. Check-and-increment atomicity lives
/// here, not in the caller.
///
/// An admitted check holds its estimate against the counters under the
/// request id. The hold is settled by `record_ai_usage` or given back by
/// `release_reservation`.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get_or_create_quota(&self, user_id: &str) -> Result<QuotaSnapshot>;

    /// Checks and, when admitted, reserves `estimated_tokens` in one step.
    /// A request id that already holds a reservation is not charged twice.
    async fn can_use_tokens(
        &self,
        user_id: &str,
        request_id: &str,
        estimated_tokens: u64,
        model: ModelId,
    ) -> Result<QuotaCheckResult>;

    /// Appends the record and replaces any reservation for its request id
    /// with the real token count. Usage from a day or month that has already
    /// rolled over is not added to the current counters. Returns false when
    /// the request id was already recorded.
    async fn record_ai_usage(&self, record: &UsageRecord) -> Result<bool>;

    /// Gives back the tokens held for a request that will not be recorded.
    /// Returns false when nothing was held.
    async fn release_reservation(&self, user_id: &str, request_id: &str) -> Result<bool>;

    async fn set_tier(&self, user_id: &str, tier: UserTier) -> Result<()>;

    async fn set_overage_enabled(&self, user_id: &str, enabled: bool) -> Result<()>;
}

#[async_trait]
pub trait MeteringSink: Send + Sync {
    async fn track_tokens(&self, org_id: &str, total_tokens: u64) -> Result<MeteringOutcome>;

    async fn track_premium_model_tokens(&self, org_id: &str, total_tokens: u64) -> Result<()>;

    async fn usage_summary(&self, org_id: &str) -> Result<UsageSummary>;
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Best effort; callers do not wait on delivery.
    async fn send_alert_notifications(&self, org_id: &str) -> Result<()>;
}

#[async_trait]
pub trait OverageEligibility: Send + Sync {
    async fn is_overage_allowed(&self, subject: &QuotaSubject) -> Result<bool>;
}
