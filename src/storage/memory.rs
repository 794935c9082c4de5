//! Process-local stores for tests and `--ephemeral` runs. Same contracts as
//! the SQLite stores; nothing survives a restart.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::error::Result;
use crate::models::catalog::ModelId;
use crate::quota::policy;
use crate::quota::tier::UserTier;
use crate::quota::types::{
    MeteringOutcome, MeteringSink, QuotaCheckResult, QuotaSnapshot, QuotaStore, UsageRecord, UsageSummary,
};
use crate::storage::metering::apply_tokens;
use crate::storage::{day_key, month_key};

#[derive(Debug, Clone)]
struct Account {
    tier: UserTier,
    overage_enabled: bool,
    daily_used: u64,
    daily_period: String,
    monthly_used: u64,
    monthly_period: String,
}

impl Account {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            tier: UserTier::Free,
            overage_enabled: false,
            daily_used: 0,
            daily_period: day_key(now),
            monthly_used: 0,
            monthly_period: month_key(now),
        }
    }

    fn roll_forward(&mut self, now: DateTime<Utc>) {
        let day = day_key(now);
        if self.daily_period < day {
            self.daily_used = 0;
            self.daily_period = day;
        }
        let month = month_key(now);
        if self.monthly_period < month {
            self.monthly_used = 0;
            self.monthly_period = month;
        }
    }

    fn snapshot(&self, user_id: &str) -> QuotaSnapshot {
        QuotaSnapshot {
            daily_used: self.daily_used,
            monthly_used: self.monthly_used,
            overage_enabled: self.overage_enabled,
            ..QuotaSnapshot::fresh(user_id, self.tier)
        }
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    user_id: String,
    tokens: u64,
    daily_period: String,
    monthly_period: String,
}

#[derive(Default)]
struct QuotaState {
    accounts: HashMap<String, Account>,
    reservations: HashMap<String, Reservation>,
    request_ids: HashSet<String>,
    records: Vec<UsageRecord>,
}

impl QuotaState {
    fn account(&mut self, user_id: &str, now: DateTime<Utc>) -> &mut Account {
        let account = self
            .accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Account::new(now));
        account.roll_forward(now);
        account
    }

    /// Drops the hold for `request_id` and takes its tokens back off the
    /// account, if they were charged to the account's current periods.
    fn release(&mut self, user_id: &str, request_id: &str, now: DateTime<Utc>) -> bool {
        let held = match self.reservations.get(request_id) {
            Some(reservation) if reservation.user_id == user_id => reservation.clone(),
            _ => return false,
        };
        self.reservations.remove(request_id);

        let account = self.account(user_id, now);
        if account.daily_period == held.daily_period {
            account.daily_used = account.daily_used.saturating_sub(held.tokens);
        }
        if account.monthly_period == held.monthly_period {
            account.monthly_used = account.monthly_used.saturating_sub(held.tokens);
        }
        true
    }
}

/// One lock guards accounts, reservations and records, so a check and its
/// reservation happen in one step.
#[derive(Default)]
pub struct InMemoryQuotaStore {
    state: Mutex<QuotaState>,
}

impl InMemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Usage records appended so far, oldest first.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.state.lock().records.clone()
    }
}

#[async_trait]
impl QuotaStore for InMemoryQuotaStore {
    async fn get_or_create_quota(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let mut state = self.state.lock();
        Ok(state.account(user_id, Utc::now()).snapshot(user_id))
    }

    async fn can_use_tokens(
        &self,
        user_id: &str,
        request_id: &str,
        estimated_tokens: u64,
        model: ModelId,
    ) -> Result<QuotaCheckResult> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let snapshot = state.account(user_id, now).snapshot(user_id);
        let result = policy::evaluate(&snapshot, estimated_tokens, model);

        if result.allowed && estimated_tokens > 0 && !state.reservations.contains_key(request_id) {
            let account = state.account(user_id, now);
            account.daily_used = account.daily_used.saturating_add(estimated_tokens);
            account.monthly_used = account.monthly_used.saturating_add(estimated_tokens);
            let reservation = Reservation {
                user_id: user_id.to_string(),
                tokens: estimated_tokens,
                daily_period: account.daily_period.clone(),
                monthly_period: account.monthly_period.clone(),
            };
            state.reservations.insert(request_id.to_string(), reservation);
        }
        Ok(result)
    }

    async fn record_ai_usage(&self, record: &UsageRecord) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        if !state.request_ids.insert(record.request_id.clone()) {
            return Ok(false);
        }

        state.release(&record.user_id, &record.request_id, now);

        let total = record.total_tokens();
        let account = state.account(&record.user_id, now);
        if day_key(record.timestamp) == account.daily_period {
            account.daily_used = account.daily_used.saturating_add(total);
        }
        if month_key(record.timestamp) == account.monthly_period {
            account.monthly_used = account.monthly_used.saturating_add(total);
        }
        state.records.push(record.clone());
        Ok(true)
    }

    async fn release_reservation(&self, user_id: &str, request_id: &str) -> Result<bool> {
        Ok(self.state.lock().release(user_id, request_id, Utc::now()))
    }

    async fn set_tier(&self, user_id: &str, tier: UserTier) -> Result<()> {
        self.state.lock().account(user_id, Utc::now()).tier = tier;
        Ok(())
    }

    async fn set_overage_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        self.state.lock().account(user_id, Utc::now()).overage_enabled = enabled;
        Ok(())
    }
}

/// Metering kept in a map keyed by `(org, month)`.
pub struct InMemoryMeter {
    included_monthly_tokens: u64,
    overage_rate_per_million: Decimal,
    summaries: Mutex<HashMap<(String, String), UsageSummary>>,
}

impl InMemoryMeter {
    pub fn new(included_monthly_tokens: u64, overage_rate_per_million: Decimal) -> Self {
        Self {
            included_monthly_tokens,
            overage_rate_per_million,
            summaries: Mutex::new(HashMap::new()),
        }
    }

    fn with_summary<T>(&self, org_id: &str, f: impl FnOnce(&mut UsageSummary) -> T) -> T {
        let period = month_key(Utc::now());
        let mut summaries = self.summaries.lock();
        let summary = summaries
            .entry((org_id.to_string(), period.clone()))
            .or_insert_with(|| UsageSummary {
                org_id: org_id.to_string(),
                period,
                ..UsageSummary::default()
            });
        f(summary)
    }
}

#[async_trait]
impl MeteringSink for InMemoryMeter {
    async fn track_tokens(&self, org_id: &str, total_tokens: u64) -> Result<MeteringOutcome> {
        Ok(self.with_summary(org_id, |summary| {
            apply_tokens(summary, total_tokens, self.included_monthly_tokens, self.overage_rate_per_million)
        }))
    }

    async fn track_premium_model_tokens(&self, org_id: &str, total_tokens: u64) -> Result<()> {
        self.with_summary(org_id, |summary| {
            summary.premium_tokens = summary.premium_tokens.saturating_add(total_tokens);
        });
        Ok(())
    }

    async fn usage_summary(&self, org_id: &str) -> Result<UsageSummary> {
        Ok(self.with_summary(org_id, |summary| summary.clone()))
    }
}
