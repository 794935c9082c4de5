use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::models::catalog::ModelId;
use crate::models::pricing::is_premium;
use crate::quota::types::{
    AlertSink, MeteringSink, OverageEligibility, QuotaCheckResult, QuotaStore, QuotaSubject,
    UsageContext, UsageOutcome, UsageRecord,
};

const MILLION: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Clone)]
pub struct QuotaSettings {
    /// USD billed per million tokens beyond the plan's limits.
    pub overage_rate_per_million_usd: Decimal,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            overage_rate_per_million_usd: Decimal::from(10),
        }
    }
}

/// Overage is allowed for paid tiers whose account has it switched on.
pub struct PlanOverage {
    store: Arc<dyn QuotaStore>,
}

impl PlanOverage {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl OverageEligibility for PlanOverage {
    async fn is_overage_allowed(&self, subject: &QuotaSubject) -> Result<bool> {
        let snapshot = self.store.get_or_create_quota(&subject.user_id).await?;
        Ok(snapshot.tier.supports_overage() && snapshot.overage_enabled)
    }
}

/// Admission before a request and accounting after it.
///
/// The manager never blocks on its own failures: a store error admits the
/// request, and recording problems are logged and reported in the
/// `UsageOutcome` rather than raised.
pub struct QuotaManager {
    store: Arc<dyn QuotaStore>,
    metering: Arc<dyn MeteringSink>,
    alerts: Arc<dyn AlertSink>,
    overage: Arc<dyn OverageEligibility>,
    settings: QuotaSettings,
}

impl QuotaManager {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        metering: Arc<dyn MeteringSink>,
        alerts: Arc<dyn AlertSink>,
        overage: Arc<dyn OverageEligibility>,
        settings: QuotaSettings,
    ) -> Self {
        Self {
            store,
            metering,
            alerts,
            overage,
            settings,
        }
    }

    pub fn store(&self) -> Arc<dyn QuotaStore> {
        self.store.clone()
    }

    pub fn metering(&self) -> Arc<dyn MeteringSink> {
        self.metering.clone()
    }

    /// Admits or denies the request. An admission reserves the estimate under
    /// `request_id` until the usage is recorded or the reservation released.
    pub async fn check_quota(
        &self,
        subject: &QuotaSubject,
        request_id: &str,
        estimated_tokens: u64,
        model: ModelId,
    ) -> QuotaCheckResult {
        match self
            .store
            .can_use_tokens(&subject.user_id, request_id, estimated_tokens, model)
            .await
        {
            Ok(result) => {
                debug!(
                    "Quota check for {}: allowed={}, daily {}/{}",
                    subject.user_id, result.allowed, result.daily_used, result.daily_limit
                );
                result
            }
            Err(e) => {
                warn!("Quota store unavailable for {}, allowing request: {}", subject.user_id, e);
                QuotaCheckResult::fail_open(format!("Quota check skipped: {}", e))
            }
        }
    }

    /// Like `check_quota`, but an over-limit denial becomes a billed overage
    /// admission when the account is eligible. Overage admissions hold no
    /// reservation; their usage is counted when recorded.
    pub async fn check_quota_with_overage(
        &self,
        subject: &QuotaSubject,
        request_id: &str,
        estimated_tokens: u64,
        model: ModelId,
    ) -> QuotaCheckResult {
        let mut result = self.check_quota(subject, request_id, estimated_tokens, model).await;

        let over_limit = result.denial.is_some_and(|d| d.is_over_limit());
        if result.allowed || !over_limit {
            return result;
        }

        result.is_overage = Some(true);
        match self.overage.is_overage_allowed(subject).await {
            Ok(true) => {
                let cost = Decimal::from(estimated_tokens) * self.settings.overage_rate_per_million_usd / MILLION;
                info!("Admitting {} as overage, estimated ${}", subject.user_id, cost);
                result.allowed = true;
                result.overage_allowed = Some(true);
                result.estimated_cost_usd = Some(cost);
            }
            Ok(false) => {
                result.overage_allowed = Some(false);
            }
            Err(e) => {
                warn!("Overage eligibility check failed for {}, keeping denial: {}", subject.user_id, e);
                result.overage_allowed = Some(false);
            }
        }
        result
    }

    /// Gives back the tokens reserved for a request that ends without
    /// recorded usage. Never fails the caller.
    pub async fn release_reservation(&self, subject: &QuotaSubject, request_id: &str) -> bool {
        match self.store.release_reservation(&subject.user_id, request_id).await {
            Ok(released) => released,
            Err(e) => {
                warn!("Failed to release reservation {} for {}: {}", request_id, subject.user_id, e);
                false
            }
        }
    }

    /// Appends the usage record, meters the same token count and schedules
    /// a threshold-alert check. Never fails the caller.
    pub async fn record_usage(
        &self,
        subject: &QuotaSubject,
        model: ModelId,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: Decimal,
        context: UsageContext,
    ) -> UsageOutcome {
        let record = UsageRecord {
            request_id: context.request_id,
            user_id: subject.user_id.clone(),
            org_id: subject.org_id.clone(),
            model,
            input_tokens,
            output_tokens,
            cost_usd,
            conversation_id: context.conversation_id,
            task_type: context.task_type,
            timestamp: Utc::now(),
        };

        let mut outcome = UsageOutcome::default();
        match self.store.record_ai_usage(&record).await {
            Ok(true) => outcome.recorded = true,
            Ok(false) => {
                debug!("Usage for request {} already recorded", record.request_id);
                outcome.duplicate = true;
                return outcome;
            }
            Err(e) => {
                error!("Failed to record usage for request {}: {}", record.request_id, e);
                outcome.errors.push(format!("usage record: {}", e));
            }
        }

        let account = subject.billing_account();
        let total = record.total_tokens();

        match self.metering.track_tokens(account, total).await {
            Ok(metered) => {
                if metered.is_overage {
                    info!("{} tokens for {} billed as overage (${})", total, account, metered.overage_cost);
                }
                outcome.metering = Some(metered);
            }
            Err(e) => {
                error!("Failed to meter {} tokens for {}: {}", total, account, e);
                outcome.errors.push(format!("metering: {}", e));
            }
        }

        if is_premium(model) {
            if let Err(e) = self.metering.track_premium_model_tokens(account, total).await {
                error!("Failed to meter premium tokens for {}: {}", account, e);
                outcome.errors.push(format!("premium metering: {}", e));
            }
        }

        let alerts = self.alerts.clone();
        let account = account.to_string();
        tokio::spawn(async move {
            if let Err(e) = alerts.send_alert_notifications(&account).await {
                warn!("Alert check failed for {}: {}", account, e);
            }
        });

        outcome
    }
}
