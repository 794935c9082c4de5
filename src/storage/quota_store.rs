use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::{debug, info};

use crate::error::Result;
use crate::models::catalog::ModelId;
use crate::quota::policy;
use crate::quota::tier::UserTier;
use crate::quota::types::{QuotaCheckResult, QuotaSnapshot, QuotaStore, UsageRecord};
use crate::storage::database::decimal_helpers;
use crate::storage::{day_key, month_key};

/// Quota store backed by SQLite. A check and its reservation run in one
/// transaction, so concurrent admissions cannot both take the last tokens.
pub struct SqliteQuotaStore {
    pool: SqlitePool,
}

impl SqliteQuotaStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Loads the account, creating it on the free tier and zeroing counters
    /// whose day or month has passed.
    async fn load_tx(tx: &mut Transaction<'_, Sqlite>, user_id: &str, now: DateTime<Utc>) -> Result<QuotaSnapshot> {
        let day = day_key(now);
        let month = month_key(now);

        sqlx::query(
            "INSERT OR IGNORE INTO account_quotas (user_id, tier, daily_period, monthly_period) VALUES (?, 'free', ?, ?)",
        )
        .bind(user_id)
        .bind(&day)
        .bind(&month)
        .execute(&mut **tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE account_quotas SET
                daily_used = CASE WHEN daily_period = ? THEN daily_used ELSE 0 END,
                daily_period = ?,
                monthly_used = CASE WHEN monthly_period = ? THEN monthly_used ELSE 0 END,
                monthly_period = ?
            WHERE user_id = ? AND (daily_period < ? OR monthly_period < ?)
            "#,
        )
        .bind(&day)
        .bind(&day)
        .bind(&month)
        .bind(&month)
        .bind(user_id)
        .bind(&day)
        .bind(&month)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query(
            "SELECT tier, overage_enabled, daily_used, monthly_used FROM account_quotas WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_one(&mut **tx)
        .await?;

        let tier = UserTier::parse(&row.try_get::<String, _>("tier")?);
        let limits = tier.limits();

        Ok(QuotaSnapshot {
            user_id: user_id.to_string(),
            tier,
            daily_used: row.try_get::<i64, _>("daily_used")? as u64,
            daily_limit: limits.daily_tokens,
            monthly_used: row.try_get::<i64, _>("monthly_used")? as u64,
            monthly_limit: limits.monthly_tokens,
            allowed_models: tier.allowed_models().to_vec(),
            overage_enabled: row.try_get::<bool, _>("overage_enabled")?,
        })
    }

    /// Removes the reservation for `request_id`, returning the tokens it held
    /// against the current day and month. Holds from a period that has since
    /// rolled over count as zero; that counter was already reset.
    async fn take_reservation_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        request_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<(u64, u64)>> {
        let row = sqlx::query(
            "SELECT tokens, daily_period, monthly_period FROM quota_reservations WHERE request_id = ? AND user_id = ?",
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        sqlx::query("DELETE FROM quota_reservations WHERE request_id = ?")
            .bind(request_id)
            .execute(&mut **tx)
            .await?;

        let tokens = row.try_get::<i64, _>("tokens")? as u64;
        let daily = if row.try_get::<String, _>("daily_period")? == day_key(now) { tokens } else { 0 };
        let monthly = if row.try_get::<String, _>("monthly_period")? == month_key(now) { tokens } else { 0 };
        Ok(Some((daily, monthly)))
    }

    /// `daily` and `monthly` are `(add, subtract)` pairs. Counters never go
    /// below zero.
    async fn adjust_counters_tx(
        tx: &mut Transaction<'_, Sqlite>,
        user_id: &str,
        daily: (u64, u64),
        monthly: (u64, u64),
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE account_quotas SET
                daily_used = MAX(0, daily_used + ? - ?),
                monthly_used = MAX(0, monthly_used + ? - ?),
                updated_at = unixepoch()
            WHERE user_id = ?
            "#,
        )
        .bind(daily.0 as i64)
        .bind(daily.1 as i64)
        .bind(monthly.0 as i64)
        .bind(monthly.1 as i64)
        .bind(user_id)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl QuotaStore for SqliteQuotaStore {
    async fn get_or_create_quota(&self, user_id: &str) -> Result<QuotaSnapshot> {
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::load_tx(&mut tx, user_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(snapshot)
    }

    async fn can_use_tokens(
        &self,
        user_id: &str,
        request_id: &str,
        estimated_tokens: u64,
        model: ModelId,
    ) -> Result<QuotaCheckResult> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let snapshot = Self::load_tx(&mut tx, user_id, now).await?;
        let result = policy::evaluate(&snapshot, estimated_tokens, model);

        if result.allowed && estimated_tokens > 0 {
            let reserved = sqlx::query(
                r#"
                INSERT OR IGNORE INTO quota_reservations (request_id, user_id, tokens, daily_period, monthly_period)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(request_id)
            .bind(user_id)
            .bind(estimated_tokens as i64)
            .bind(day_key(now))
            .bind(month_key(now))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if reserved > 0 {
                Self::adjust_counters_tx(&mut tx, user_id, (estimated_tokens, 0), (estimated_tokens, 0)).await?;
                debug!("Reserved {} tokens for {} ({})", estimated_tokens, user_id, request_id);
            }
        }

        tx.commit().await?;
        Ok(result)
    }

    async fn record_ai_usage(&self, record: &UsageRecord) -> Result<bool> {
        debug!(
            "Recording usage: user={}, model={}, input_tokens={}, output_tokens={}, cost={}",
            record.user_id, record.model, record.input_tokens, record.output_tokens, record.cost_usd
        );

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO usage_records (
                request_id, user_id, org_id, model, input_tokens, output_tokens,
                cost_usd, conversation_id, task_type, timestamp
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.request_id)
        .bind(&record.user_id)
        .bind(&record.org_id)
        .bind(record.model.as_str())
        .bind(record.input_tokens as i64)
        .bind(record.output_tokens as i64)
        .bind(decimal_helpers::decimal_to_string(record.cost_usd))
        .bind(&record.conversation_id)
        .bind(&record.task_type)
        .bind(record.timestamp.timestamp())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        Self::load_tx(&mut tx, &record.user_id, now).await?;
        let (held_daily, held_monthly) = Self::take_reservation_tx(&mut tx, &record.user_id, &record.request_id, now)
            .await?
            .unwrap_or((0, 0));

        let total = record.total_tokens();
        let daily = if day_key(record.timestamp) == day_key(now) { total } else { 0 };
        let monthly = if month_key(record.timestamp) == month_key(now) { total } else { 0 };
        Self::adjust_counters_tx(&mut tx, &record.user_id, (daily, held_daily), (monthly, held_monthly)).await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn release_reservation(&self, user_id: &str, request_id: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        Self::load_tx(&mut tx, user_id, now).await?;

        let Some((daily, monthly)) = Self::take_reservation_tx(&mut tx, user_id, request_id, now).await? else {
            tx.rollback().await?;
            return Ok(false);
        };
        Self::adjust_counters_tx(&mut tx, user_id, (0, daily), (0, monthly)).await?;
        tx.commit().await?;

        debug!("Released reservation {} for {}", request_id, user_id);
        Ok(true)
    }

    async fn set_tier(&self, user_id: &str, tier: UserTier) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::load_tx(&mut tx, user_id, Utc::now()).await?;
        sqlx::query("UPDATE account_quotas SET tier = ?, updated_at = unixepoch() WHERE user_id = ?")
            .bind(tier.as_str())
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Set tier for {} to {}", user_id, tier);
        Ok(())
    }

    async fn set_overage_enabled(&self, user_id: &str, enabled: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::load_tx(&mut tx, user_id, Utc::now()).await?;
        sqlx::query("UPDATE account_quotas SET overage_enabled = ?, updated_at = unixepoch() WHERE user_id = ?")
            .bind(enabled)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!("Set overage for {} to {}", user_id, enabled);
        Ok(())
    }
}
