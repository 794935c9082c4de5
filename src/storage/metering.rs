use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::error::Result;
use crate::quota::types::{MeteringOutcome, MeteringSink, UsageSummary};
use crate::storage::database::decimal_helpers;
use crate::storage::month_key;

/// Adds `total_tokens` to a period summary and prices whatever crosses the
/// included allowance at `rate_per_million`.
pub(crate) fn apply_tokens(
    summary: &mut UsageSummary,
    total_tokens: u64,
    included_tokens: u64,
    rate_per_million: Decimal,
) -> MeteringOutcome {
    let before = summary.total_tokens;
    let after = before.saturating_add(total_tokens);
    summary.total_tokens = after;

    let new_overage = after.saturating_sub(included_tokens.max(before));
    if new_overage == 0 {
        return MeteringOutcome::default();
    }

    let cost = Decimal::from(new_overage) * rate_per_million / Decimal::from(1_000_000u64);
    summary.overage_tokens += new_overage;
    summary.overage_cost += cost;

    MeteringOutcome {
        is_overage: true,
        overage_cost: cost,
    }
}

/// Per-organization metering for the current billing month.
pub struct SqliteMeter {
    pool: SqlitePool,
    included_monthly_tokens: u64,
    overage_rate_per_million: Decimal,
}

impl SqliteMeter {
    pub fn new(pool: SqlitePool, included_monthly_tokens: u64, overage_rate_per_million: Decimal) -> Self {
        Self {
            pool,
            included_monthly_tokens,
            overage_rate_per_million,
        }
    }

    async fn load(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        org_id: &str,
        period: &str,
    ) -> Result<UsageSummary> {
        let row = sqlx::query(
            r#"
            SELECT total_tokens, premium_tokens, overage_tokens, overage_cost
            FROM metered_usage WHERE org_id = ? AND period = ?
            "#,
        )
        .bind(org_id)
        .bind(period)
        .fetch_optional(&mut **tx)
        .await?;

        let mut summary = UsageSummary {
            org_id: org_id.to_string(),
            period: period.to_string(),
            ..UsageSummary::default()
        };

        if let Some(row) = row {
            summary.total_tokens = row.try_get::<i64, _>("total_tokens")? as u64;
            summary.premium_tokens = row.try_get::<i64, _>("premium_tokens")? as u64;
            summary.overage_tokens = row.try_get::<i64, _>("overage_tokens")? as u64;
            summary.overage_cost =
                decimal_helpers::string_to_decimal(&row.try_get::<String, _>("overage_cost")?)?;
        }

        Ok(summary)
    }

    async fn store(tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>, summary: &UsageSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metered_usage (
                org_id, period, total_tokens, premium_tokens, overage_tokens, overage_cost, last_updated
            ) VALUES (?, ?, ?, ?, ?, ?, unixepoch())
            ON CONFLICT (org_id, period) DO UPDATE SET
                total_tokens = excluded.total_tokens,
                premium_tokens = excluded.premium_tokens,
                overage_tokens = excluded.overage_tokens,
                overage_cost = excluded.overage_cost,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&summary.org_id)
        .bind(&summary.period)
        .bind(summary.total_tokens as i64)
        .bind(summary.premium_tokens as i64)
        .bind(summary.overage_tokens as i64)
        .bind(decimal_helpers::decimal_to_string(summary.overage_cost))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl MeteringSink for SqliteMeter {
    async fn track_tokens(&self, org_id: &str, total_tokens: u64) -> Result<MeteringOutcome> {
        let period = month_key(Utc::now());
        let mut tx = self.pool.begin().await?;

        let mut summary = Self::load(&mut tx, org_id, &period).await?;
        let outcome = apply_tokens(
            &mut summary,
            total_tokens,
            self.included_monthly_tokens,
            self.overage_rate_per_million,
        );
        Self::store(&mut tx, &summary).await?;
        tx.commit().await?;

        if outcome.is_overage {
            info!(
                "Metered overage for {}: {} tokens this period, ${} added",
                org_id, summary.total_tokens, outcome.overage_cost
            );
        } else {
            debug!("Metered {} tokens for {} ({})", total_tokens, org_id, period);
        }

        Ok(outcome)
    }

    async fn track_premium_model_tokens(&self, org_id: &str, total_tokens: u64) -> Result<()> {
        let period = month_key(Utc::now());
        let mut tx = self.pool.begin().await?;

        let mut summary = Self::load(&mut tx, org_id, &period).await?;
        summary.premium_tokens = summary.premium_tokens.saturating_add(total_tokens);
        Self::store(&mut tx, &summary).await?;
        tx.commit().await?;

        debug!("Metered {} premium tokens for {}", total_tokens, org_id);
        Ok(())
    }

    async fn usage_summary(&self, org_id: &str) -> Result<UsageSummary> {
        let period = month_key(Utc::now());
        let mut tx = self.pool.begin().await?;
        let summary = Self::load(&mut tx, org_id, &period).await?;
        tx.commit().await?;
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::AppPaths;
    use crate::storage::Database;
    use tempfile::TempDir;

    #[test]
    fn test_apply_tokens_prices_only_the_crossing_part() {
        let mut summary = UsageSummary::default();
        let rate = Decimal::from(10);

        let first = apply_tokens(&mut summary, 900, 1_000, rate);
        assert!(!first.is_overage);

        let second = apply_tokens(&mut summary, 300, 1_000, rate);
        assert!(second.is_overage);
        assert_eq!(summary.overage_tokens, 200);
        assert_eq!(second.overage_cost, Decimal::new(2, 3));

        let third = apply_tokens(&mut summary, 100, 1_000, rate);
        assert_eq!(summary.overage_tokens, 300);
        assert_eq!(third.overage_cost, Decimal::new(1, 3));
        assert_eq!(summary.overage_cost, Decimal::new(3, 3));
    }

    #[tokio::test]
    async fn test_sqlite_meter_accumulates_per_org() {
        let temp_dir = TempDir::new().unwrap();
        let paths = AppPaths::with_data_dir(temp_dir.path()).unwrap();
        let db = Database::new(&paths).await.unwrap();
        let meter = SqliteMeter::new(db.pool().clone(), 1_000, Decimal::from(10));

        assert!(!meter.track_tokens("acme", 800).await.unwrap().is_overage);
        let outcome = meter.track_tokens("acme", 700).await.unwrap();
        assert!(outcome.is_overage);
        assert_eq!(outcome.overage_cost, Decimal::new(5, 3));

        meter.track_premium_model_tokens("acme", 700).await.unwrap();
        meter.track_tokens("globex", 10).await.unwrap();

        let acme = meter.usage_summary("acme").await.unwrap();
        assert_eq!(acme.total_tokens, 1_500);
        assert_eq!(acme.premium_tokens, 700);
        assert_eq!(acme.overage_tokens, 500);

        let globex = meter.usage_summary("globex").await.unwrap();
        assert_eq!(globex.total_tokens, 10);
        assert_eq!(meter.usage_summary("initech").await.unwrap().total_tokens, 0);
    }
}
