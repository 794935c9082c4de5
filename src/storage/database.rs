use std::path::Path;
use sqlx::{SqlitePool, migrate::MigrateDatabase};
use tracing::{info, debug, error};

use crate::error::{Error, Result};
use crate::platform::AppPaths;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS account_quotas (
        user_id TEXT PRIMARY KEY,
        tier TEXT NOT NULL DEFAULT 'free',
        overage_enabled INTEGER NOT NULL DEFAULT 0,
        daily_used INTEGER NOT NULL DEFAULT 0,
        daily_period TEXT NOT NULL,
        monthly_used INTEGER NOT NULL DEFAULT 0,
        monthly_period TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT (unixepoch()),
        updated_at INTEGER NOT NULL DEFAULT (unixepoch())
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS usage_records (
        request_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        org_id TEXT,
        model TEXT NOT NULL,
        input_tokens INTEGER NOT NULL,
        output_tokens INTEGER NOT NULL,
        cost_usd TEXT NOT NULL,
        conversation_id TEXT,
        task_type TEXT,
        timestamp INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_usage_records_user ON usage_records (user_id, timestamp)",
    r#"
    CREATE TABLE IF NOT EXISTS quota_reservations (
        request_id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        tokens INTEGER NOT NULL,
        daily_period TEXT NOT NULL,
        monthly_period TEXT NOT NULL,
        created_at INTEGER NOT NULL DEFAULT (unixepoch())
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS metered_usage (
        org_id TEXT NOT NULL,
        period TEXT NOT NULL,
        total_tokens INTEGER NOT NULL DEFAULT 0,
        premium_tokens INTEGER NOT NULL DEFAULT 0,
        overage_tokens INTEGER NOT NULL DEFAULT 0,
        overage_cost TEXT NOT NULL DEFAULT '0',
        last_updated INTEGER NOT NULL DEFAULT (unixepoch()),
        PRIMARY KEY (org_id, period)
    )
    "#,
];

/// SQLite connection pool with the gateway schema applied.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database in the platform data directory.
    pub async fn new(paths: &AppPaths) -> Result<Self> {
        Self::open(&paths.database_file()).await
    }

    pub async fn open(db_path: &Path) -> Result<Self> {
        info!("Initializing database at: {:?}", db_path);

        if !db_path.exists() {
            info!("Database doesn't exist, creating new database");
            sqlx::Sqlite::create_database(&format!("sqlite:{}", db_path.display())).await?;
        }

        let database_url = format!("sqlite:{}?mode=rwc", db_path.display());
        let pool = SqlitePool::connect(&database_url).await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!("Database initialized successfully");
        Ok(db)
    }

    async fn ensure_schema(&self) -> Result<()> {
        debug!("Applying schema ({} statements)", SCHEMA.len());
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                error!("Failed to apply schema statement: {}", e);
                Error::Database(e)
            })?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
        info!("Database connection closed");
    }

    pub async fn get_statistics(&self) -> Result<DatabaseStatistics> {
        let accounts_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM account_quotas")
            .fetch_one(&self.pool)
            .await?;

        let usage_records_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
            .fetch_one(&self.pool)
            .await?;

        let size_result: Option<i64> = sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(DatabaseStatistics {
            accounts_count: accounts_count as u64,
            usage_records_count: usage_records_count as u64,
            database_size_bytes: size_result.unwrap_or(0) as u64,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DatabaseStatistics {
    pub accounts_count: u64,
    pub usage_records_count: u64,
    pub database_size_bytes: u64,
}

/// Helper functions for working with decimal values in the database
pub mod decimal_helpers {
    use rust_decimal::Decimal;
    use crate::error::{Error, Result};

    /// Decimals are stored as text to keep them exact.
    pub fn decimal_to_string(decimal: Decimal) -> String {
        decimal.to_string()
    }

    pub fn string_to_decimal(s: &str) -> Result<Decimal> {
        s.parse().map_err(|e| {
            Error::Database(sqlx::Error::Decode(
                format!("Failed to parse decimal from string '{}': {}", s, e).into()
            ))
        })
    }
}
