use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use reading::{Currency, Reading, ReadingStore, StoreError};
use rust_decimal::Decimal;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::sync::OnceCell;
use tracing::info;

mod cache;

pub use cache::LocalCache;

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

pub const INIT_SQL: &str = include_str!("../../../scripts/init_db.sql");

/// SQLite-backed reading history.
///
/// Connections are opened on demand and the schema is applied on the first
/// successful use, so a database that is unreachable at boot only fails the
/// calls made while it stays unreachable.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    schema: Arc<OnceCell<()>>,
}

impl Store {
    /// Builds the pool without touching the database. Only a malformed URL fails.
    pub fn connect_lazy(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(path)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy_with(options);
        Ok(Self {
            pool,
            schema: Arc::new(OnceCell::new()),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        self.ready().await.map(|_| ())
    }

    async fn ready(&self) -> Result<&SqlitePool, sqlx::Error> {
        self.schema
            .get_or_try_init(|| run_init_sql(&self.pool))
            .await?;
        Ok(&self.pool)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn insert_run(&self, run_id: &str, git_sha: Option<&str>) -> Result<()> {
        let host = hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string();
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT OR REPLACE INTO runs (run_id, started_at_ms, git_sha, host) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(git_sha)
        .bind(host)
        .execute(self.ready().await?)
        .await?;
        Ok(())
    }

    pub async fn log_incident(
        &self,
        run_id: &str,
        severity: &str,
        kind: &str,
        message: &str,
    ) -> Result<()> {
        let ts_ms = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO incidents (run_id, ts_ms, severity, kind, message) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(run_id)
        .bind(ts_ms)
        .bind(severity)
        .bind(kind)
        .bind(message)
        .execute(self.ready().await?)
        .await?;
        Ok(())
    }

    pub async fn reading_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM readings")
            .fetch_one(self.ready().await?)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl ReadingStore for Store {
    async fn latest(&self) -> Result<Option<Reading>, StoreError> {
        let pool = self.ready().await.map_err(db_error)?;
        let row: Option<(String, String, i64)> = sqlx::query_as(
            "SELECT date_of_record, values_json, captured_at_ms FROM readings \
             ORDER BY captured_at_ms DESC, id DESC LIMIT 1",
        )
        .fetch_optional(pool)
        .await
        .map_err(db_error)?;

        row.map(|(date_of_record, values_json, captured_at_ms)| {
            let values: BTreeMap<Currency, Decimal> = serde_json::from_str(&values_json)
                .map_err(|err| StoreError::Malformed(err.to_string()))?;
            let captured_at = Utc
                .timestamp_millis_opt(captured_at_ms)
                .single()
                .ok_or_else(|| {
                    StoreError::Malformed(format!("capture timestamp {captured_at_ms}"))
                })?;
            Ok(Reading {
                date_of_record,
                values,
                captured_at,
            })
        })
        .transpose()
    }

    async fn append(&self, reading: &Reading) -> Result<(), StoreError> {
        let values_json = serde_json::to_string(&reading.values)
            .map_err(|err| StoreError::Malformed(err.to_string()))?;
        let pool = self.ready().await.map_err(db_error)?;
        sqlx::query(
            "INSERT INTO readings (date_of_record, primary_value, values_json, captured_at_ms) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(&reading.date_of_record)
        .bind(reading.primary().to_string())
        .bind(values_json)
        .bind(reading.captured_at.timestamp_millis())
        .execute(pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

/// Builds the store and applies the schema; fails if the database is unreachable.
pub async fn init_sqlite(path: &str) -> Result<Store> {
    let store = Store::connect_lazy(path)?;
    store.ensure_schema().await?;
    info!(path = path, "sqlite initialized");
    Ok(store)
}

async fn run_init_sql(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in INIT_SQL.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}
