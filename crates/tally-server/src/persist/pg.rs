//! Snapshot to a PostgreSQL table.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use tally_core::{Metric, MetricKind, Snapshot};
use tracing::info;

use super::{SinkFuture, SnapshotSink};
use crate::error::{Result, ServerError};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS metrics (
    type TEXT NOT NULL,
    name TEXT NOT NULL,
    value DOUBLE PRECISION,
    delta BIGINT
)";

const CREATE_INDEX: &str =
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_metrics_type_name ON metrics (type, name)";

const UPSERT: &str = "INSERT INTO metrics (type, name, value, delta)
VALUES ($1, $2, $3, $4)
ON CONFLICT (type, name)
DO UPDATE SET value = EXCLUDED.value, delta = EXCLUDED.delta";

const SELECT_ALL: &str = "SELECT type, name, value, delta FROM metrics";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Upserts one row per metric into `metrics(type, name, value, delta)`.
#[derive(Debug, Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    /// Connects to `dsn` and creates the table if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is unreachable or the schema cannot
    /// be created.
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(CONNECT_TIMEOUT)
            .connect(dsn)
            .await?;
        let sink = Self::from_pool(pool);
        sink.migrate().await?;
        info!("database connected");
        Ok(sink)
    }

    /// Wraps an existing pool without touching the schema.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the `metrics` table and its `(type, name)` index.
    ///
    /// # Errors
    ///
    /// Returns an error if either statement fails.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(CREATE_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_all(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (name, total) in &snapshot.counters {
            sqlx::query(UPSERT)
                .bind(MetricKind::Counter.as_str())
                .bind(name)
                .bind(None::<f64>)
                .bind(Some(*total))
                .execute(&mut *tx)
                .await?;
        }
        for (name, value) in &snapshot.gauges {
            sqlx::query(UPSERT)
                .bind(MetricKind::Gauge.as_str())
                .bind(name)
                .bind(Some(*value))
                .bind(None::<i64>)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn select_all(&self) -> Result<Vec<Metric>> {
        let rows: Vec<(String, String, Option<f64>, Option<i64>)> =
            sqlx::query_as(SELECT_ALL).fetch_all(&self.pool).await?;
        Ok(rows
            .into_iter()
            .map(|(kind, id, value, delta)| Metric {
                id,
                kind,
                delta,
                value,
            })
            .collect())
    }

    async fn select_one(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| ServerError::Unavailable(format!("database ping failed: {e}")))?;
        Ok(())
    }
}

impl SnapshotSink for PgSink {
    fn save<'a>(&'a self, snapshot: &'a Snapshot) -> SinkFuture<'a, ()> {
        Box::pin(self.upsert_all(snapshot))
    }

    fn load(&self) -> SinkFuture<'_, Vec<Metric>> {
        Box::pin(self.select_all())
    }

    fn ping(&self) -> SinkFuture<'_, ()> {
        Box::pin(self.select_one())
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}
