//! Durable time-series sink for telemetry samples (PostgreSQL / TimescaleDB).

use super::error::StoreError;
use super::telemetry::DecodedTelemetry;
use crate::config::StoreConfig;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::future::Future;
use std::time::Duration;

pub trait TelemetrySink: Send + Sync {
    /// Appends one row per sample; duplicates are written as-is.
    fn append(
        &self,
        telemetry: &DecodedTelemetry,
        received_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

#[derive(Debug, Clone)]
pub struct PgTelemetryStore {
    pool: PgPool,
    table: String,
    insert_sql: String,
}

fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        && !table.starts_with(|c: char| c.is_ascii_digit());
    if valid {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!("invalid table name {table:?}")))
    }
}

fn insert_statement(table: &str) -> String {
    format!(
        "INSERT INTO {table} (time, gpu_id, gpu_name, temperature_c, utilization_gpu, \
         utilization_memory, power_draw_w, clock_core_mhz, clock_memory_mhz, memory_used_mb, \
         memory_total_mb, performance_state, throttling_reasons) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
    )
}

fn create_statement(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            time TIMESTAMPTZ NOT NULL,
            gpu_id TEXT NOT NULL,
            gpu_name TEXT,
            temperature_c BIGINT NOT NULL,
            utilization_gpu BIGINT NOT NULL,
            utilization_memory BIGINT NOT NULL,
            power_draw_w DOUBLE PRECISION NOT NULL,
            clock_core_mhz BIGINT,
            clock_memory_mhz BIGINT,
            memory_used_mb BIGINT NOT NULL,
            memory_total_mb BIGINT NOT NULL,
            performance_state TEXT,
            throttling_reasons TEXT[] NOT NULL
        )"
    )
}

fn as_bigint(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl PgTelemetryStore {
    /// Connects the pool; failure here is fatal for the daemon.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        validate_table_name(&config.table)?;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect(&config.database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self {
            pool,
            table: config.table.clone(),
            insert_sql: insert_statement(&config.table),
        })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(&create_statement(&self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TelemetrySink for PgTelemetryStore {
    async fn append(
        &self,
        telemetry: &DecodedTelemetry,
        received_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let sample = &telemetry.sample;
        sqlx::query(&self.insert_sql)
            .bind(received_at)
            .bind(&telemetry.gpu_id)
            .bind(&sample.gpu_name)
            .bind(i64::from(sample.temperature_c))
            .bind(i64::from(sample.utilization_gpu))
            .bind(i64::from(sample.utilization_memory))
            .bind(sample.power_draw_w)
            .bind(sample.clock_core_mhz.map(i64::from))
            .bind(sample.clock_memory_mhz.map(i64::from))
            .bind(as_bigint(sample.memory_used_mb))
            .bind(as_bigint(sample.memory_total_mb))
            .bind(&sample.performance_state)
            .bind(&sample.throttling_reasons)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
