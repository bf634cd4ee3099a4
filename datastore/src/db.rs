use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{
    device_data_kind, format_timestamp, DeviceDataRow, DeviceReading, IncomingReading,
};
use crate::store::DeviceDataStore;
use crate::validate::validate;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const MAX_ATTEMPTS: u32 = 5;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

/// Device data backed by the `device_data` table.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct DeviceDataRecord {
    ts: DateTime<Utc>,
    data: Json<DeviceReading>,
}

impl From<DeviceDataRecord> for DeviceDataRow {
    fn from(record: DeviceDataRecord) -> Self {
        Self {
            data: record.data.0,
            timestamp: format_timestamp(record.ts),
        }
    }
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self> {
        Ok(Self::new(make_pool(database_url).await?))
    }

    async fn insert_one(
        &self,
        device_id: &str,
        metric: &str,
        reading: &DeviceReading,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_data (device_id, metric, ts, data)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(device_id)
        .bind(metric)
        .bind(Utc::now())
        .bind(Json(reading))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_batch_inner(&self, batch: &[IncomingReading]) -> Result<()> {
        let device_ids: Vec<&str> = batch.iter().map(|r| r.device_id.as_str()).collect();
        let metrics: Vec<&str> = batch.iter().map(|r| r.metric.as_str()).collect();
        let now = Utc::now();
        let timestamps: Vec<DateTime<Utc>> = batch.iter().map(|_| now).collect();
        let payloads = batch
            .iter()
            .map(|r| serde_json::to_value(&r.reading))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let query = r#"
            INSERT INTO device_data (device_id, metric, ts, data)
            SELECT * FROM UNNEST($1::text[], $2::text[], $3::timestamptz[], $4::jsonb[])
            "#;

        sqlx::query(query)
            .bind(&device_ids)
            .bind(&metrics)
            .bind(&timestamps)
            .bind(&payloads)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn select(
        &self,
        metric: &str,
        device_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<DeviceDataRow>> {
        // LIMIT NULL is LIMIT ALL
        let limit = count.map(|c| c as i64);
        let records = sqlx::query_as::<_, DeviceDataRecord>(
            r#"
            SELECT ts, data
            FROM device_data
            WHERE device_id = $1 AND metric = $2
            ORDER BY ts DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(device_id)
        .bind(metric)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records.into_iter().map(DeviceDataRow::from).collect())
    }
}

#[async_trait]
impl DeviceDataStore for PgStore {
    async fn save(&self, device_id: &str, metric: &str, reading: &DeviceReading) -> Result<bool> {
        validate(device_id, metric, reading)?;
        with_retry("save", move || self.insert_one(device_id, metric, reading)).await?;
        info!(
            "ds save: entity={} data={:?}",
            device_data_kind(metric, device_id),
            reading
        );
        Ok(true)
    }

    async fn get(
        &self,
        metric: &str,
        device_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<DeviceDataRow>> {
        let rows = with_retry("get", move || self.select(metric, device_id, count)).await?;
        debug!(
            "get_device_data: entity={} count={}",
            device_data_kind(metric, device_id),
            rows.len()
        );
        Ok(rows)
    }

    async fn save_batch(&self, batch: &[IncomingReading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        for incoming in batch {
            validate(&incoming.device_id, &incoming.metric, &incoming.reading)?;
        }
        with_retry("save_batch", move || self.insert_batch_inner(batch)).await
    }
}

/// Run a database operation, retrying transient failures with backoff.
async fn with_retry<T, F, Fut>(op: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) => match &e {
                Error::Database(db_err) => {
                    if attempts >= MAX_ATTEMPTS || !is_transient_error(db_err) {
                        error!(
                            "Database {} failed permanently after {} attempts: {}",
                            op, attempts, e
                        );
                        return Err(e);
                    }

                    let wait_ms = 100 * 2_u64.pow(attempts - 1).min(32);
                    warn!(
                        "Database {} failed (attempt {}/{}), retrying in {}ms: {}",
                        op, attempts, MAX_ATTEMPTS, wait_ms, db_err
                    );
                    DB_FAILURES_TOTAL.inc();
                    tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                }
                _ => {
                    error!("Database {} failed with non-database error: {}", op, e);
                    return Err(e);
                }
            },
        }
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Check if it's a connection-related error
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
