//! The device data capability and the helpers built on top of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::Result;
use crate::model::{
    device_data_kind, format_timestamp, DeviceDataRow, DeviceReading, HistoryPoint,
    IncomingReading, LatestProperties, BOOT, WELL_KNOWN_METRICS,
};
use crate::validate::validate;

/// Storage for per-device, per-metric reading series.
#[async_trait]
pub trait DeviceDataStore: Send + Sync {
    /// Store one reading. Returns `true` once it has been written.
    async fn save(&self, device_id: &str, metric: &str, reading: &DeviceReading) -> Result<bool>;

    /// Rows for a series, newest first. `None` returns every row.
    async fn get(
        &self,
        metric: &str,
        device_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<DeviceDataRow>>;

    /// Store several readings; stops at the first failure.
    async fn save_batch(&self, batch: &[IncomingReading]) -> Result<()> {
        for incoming in batch {
            self.save(&incoming.device_id, &incoming.metric, &incoming.reading)
                .await?;
        }
        Ok(())
    }
}

/// In-memory store keyed by series kind.
///
/// Nothing is persisted; used by tests and the smoke binary's
/// `--backend memory`.
#[derive(Debug, Default)]
pub struct MemoryStore {
    series: RwLock<HashMap<String, Vec<DeviceDataRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row with an explicit write time.
    pub async fn save_at(
        &self,
        device_id: &str,
        metric: &str,
        reading: &DeviceReading,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        validate(device_id, metric, reading)?;
        let kind = device_data_kind(metric, device_id);
        let row = DeviceDataRow {
            data: reading.clone(),
            timestamp: format_timestamp(at),
        };

        let mut series = self.series.write().await;
        let rows = series.entry(kind.clone()).or_default();
        // Newest first; on equal timestamps the latest write goes first.
        let pos = rows.partition_point(|r| r.timestamp > row.timestamp);
        rows.insert(pos, row);
        debug!("memory save: kind={} rows={}", kind, rows.len());
        Ok(true)
    }
}

#[async_trait]
impl DeviceDataStore for MemoryStore {
    async fn save(&self, device_id: &str, metric: &str, reading: &DeviceReading) -> Result<bool> {
        self.save_at(device_id, metric, reading, Utc::now()).await
    }

    async fn get(
        &self,
        metric: &str,
        device_id: &str,
        count: Option<usize>,
    ) -> Result<Vec<DeviceDataRow>> {
        let kind = device_data_kind(metric, device_id);
        let series = self.series.read().await;
        let rows = match series.get(&kind) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };
        let limit = count.unwrap_or(rows.len());
        Ok(rows.iter().take(limit).cloned().collect())
    }
}

/// Latest value of every well-known metric plus the last boot time,
/// measured against `now`. Metrics with no rows report an empty string.
pub async fn latest_properties<S>(
    store: &S,
    device_id: &str,
    now: DateTime<Utc>,
) -> Result<LatestProperties>
where
    S: DeviceDataStore + ?Sized,
{
    let mut latest = LatestProperties::default();

    if let Some(row) = store.get(BOOT, device_id, Some(1)).await?.into_iter().next() {
        latest.minutes_since_boot = minutes_since(&row.data.timestamp, now);
        latest.boot_time = row.data.timestamp;
    }

    for metric in WELL_KNOWN_METRICS {
        let value = store
            .get(metric, device_id, Some(1))
            .await?
            .into_iter()
            .next()
            .map(|row| row.data.value)
            .unwrap_or_default();
        latest.values.insert(metric.to_string(), value);
    }

    Ok(latest)
}

/// Value/time pairs for charting a series, newest first.
pub async fn history<S>(
    store: &S,
    metric: &str,
    device_id: &str,
    count: Option<usize>,
) -> Result<Vec<HistoryPoint>>
where
    S: DeviceDataStore + ?Sized,
{
    let rows = store.get(metric, device_id, count).await?;
    Ok(rows
        .into_iter()
        .map(|row| HistoryPoint {
            value: row.data.value,
            time: row.data.timestamp,
        })
        .collect())
}

/// Whole minutes between an ISO-8601 timestamp and `now`.
/// `None` when the timestamp does not parse.
pub fn minutes_since(timestamp: &str, now: DateTime<Utc>) -> Option<i64> {
    let ts = DateTime::parse_from_rfc3339(timestamp).ok()?;
    Some((now - ts.with_timezone(&Utc)).num_minutes())
}
