use datastore::{DeviceDataRow, DeviceDataStore, DeviceReading};
use std::io::Write;
use tracing::info;

pub const DEFAULT_DEVICE_ID: &str = "debugrobID";
pub const DEFAULT_METRIC: &str = "tempC";

/// The reading every smoke run writes.
pub fn smoke_reading() -> DeviceReading {
    DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmokeReport {
    pub saved: bool,
    pub all_rows: usize,
    pub limited_rows: usize,
    pub latest: Option<DeviceDataRow>,
}

/// Save one reading, read the series back unbounded and limited to one
/// row, and print what came back. Store errors are returned as-is.
pub async fn run_smoke<S, W>(
    store: &S,
    device_id: &str,
    metric: &str,
    out: &mut W,
) -> anyhow::Result<SmokeReport>
where
    S: DeviceDataStore + ?Sized,
    W: Write,
{
    info!("Smoke test against {} / {}", device_id, metric);

    let saved = store.save(device_id, metric, &smoke_reading()).await?;
    writeln!(out, "save_device_data returned {}", saved)?;

    let all = store.get(metric, device_id, None).await?;
    writeln!(out, "get_device_data returned {} rows", all.len())?;
    writeln!(out, "{}", serde_json::to_string(&all)?)?;

    let limited = store.get(metric, device_id, Some(1)).await?;
    writeln!(out, "get_device_data(count=1) returned {} rows", limited.len())?;
    writeln!(out, "{}", serde_json::to_string(&limited)?)?;

    let limited_rows = limited.len();
    let latest = limited.into_iter().next();
    match &latest {
        Some(row) => writeln!(
            out,
            "name={} value={} timestamp={}",
            row.data.name, row.data.value, row.timestamp
        )?,
        None => writeln!(out, "no rows returned for limited query")?,
    }

    Ok(SmokeReport {
        saved,
        all_rows: all.len(),
        limited_rows,
        latest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use datastore::{Error, MemoryStore};
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Save(String, String, DeviceReading),
        Get(String, String, Option<usize>),
    }

    /// Records every call and answers `get` with canned rows.
    #[derive(Default)]
    struct RecordingStore {
        calls: Mutex<Vec<Call>>,
        rows: Vec<DeviceDataRow>,
        fail_get: bool,
    }

    impl RecordingStore {
        fn with_rows(rows: Vec<DeviceDataRow>) -> Self {
            Self {
                rows,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl DeviceDataStore for RecordingStore {
        async fn save(
            &self,
            device_id: &str,
            metric: &str,
            reading: &DeviceReading,
        ) -> datastore::Result<bool> {
            self.calls.lock().unwrap().push(Call::Save(
                device_id.to_string(),
                metric.to_string(),
                reading.clone(),
            ));
            Ok(true)
        }

        async fn get(
            &self,
            metric: &str,
            device_id: &str,
            count: Option<usize>,
        ) -> datastore::Result<Vec<DeviceDataRow>> {
            self.calls.lock().unwrap().push(Call::Get(
                metric.to_string(),
                device_id.to_string(),
                count,
            ));
            if self.fail_get {
                return Err(Error::Validation("store unavailable".to_string()));
            }
            let limit = count.unwrap_or(self.rows.len());
            Ok(self.rows.iter().take(limit).cloned().collect())
        }
    }

    fn sample_row() -> DeviceDataRow {
        DeviceDataRow {
            data: DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z"),
            timestamp: "2019-07-18T23:05:42Z".to_string(),
        }
    }

    async fn run(store: &RecordingStore) -> (anyhow::Result<SmokeReport>, String) {
        let mut out = Vec::new();
        let result = run_smoke(store, DEFAULT_DEVICE_ID, DEFAULT_METRIC, &mut out).await;
        (result, String::from_utf8(out).unwrap())
    }

    #[tokio::test]
    async fn test_call_sequence() {
        let store = RecordingStore::with_rows(vec![sample_row()]);
        let (result, _) = run(&store).await;
        result.unwrap();

        assert_eq!(
            store.calls(),
            vec![
                Call::Save(
                    "debugrobID".to_string(),
                    "tempC".to_string(),
                    DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z"),
                ),
                Call::Get("tempC".to_string(), "debugrobID".to_string(), None),
                Call::Get("tempC".to_string(), "debugrobID".to_string(), Some(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_prints_latest_fields() {
        let store = RecordingStore::with_rows(vec![sample_row(), sample_row()]);
        let (result, output) = run(&store).await;
        let report = result.unwrap();

        assert!(output.contains("name=SHT25-Top"));
        assert!(output.contains("value=24.0"));
        assert!(output.contains("timestamp=2019-07-18T23:05:42Z"));
        assert!(!output.contains("timestamp=2019-07-18T22:57:01Z"));
        assert!(output.contains("get_device_data returned 2 rows"));
        assert_eq!(report.all_rows, 2);
        assert_eq!(report.limited_rows, 1);
    }

    #[tokio::test]
    async fn test_empty_results_do_not_fail() {
        let store = RecordingStore::default();
        let (result, output) = run(&store).await;
        let report = result.unwrap();

        assert!(output.contains("get_device_data returned 0 rows"));
        assert!(output.contains("get_device_data(count=1) returned 0 rows"));
        assert!(output.contains("no rows returned for limited query"));
        assert_eq!(report.latest, None);
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let store = RecordingStore {
            fail_get: true,
            ..Default::default()
        };
        let (result, output) = run(&store).await;

        let err = result.unwrap_err();
        assert!(err.downcast_ref::<Error>().is_some());
        assert!(output.contains("save_device_data returned true"));
        // Aborted on the first failing call.
        assert_eq!(store.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_against_memory_store() {
        let store = MemoryStore::new();
        let mut out = Vec::new();

        let report = run_smoke(&store, DEFAULT_DEVICE_ID, DEFAULT_METRIC, &mut out)
            .await
            .unwrap();

        assert!(report.saved);
        assert_eq!(report.all_rows, 1);
        let latest = report.latest.unwrap();
        assert_eq!(latest.data, smoke_reading());
        assert!(String::from_utf8(out).unwrap().contains("name=SHT25-Top"));
    }
}
