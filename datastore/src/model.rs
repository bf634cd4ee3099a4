use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEVICE_DATA_KIND: &str = "DeviceData";

pub const BOOT: &str = "boot";
pub const STATUS: &str = "status";
pub const CO2: &str = "air_carbon_dioxide_ppm";
pub const HUMIDITY: &str = "air_humidity_percent";
pub const AIR_TEMPERATURE: &str = "air_temperature_celsius";
pub const LED_SPECTRUM: &str = "light_spectrum_nm_percent";
pub const LED_DISTANCE: &str = "light_illumination_distance_cm";
pub const LED_INTENSITY: &str = "light_intensity_watts";
pub const WATER_EC: &str = "water_electrical_conductivity_ms_cm";
pub const WATER_PH: &str = "water_potential_hydrogen";
// Spelling matches what devices publish.
pub const WATER_TEMPERATURE: &str = "water_temperature_celcius";

/// Metrics reported by `latest_properties`, in display order.
pub const WELL_KNOWN_METRICS: [&str; 11] = [
    BOOT,
    STATUS,
    CO2,
    HUMIDITY,
    AIR_TEMPERATURE,
    LED_SPECTRUM,
    LED_DISTANCE,
    LED_INTENSITY,
    WATER_EC,
    WATER_PH,
    WATER_TEMPERATURE,
];

/// A single sensor measurement as reported by a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub value: String,
    pub name: String,
    pub timestamp: String,
}

impl DeviceReading {
    pub fn new(
        value: impl Into<String>,
        name: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            value: value.into(),
            name: name.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// A stored reading together with the time it was written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDataRow {
    pub data: DeviceReading,
    pub timestamp: String,
}

/// A reading on its way into a store, addressed by device and metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingReading {
    pub device_id: String,
    pub metric: String,
    pub reading: DeviceReading,
}

/// Latest value of each well-known metric for one device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LatestProperties {
    pub boot_time: String,
    /// Whole minutes since `boot_time`; `None` when the device never booted.
    pub minutes_since_boot: Option<i64>,
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

/// Chart point derived from a stored row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryPoint {
    pub value: String,
    pub time: String,
}

/// REST API response wrapper
#[derive(Debug, Serialize)]
pub struct DeviceDataResponse {
    pub data: Vec<DeviceDataRow>,
    pub total: usize,
    pub count: Option<usize>,
}

/// Series name for a device's metric, e.g. `DeviceData_tempC_debugrobID`.
pub fn device_data_kind(metric: &str, device_id: &str) -> String {
    format!("{}_{}_{}", DEVICE_DATA_KIND, metric, device_id)
}

/// ISO-8601 UTC timestamp with a `Z` suffix and second precision.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}
