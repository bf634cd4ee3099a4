use crate::errors::{Error, Result};
use crate::model::DeviceReading;
use chrono::DateTime;

/// Validates a reading before it is written to a store
pub fn validate(device_id: &str, metric: &str, reading: &DeviceReading) -> Result<()> {
    if device_id.is_empty() {
        return Err(Error::Validation("Device ID cannot be empty".to_string()));
    }

    if metric.is_empty() {
        return Err(Error::Validation("Metric cannot be empty".to_string()));
    }

    if reading.name.is_empty() {
        return Err(Error::Validation(format!(
            "Reading for {} on {} has no sensor name",
            metric, device_id
        )));
    }

    // Timestamps must be ISO-8601 / RFC 3339
    if let Err(e) = DateTime::parse_from_rfc3339(&reading.timestamp) {
        return Err(Error::Validation(format!(
            "Timestamp {:?} is not ISO-8601: {}",
            reading.timestamp, e
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading() -> DeviceReading {
        DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z")
    }

    #[test]
    fn test_valid_reading() {
        assert!(validate("debugrobID", "tempC", &reading()).is_ok());
    }

    #[test]
    fn test_empty_device_id() {
        assert!(validate("", "tempC", &reading()).is_err());
    }

    #[test]
    fn test_empty_metric() {
        assert!(validate("debugrobID", "", &reading()).is_err());
    }

    #[test]
    fn test_empty_name() {
        let mut r = reading();
        r.name.clear();
        assert!(validate("debugrobID", "tempC", &r).is_err());
    }

    #[test]
    fn test_bad_timestamp() {
        let mut r = reading();
        r.timestamp = "yesterday".to_string();
        assert!(matches!(
            validate("debugrobID", "tempC", &r),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn test_empty_value_is_allowed() {
        let mut r = reading();
        r.value.clear();
        assert!(validate("debugrobID", "tempC", &r).is_ok());
    }
}
