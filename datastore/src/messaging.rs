//! Device message handling: validate a message published by a device and
//! turn storable ones into readings.

use crate::errors::{Error, Result};
use crate::literal::{self, Literal};
use crate::model::{format_timestamp, DeviceReading, IncomingReading};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

pub const TOPIC_PREFIX: &str = "telemetry/";

const MESSAGE_TYPE_KEY: &str = "messageType";
const VAR_KEY: &str = "var";
const VALUES_KEY: &str = "values";
const VAR_NAME_KEY: &str = "varName";
const IMAGE_TYPE_KEY: &str = "imageType";
const FILE_NAME_KEY: &str = "fileName";
const RECIPE_ACTION_KEY: &str = "action";
const RECIPE_NAME_KEY: &str = "name";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    EnvVar,
    CommandReply,
    /// Chunked images from old clients; accepted but not stored.
    Image,
    ImageUpload,
    RecipeEvent,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EnvVar" => Some(Self::EnvVar),
            "CommandReply" => Some(Self::CommandReply),
            "Image" => Some(Self::Image),
            "ImageUpload" => Some(Self::ImageUpload),
            "RecipeEvent" => Some(Self::RecipeEvent),
            _ => None,
        }
    }

    fn required_keys(self) -> &'static [&'static str] {
        match self {
            Self::EnvVar | Self::CommandReply => &[VAR_KEY, VALUES_KEY],
            Self::Image | Self::ImageUpload => &[VAR_NAME_KEY, IMAGE_TYPE_KEY, FILE_NAME_KEY],
            Self::RecipeEvent => &[RECIPE_ACTION_KEY, RECIPE_NAME_KEY],
        }
    }

    fn is_storable(self) -> bool {
        matches!(self, Self::EnvVar | Self::CommandReply)
    }
}

/// Device ID from a `telemetry/<device_id>` topic.
pub fn device_id_from_topic(topic: &str) -> Option<&str> {
    topic
        .strip_prefix(TOPIC_PREFIX)
        .filter(|id| !id.is_empty() && !id.contains('/'))
}

/// Check a message has a known type and at least one of the keys its type needs.
pub fn validate_message(message: &Map<String, Value>) -> Result<MessageType> {
    let raw = message
        .get(MESSAGE_TYPE_KEY)
        .ok_or_else(|| Error::Message(format!("missing key {}", MESSAGE_TYPE_KEY)))?;
    let message_type = raw
        .as_str()
        .and_then(MessageType::parse)
        .ok_or_else(|| {
            Error::Message(format!("invalid value {} for key {}", raw, MESSAGE_TYPE_KEY))
        })?;

    let required = message_type.required_keys();
    if !required.iter().any(|key| message.contains_key(*key)) {
        return Err(Error::Message(format!(
            "{:?} message needs one of {:?}",
            message_type, required
        )));
    }

    Ok(message_type)
}

/// Parse a raw payload from `device_id`. Returns `Ok(None)` for valid
/// messages that carry nothing to store.
pub fn parse_message(
    device_id: &str,
    payload: &[u8],
    received_at: DateTime<Utc>,
) -> Result<Option<IncomingReading>> {
    let message: Map<String, Value> = serde_json::from_slice(payload)?;
    let message_type = validate_message(&message)?;

    if !message_type.is_storable() {
        debug!("Ignoring {:?} message from {}", message_type, device_id);
        return Ok(None);
    }

    let metric = message
        .get(VAR_KEY)
        .and_then(Value::as_str)
        .ok_or_else(|| missing(message_type, VAR_KEY))?;
    let values = message
        .get(VALUES_KEY)
        .ok_or_else(|| missing(message_type, VALUES_KEY))?;

    let (name, value) = match values {
        Value::String(s) => (string_to_name(s)?, string_to_value(s)?),
        other => json_name_value(other)?,
    };

    Ok(Some(IncomingReading {
        device_id: device_id.to_string(),
        metric: metric.to_string(),
        reading: DeviceReading {
            value,
            name,
            timestamp: format_timestamp(received_at),
        },
    }))
}

fn missing(message_type: MessageType, key: &str) -> Error {
    Error::Message(format!("{:?} message missing {}", message_type, key))
}

fn first_entry(lit: &Literal) -> Option<&Literal> {
    lit.get(VALUES_KEY).and_then(Literal::first)
}

/// Sensor name of the first entry in a `values` string.
fn string_to_name(s: &str) -> Result<String> {
    if let Ok(lit) = literal::parse(s) {
        if let Some(Literal::Str(name)) = first_entry(&lit).and_then(|e| e.get("name")) {
            return Ok(name.clone());
        }
    }

    // Probably a string embedded in a string; scan for the name instead.
    const NAME_TAG: &str = "'name':'";
    let start = s
        .find(NAME_TAG)
        .map(|i| i + NAME_TAG.len())
        .ok_or_else(|| Error::Message(format!("no sensor name in {:?}", s)))?;
    let end = s[start..]
        .find('\'')
        .map(|i| start + i)
        .ok_or_else(|| Error::Message(format!("unterminated sensor name in {:?}", s)))?;
    Ok(s[start..end].to_string())
}

/// Value of the first entry in a `values` string, rendered as text.
fn string_to_value(s: &str) -> Result<String> {
    if let Ok(lit) = literal::parse(s) {
        if let Some(value) = first_entry(&lit).and_then(|e| e.get("value")) {
            return Ok(value.render());
        }
    }

    // e.g. {'values':[{'name':'LEDPanel-Top', 'type':'str', 'value':'{'400-449': 0.0}'}]}
    const VALUE_TAG: &str = "'value':'";
    const END_TAG: &str = "}]}";
    let (start, end) = match (s.find(VALUE_TAG), s.find(END_TAG)) {
        (Some(start), Some(end)) => (start + VALUE_TAG.len(), end.saturating_sub(1)),
        _ => return Ok(s.to_string()),
    };
    let Some(embedded) = s.get(start..end) else {
        return Ok(s.to_string());
    };
    let lit = literal::parse(embedded).map_err(|e| {
        warn!("Unparseable embedded value {:?}: {}", embedded, e);
        Error::Message(format!("unparseable embedded value: {}", e))
    })?;
    Ok(lit.render())
}

/// Name and value when a device sends `values` as structured JSON.
fn json_name_value(values: &Value) -> Result<(String, String)> {
    let entry = values
        .get(VALUES_KEY)
        .and_then(|v| v.get(0))
        .ok_or_else(|| Error::Message("values has no entries".to_string()))?;
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::Message("values entry has no name".to_string()))?;
    let value = match entry.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    Ok((name.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2019, 7, 18, 22, 57, 1).unwrap()
    }

    fn payload(v: Value) -> Vec<u8> {
        serde_json::to_vec(&v).unwrap()
    }

    #[test]
    fn test_device_id_from_topic() {
        assert_eq!(device_id_from_topic("telemetry/debugrobID"), Some("debugrobID"));
        assert_eq!(device_id_from_topic("telemetry/"), None);
        assert_eq!(device_id_from_topic("telemetry/a/b"), None);
        assert_eq!(device_id_from_topic("other/debugrobID"), None);
    }

    #[test]
    fn test_parse_env_var() {
        let msg = json!({
            "messageType": "EnvVar",
            "var": "air_temperature_celsius",
            "values": "{'values':[{'name':'SHT25-Top','type':'float','value':24.0}]}"
        });

        let incoming = parse_message("debugrobID", &payload(msg), now())
            .unwrap()
            .unwrap();
        assert_eq!(incoming.device_id, "debugrobID");
        assert_eq!(incoming.metric, "air_temperature_celsius");
        assert_eq!(
            incoming.reading,
            DeviceReading::new("24.0", "SHT25-Top", "2019-07-18T22:57:01Z")
        );
    }

    #[test]
    fn test_parse_embedded_string_value() {
        let msg = json!({
            "messageType": "EnvVar",
            "var": "light_spectrum_nm_percent",
            "values": concat!(
                "{'values':[{'name':'LEDPanel-Top', 'type':'str', ",
                "'value':'{'400-449': 0.0, '500-549': 83.33}'}]}"
            )
        });

        let incoming = parse_message("dev", &payload(msg), now()).unwrap().unwrap();
        assert_eq!(incoming.reading.name, "LEDPanel-Top");
        assert_eq!(incoming.reading.value, r#"{"400-449": 0.0, "500-549": 83.33}"#);
    }

    #[test]
    fn test_parse_command_reply() {
        let msg = json!({
            "messageType": "CommandReply",
            "var": "status",
            "values": "{'values':[{'name':'status','type':'str','value':'ok'}]}"
        });

        let incoming = parse_message("dev", &payload(msg), now()).unwrap().unwrap();
        assert_eq!(incoming.metric, "status");
        assert_eq!(incoming.reading.value, "ok");
    }

    #[test]
    fn test_parse_structured_values() {
        let msg = json!({
            "messageType": "EnvVar",
            "var": "air_humidity_percent",
            "values": {"values": [{"name": "SHT25-Top", "value": 41.5}]}
        });

        let incoming = parse_message("dev", &payload(msg), now()).unwrap().unwrap();
        assert_eq!(incoming.reading.value, "41.5");
    }

    #[test]
    fn test_recipe_event_is_ignored() {
        let msg = json!({"messageType": "RecipeEvent", "action": "start", "name": "basil"});
        assert!(parse_message("dev", &payload(msg), now()).unwrap().is_none());
    }

    #[test]
    fn test_image_upload_is_ignored() {
        let msg = json!({"messageType": "ImageUpload", "fileName": "x.png"});
        assert!(parse_message("dev", &payload(msg), now()).unwrap().is_none());
    }

    #[test]
    fn test_missing_message_type() {
        let msg = json!({"var": "status"});
        assert!(matches!(
            parse_message("dev", &payload(msg), now()),
            Err(Error::Message(_))
        ));
    }

    #[test]
    fn test_unknown_message_type() {
        let msg = json!({"messageType": "Bogus", "var": "x"});
        assert!(parse_message("dev", &payload(msg), now()).is_err());
    }

    #[test]
    fn test_missing_required_keys() {
        let msg = json!({"messageType": "EnvVar"});
        assert!(matches!(
            validate_message(msg.as_object().unwrap()),
            Err(Error::Message(_))
        ));
    }

    #[test]
    fn test_env_var_needs_var_to_store() {
        let msg = json!({
            "messageType": "EnvVar",
            "values": "{'values':[{'name':'a','value':1}]}"
        });
        assert!(parse_message("dev", &payload(msg), now()).is_err());
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            parse_message("dev", b"invalid json", now()),
            Err(Error::Json(_))
        ));
    }

    #[test]
    fn test_value_without_tags_is_whole_string() {
        assert_eq!(string_to_value("garbled").unwrap(), "garbled");
    }

    #[test]
    fn test_name_scan_fallback() {
        let s = "{'values':[{'name':'LEDPanel-Top', 'value':'{'a': 1}'}]}";
        assert_eq!(string_to_name(s).unwrap(), "LEDPanel-Top");
        assert!(string_to_name("no name here").is_err());
    }

    #[test]
    fn test_deeply_nested_values_are_rejected() {
        let msg = json!({
            "messageType": "EnvVar",
            "var": "air_temperature_celsius",
            "values": "[".repeat(8000)
        });
        assert!(matches!(
            parse_message("dev", &payload(msg), now()),
            Err(Error::Message(_))
        ));
    }
}
