//! The canonical, normalized GPS position record produced by a decoder and
//! consumed by the validator and publisher (spec.md §3).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Reserved `extended-data` keys the pipeline itself is allowed to append
/// after a decoder has produced a record. Plugins must not write these.
pub mod reserved_keys {
    pub const PROTOCOL: &str = "protocol";
    pub const PROCESSED_AT: &str = "processedAt";
    pub const PROCESSING_ID: &str = "processingId";
    pub const DATA_SIZE: &str = "dataSize";
    pub const QUALITY_SCORE: &str = "qualityScore";
    pub const KAFKA_PARTITION: &str = "kafkaPartition";
    pub const KAFKA_OFFSET: &str = "kafkaOffset";
}

/// A decoder-specific scalar stored in `extended-data`. Kept as a closed,
/// tagged set rather than a bag of `serde_json::Value` so callers can match
/// on it without re-parsing JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExtendedValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for ExtendedValue {
    fn from(v: &str) -> Self {
        ExtendedValue::Text(v.to_string())
    }
}
impl From<String> for ExtendedValue {
    fn from(v: String) -> Self {
        ExtendedValue::Text(v)
    }
}
impl From<i64> for ExtendedValue {
    fn from(v: i64) -> Self {
        ExtendedValue::Integer(v)
    }
}
impl From<u8> for ExtendedValue {
    fn from(v: u8) -> Self {
        ExtendedValue::Integer(v as i64)
    }
}
impl From<f64> for ExtendedValue {
    fn from(v: f64) -> Self {
        ExtendedValue::Float(v)
    }
}
impl From<bool> for ExtendedValue {
    fn from(v: bool) -> Self {
        ExtendedValue::Bool(v)
    }
}

/// The normalized output of a decoder (spec.md §3, "Canonical Record").
///
/// Required fields are always populated before the record leaves the
/// decoder; the `Validator` rejects any violation of the invariants. The
/// record is immutable after validation completes — only the pipeline's
/// publish step may append reserved `extended-data` keys, which is why
/// `extended_data` is the only field with a public mutator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalRecord {
    pub device_id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub satellite_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hdop: Option<f64>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub extended_data: BTreeMap<String, ExtendedValue>,
}

impl CanonicalRecord {
    /// Start building a record for `device_id`; timestamp defaults to now
    /// and is expected to be overwritten by a decoder or, failing that, by
    /// the pipeline on ingress (spec.md §4.B, "decoder leaves the timestamp
    /// unset").
    pub fn new(device_id: impl Into<String>, latitude: f64, longitude: f64) -> Self {
        CanonicalRecord {
            device_id: device_id.into(),
            latitude,
            longitude,
            timestamp: Utc::now(),
            speed: None,
            heading: None,
            altitude: None,
            satellite_count: None,
            hdop: None,
            extended_data: BTreeMap::new(),
        }
    }

    pub fn set_extended(&mut self, key: impl Into<String>, value: impl Into<ExtendedValue>) {
        self.extended_data.insert(key.into(), value.into());
    }

    pub fn protocol_tag(&self) -> Option<&str> {
        match self.extended_data.get(reserved_keys::PROTOCOL) {
            Some(ExtendedValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn quality_score(&self) -> Option<f64> {
        match self.extended_data.get(reserved_keys::QUALITY_SCORE) {
            Some(ExtendedValue::Integer(i)) => Some(*i as f64),
            Some(ExtendedValue::Float(f)) => Some(*f),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn omits_null_optionals_when_serialized() {
        let record = CanonicalRecord::new("truck-1", 48.1173, 11.5167);
        let json = serde_json::to_value(&record).unwrap();
        assert!(json.get("speed").is_none());
        assert!(json.get("heading").is_none());
        assert!(json.get("extendedData").is_none());
        assert_eq!(json["deviceId"], "truck-1");
    }

    #[test]
    fn keeps_populated_optionals() {
        let mut record = CanonicalRecord::new("truck-1", 48.1173, 11.5167);
        record.speed = Some(41.48);
        record.set_extended(reserved_keys::PROTOCOL, "NMEA");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["speed"], 41.48);
        assert_eq!(json["extendedData"]["protocol"], "NMEA");
    }
}
