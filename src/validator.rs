//! Validates a `CanonicalRecord` against the invariants in spec.md §3 and
//! computes a quality score (spec.md §4.C).

use chrono::{Duration, Utc};
use log::warn;

use crate::error::ValidationError;
use crate::record::{reserved_keys, CanonicalRecord};

const MAX_INGEST_AGE_HOURS: i64 = 24;
const MAX_INGEST_SKEW_HOURS: i64 = 1;
const MAX_SPEED_KMH: f64 = 1000.0;
const SPEED_WARN_THRESHOLD_KMH: f64 = 300.0;
const MAX_SATELLITE_COUNT: i32 = 50;
const MAX_HDOP: f64 = 50.0;

/// The outcome of running a record through the validator: whether it's
/// acceptable, plus every human-readable reason it failed (there can be
/// more than one simultaneous violation).
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Validator
    }

    /// Run every hard invariant check and compute the quality score. The
    /// quality score is stored on the record regardless of outcome — a
    /// score of 0 never causes rejection on its own, only a hard invariant
    /// violation does (spec.md §4.C).
    pub fn validate(&self, record: &mut CanonicalRecord) -> ValidationResult {
        let mut errors = Vec::new();

        if record.device_id.trim().is_empty() {
            errors.push(ValidationError::EmptyDeviceId);
        }
        if !(-90.0..=90.0).contains(&record.latitude) {
            errors.push(ValidationError::LatitudeOutOfRange(record.latitude));
        }
        if !(-180.0..=180.0).contains(&record.longitude) {
            errors.push(ValidationError::LongitudeOutOfRange(record.longitude));
        }
        if record.latitude == 0.0 && record.longitude == 0.0 {
            errors.push(ValidationError::NullIsland);
        }

        let now = Utc::now();
        let window_start = now - Duration::hours(MAX_INGEST_AGE_HOURS);
        let window_end = now + Duration::hours(MAX_INGEST_SKEW_HOURS);
        if record.timestamp < window_start || record.timestamp > window_end || record.timestamp.year_before_2000() {
            errors.push(ValidationError::TimestampOutOfWindow(record.timestamp));
        }

        if let Some(speed) = record.speed {
            if !(0.0..=MAX_SPEED_KMH).contains(&speed) {
                errors.push(ValidationError::SpeedOutOfRange(speed));
            } else if speed > SPEED_WARN_THRESHOLD_KMH {
                warn!(
                    "device {}: speed {speed} km/h exceeds {SPEED_WARN_THRESHOLD_KMH}, remains valid",
                    record.device_id
                );
            }
        }
        if let Some(heading) = record.heading {
            if !(0.0..360.0).contains(&heading) {
                errors.push(ValidationError::HeadingOutOfRange(heading));
            }
        }
        if let Some(count) = record.satellite_count {
            if !(0..=MAX_SATELLITE_COUNT).contains(&count) {
                errors.push(ValidationError::SatelliteCountOutOfRange(count));
            }
        }
        if let Some(hdop) = record.hdop {
            if !(0.0..=MAX_HDOP).contains(&hdop) {
                errors.push(ValidationError::HdopOutOfRange(hdop));
            }
        }

        let score = quality_score(record, now);
        record.set_extended(reserved_keys::QUALITY_SCORE, score as i64);

        ValidationResult { errors }
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

/// A quality score in `[0, 100]`, deducting points for missing optional
/// fields, low satellite count, high HDOP, and stale timestamps
/// (spec.md §4.C).
fn quality_score(record: &CanonicalRecord, now: chrono::DateTime<Utc>) -> i32 {
    let mut score: i32 = 100;

    if record.speed.is_none() {
        score -= 5;
    }
    if record.heading.is_none() {
        score -= 5;
    }
    if record.altitude.is_none() {
        score -= 5;
    }
    if record.satellite_count.is_none() {
        score -= 5;
    }
    if record.hdop.is_none() {
        score -= 5;
    }

    if let Some(count) = record.satellite_count {
        if count < 4 {
            score -= 30;
        } else if count < 6 {
            score -= 15;
        } else if count < 8 {
            score -= 5;
        }
    }

    if let Some(hdop) = record.hdop {
        if hdop > 10.0 {
            score -= 40;
        } else if hdop > 5.0 {
            score -= 20;
        } else if hdop > 2.0 {
            score -= 10;
        }
    }

    let age_minutes = (now - record.timestamp).num_minutes();
    if age_minutes > 60 {
        score -= 20;
    } else if age_minutes > 10 {
        score -= 10;
    }

    score.clamp(0, 100)
}

/// Small helper so the year ≥ 2000 invariant (spec.md §3) reads naturally
/// at the call site above without a second standalone check.
trait YearBefore2000 {
    fn year_before_2000(&self) -> bool;
}

impl YearBefore2000 for chrono::DateTime<Utc> {
    fn year_before_2000(&self) -> bool {
        use chrono::Datelike;
        self.year() < 2000
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fresh_record() -> CanonicalRecord {
        let mut record = CanonicalRecord::new("truck-1", 48.1173, 11.5167);
        record.timestamp = Utc::now();
        record
    }

    #[test]
    fn accepts_a_well_formed_record() {
        let mut record = fresh_record();
        let result = Validator::new().validate(&mut record);
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_null_island() {
        let mut record = fresh_record();
        record.latitude = 0.0;
        record.longitude = 0.0;
        let result = Validator::new().validate(&mut record);
        assert!(matches!(result.errors[0], ValidationError::NullIsland));
    }

    #[test]
    fn rejects_out_of_range_latitude() {
        let mut record = fresh_record();
        record.latitude = 91.0;
        let result = Validator::new().validate(&mut record);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::LatitudeOutOfRange(_))));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let mut record = fresh_record();
        record.timestamp = Utc.with_ymd_and_hms(1994, 3, 23, 12, 35, 19).unwrap();
        let result = Validator::new().validate(&mut record);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::TimestampOutOfWindow(_))));
    }

    #[test]
    fn low_satellite_count_and_high_hdop_both_deduct_points() {
        let mut record = fresh_record();
        record.satellite_count = Some(3);
        record.hdop = Some(12.0);
        record.speed = Some(10.0);
        record.heading = Some(90.0);
        record.altitude = Some(10.0);
        Validator::new().validate(&mut record);
        let score = record.quality_score().unwrap();
        assert!(score <= 30.0, "expected heavy deduction, got {score}");
    }

    #[test]
    fn high_speed_warns_but_remains_valid() {
        let mut record = fresh_record();
        record.speed = Some(310.0);
        let result = Validator::new().validate(&mut record);
        assert!(result.is_valid(), "{:?}", result.errors);
    }

    #[test]
    fn rejects_speed_above_the_hard_range() {
        let mut record = fresh_record();
        record.speed = Some(1000.1);
        let result = Validator::new().validate(&mut record);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::SpeedOutOfRange(_))));
    }

    #[test]
    fn rejects_satellite_count_above_the_hard_range() {
        let mut record = fresh_record();
        record.satellite_count = Some(51);
        let result = Validator::new().validate(&mut record);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::SatelliteCountOutOfRange(_))));
    }

    #[test]
    fn rejects_hdop_above_the_hard_range() {
        let mut record = fresh_record();
        record.hdop = Some(50.1);
        let result = Validator::new().validate(&mut record);
        assert!(result
            .errors
            .iter()
            .any(|e| matches!(e, ValidationError::HdopOutOfRange(_))));
    }

    #[test]
    fn zero_score_does_not_cause_rejection_on_its_own() {
        let mut record = fresh_record();
        record.satellite_count = Some(0);
        record.hdop = Some(50.0);
        let result = Validator::new().validate(&mut record);
        assert!(result.is_valid());
        assert_eq!(record.quality_score(), Some(0.0));
    }
}
