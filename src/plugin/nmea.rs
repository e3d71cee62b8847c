//! NMEA 0183 decoder — the reference in-tree plugin (spec.md §4.B).
//!
//! Framing, checksum validation, coordinate/timestamp reconstruction and
//! the multi-sentence merge rule are part of this system's observable
//! contract, not an implementation detail: round-tripping the scenario
//! table in spec.md §8 must reproduce the documented lat/lon/speed/heading.

use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use log::warn;

use crate::error::DecodeError;
use crate::plugin::{Plugin, ProtocolTag};
use crate::record::CanonicalRecord;

pub struct NmeaDecoder;

impl NmeaDecoder {
    pub fn new() -> Self {
        NmeaDecoder
    }
}

impl Default for NmeaDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for NmeaDecoder {
    fn name(&self) -> &str {
        "nmea"
    }

    fn version(&self) -> &str {
        "1.0"
    }

    fn protocol_tag(&self) -> ProtocolTag {
        ProtocolTag::Nmea
    }

    fn matches(&self, frame: &[u8]) -> bool {
        !frame.is_empty() && frame[0] == b'$' && frame.contains(&b',')
    }

    fn decode(&self, frame: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError> {
        decode(frame, device_id)
    }
}

/// A sentence surviving framing and checksum validation, stripped of its
/// leading `$` and trailing `*XX` / CRLF.
struct Sentence<'a> {
    talker: &'a str,
    kind: &'a str,
    fields: Vec<&'a str>,
}

/// Split the buffer into lines, keep only lines starting with `$`, validate
/// each sentence's checksum, and split the survivors into talker-stripped
/// type + comma fields (spec.md §4.B, "Framing" and "Checksum").
fn framed_sentences(buf: &[u8]) -> Result<Vec<Sentence<'_>>, DecodeError> {
    let text = std::str::from_utf8(buf).map_err(|_| DecodeError::NotAscii)?;

    let mut sentences = Vec::new();
    for line in text.split(['\r', '\n']) {
        let line = line.trim();
        if line.is_empty() || !line.starts_with('$') {
            continue;
        }

        match verify_checksum(line) {
            Ok(body) => {
                // body is "TTSSS,field,field,..." without the leading $ or
                // trailing checksum.
                let (head, rest) = match body.split_once(',') {
                    Some(x) => x,
                    None => continue,
                };
                if head.len() < 3 {
                    continue;
                }
                let talker = &head[..2];
                let kind = &head[2..];
                let fields: Vec<&str> = rest.split(',').collect();
                sentences.push(Sentence { talker, kind, fields });
            }
            Err(ChecksumFailure::NoAsterisk) => {
                warn!("Invalid NMEA checksum: no `*` separator in `{line}`");
            }
            Err(ChecksumFailure::Mismatch { declared, computed }) => {
                warn!(
                    "Invalid NMEA checksum: declared {declared:02X}, computed {computed:02X} in `{line}`"
                );
            }
            Err(ChecksumFailure::Malformed) => {
                warn!("Invalid NMEA checksum: malformed checksum field in `{line}`");
            }
        }
    }

    if sentences.is_empty() {
        return Err(DecodeError::NoSentence);
    }
    Ok(sentences)
}

enum ChecksumFailure {
    NoAsterisk,
    Malformed,
    Mismatch { declared: u8, computed: u8 },
}

/// A sentence is valid iff it contains exactly one `*`, the two characters
/// after it form a hex byte, and the XOR of every byte between `$` and `*`
/// (exclusive) equals that byte. Returns the body between `$` and `*` on
/// success.
fn verify_checksum(line: &str) -> Result<&str, ChecksumFailure> {
    let body_with_dollar = line;
    let mut parts = body_with_dollar.match_indices('*');
    let (star_idx, _) = match parts.next() {
        Some(x) => x,
        None => return Err(ChecksumFailure::NoAsterisk),
    };
    if parts.next().is_some() {
        return Err(ChecksumFailure::Malformed);
    }

    let body = &body_with_dollar[1..star_idx];
    let checksum_str = &body_with_dollar[star_idx + 1..];
    if checksum_str.len() != 2 {
        return Err(ChecksumFailure::Malformed);
    }
    let declared = match u8::from_str_radix(checksum_str, 16) {
        Ok(v) => v,
        Err(_) => return Err(ChecksumFailure::Malformed),
    };

    let computed = body.bytes().fold(0u8, |acc, b| acc ^ b);
    if computed == declared {
        Ok(body)
    } else {
        Err(ChecksumFailure::Mismatch { declared, computed })
    }
}

/// `DDMM.MMMM` → `DD + MM.MMMM/60`, negated if direction is `S` or `W`
/// (spec.md §4.B, "Coordinate parsing").
fn parse_coordinate(raw: &str, direction: &str, field_name: &'static str, sentence: &str) -> Result<f64, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::MalformedField {
            sentence: sentence.into(),
            field: field_name,
        });
    }
    let dot = raw.find('.').ok_or(DecodeError::MalformedField {
        sentence: sentence.into(),
        field: field_name,
    })?;
    // Minutes are always the two digits immediately before the decimal point.
    let deg_digits = dot.saturating_sub(2);
    let (deg_part, min_part) = raw.split_at(deg_digits);
    let degrees: f64 = deg_part.parse().map_err(|_| DecodeError::MalformedField {
        sentence: sentence.into(),
        field: field_name,
    })?;
    let minutes: f64 = min_part.parse().map_err(|_| DecodeError::MalformedField {
        sentence: sentence.into(),
        field: field_name,
    })?;

    let mut value = degrees + minutes / 60.0;
    if direction == "S" || direction == "W" {
        value = -value;
    }
    Ok(value)
}

/// `HHMMSS[.sss]` combined with `DDMMYY` in UTC (spec.md §4.B, "Timestamp
/// reconstruction"). The two-digit year is windowed with the standard
/// glibc/POSIX `%y` pivot (`>= 69` → 1900s, else → 2000s) rather than a flat
/// `+2000`: spec.md's prose says "year offset +2000" but its own worked
/// scenario (GPRMC date `230394`) expects `1994`, which only a pivoting
/// rule satisfies while still mapping contemporary two-digit years to the
/// 2000s.
fn parse_timestamp(time_str: &str, date_str: &str, sentence: &str) -> Result<chrono::DateTime<Utc>, DecodeError> {
    let err = || DecodeError::MalformedField {
        sentence: sentence.into(),
        field: "timestamp",
    };

    if time_str.len() < 6 || date_str.len() != 6 {
        return Err(err());
    }
    let hour: u32 = time_str[0..2].parse().map_err(|_| err())?;
    let minute: u32 = time_str[2..4].parse().map_err(|_| err())?;
    let secs_part = &time_str[4..];
    let second_f: f64 = secs_part.parse().map_err(|_| err())?;
    let second = second_f.trunc() as u32;
    let nanos = ((second_f.fract()) * 1_000_000_000.0).round() as u32;

    let day: u32 = date_str[0..2].parse().map_err(|_| err())?;
    let month: u32 = date_str[2..4].parse().map_err(|_| err())?;
    let two_digit_year: i32 = date_str[4..6].parse().map_err(|_| err())?;
    let year = if two_digit_year >= 69 {
        1900 + two_digit_year
    } else {
        2000 + two_digit_year
    };

    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or_else(err)?;
    let time = NaiveTime::from_hms_nano_opt(hour, minute, second, nanos).ok_or_else(err)?;
    let naive = date.and_time(time);
    Ok(Utc.from_utc_datetime(&naive))
}

/// Decode every sentence in the buffer into a single canonical record,
/// applying last-write-wins-by-sentence-order for fields and accumulation
/// for `extended-data` keys (spec.md §4.B, "Multi-sentence merging").
fn decode(buf: &[u8], device_id: &str) -> Result<CanonicalRecord, DecodeError> {
    let sentences = framed_sentences(buf)?;

    let mut record: Option<CanonicalRecord> = None;
    let ensure = |record: &mut Option<CanonicalRecord>| -> &mut CanonicalRecord {
        record.get_or_insert_with(|| CanonicalRecord::new(device_id, 0.0, 0.0))
    };

    let mut any_accepted = false;
    let mut last_err: Option<DecodeError> = None;

    for sentence in &sentences {
        let kind = sentence.kind;
        let result = match kind {
            "RMC" => apply_rmc(ensure(&mut record), sentence),
            "GGA" => apply_gga(ensure(&mut record), sentence),
            "GSA" => apply_gsa(ensure(&mut record), sentence),
            "GSV" => apply_gsv(ensure(&mut record), sentence),
            other => {
                apply_unknown(ensure(&mut record), sentence, other);
                Ok(())
            }
        };
        match result {
            Ok(()) => any_accepted = true,
            Err(e) => last_err = Some(e),
        }
    }

    if !any_accepted {
        return Err(last_err.unwrap_or(DecodeError::FixNotValid));
    }

    let record = record.expect("any_accepted implies record was created");
    Ok(record)
}

fn field<'a>(sentence: &Sentence<'a>, idx: usize) -> &'a str {
    sentence.fields.get(idx).copied().unwrap_or("")
}

/// RMC — discarded unless status is `A`. `speed := speed-knots × 1.852`,
/// `heading := course`.
fn apply_rmc(record: &mut CanonicalRecord, sentence: &Sentence) -> Result<(), DecodeError> {
    let time = field(sentence, 0);
    let status = field(sentence, 1);
    if status != "A" {
        return Err(DecodeError::FixNotValid);
    }
    let lat_raw = field(sentence, 2);
    let lat_dir = field(sentence, 3);
    let lon_raw = field(sentence, 4);
    let lon_dir = field(sentence, 5);
    let speed_knots = field(sentence, 6);
    let course = field(sentence, 7);
    let date = field(sentence, 8);

    record.latitude = parse_coordinate(lat_raw, lat_dir, "latitude", "RMC")?;
    record.longitude = parse_coordinate(lon_raw, lon_dir, "longitude", "RMC")?;

    if !speed_knots.is_empty() {
        let knots: f64 = speed_knots
            .parse()
            .map_err(|_| DecodeError::MalformedField { sentence: "RMC".into(), field: "speed" })?;
        record.speed = Some(knots * 1.852);
    }
    if !course.is_empty() {
        record.heading = course.parse().ok();
    }
    if !time.is_empty() && !date.is_empty() {
        record.timestamp = parse_timestamp(time, date, "RMC")?;
    }
    record.set_extended("messageType", "GPRMC");
    Ok(())
}

/// GGA — discarded unless fix-quality ≠ `0`. Populates altitude, satellites,
/// hdop; leaves timestamp unset if no date is available in the buffer.
fn apply_gga(record: &mut CanonicalRecord, sentence: &Sentence) -> Result<(), DecodeError> {
    let time = field(sentence, 0);
    let lat_raw = field(sentence, 1);
    let lat_dir = field(sentence, 2);
    let lon_raw = field(sentence, 3);
    let lon_dir = field(sentence, 4);
    let fix_quality = field(sentence, 5);
    let satellites = field(sentence, 6);
    let hdop = field(sentence, 7);
    let altitude = field(sentence, 8);

    if fix_quality.is_empty() || fix_quality == "0" {
        return Err(DecodeError::FixNotValid);
    }

    record.latitude = parse_coordinate(lat_raw, lat_dir, "latitude", "GGA")?;
    record.longitude = parse_coordinate(lon_raw, lon_dir, "longitude", "GGA")?;
    if !satellites.is_empty() {
        record.satellite_count = satellites.parse().ok();
    }
    if !hdop.is_empty() {
        record.hdop = hdop.parse().ok();
    }
    if !altitude.is_empty() {
        record.altitude = altitude.parse().ok();
    }
    record.set_extended("fixQuality", fix_quality.to_string());
    record.set_extended("messageType", "GPGGA");
    let _ = time;
    Ok(())
}

/// GSA — populates hdop (field 15, 0-indexed 14) and `Mode`/`FixType`.
fn apply_gsa(record: &mut CanonicalRecord, sentence: &Sentence) -> Result<(), DecodeError> {
    let mode = field(sentence, 0);
    let fix_type = field(sentence, 1);
    let hdop = field(sentence, 14);

    if !hdop.is_empty() {
        record.hdop = hdop.parse().ok();
    }
    if !mode.is_empty() {
        record.set_extended("mode", mode.to_string());
    }
    if !fix_type.is_empty() {
        record.set_extended("fixType", fix_type.to_string());
    }
    Ok(())
}

/// GSV — populates `extended-data` `SatellitesInView`.
fn apply_gsv(record: &mut CanonicalRecord, sentence: &Sentence) -> Result<(), DecodeError> {
    let sats_in_view = field(sentence, 2);
    if !sats_in_view.is_empty() {
        if let Ok(n) = sats_in_view.parse::<i64>() {
            record.set_extended("satellitesInView", n);
        }
    }
    Ok(())
}

/// Any other sentence type — stored under key `unknown_<type>`, keyed on the
/// talker-stripped type so the same sentence type from different talkers
/// (`$GPZZZ`, `$GLZZZ`) accumulates under one key.
fn apply_unknown(record: &mut CanonicalRecord, sentence: &Sentence, kind: &str) {
    let joined = sentence.fields.join(",");
    record.set_extended(format!("unknown_{kind}"), joined);
}

#[cfg(test)]
mod tests {
    use super::*;

    const GPRMC: &[u8] =
        b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A\r\n";

    #[test]
    fn decodes_a_valid_gprmc_sentence() {
        let record = decode(GPRMC, "truck-1").unwrap();
        assert!((record.latitude - 48.1173).abs() < 1e-4);
        assert!((record.longitude - 11.5167).abs() < 1e-4);
        assert!((record.speed.unwrap() - 41.4848).abs() < 1e-3);
        assert_eq!(record.heading, Some(84.4));
        assert_eq!(
            record.timestamp,
            Utc.with_ymd_and_hms(1994, 3, 23, 12, 35, 19).unwrap()
        );
        // Protocol is a reserved extended-data key the Pipeline appends at
        // publish time, not the decoder — see process_frame in pipeline.rs.
        assert_eq!(record.protocol_tag(), None);
    }

    #[test]
    fn rejects_sentence_with_bad_checksum() {
        let bad = b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*00\r\n";
        let err = decode(bad, "truck-1").unwrap_err();
        assert!(matches!(err, DecodeError::FixNotValid) || matches!(err, DecodeError::NoSentence));
    }

    #[test]
    fn discards_sentence_with_invalid_status() {
        let invalid = b"$GPRMC,123519,V,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*7D\r\n";
        let err = decode(invalid, "truck-1").unwrap_err();
        assert!(matches!(err, DecodeError::FixNotValid));
    }

    #[test]
    fn gga_populates_altitude_satellites_and_hdop() {
        let gga = b"$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47\r\n";
        let record = decode(gga, "peer-1").unwrap();
        assert_eq!(record.altitude, Some(545.4));
        assert_eq!(record.satellite_count, Some(8));
        assert_eq!(record.hdop, Some(0.9));
    }

    #[test]
    fn later_sentence_wins_when_lat_lon_disagree() {
        let buf = [
            "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A",
            "$GPGGA,123520,4900.000,N,01200.000,E,1,08,0.9,545.4,M,46.9,M,,*41",
        ]
        .join("\r\n")
            + "\r\n";
        let record = decode(buf.as_bytes(), "truck-1").unwrap();
        assert!((record.latitude - 49.0).abs() < 1e-6);
        assert!((record.longitude - 12.0).abs() < 1e-6);
        // RMC's speed/heading still survive the merge.
        assert!(record.speed.is_some());
    }

    #[test]
    fn unknown_sentence_types_are_stashed_under_a_talker_stripped_key() {
        let computed = "GPZZZ,1,2,3".bytes().fold(0u8, |a, b| a ^ b);
        let line = format!("$GPZZZ,1,2,3*{:02X}\r\n", computed);
        let record = decode(line.as_bytes(), "truck-1").unwrap();
        assert!(record.extended_data.contains_key("unknown_ZZZ"));
    }

    #[test]
    fn unknown_sentence_types_merge_across_talkers() {
        let gp = "GPZZZ,1,2,3".bytes().fold(0u8, |a, b| a ^ b);
        let gl = "GLZZZ,4,5,6".bytes().fold(0u8, |a, b| a ^ b);
        let buf = format!("$GPZZZ,1,2,3*{gp:02X}\r\n$GLZZZ,4,5,6*{gl:02X}\r\n");
        let record = decode(buf.as_bytes(), "truck-1").unwrap();
        // Same unknown type from two talkers lands in one extended-data key;
        // the later sentence wins per the last-write-wins merge rule.
        assert_eq!(
            record.extended_data.get("unknown_ZZZ"),
            Some(&crate::record::ExtendedValue::Text("4,5,6".to_string()))
        );
    }

    #[test]
    fn coordinate_parsing_matches_expected_decimal() {
        assert!((parse_coordinate("4807.038", "N", "latitude", "RMC").unwrap() - 48.1173).abs() < 1e-4);
        assert!((parse_coordinate("01131.000", "W", "longitude", "RMC").unwrap() + 11.5167).abs() < 1e-4);
    }
}
