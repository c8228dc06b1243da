//! Inbound telemetry decoding.
//!
//! Controllers stream one JSON object per line:
//!
//! ```text
//! {"pos_cnt": 1523, "cycle count A": 12, "cycle count B": 11, "RPM A": 2710.5, "RPM B": 2698.0}
//! ```
//!
//! All five keys are required; extra keys are ignored.

use crate::device::DeviceId;
use crate::error::ProtocolError;
use chrono::{DateTime, Local};
use serde::Serialize;
use serde_json::{Map, Value};

/// Position counter key.
pub const FIELD_POS_CNT: &str = "pos_cnt";
/// Channel A cycle count key.
pub const FIELD_CYCLE_COUNT_A: &str = "cycle count A";
/// Channel B cycle count key.
pub const FIELD_CYCLE_COUNT_B: &str = "cycle count B";
/// Channel A RPM key.
pub const FIELD_RPM_A: &str = "RPM A";
/// Channel B RPM key.
pub const FIELD_RPM_B: &str = "RPM B";

/// Decoded field set of one telemetry line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    /// Encoder position count
    pub pos_cnt: i64,
    /// Channel A cycle count
    pub cycle_count_a: i64,
    /// Channel B cycle count
    pub cycle_count_b: i64,
    /// Channel A RPM
    pub rpm_a: f64,
    /// Channel B RPM
    pub rpm_b: f64,
}

/// One telemetry reading, stamped with its device and arrival time.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sample {
    /// Source controller
    pub device: DeviceId,
    /// Host time when the line was decoded
    pub received_at: DateTime<Local>,
    /// Decoded fields
    pub reading: Reading,
}

impl Sample {
    /// Stamp `reading` as received now from `device`.
    pub fn new(device: DeviceId, reading: Reading) -> Self {
        Self::at(device, Local::now(), reading)
    }

    /// Stamp `reading` with an explicit arrival time.
    pub fn at(device: DeviceId, received_at: DateTime<Local>, reading: Reading) -> Self {
        Self {
            device,
            received_at,
            reading,
        }
    }
}

/// Decode one line (without or with its trailing `\r\n`).
pub fn decode_line(line: &str) -> Result<Reading, ProtocolError> {
    let value: Value = serde_json::from_str(line.trim())
        .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| ProtocolError::Malformed("expected a JSON object".to_string()))?;

    Ok(Reading {
        pos_cnt: integer_field(object, FIELD_POS_CNT)?,
        cycle_count_a: integer_field(object, FIELD_CYCLE_COUNT_A)?,
        cycle_count_b: integer_field(object, FIELD_CYCLE_COUNT_B)?,
        rpm_a: number_field(object, FIELD_RPM_A)?,
        rpm_b: number_field(object, FIELD_RPM_B)?,
    })
}

fn field<'a>(object: &'a Map<String, Value>, key: &'static str) -> Result<&'a Value, ProtocolError> {
    object.get(key).ok_or(ProtocolError::MissingField(key))
}

fn integer_field(object: &Map<String, Value>, key: &'static str) -> Result<i64, ProtocolError> {
    let value = field(object, key)?;
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    // Integral floats such as `12.0` are accepted.
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => Ok(f as i64),
        _ => Err(ProtocolError::InvalidField(key)),
    }
}

fn number_field(object: &Map<String, Value>, key: &'static str) -> Result<f64, ProtocolError> {
    field(object, key)?
        .as_f64()
        .ok_or(ProtocolError::InvalidField(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str =
        r#"{"pos_cnt":1,"cycle count A":0,"cycle count B":0,"RPM A":0,"RPM B":0}"#;

    #[test]
    fn test_decode_valid_line() {
        let reading = decode_line(
            r#"{"pos_cnt":1523,"cycle count A":12,"cycle count B":11,"RPM A":2710.5,"RPM B":2698}"#,
        )
        .unwrap();
        assert_eq!(reading.pos_cnt, 1523);
        assert_eq!(reading.cycle_count_a, 12);
        assert_eq!(reading.cycle_count_b, 11);
        assert_eq!(reading.rpm_a, 2710.5);
        assert_eq!(reading.rpm_b, 2698.0);
    }

    #[test]
    fn test_decode_tolerates_line_endings_and_extra_keys() {
        assert!(decode_line(&format!("{}\r\n", VALID)).is_ok());
        let extra = r#"{"pos_cnt":1,"cycle count A":0,"cycle count B":0,"RPM A":0,"RPM B":0,"temp":31}"#;
        assert!(decode_line(extra).is_ok());
    }

    #[test]
    fn test_each_missing_field_invalidates_sample() {
        for key in [
            FIELD_POS_CNT,
            FIELD_CYCLE_COUNT_A,
            FIELD_CYCLE_COUNT_B,
            FIELD_RPM_A,
            FIELD_RPM_B,
        ] {
            let mut object: Map<String, Value> = serde_json::from_str(VALID).unwrap();
            object.remove(key);
            let line = Value::Object(object).to_string();
            assert_eq!(decode_line(&line), Err(ProtocolError::MissingField(key)));
        }
    }

    #[test]
    fn test_malformed_lines() {
        assert!(matches!(
            decode_line("{not valid json}"),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(decode_line("[1,2,3]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode_line(""), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_wrong_field_type() {
        let line = r#"{"pos_cnt":"one","cycle count A":0,"cycle count B":0,"RPM A":0,"RPM B":0}"#;
        assert_eq!(
            decode_line(line),
            Err(ProtocolError::InvalidField(FIELD_POS_CNT))
        );
        let line = r#"{"pos_cnt":1.5,"cycle count A":0,"cycle count B":0,"RPM A":0,"RPM B":0}"#;
        assert_eq!(
            decode_line(line),
            Err(ProtocolError::InvalidField(FIELD_POS_CNT))
        );
        let line = r#"{"pos_cnt":1,"cycle count A":2.0,"cycle count B":0,"RPM A":0,"RPM B":0}"#;
        assert_eq!(decode_line(line).unwrap().cycle_count_a, 2);
    }
}
