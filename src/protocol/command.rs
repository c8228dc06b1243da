//! Outbound command encoding.
//!
//! Every message is exactly one newline-terminated line. The encoder performs no
//! I/O; it returns bytes for the caller to write to a [`Device`](crate::device::Device).

use crate::error::ProtocolError;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Full-scale value of the controller's 16-bit duty-cycle fraction.
pub const DUTY_CYCLE_FULL_SCALE: f64 = 65_536.0;

/// Stage addressed by a configuration message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StageId {
    /// Stage A
    A,
    /// Stage B
    B,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
        }
    }
}

impl FromStr for StageId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "A" => Ok(Self::A),
            "B" => Ok(Self::B),
            other => Err(format!("Invalid stage '{}'. Must be A or B", other)),
        }
    }
}

/// Mechanical/electrical setup pushed to one stage before a run.
///
/// The four parameters are forwarded as entered; the firmware parses them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigCommand {
    /// Gear head ratio
    pub ghr: String,
    /// Threads per inch
    pub tpi: String,
    /// Encoder resolution
    pub resolution: String,
    /// Quadrature multiplier
    pub quadrature: String,
    /// Target stage, sent as `id`
    #[serde(rename = "id")]
    pub stage: StageId,
}

/// Cycle program: number of cycles and the duty cycle as a 16-bit fixed-point fraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleCommand {
    /// Number of cycles to run
    #[serde(rename = "num_of_cycles", serialize_with = "as_decimal_string")]
    pub num_cycles: u32,
    /// `round(percent / 100 * 65536)`
    #[serde(rename = "duty_cycle", serialize_with = "as_decimal_string")]
    pub duty_cycle_fixed: u32,
}

fn as_decimal_string<S: serde::Serializer>(value: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(value)
}

impl CycleCommand {
    /// Build from a human-entered duty-cycle percentage.
    pub fn from_percent(num_cycles: u32, duty_cycle_percent: f64) -> Result<Self, ProtocolError> {
        Ok(Self {
            num_cycles,
            duty_cycle_fixed: duty_cycle_fixed_point(duty_cycle_percent)?,
        })
    }
}

/// Outbound command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Stage setup, one JSON object
    Config(ConfigCommand),
    /// Cycle program, one JSON object
    Cycle(CycleCommand),
    /// `start`
    Start,
    /// `pause`
    Pause,
    /// `stop`
    Stop,
}

impl ControlMessage {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Cycle(_) => "cycle",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Stop => "stop",
        }
    }

    /// The message as one line, newline included.
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line = match self {
            Self::Config(cmd) => {
                serde_json::to_string(cmd).map_err(|e| ProtocolError::Encode(e.to_string()))?
            }
            Self::Cycle(cmd) => {
                serde_json::to_string(cmd).map_err(|e| ProtocolError::Encode(e.to_string()))?
            }
            Self::Start | Self::Pause | Self::Stop => self.kind().to_string(),
        };
        line.push('\n');
        Ok(line)
    }

    /// The message as wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        self.to_line().map(String::into_bytes)
    }
}

/// Convert a duty-cycle percentage to the controller's fixed-point fraction.
///
/// `round(percent / 100 * 65536)`; 100% maps to 65536. Values outside 0-100%
/// (or non-finite) are rejected rather than encoded.
pub fn duty_cycle_fixed_point(percent: f64) -> Result<u32, ProtocolError> {
    if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
        return Err(ProtocolError::DutyCycleOutOfRange(percent));
    }
    Ok((percent / 100.0 * DUTY_CYCLE_FULL_SCALE).round() as u32)
}

/// Encode a stage configuration message.
pub fn encode_config(
    ghr: &str,
    tpi: &str,
    resolution: &str,
    quadrature: &str,
    stage: StageId,
) -> Result<Vec<u8>, ProtocolError> {
    ControlMessage::Config(ConfigCommand {
        ghr: ghr.to_string(),
        tpi: tpi.to_string(),
        resolution: resolution.to_string(),
        quadrature: quadrature.to_string(),
        stage,
    })
    .encode()
}

/// Encode a cycle program message.
pub fn encode_cycle(num_cycles: u32, duty_cycle_percent: f64) -> Result<Vec<u8>, ProtocolError> {
    ControlMessage::Cycle(CycleCommand::from_percent(num_cycles, duty_cycle_percent)?).encode()
}

/// `start\n`
pub fn encode_start() -> Vec<u8> {
    b"start\n".to_vec()
}

/// `pause\n`
pub fn encode_pause() -> Vec<u8> {
    b"pause\n".to_vec()
}

/// `stop\n`
pub fn encode_stop() -> Vec<u8> {
    b"stop\n".to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_duty_cycle_fixed_point() {
        assert_eq!(duty_cycle_fixed_point(50.0).unwrap(), 32_768);
        assert_eq!(duty_cycle_fixed_point(100.0).unwrap(), 65_536);
        assert_eq!(duty_cycle_fixed_point(0.0).unwrap(), 0);
        assert_eq!(duty_cycle_fixed_point(25.0).unwrap(), 16_384);
        // 33% of 65536 = 21626.88
        assert_eq!(duty_cycle_fixed_point(33.0).unwrap(), 21_627);
    }

    #[test]
    fn test_duty_cycle_out_of_range_is_rejected() {
        assert!(matches!(
            duty_cycle_fixed_point(100.5),
            Err(ProtocolError::DutyCycleOutOfRange(_))
        ));
        assert!(duty_cycle_fixed_point(-1.0).is_err());
        assert!(duty_cycle_fixed_point(f64::NAN).is_err());
        assert!(encode_cycle(10, 150.0).is_err());
    }

    #[test]
    fn test_encode_cycle_wire_shape() {
        assert_eq!(
            line(encode_cycle(500, 50.0).unwrap()),
            "{\"num_of_cycles\":\"500\",\"duty_cycle\":\"32768\"}\n"
        );
        assert_eq!(
            line(encode_cycle(1, 100.0).unwrap()),
            "{\"num_of_cycles\":\"1\",\"duty_cycle\":\"65536\"}\n"
        );
    }

    #[test]
    fn test_encode_config_wire_shape() {
        let encoded = line(encode_config("100", "20", "4096", "4", StageId::B).unwrap());
        assert_eq!(
            encoded,
            "{\"ghr\":\"100\",\"tpi\":\"20\",\"resolution\":\"4096\",\"quadrature\":\"4\",\"id\":\"B\"}\n"
        );
    }

    #[test]
    fn test_control_literals() {
        assert_eq!(encode_start(), b"start\n");
        assert_eq!(encode_pause(), b"pause\n");
        assert_eq!(encode_stop(), b"stop\n");
        assert_eq!(ControlMessage::Start.encode().unwrap(), encode_start());
        assert_eq!(ControlMessage::Pause.encode().unwrap(), encode_pause());
        assert_eq!(ControlMessage::Stop.encode().unwrap(), encode_stop());
    }

    #[test]
    fn test_every_message_is_one_line() {
        let messages = vec![
            ControlMessage::Config(ConfigCommand {
                ghr: "line\nbreak".into(),
                tpi: String::new(),
                resolution: "1".into(),
                quadrature: "1".into(),
                stage: StageId::A,
            }),
            ControlMessage::Cycle(CycleCommand::from_percent(3, 12.5).unwrap()),
            ControlMessage::Start,
            ControlMessage::Pause,
            ControlMessage::Stop,
        ];
        for message in messages {
            let text = message.to_line().unwrap();
            assert!(text.ends_with('\n'));
            assert_eq!(text.matches('\n').count(), 1, "{:?}", text);
        }
    }

    #[test]
    fn test_stage_id_parsing() {
        assert_eq!("a".parse::<StageId>().unwrap(), StageId::A);
        assert_eq!(" B ".parse::<StageId>().unwrap(), StageId::B);
        assert!("C".parse::<StageId>().is_err());
    }
}
