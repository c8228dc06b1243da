//! Controller wire protocol.
//!
//! Both directions carry newline-delimited text, one message per line. Outbound
//! commands are JSON objects or bare control literals ([`command`]); inbound
//! telemetry is one JSON object per line ([`telemetry`]).

pub mod command;
pub mod telemetry;

pub use command::{
    duty_cycle_fixed_point, encode_config, encode_cycle, encode_pause, encode_start,
    encode_stop, ConfigCommand, ControlMessage, CycleCommand, StageId,
};
pub use telemetry::{decode_line, Reading, Sample};
