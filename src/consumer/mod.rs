//! Telemetry sinks.
//!
//! A [`TelemetryConsumer`] receives dispatched samples inside the single consumer
//! context owned by the [`DispatchBridge`](crate::dispatch::DispatchBridge). The
//! table and chart sinks are clone-able handles over shared state, so the bridge
//! owns one clone while the rest of the application reads another.

pub mod chart;
pub mod table;

use crate::device::DeviceId;
use crate::protocol::Sample;

pub use chart::{ChartPoint, ChartSink};
pub use table::{TableRow, TableSink};

/// Capability required of every sink.
pub trait TelemetryConsumer: Send {
    /// Name for logs.
    fn name(&self) -> &str;

    /// Handle one sample. Called only in the consumer context; must return promptly.
    fn on_sample(&mut self, device: &DeviceId, sample: &Sample);

    /// Drop accumulated state before a fresh session.
    fn reset(&mut self);
}

/// Emits every sample as a `debug` event under the `telemetry` target.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    samples: u64,
}

impl LogSink {
    /// Sink with its counter at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TelemetryConsumer for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    fn on_sample(&mut self, device: &DeviceId, sample: &Sample) {
        self.samples += 1;
        tracing::debug!(
            target: "telemetry",
            device = %device,
            seq = self.samples,
            pos_cnt = sample.reading.pos_cnt,
            cycle_count_a = sample.reading.cycle_count_a,
            cycle_count_b = sample.reading.cycle_count_b,
            rpm_a = sample.reading.rpm_a,
            rpm_b = sample.reading.rpm_b,
            "Sample"
        );
    }

    fn reset(&mut self) {
        self.samples = 0;
    }
}
