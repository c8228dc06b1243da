//! Per-device acquisition worker.
//!
//! One worker owns one [`Device`] for the duration of a run. It polls the serial
//! link for available bytes, frames them into lines, decodes each line into a
//! [`Sample`] and forwards it to the dispatch bridge. A worker never touches
//! consumer state and never looks at other devices, so a failing controller only
//! affects its own worker.
//!
//! The serial port is blocking, so the worker runs on tokio's blocking pool
//! (`spawn_blocking`). The device mutex is held only for `bytes_to_read` plus the
//! read of what is already buffered, which keeps control writes from the session
//! short.

use crate::config::AcquisitionConfig;
use crate::device::{Device, DeviceId, DeviceState};
use crate::dispatch::SampleSender;
use crate::error::RigError;
use crate::protocol::{decode_line, Sample};
use crate::run_state::{RunState, RunStateKind};
use serde::Serialize;
use std::io::{self, Read};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn};

/// Longest line accepted before the partial buffer is discarded.
pub const MAX_LINE_LEN: usize = 4096;

const READ_CHUNK: usize = 1024;

/// Polling and error-recovery parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Sleep between polls when no bytes are waiting
    pub poll_interval: Duration,
    /// Consecutive read failures before the device is marked faulted
    pub max_consecutive_errors: u32,
    /// First backoff after a read failure
    pub error_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(10),
            max_consecutive_errors: 5,
            error_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(2000),
        }
    }
}

impl From<&AcquisitionConfig> for WorkerSettings {
    fn from(config: &AcquisitionConfig) -> Self {
        Self {
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            max_consecutive_errors: config.max_consecutive_errors,
            error_backoff: Duration::from_millis(config.error_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Counters kept by one worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Framed lines, including rejected ones
    pub lines_read: u64,
    /// Samples accepted by the bridge
    pub samples_forwarded: u64,
    /// Lines that failed framing or decoding
    pub lines_skipped: u64,
    /// Failed polls
    pub read_errors: u64,
}

/// Why a worker stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The run was stopped
    Stopped,
    /// The device handle was closed underneath the worker
    DeviceClosed,
    /// Too many consecutive read failures; the device is now in `Error`
    DeviceFault(String),
    /// The dispatch bridge shut down
    BridgeClosed,
    /// Another worker already owned the device
    AlreadyAttached,
}

/// Final outcome of one worker.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    /// Device the worker read
    pub device: DeviceId,
    /// Bridge session the worker stamped
    pub session: u64,
    /// Why the worker stopped
    pub exit: WorkerExit,
    /// Final counters
    pub stats: WorkerStats,
}

/// Splits a byte stream into `\n`-terminated lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    discarding: bool,
}

/// One framed line, or a marker for input that could not be framed.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    /// A complete line without its terminator
    Line(String),
    /// Overlong or non-UTF-8 input was discarded
    Rejected(&'static str),
}

impl LineBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes held that are not yet terminated.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop any partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.discarding = false;
    }

    /// Append `bytes` and return every line completed by them.
    ///
    /// Blank lines are dropped. A line is stripped of its trailing `\r`.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if self.discarding {
                    self.discarding = false;
                } else if let Some(frame) = self.take_line() {
                    frames.push(frame);
                }
                continue;
            }
            if self.discarding {
                continue;
            }
            self.pending.push(byte);
            if self.pending.len() > MAX_LINE_LEN {
                self.pending.clear();
                self.discarding = true;
                frames.push(Frame::Rejected("line too long"));
            }
        }
        frames
    }

    fn take_line(&mut self) -> Option<Frame> {
        let mut raw = std::mem::take(&mut self.pending);
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
        match String::from_utf8(raw) {
            Ok(line) if line.trim().is_empty() => None,
            Ok(line) => Some(Frame::Line(line)),
            Err(_) => Some(Frame::Rejected("invalid UTF-8")),
        }
    }
}

/// Double `current`, capped at `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

enum Poll {
    Data(Vec<u8>),
    Empty,
    Closed,
}

enum Step {
    Continue,
    Exit(WorkerExit),
}

/// Reads one device and forwards its samples.
pub struct AcquisitionWorker {
    device: Device,
    run_state: Arc<RunState>,
    sender: SampleSender,
    settings: WorkerSettings,
    buffer: LineBuffer,
    stats: WorkerStats,
}

impl AcquisitionWorker {
    /// Worker for `device`, forwarding through `sender`.
    pub fn new(
        device: Device,
        run_state: Arc<RunState>,
        sender: SampleSender,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            device,
            run_state,
            sender,
            settings,
            buffer: LineBuffer::new(),
            stats: WorkerStats::default(),
        }
    }

    /// Run on the blocking pool until the run stops or the device fails.
    pub fn spawn(self) -> JoinHandle<WorkerReport> {
        tokio::task::spawn_blocking(move || self.run())
    }

    /// Poll loop. Blocks the calling thread.
    pub fn run(mut self) -> WorkerReport {
        let span = info_span!(
            "acquisition",
            device = %self.device.id(),
            session = self.sender.session()
        );
        let _entered = span.enter();

        let exit = match self.device.try_attach() {
            Some(_lease) => {
                info!("Acquisition worker started");
                let exit = self.poll_loop();
                if self.device.state() != DeviceState::Error {
                    self.device.set_state(DeviceState::Stopped);
                }
                exit
            }
            None => {
                warn!("Device already owned by another worker");
                WorkerExit::AlreadyAttached
            }
        };

        info!(
            exit = ?exit,
            lines_read = self.stats.lines_read,
            samples_forwarded = self.stats.samples_forwarded,
            lines_skipped = self.stats.lines_skipped,
            read_errors = self.stats.read_errors,
            "Acquisition worker finished"
        );

        WorkerReport {
            device: self.device.id().clone(),
            session: self.sender.session(),
            exit,
            stats: self.stats,
        }
    }

    fn poll_loop(&mut self) -> WorkerExit {
        let mut consecutive_errors = 0u32;
        let mut backoff = self.settings.error_backoff;

        loop {
            match self.run_state.load() {
                RunStateKind::Idle | RunStateKind::Stopped => return WorkerExit::Stopped,
                RunStateKind::Paused => {
                    self.device.set_state(DeviceState::Paused);
                    std::thread::sleep(self.settings.poll_interval);
                    continue;
                }
                RunStateKind::Running => self.device.set_state(DeviceState::Running),
            }

            match self.poll_once() {
                Ok(Poll::Data(bytes)) => {
                    consecutive_errors = 0;
                    backoff = self.settings.error_backoff;
                    if let Step::Exit(exit) = self.handle_bytes(&bytes) {
                        return exit;
                    }
                }
                Ok(Poll::Empty) => {
                    consecutive_errors = 0;
                    backoff = self.settings.error_backoff;
                    std::thread::sleep(self.settings.poll_interval);
                }
                Ok(Poll::Closed) => {
                    debug!("Device handle closed");
                    return WorkerExit::DeviceClosed;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.stats.read_errors += 1;
                    if consecutive_errors >= self.settings.max_consecutive_errors {
                        error!(
                            attempt = consecutive_errors,
                            error = %e,
                            "Read failures exceeded threshold, marking device faulted"
                        );
                        self.device.set_state(DeviceState::Error);
                        return WorkerExit::DeviceFault(e.to_string());
                    }
                    warn!(
                        attempt = consecutive_errors,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %e,
                        "Serial read failed, retrying"
                    );
                    self.backoff_sleep(backoff);
                    backoff = next_backoff(backoff, self.settings.max_backoff);
                }
            }
        }
    }

    /// Sleep for `total` in slices of at most `poll_interval`, returning early once
    /// the run leaves `Running`.
    fn backoff_sleep(&self, total: Duration) {
        let slice = self.settings.poll_interval.max(Duration::from_millis(1));
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.run_state.load() != RunStateKind::Running {
                return;
            }
            let step = remaining.min(slice);
            std::thread::sleep(step);
            remaining = remaining.saturating_sub(step);
        }
    }

    fn poll_once(&mut self) -> io::Result<Poll> {
        let mut guard = self.device.link().blocking_lock();
        let Some(link) = guard.as_mut() else {
            return Ok(Poll::Closed);
        };
        let available = link.bytes_to_read()? as usize;
        if available == 0 {
            return Ok(Poll::Empty);
        }
        let mut chunk = vec![0u8; available.min(READ_CHUNK)];
        match link.read(&mut chunk) {
            Ok(0) => Ok(Poll::Empty),
            Ok(n) => {
                chunk.truncate(n);
                Ok(Poll::Data(chunk))
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(Poll::Empty),
            Err(e) => Err(e),
        }
    }

    fn handle_bytes(&mut self, bytes: &[u8]) -> Step {
        for frame in self.buffer.push(bytes) {
            self.stats.lines_read += 1;
            let line = match frame {
                Frame::Line(line) => line,
                Frame::Rejected(reason) => {
                    self.stats.lines_skipped += 1;
                    warn!(reason, "Discarded unframed telemetry input");
                    continue;
                }
            };
            trace!(line = %line, "Telemetry line");
            let reading = match decode_line(&line) {
                Ok(reading) => reading,
                Err(e) => {
                    self.stats.lines_skipped += 1;
                    warn!(error = %e, "Skipping telemetry line");
                    continue;
                }
            };
            let sample = Sample::new(self.device.id().clone(), reading);
            debug!(pos_cnt = reading.pos_cnt, "Sample decoded");
            match self.sender.forward(sample) {
                Ok(()) => self.stats.samples_forwarded += 1,
                Err(RigError::BridgeClosed) => return Step::Exit(WorkerExit::BridgeClosed),
                Err(e) => warn!(error = %e, "Failed to forward sample"),
            }
        }
        Step::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(frames: Vec<Frame>) -> Vec<String> {
        frames
            .into_iter()
            .filter_map(|f| match f {
                Frame::Line(l) => Some(l),
                Frame::Rejected(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_lines_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"{\"pos_cnt\":").is_empty());
        assert_eq!(buffer.pending(), 11);
        let frames = buffer.push(b"1}\r\n{\"pos_cnt\":2}\n{\"po");
        assert_eq!(lines(frames), vec!["{\"pos_cnt\":1}", "{\"pos_cnt\":2}"]);
        assert_eq!(buffer.pending(), 4);
    }

    #[test]
    fn test_blank_lines_dropped() {
        let mut buffer = LineBuffer::new();
        let frames = buffer.push(b"\n\r\n   \nabc\n");
        assert_eq!(frames, vec![Frame::Line("abc".into())]);
    }

    #[test]
    fn test_overlong_line_rejected_once() {
        let mut buffer = LineBuffer::new();
        let long = vec![b'x'; MAX_LINE_LEN + 10];
        let frames = buffer.push(&long);
        assert_eq!(frames, vec![Frame::Rejected("line too long")]);
        assert_eq!(buffer.pending(), 0);

        // Remainder up to the newline is discarded, the next line survives.
        let frames = buffer.push(b"yyy\nok\n");
        assert_eq!(frames, vec![Frame::Line("ok".into())]);
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buffer = LineBuffer::new();
        let frames = buffer.push(&[0xff, 0xfe, b'\n']);
        assert_eq!(frames, vec![Frame::Rejected("invalid UTF-8")]);
    }

    #[test]
    fn test_backoff_doubles_up_to_ceiling() {
        let max = Duration::from_millis(2000);
        assert_eq!(next_backoff(Duration::from_millis(100), max), Duration::from_millis(200));
        assert_eq!(next_backoff(Duration::from_millis(1600), max), max);
        assert_eq!(next_backoff(Duration::MAX, Duration::MAX), Duration::MAX);
    }

    #[test]
    fn test_settings_from_config() {
        let config = AcquisitionConfig {
            poll_interval_ms: 5,
            max_consecutive_errors: 3,
            error_backoff_ms: 20,
            max_backoff_ms: 80,
        };
        let settings = WorkerSettings::from(&config);
        assert_eq!(settings.poll_interval, Duration::from_millis(5));
        assert_eq!(settings.max_consecutive_errors, 3);
        assert_eq!(settings.max_backoff, Duration::from_millis(80));
    }
}
