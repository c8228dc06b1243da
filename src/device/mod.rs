//! Test controller handles.
//!
//! A [`Device`] is one controller reachable over a serial endpoint. The handle is a
//! cheap clone: the registry keeps one, and the acquisition worker attached to the
//! device during a run holds another. Reads (telemetry) and writes (commands) go
//! through the same mutex, so they are serialized per device while separate
//! devices never contend.

pub mod mock;
pub mod registry;

use crate::error::{AppResult, RigError};
use crate::protocol::ControlMessage;
use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

pub use registry::{DeviceRegistry, LineSettings, PortCandidate, SerialBackend, SystemSerial};

/// Platform port name identifying a controller (e.g. `ttyACM0`, `COM3`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wrap a port name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The port name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum DeviceState {
    /// Seen during discovery, not opened
    Discovered = 0,
    /// Handle open, no run yet
    Open = 1,
    /// Worker reading
    Running = 2,
    /// Worker attached but idle
    Paused = 3,
    /// Run ended, handle still open
    Stopped = 4,
    /// Faulted; skipped by broadcasts and restarts
    Error = 5,
}

impl DeviceState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Discovered,
            1 => Self::Open,
            2 => Self::Running,
            3 => Self::Paused,
            4 => Self::Stopped,
            _ => Self::Error,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Discovered => "discovered",
            Self::Open => "open",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(label)
    }
}

/// Byte stream to a controller.
///
/// Implemented for real serial ports and for [`mock::MockLink`].
pub trait DeviceLink: Read + Write + Send {
    /// Number of bytes waiting in the input buffer.
    fn bytes_to_read(&mut self) -> io::Result<u32>;

    /// Discard everything waiting in the input buffer.
    fn clear_input(&mut self) -> io::Result<()>;
}

#[cfg(feature = "instrument_serial")]
impl DeviceLink for Box<dyn serialport::SerialPort> {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        serialport::SerialPort::bytes_to_read(self.as_ref()).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        serialport::SerialPort::clear(self.as_ref(), serialport::ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

type SharedLink = Arc<Mutex<Option<Box<dyn DeviceLink>>>>;

/// Shared handle to one open controller.
#[derive(Clone)]
pub struct Device {
    id: DeviceId,
    link: SharedLink,
    state: Arc<AtomicU8>,
    attached: Arc<AtomicBool>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl Device {
    /// Wrap an already-open link. The device starts in [`DeviceState::Open`].
    pub fn new(id: DeviceId, link: Box<dyn DeviceLink>) -> Self {
        Self {
            id,
            link: Arc::new(Mutex::new(Some(link))),
            state: Arc::new(AtomicU8::new(DeviceState::Open as u8)),
            attached: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Port name of this controller.
    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Whether the device may take part in a run (open and not faulted).
    pub fn is_active(&self) -> bool {
        !matches!(
            self.state(),
            DeviceState::Error | DeviceState::Discovered
        )
    }

    /// Whether an acquisition worker currently owns this device.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Claim exclusive ownership for an acquisition worker.
    ///
    /// Returns `None` if another worker already holds the device. Ownership is
    /// released when the guard is dropped.
    pub fn try_attach(&self) -> Option<AttachGuard> {
        self.attached
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AttachGuard {
                attached: self.attached.clone(),
            })
    }

    /// Write one encoded control message.
    ///
    /// Serialized against the acquisition worker's reads on the same device.
    pub async fn send(&self, message: &ControlMessage) -> AppResult<()> {
        let bytes = message.encode()?;
        self.ensure_writable()?;
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| self.unavailable())?;
        link.write_all(&bytes)?;
        link.flush()?;
        tracing::debug!(device = %self.id, message = %message.kind(), "Sent control message");
        Ok(())
    }

    /// Discard unread input, such as lines the controller sent before it saw `stop`.
    pub async fn clear_input(&self) -> AppResult<()> {
        let mut guard = self.link.lock().await;
        let link = guard.as_mut().ok_or_else(|| self.unavailable())?;
        link.clear_input()?;
        Ok(())
    }

    /// Drop the OS handle. Idempotent.
    pub async fn close(&self) {
        if self.link.lock().await.take().is_some() {
            tracing::debug!(device = %self.id, "Serial port closed");
        }
    }

    pub(crate) fn close_blocking(&self) {
        // Called from Drop; an async caller may hold the lock, so never block here.
        match self.link.try_lock() {
            Ok(mut guard) => {
                if guard.take().is_some() {
                    tracing::debug!(device = %self.id, "Serial port closed");
                }
            }
            Err(_) => tracing::warn!(device = %self.id, "Serial port busy during close"),
        }
    }

    pub(crate) fn link(&self) -> &SharedLink {
        &self.link
    }

    fn ensure_writable(&self) -> AppResult<()> {
        match self.state() {
            DeviceState::Error => Err(self.unavailable()),
            _ => Ok(()),
        }
    }

    fn unavailable(&self) -> RigError {
        RigError::DeviceUnavailable {
            device: self.id.clone(),
            state: self.state(),
        }
    }
}

/// RAII guard for exclusive worker ownership of a [`Device`].
#[derive(Debug)]
pub struct AttachGuard {
    attached: Arc<AtomicBool>,
}

impl Drop for AttachGuard {
    fn drop(&mut self) {
        self.attached.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::MockLink;

    #[test]
    fn test_only_one_worker_can_attach() {
        let device = Device::new("ttyACM0".into(), Box::new(MockLink::new()));
        let guard = device.try_attach();
        assert!(guard.is_some());
        assert!(device.is_attached());
        assert!(device.try_attach().is_none());

        drop(guard);
        assert!(!device.is_attached());
        assert!(device.try_attach().is_some());
    }

    #[tokio::test]
    async fn test_send_writes_one_line() {
        let link = MockLink::new();
        let device = Device::new("ttyACM0".into(), Box::new(link.clone()));
        device.send(&ControlMessage::Start).await.unwrap();
        device.send(&ControlMessage::Stop).await.unwrap();
        assert_eq!(link.written_lines(), vec!["start", "stop"]);
    }

    #[tokio::test]
    async fn test_clear_input_discards_pending_bytes() {
        let link = MockLink::new();
        link.feed_line("{\"pos_cnt\":1}");
        let device = Device::new("ttyACM0".into(), Box::new(link.clone()));
        device.clear_input().await.unwrap();
        assert_eq!(link.pending_inbound(), 0);
    }

    #[tokio::test]
    async fn test_send_after_close_is_unavailable() {
        let device = Device::new("ttyACM0".into(), Box::new(MockLink::new()));
        device.close().await;
        device.close().await;
        let err = device.send(&ControlMessage::Pause).await.unwrap_err();
        assert!(matches!(err, RigError::DeviceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_faulted_device_rejects_commands() {
        let link = MockLink::new();
        let device = Device::new("COM4".into(), Box::new(link.clone()));
        device.set_state(DeviceState::Error);
        assert!(!device.is_active());
        assert!(device.send(&ControlMessage::Start).await.is_err());
        assert!(link.written_lines().is_empty());
    }
}
