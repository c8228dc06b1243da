//! Mock controller links for testing without physical hardware.
//!
//! [`MockLink`] is an in-memory serial stream: tests feed telemetry lines into it,
//! inject read failures, and inspect the commands written to it. [`MockBackend`]
//! serves a fixed set of mock ports to a [`DeviceRegistry`](super::DeviceRegistry).

use super::registry::{LineSettings, SerialBackend};
use super::DeviceLink;
use crate::error::{AppResult, DeviceOpenError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MockState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    pending_errors: VecDeque<io::ErrorKind>,
    disconnected: bool,
}

/// Shared in-memory serial stream.
///
/// Clones share the same buffers, so a test keeps one clone while the device
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    /// Empty link.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue raw bytes as if the controller had sent them.
    pub fn feed_bytes(&self, bytes: &[u8]) {
        self.lock().inbound.extend(bytes.iter().copied());
    }

    /// Queue one line; a trailing newline is added when missing.
    pub fn feed_line(&self, line: &str) {
        let mut state = self.lock();
        state.inbound.extend(line.as_bytes().iter().copied());
        if !line.ends_with('\n') {
            state.inbound.push_back(b'\n');
        }
    }

    /// Make the next poll fail with `kind`.
    pub fn inject_read_error(&self, kind: io::ErrorKind) {
        self.lock().pending_errors.push_back(kind);
    }

    /// Simulate the cable being pulled: every further read and write fails.
    pub fn disconnect(&self) {
        self.lock().disconnected = true;
    }

    /// Bytes not yet consumed by the reader.
    pub fn pending_inbound(&self) -> usize {
        self.lock().inbound.len()
    }

    /// Everything written to the link, split into lines.
    pub fn written_lines(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.lock().written)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if let Some(kind) = state.pending_errors.pop_front() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        state.written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl DeviceLink for MockLink {
    fn bytes_to_read(&mut self) -> io::Result<u32> {
        let mut state = self.lock();
        if let Some(kind) = state.pending_errors.pop_front() {
            return Err(io::Error::new(kind, "injected read failure"));
        }
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        Ok(u32::try_from(state.inbound.len()).unwrap_or(u32::MAX))
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut state = self.lock();
        if state.disconnected {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        state.inbound.clear();
        Ok(())
    }
}

/// [`SerialBackend`] serving mock ports by path.
#[derive(Debug, Default, Clone)]
pub struct MockBackend {
    order: Vec<String>,
    links: HashMap<String, MockLink>,
    busy: HashSet<String>,
}

impl MockBackend {
    /// Backend with no ports.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a port at `path` backed by `link`.
    pub fn with_port(mut self, path: &str, link: MockLink) -> Self {
        self.order.push(path.to_string());
        self.links.insert(path.to_string(), link);
        self
    }

    /// Add a port at `path` that is held by another process.
    pub fn with_busy_port(mut self, path: &str) -> Self {
        self.order.push(path.to_string());
        self.busy.insert(path.to_string());
        self
    }
}

impl SerialBackend for MockBackend {
    fn available_ports(&self) -> AppResult<Vec<String>> {
        Ok(self.order.clone())
    }

    fn open(
        &self,
        path: &str,
        _settings: &LineSettings,
    ) -> Result<Box<dyn DeviceLink>, DeviceOpenError> {
        if self.busy.contains(path) {
            return Err(DeviceOpenError::Busy(path.to_string()));
        }
        self.links
            .get(path)
            .map(|link| Box::new(link.clone()) as Box<dyn DeviceLink>)
            .ok_or_else(|| DeviceOpenError::NotFound(path.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_and_read_back() {
        let mut link = MockLink::new();
        link.feed_line("{\"pos_cnt\":1}");
        assert_eq!(link.bytes_to_read().unwrap(), 14);

        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"{\"pos_cnt\":1}\n");
        assert_eq!(link.pending_inbound(), 0);
    }

    #[test]
    fn test_injected_error_fires_once() {
        let mut link = MockLink::new();
        link.inject_read_error(io::ErrorKind::Other);
        assert!(link.bytes_to_read().is_err());
        assert_eq!(link.bytes_to_read().unwrap(), 0);
    }

    #[test]
    fn test_disconnect_fails_reads_and_writes() {
        let mut link = MockLink::new();
        link.disconnect();
        assert!(link.bytes_to_read().is_err());
        assert!(link.write_all(b"start\n").is_err());
    }
}
