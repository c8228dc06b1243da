//! Controller discovery and port ownership.
//!
//! The registry enumerates serial endpoints, keeps only the ones whose names look
//! like test controllers, and opens them with the fixed controller line parameters.
//! It owns every [`Device`] handle until a session attaches workers to them, and it
//! releases every handle when dropped.

use super::{Device, DeviceId, DeviceLink, DeviceState};
use crate::error::{AppResult, DeviceOpenError, RigError};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Port-name fragments that identify controllers: USB CDC-ACM on POSIX, COM on Windows.
pub const DEFAULT_PORT_PATTERNS: [&str; 2] = ["ACM", "COM"];

/// Serial line parameters used for every controller: 115200-8-N-1, 1 s read timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits
    pub data_bits: u8,
    /// Stop bits
    pub stop_bits: u8,
    /// Parity enabled
    pub parity: bool,
    /// Read timeout
    pub timeout: Duration,
}

impl LineSettings {
    /// The controller firmware's fixed line parameters.
    pub const CONTROLLER: Self = Self {
        baud_rate: 115_200,
        data_bits: 8,
        stop_bits: 1,
        parity: false,
        timeout: Duration::from_secs(1),
    };
}

impl Default for LineSettings {
    fn default() -> Self {
        Self::CONTROLLER
    }
}

/// A serial endpoint believed to be a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    /// Port name as reported by the OS, used as the device id
    pub name: String,
    /// Path passed to the serial driver
    pub path: String,
}

/// Source of serial endpoints.
pub trait SerialBackend: Send + Sync {
    /// Names of every serial endpoint on the system.
    fn available_ports(&self) -> AppResult<Vec<String>>;

    /// Open `path` with `settings`.
    fn open(
        &self,
        path: &str,
        settings: &LineSettings,
    ) -> Result<Box<dyn DeviceLink>, DeviceOpenError>;
}

/// [`SerialBackend`] over the OS serial driver (`serialport` crate).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSerial;

impl SerialBackend for SystemSerial {
    fn available_ports(&self) -> AppResult<Vec<String>> {
        #[cfg(feature = "instrument_serial")]
        {
            let ports = serialport::available_ports().map_err(|e| {
                RigError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to enumerate serial ports: {}", e),
                ))
            })?;
            Ok(ports.into_iter().map(|p| p.port_name).collect())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(RigError::SerialFeatureDisabled)
        }
    }

    fn open(
        &self,
        path: &str,
        settings: &LineSettings,
    ) -> Result<Box<dyn DeviceLink>, DeviceOpenError> {
        #[cfg(feature = "instrument_serial")]
        {
            let data_bits = match settings.data_bits {
                5 => serialport::DataBits::Five,
                6 => serialport::DataBits::Six,
                7 => serialport::DataBits::Seven,
                _ => serialport::DataBits::Eight,
            };
            let stop_bits = match settings.stop_bits {
                2 => serialport::StopBits::Two,
                _ => serialport::StopBits::One,
            };
            let parity = if settings.parity {
                serialport::Parity::Even
            } else {
                serialport::Parity::None
            };
            let port = serialport::new(path, settings.baud_rate)
                .data_bits(data_bits)
                .stop_bits(stop_bits)
                .parity(parity)
                .flow_control(serialport::FlowControl::None)
                .timeout(settings.timeout)
                .open()
                .map_err(|e| DeviceOpenError::from_serialport(path, &e))?;

            debug!(
                "Serial port '{}' opened at {} baud",
                path, settings.baud_rate
            );
            Ok(Box::new(port))
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = settings;
            Err(DeviceOpenError::Other {
                port: path.to_string(),
                reason: RigError::SerialFeatureDisabled.to_string(),
            })
        }
    }
}

/// Match a reported port name against the controller patterns.
///
/// POSIX names are resolved under `/dev/` unless already absolute; Windows names
/// are used verbatim.
pub fn controller_candidate(reported: &str, patterns: &[String]) -> Option<PortCandidate> {
    let name = reported.rsplit('/').next().unwrap_or(reported);
    if !patterns.iter().any(|p| name.contains(p.as_str())) {
        return None;
    }
    let path = if reported.starts_with('/') {
        reported.to_string()
    } else if name.starts_with("COM") {
        name.to_string()
    } else {
        format!("/dev/{}", name)
    };
    Some(PortCandidate {
        name: name.to_string(),
        path,
    })
}

/// Owner of every open controller handle.
pub struct DeviceRegistry {
    backend: Box<dyn SerialBackend>,
    patterns: Vec<String>,
    settings: LineSettings,
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceRegistry {
    /// Registry over the OS serial driver with the default port patterns.
    pub fn system() -> Self {
        Self::new(Box::new(SystemSerial))
    }

    /// Registry over an arbitrary backend with the default port patterns.
    pub fn new(backend: Box<dyn SerialBackend>) -> Self {
        Self {
            backend,
            patterns: DEFAULT_PORT_PATTERNS.iter().map(|p| p.to_string()).collect(),
            settings: LineSettings::CONTROLLER,
            devices: BTreeMap::new(),
        }
    }

    /// Replace the port-name patterns used by [`DeviceRegistry::discover`].
    pub fn with_patterns(mut self, patterns: Vec<String>) -> Self {
        self.patterns = patterns;
        self
    }

    /// Line parameters used for every open.
    pub fn line_settings(&self) -> &LineSettings {
        &self.settings
    }

    /// Enumerate endpoints and keep the ones that look like controllers.
    pub fn discover(&self) -> AppResult<Vec<PortCandidate>> {
        let reported = self.backend.available_ports()?;
        let candidates: Vec<PortCandidate> = reported
            .iter()
            .filter_map(|name| controller_candidate(name, &self.patterns))
            .collect();
        debug!(
            reported = reported.len(),
            candidates = candidates.len(),
            "Serial port discovery finished"
        );
        Ok(candidates)
    }

    /// Open the controller on port `name`.
    ///
    /// Opening an already-open port returns the existing handle.
    pub fn open(&mut self, name: &str) -> Result<Device, DeviceOpenError> {
        let candidate = controller_candidate(name, &self.patterns).unwrap_or_else(|| {
            PortCandidate {
                name: name.to_string(),
                path: name.to_string(),
            }
        });
        self.open_candidate(&candidate)
    }

    fn open_candidate(&mut self, candidate: &PortCandidate) -> Result<Device, DeviceOpenError> {
        let id = DeviceId::new(candidate.name.clone());
        if let Some(device) = self.devices.get(&id) {
            return Ok(device.clone());
        }
        let link = self.backend.open(&candidate.path, &self.settings)?;
        let device = Device::new(id.clone(), link);
        info!(device = %id, path = %candidate.path, "Controller opened");
        self.devices.insert(id, device.clone());
        Ok(device)
    }

    /// Discover and open every controller.
    ///
    /// Returns the opened devices and the failures; one failing port never prevents
    /// the others from opening.
    pub fn open_all(&mut self) -> AppResult<(Vec<Device>, Vec<DeviceOpenError>)> {
        let mut opened = Vec::new();
        let mut failed = Vec::new();
        for candidate in self.discover()? {
            match self.open_candidate(&candidate) {
                Ok(device) => opened.push(device),
                Err(e) => {
                    warn!(port = %candidate.name, error = %e, "Controller failed to open");
                    failed.push(e);
                }
            }
        }
        Ok((opened, failed))
    }

    /// Release the handle for `id`. Unknown or already-closed ids are ignored.
    pub async fn close(&mut self, id: &DeviceId) {
        if let Some(device) = self.devices.remove(id) {
            device.close().await;
            if device.state() != DeviceState::Error {
                device.set_state(DeviceState::Stopped);
            }
            info!(device = %id, "Controller closed");
        }
    }

    /// Release every handle.
    pub async fn close_all(&mut self) {
        let ids: Vec<DeviceId> = self.devices.keys().cloned().collect();
        for id in ids {
            self.close(&id).await;
        }
    }

    /// Look up an open device.
    pub fn get(&self, id: &DeviceId) -> AppResult<&Device> {
        self.devices
            .get(id)
            .ok_or_else(|| RigError::UnknownDevice(id.clone()))
    }

    /// Every open device, ordered by id.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Open devices that are not faulted.
    pub fn active_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values().filter(|d| d.is_active())
    }

    /// Number of open devices.
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    /// Whether no devices are open.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        for device in self.devices.values() {
            device.close_blocking();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::mock::{MockBackend, MockLink};

    fn patterns() -> Vec<String> {
        DEFAULT_PORT_PATTERNS.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_controller_candidate_filters_by_pattern() {
        let p = patterns();
        assert_eq!(
            controller_candidate("ttyACM0", &p),
            Some(PortCandidate {
                name: "ttyACM0".into(),
                path: "/dev/ttyACM0".into()
            })
        );
        assert_eq!(
            controller_candidate("/dev/ttyACM1", &p).map(|c| c.path),
            Some("/dev/ttyACM1".to_string())
        );
        assert_eq!(
            controller_candidate("COM7", &p).map(|c| c.path),
            Some("COM7".to_string())
        );
        assert!(controller_candidate("/dev/ttyS0", &p).is_none());
        assert!(controller_candidate("ttyUSB0", &p).is_none());
    }

    #[test]
    fn test_line_settings_are_fixed() {
        let registry = DeviceRegistry::new(Box::new(MockBackend::new()));
        let settings = registry.line_settings();
        assert_eq!(settings.baud_rate, 115_200);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert!(!settings.parity);
        assert_eq!(settings.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_discover_keeps_only_controllers() {
        let backend = MockBackend::new()
            .with_port("/dev/ttyACM0", MockLink::new())
            .with_port("/dev/ttyS0", MockLink::new())
            .with_port("/dev/ttyACM1", MockLink::new());
        let registry = DeviceRegistry::new(Box::new(backend));
        let names: Vec<String> = registry
            .discover()
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec!["ttyACM0", "ttyACM1"]);
    }

    #[test]
    fn test_open_failures_are_classified() {
        let backend = MockBackend::new()
            .with_port("/dev/ttyACM0", MockLink::new())
            .with_busy_port("/dev/ttyACM1");
        let mut registry = DeviceRegistry::new(Box::new(backend));

        assert_eq!(
            registry.open("ttyACM1").unwrap_err(),
            DeviceOpenError::Busy("/dev/ttyACM1".into())
        );
        assert_eq!(
            registry.open("ttyACM9").unwrap_err(),
            DeviceOpenError::NotFound("/dev/ttyACM9".into())
        );
        assert!(registry.open("ttyACM0").is_ok());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_open_all_isolates_failures() {
        let backend = MockBackend::new()
            .with_port("/dev/ttyACM0", MockLink::new())
            .with_busy_port("/dev/ttyACM1")
            .with_port("/dev/ttyACM2", MockLink::new());
        let mut registry = DeviceRegistry::new(Box::new(backend));
        let (opened, failed) = registry.open_all().unwrap();
        assert_eq!(opened.len(), 2);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].port(), "/dev/ttyACM1");
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_close_releases() {
        let backend = MockBackend::new().with_port("/dev/ttyACM0", MockLink::new());
        let mut registry = DeviceRegistry::new(Box::new(backend));

        let first = registry.open("ttyACM0").unwrap();
        let second = registry.open("ttyACM0").unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(registry.len(), 1);

        let id = first.id().clone();
        registry.close(&id).await;
        registry.close(&id).await;
        assert!(registry.is_empty());
        assert!(first
            .send(&crate::protocol::ControlMessage::Start)
            .await
            .is_err());
    }
}
