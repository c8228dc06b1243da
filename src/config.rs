//! Configuration using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults ([`RigConfig::default`])
//! 2. `config/testrig.toml`, or the file passed with `--config`
//! 3. Environment variables prefixed with `TESTRIG_`, sections separated by `__`
//!
//! # Example
//! ```no_run
//! use testrig_daq::config::RigConfig;
//!
//! // TESTRIG_DISPATCH__CHANNEL_CAPACITY=64 overrides dispatch.channel_capacity
//! let config = RigConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), testrig_daq::error::RigError>(())
//! ```

use crate::dispatch::BackpressurePolicy;
use crate::error::{AppResult, RigError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/testrig.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "TESTRIG_";

/// Longest accepted poll interval; equal to the serial read timeout.
const MAX_POLL_INTERVAL_MS: u64 = 1000;

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RigConfig {
    /// Name and logging
    pub application: ApplicationConfig,
    /// Port discovery
    pub serial: SerialConfig,
    /// Worker polling and error recovery
    pub acquisition: AcquisitionConfig,
    /// Consumer channel
    pub dispatch: DispatchConfig,
    /// Rolling chart window
    pub chart: ChartConfig,
    /// CSV export
    pub export: ExportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Test Rig DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, coloured
    Pretty,
    /// Single line
    Compact,
    /// JSON lines
    Json,
}

/// Controller discovery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port-name fragments that identify a controller
    pub port_patterns: Vec<String>,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_patterns: crate::device::registry::DEFAULT_PORT_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Worker polling and error recovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Sleep between polls when no bytes are waiting
    pub poll_interval_ms: u64,
    /// Consecutive read failures before a device is marked faulted
    pub max_consecutive_errors: u32,
    /// Initial backoff after a read failure
    pub error_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            max_consecutive_errors: 5,
            error_backoff_ms: 100,
            max_backoff_ms: 2000,
        }
    }
}

/// Full-channel behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Wait up to `block_timeout_ms`, then drop
    Block,
    /// Drop immediately
    DropNewest,
}

/// Worker to consumer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Bounded channel capacity
    pub channel_capacity: usize,
    /// What to do when the channel is full
    pub policy: PolicyKind,
    /// Wait before dropping under the `block` policy
    pub block_timeout_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: crate::dispatch::DEFAULT_CHANNEL_CAPACITY,
            policy: PolicyKind::Block,
            block_timeout_ms: 50,
        }
    }
}

impl DispatchConfig {
    /// Backpressure policy described by this section.
    pub fn backpressure(&self) -> BackpressurePolicy {
        match self.policy {
            PolicyKind::Block => BackpressurePolicy::Block {
                timeout: Duration::from_millis(self.block_timeout_ms),
            },
            PolicyKind::DropNewest => BackpressurePolicy::DropNewest,
        }
    }
}

/// Live chart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChartConfig {
    /// Points kept per chart
    pub window: usize,
}

impl Default for ChartConfig {
    fn default() -> Self {
        Self {
            window: crate::consumer::chart::DEFAULT_CHART_WINDOW,
        }
    }
}

/// CSV export
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Output directory for data files
    pub output_dir: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
        }
    }
}

impl RigConfig {
    /// Load from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// A missing file is not an error; defaults apply.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path and the environment, then validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Provider chain used by [`RigConfig::load_from`].
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.serial.port_patterns.iter().all(|p| p.trim().is_empty()) {
            return Err(invalid("serial.port_patterns must not be empty".to_string()));
        }

        let acquisition = &self.acquisition;
        if acquisition.poll_interval_ms == 0 || acquisition.poll_interval_ms > MAX_POLL_INTERVAL_MS {
            return Err(invalid(format!(
                "Invalid acquisition.poll_interval_ms {}. Must be 1-{}",
                acquisition.poll_interval_ms, MAX_POLL_INTERVAL_MS
            )));
        }
        if acquisition.max_consecutive_errors == 0 {
            return Err(invalid(
                "acquisition.max_consecutive_errors must be at least 1".to_string(),
            ));
        }
        if acquisition.max_backoff_ms < acquisition.error_backoff_ms {
            return Err(invalid(format!(
                "acquisition.max_backoff_ms {} is below error_backoff_ms {}",
                acquisition.max_backoff_ms, acquisition.error_backoff_ms
            )));
        }

        if self.dispatch.channel_capacity == 0 {
            return Err(invalid(
                "dispatch.channel_capacity must be at least 1".to_string(),
            ));
        }

        if self.chart.window == 0 {
            return Err(invalid("chart.window must be at least 1".to_string()));
        }

        Ok(())
    }
}

fn invalid(message: String) -> RigError {
    RigError::Configuration(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = RigConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.serial.port_patterns, vec!["ACM", "COM"]);
        assert_eq!(config.acquisition.poll_interval_ms, 10);
        assert_eq!(config.dispatch.channel_capacity, 1024);
        assert_eq!(config.chart.window, 15_000);
        assert_eq!(
            config.dispatch.backpressure(),
            BackpressurePolicy::Block {
                timeout: Duration::from_millis(50)
            }
        );
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = RigConfig::default();
        config.application.log_level = "chatty".to_string();
        assert!(matches!(config.validate(), Err(RigError::Configuration(_))));
    }

    #[test]
    fn test_rejects_zero_capacity_and_window() {
        let mut config = RigConfig::default();
        config.dispatch.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.chart.window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_poll_interval_bounded_by_read_timeout() {
        let mut config = RigConfig::default();
        config.acquisition.poll_interval_ms = 0;
        assert!(config.validate().is_err());
        config.acquisition.poll_interval_ms = 1001;
        assert!(config.validate().is_err());
        config.acquisition.poll_interval_ms = 1000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_empty_patterns_and_zero_threshold() {
        let mut config = RigConfig::default();
        config.serial.port_patterns.clear();
        assert!(config.validate().is_err());

        let mut config = RigConfig::default();
        config.acquisition.max_consecutive_errors = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RigConfig::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, RigConfig::default());
    }

    #[test]
    #[serial]
    fn test_toml_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[application]
log_level = "debug"
log_format = "json"

[serial]
port_patterns = ["USB"]

[dispatch]
channel_capacity = 64
policy = "drop_newest"
"#
        )
        .unwrap();

        let config = RigConfig::load_from(file.path()).unwrap();
        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, LogFormat::Json);
        assert_eq!(config.serial.port_patterns, vec!["USB"]);
        assert_eq!(config.dispatch.channel_capacity, 64);
        assert_eq!(config.dispatch.backpressure(), BackpressurePolicy::DropNewest);
        // Untouched sections keep their defaults.
        assert_eq!(config.acquisition, AcquisitionConfig::default());
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatch]\nchannel_capacity = 64").unwrap();

        std::env::set_var("TESTRIG_DISPATCH__CHANNEL_CAPACITY", "8");
        let result = RigConfig::load_from(file.path());
        std::env::remove_var("TESTRIG_DISPATCH__CHANNEL_CAPACITY");

        assert_eq!(result.unwrap().dispatch.channel_capacity, 8);
    }

    #[test]
    #[serial]
    fn test_invalid_file_value_fails_validation() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[chart]\nwindow = 0").unwrap();
        assert!(matches!(
            RigConfig::load_from(file.path()),
            Err(RigError::Configuration(_))
        ));
    }
}
