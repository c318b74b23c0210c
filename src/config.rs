//! Station configuration using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults (`StationConfig::default()`)
//! 2. A TOML file (`config/station.toml` unless another path is given)
//! 3. Environment variables prefixed with `DEPOSIT_`, nested with `__`
//!
//! # Example
//! ```no_run
//! use deposit_station::config::StationConfig;
//!
//! // DEPOSIT_LINK__PORT=/dev/ttyUSB1 overrides link.port
//! let config = StationConfig::load()?;
//! config.validate()?;
//! println!("Controller link: {}", config.link.port);
//! # Ok::<(), deposit_station::error::StationError>(())
//! ```

use crate::error::{StationError, StationResult};
use crate::logging::OutputFormat;
use crate::pipeline::DedupPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on any poll interval; shutdown must be observed within this.
pub const MAX_POLL_INTERVAL_MS: u64 = 100;

/// Top-level station configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Serial link settings
    pub link: LinkConfig,
    /// Detection pipeline settings
    pub pipeline: PipelineConfig,
    /// Command dispatch settings
    pub dispatch: DispatchConfig,
    /// Simulated device settings
    pub device: DeviceConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log line format (pretty, compact, json)
    pub log_format: OutputFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Deposit station".to_string(),
            log_level: "info".to_string(),
            log_format: OutputFormat::Compact,
        }
    }
}

/// Serial link configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LinkConfig {
    /// Serial port path (e.g., "/dev/ttyACM0", "COM3")
    pub port: String,
    /// Communication speed
    pub baud_rate: u32,
    /// Per-read timeout; also the cancellation poll interval of link readers
    pub read_timeout_ms: u64,
    /// Total time allowed for the identification handshake
    pub handshake_timeout_ms: u64,
    /// Delay between identification retries during the handshake
    pub handshake_retry_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            baud_rate: 9600,
            read_timeout_ms: 50,
            handshake_timeout_ms: 5000,
            handshake_retry_ms: 500,
        }
    }
}

impl LinkConfig {
    /// Read timeout as a `Duration`
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Handshake deadline as a `Duration`
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Handshake retry period as a `Duration`
    pub fn handshake_retry(&self) -> Duration {
        Duration::from_millis(self.handshake_retry_ms)
    }
}

/// Detection pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// How long an idle loop waits before rechecking the stop signal
    pub poll_interval_ms: u64,
    /// Which detections count as "already seen"
    pub dedup: DedupPolicy,
    /// Discard queued detections after every unique event
    pub drain_backlog_on_unique: bool,
    /// Frame rate of the synthetic camera used when no capture device is attached
    pub synthetic_fps: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            dedup: DedupPolicy::default(),
            drain_backlog_on_unique: false,
            synthetic_fps: 20,
        }
    }
}

impl PipelineConfig {
    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Command dispatch configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// How long to wait for a reply line before giving up on a request
    pub response_timeout_ms: u64,
    /// Consecutive timeouts after which the operator is warned
    pub timeout_warn_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            timeout_warn_threshold: 3,
        }
    }
}

impl DispatchConfig {
    /// Response timeout as a `Duration`
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Simulated device configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    /// Where the device state is persisted
    pub state_file: PathBuf,
    /// Simulated lock actuation time
    pub actuation_delay_ms: u64,
    /// Value reported for `MEAS:DIST?`
    pub distance_mm: u32,
    /// Identification reported for `*IDN?`
    pub identity: IdentityConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("state.json"),
            actuation_delay_ms: 500,
            distance_mm: 120,
            identity: IdentityConfig::default(),
        }
    }
}

impl DeviceConfig {
    /// Actuation delay as a `Duration`
    pub fn actuation_delay(&self) -> Duration {
        Duration::from_millis(self.actuation_delay_ms)
    }
}

/// Fields of the `*IDN?` reply
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentityConfig {
    /// Manufacturer
    pub vendor: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware version
    pub firmware: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            vendor: "DSDevs".to_string(),
            model: "DSDriver".to_string(),
            serial: "#00".to_string(),
            firmware: "mock_driver".to_string(),
        }
    }
}

impl StationConfig {
    /// Load configuration from `config/station.toml` and environment variables
    ///
    /// Environment variables override the file with prefix `DEPOSIT_`.
    /// Example: `DEPOSIT_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> StationResult<Self> {
        Self::load_from("config/station.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> StationResult<Self> {
        Self::figment(path.as_ref())
            .extract()
            .map_err(StationError::from)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(StationConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("DEPOSIT_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> StationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(StationError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        for (name, value) in [
            ("pipeline.poll_interval_ms", self.pipeline.poll_interval_ms),
            ("link.read_timeout_ms", self.link.read_timeout_ms),
        ] {
            if value == 0 || value > MAX_POLL_INTERVAL_MS {
                return Err(StationError::Configuration(format!(
                    "{name} must be between 1 and {MAX_POLL_INTERVAL_MS}, got {value}"
                )));
            }
        }

        if self.link.handshake_timeout_ms < self.link.read_timeout_ms {
            return Err(StationError::Configuration(
                "link.handshake_timeout_ms must not be shorter than link.read_timeout_ms".into(),
            ));
        }

        if self.pipeline.synthetic_fps == 0 {
            return Err(StationError::Configuration(
                "pipeline.synthetic_fps must be positive".into(),
            ));
        }

        if let DedupPolicy::Window { window_ms: 0 } = self.pipeline.dedup {
            return Err(StationError::Configuration(
                "pipeline.dedup window_ms must be positive".into(),
            ));
        }

        let identity = &self.device.identity;
        for (name, value) in [
            ("vendor", &identity.vendor),
            ("model", &identity.model),
            ("serial", &identity.serial),
            ("firmware", &identity.firmware),
        ] {
            if value.is_empty() || value.contains(',') {
                return Err(StationError::Configuration(format!(
                    "device.identity.{name} must be non-empty and free of commas"
                )));
            }
        }

        Ok(())
    }
}
