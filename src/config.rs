//! Driver configuration using Figment
//!
//! Configuration is loaded from:
//! 1. A TOML file (default `force_stage.toml`, missing file means all defaults)
//! 2. Environment variables prefixed with `FORCE_STAGE_`
//!
//! Only the keys enumerated on [`DriverConfig`] are recognized; anything else is
//! rejected at load time instead of being silently ignored.
//!
//! # Example
//! ```no_run
//! use force_stage::config::DriverConfig;
//!
//! let config = DriverConfig::load()?;
//! println!("Port: {} @ {} baud", config.port, config.baud_rate);
//! # Ok::<(), force_stage::error::DriverError>(())
//! ```

use crate::calibration::CalibrationState;
use crate::error::{DriverError, DriverResult};
use crate::motion::{ForceLimit, MotionLimits, DEFAULT_MAX_POSITION, DEFAULT_MIN_POSITION};
use crate::protocol::{FrameConfig, ProtocolRevision};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "force_stage.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "FORCE_STAGE_";

const SUPPORTED_ENCODINGS: [&str; 3] = ["utf-8", "utf8", "ascii"];

/// Every recognized driver option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Serial device path
    pub port: String,
    /// Text encoding of the link
    pub encoding: String,
    /// Serial baud rate
    pub baud_rate: u32,
    /// Per-line read timeout in milliseconds
    pub timeout_ms: u64,
    /// First character of every frame
    pub frame_start: char,
    /// Last character of every frame
    pub frame_end: char,
    /// Separator between frame arguments
    pub argument_separator: char,
    /// Lower travel limit (mm)
    pub min_position: i64,
    /// Upper travel limit (mm)
    pub max_position: i64,
    /// Command table to use
    pub revision: ProtocolRevision,
    /// Initial zero offset (raw counts)
    pub gauge_value: f64,
    /// Initial scale factor
    pub units_per_count: f64,
    /// Overload warning threshold (calibrated units)
    pub max_force: f64,
    /// Log a warning when `max_force` is exceeded
    pub warn_on_overload: bool,
    /// Readings averaged by a re-gauge
    pub gauge_samples: usize,
    /// Readings discarded before a re-gauge averages
    pub gauge_skips: usize,
    /// How long an input-buffer reset keeps draining (ms)
    pub drain_window_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".to_string(),
            encoding: "utf-8".to_string(),
            baud_rate: 115_200,
            timeout_ms: 2000,
            frame_start: '#',
            frame_end: ';',
            argument_separator: ',',
            min_position: DEFAULT_MIN_POSITION,
            max_position: DEFAULT_MAX_POSITION,
            revision: ProtocolRevision::default(),
            gauge_value: 0.0,
            units_per_count: 1.0,
            max_force: 5.0,
            warn_on_overload: true,
            gauge_samples: 10,
            gauge_skips: 3,
            drain_window_ms: 20,
        }
    }
}

impl DriverConfig {
    /// Load from `force_stage.toml` and `FORCE_STAGE_*` environment variables
    ///
    /// Example: `FORCE_STAGE_TIMEOUT_MS=500`
    pub fn load() -> DriverResult<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific file path, then environment, then validate
    pub fn load_from<P: AsRef<Path>>(path: P) -> DriverResult<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Provider stack used by [`DriverConfig::load_from`]
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(DriverConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> DriverResult<()> {
        let delimiters = [
            ("frame_start", self.frame_start),
            ("frame_end", self.frame_end),
            ("argument_separator", self.argument_separator),
        ];
        for (name, c) in delimiters {
            if !c.is_ascii() || c.is_ascii_whitespace() || c.is_ascii_control() {
                return Err(invalid(format!(
                    "{} must be a printable ASCII character, got {:?}",
                    name, c
                )));
            }
            if c.is_ascii_alphanumeric() || c == ' ' {
                return Err(invalid(format!(
                    "{} must not be alphanumeric, got {:?}",
                    name, c
                )));
            }
        }
        if self.frame_start == self.frame_end
            || self.frame_start == self.argument_separator
            || self.frame_end == self.argument_separator
        {
            return Err(invalid(
                "frame_start, frame_end and argument_separator must all differ".to_string(),
            ));
        }

        if !SUPPORTED_ENCODINGS.contains(&self.encoding.to_lowercase().as_str()) {
            return Err(invalid(format!(
                "Unsupported encoding '{}'. Must be one of: {}",
                self.encoding,
                SUPPORTED_ENCODINGS.join(", ")
            )));
        }
        if self.baud_rate == 0 {
            return Err(invalid("baud_rate must be positive".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(invalid("timeout_ms must be positive".to_string()));
        }

        MotionLimits::new(self.min_position, self.max_position)?;
        CalibrationState::new(self.gauge_value, self.units_per_count)
            .map_err(|e| invalid(e.to_string()))?;

        if !self.max_force.is_finite() || self.max_force <= 0.0 {
            return Err(invalid(format!(
                "max_force must be positive, got {}",
                self.max_force
            )));
        }
        if self.gauge_samples == 0 {
            return Err(invalid("gauge_samples must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Frame delimiters
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            start: self.frame_start,
            end: self.frame_end,
            separator: self.argument_separator,
        }
    }

    /// Travel limits
    pub fn limits(&self) -> DriverResult<MotionLimits> {
        MotionLimits::new(self.min_position, self.max_position)
    }

    /// Initial calibration
    pub fn calibration(&self) -> DriverResult<CalibrationState> {
        CalibrationState::new(self.gauge_value, self.units_per_count)
    }

    /// Overload guard
    pub fn force_limit(&self) -> ForceLimit {
        ForceLimit {
            max_force: self.max_force,
            warn: self.warn_on_overload,
        }
    }

    /// Per-line read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Input-buffer reset window
    pub fn drain_window(&self) -> Duration {
        Duration::from_millis(self.drain_window_ms)
    }
}

fn invalid(msg: String) -> DriverError {
    DriverError::Configuration(msg)
}
