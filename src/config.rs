//! Layered settings using Figment.
//!
//! Settings are loaded from, in increasing precedence:
//! 1. built-in defaults
//! 2. an optional TOML file
//! 3. environment variables prefixed with `INSTR_` (`__` separates sections)
//!
//! ```text
//! INSTR_APPLICATION__LOG_LEVEL=debug
//! INSTR_LOCK__TIMEOUT=30s
//! INSTR_ACQUISITION__DETECT_SLICE=250ms
//! ```
//!
//! # Example
//!
//! ```
//! use instrument_core::config::Settings;
//! use std::time::Duration;
//!
//! let settings = Settings::default();
//! settings.validate().unwrap();
//! assert_eq!(settings.lock.poll_interval, Duration::from_millis(1));
//! ```

use crate::error::{AppResult, DaqError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "INSTR_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Instrument lock settings
    pub lock: LockConfig,
    /// Asynchronous acquisition settings
    pub acquisition: AcquisitionConfig,
    /// Instrument behavior
    pub instrument: InstrumentConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "instrument-core".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Instrument lock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Interval between acquisition attempts
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Give up after this long; absent waits until interrupted
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,
    /// Directory of shared-memory lock records (OS temp dir if absent)
    pub shared_dir: Option<PathBuf>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1),
            timeout: None,
            shared_dir: None,
        }
    }
}

impl LockConfig {
    /// Directory holding shared-memory records.
    pub fn shared_dir(&self) -> PathBuf {
        self.shared_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// Asynchronous acquisition configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Poll interval of the pre-trigger delay
    #[serde(with = "humantime_serde")]
    pub delay_poll: Duration,
    /// Longest single call to the detector
    #[serde(with = "humantime_serde")]
    pub detect_slice: Duration,
    /// Slice used by callers blocked in stage 2
    #[serde(with = "humantime_serde")]
    pub wait_slice: Duration,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            delay_poll: Duration::from_millis(100),
            detect_slice: Duration::from_millis(500),
            wait_slice: Duration::from_millis(200),
        }
    }
}

/// Instrument behavior configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    /// Minimum time between two `force_get` passes
    #[serde(with = "humantime_serde")]
    pub force_get_interval: Duration,
    /// Start instruments in checking (dry-run) mode
    pub checking: bool,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            force_get_interval: Duration::from_secs(2),
            checking: false,
        }
    }
}

impl Settings {
    /// Defaults overridden by `INSTR_` environment variables.
    pub fn load() -> AppResult<Self> {
        Self::extract(Self::figment())
    }

    /// Defaults, then `path`, then environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::extract(Self::figment().merge(Toml::file(path.as_ref())).merge(env()))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default())).merge(env())
    }

    fn extract(figment: Figment) -> AppResult<Self> {
        let settings: Self = figment.extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Check values serde cannot.
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }
        let intervals = [
            ("lock.poll_interval", self.lock.poll_interval),
            ("acquisition.delay_poll", self.acquisition.delay_poll),
            ("acquisition.detect_slice", self.acquisition.detect_slice),
            ("acquisition.wait_slice", self.acquisition.wait_slice),
        ];
        for (name, value) in intervals {
            if value.is_zero() {
                return Err(DaqError::Configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Effective settings as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DaqError::Configuration(format!("cannot serialize settings: {e}")))
    }
}

fn env() -> Env {
    Env::prefixed(ENV_PREFIX).split("__")
}
