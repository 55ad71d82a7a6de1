//! Engine configuration file format.

use std::path::Path;
use std::time::Duration;

use rivulet_core::{AutoplayPolicy, ContextOptions};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::validation::{ValidationResult, validate_engine_config};

/// Autoplay behavior as written in a config file.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Autoplay {
    /// Start rendering as soon as the context initializes.
    #[default]
    Allow,
    /// Wait for a user gesture before rendering.
    UserGesture,
}

impl From<Autoplay> for AutoplayPolicy {
    fn from(autoplay: Autoplay) -> Self {
        match autoplay {
            Autoplay::Allow => AutoplayPolicy::Allow,
            Autoplay::UserGesture => AutoplayPolicy::RequireUserGesture,
        }
    }
}

/// Settings for the threaded driver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DriverConfig {
    /// Time between render quanta, in milliseconds.
    pub period_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { period_ms: 2 }
    }
}

/// Engine configuration.
///
/// Every field has a default, so an empty file is a valid configuration.
///
/// # TOML Format
///
/// ```toml
/// sample_rate = 48000
/// quantum_frames = 128
/// max_channels = 32
/// output_channels = 2
/// max_live_sessions = 4
/// control_queue_depth = 64
/// autoplay = "user-gesture"
///
/// [driver]
/// period_ms = 2
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Frames per render quantum.
    pub quantum_frames: usize,
    /// Largest channel count a node may be set to.
    pub max_channels: usize,
    /// Destination channel count.
    pub output_channels: usize,
    /// Realtime contexts allowed at once.
    pub max_live_sessions: usize,
    /// Capacity of the control task queue.
    pub control_queue_depth: usize,
    /// Autoplay behavior.
    pub autoplay: Autoplay,
    /// Threaded driver settings.
    pub driver: DriverConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            quantum_frames: 128,
            max_channels: 32,
            output_channels: 2,
            max_live_sessions: 4,
            control_queue_depth: 64,
            autoplay: Autoplay::Allow,
            driver: DriverConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load a configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::read_file(path, e))?;
        Self::from_toml(&content)
    }

    /// Load a configuration from `path` if the file exists, defaults otherwise.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.is_file() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load a configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::create_dir(parent, e))?;
        }
        let content = self.to_toml()?;
        std::fs::write(path, content).map_err(|e| ConfigError::write_file(path, e))
    }

    /// Checks every field against its accepted range.
    pub fn validate(&self) -> ValidationResult<()> {
        validate_engine_config(self)
    }

    /// Time between render quanta for the threaded driver.
    pub fn driver_period(&self) -> Duration {
        Duration::from_millis(self.driver.period_ms)
    }

    /// Validates the configuration and converts it into context options
    /// counted against the process-wide live-session counter.
    pub fn context_options(&self) -> Result<ContextOptions, ConfigError> {
        self.validate()?;
        let options = ContextOptions {
            sample_rate: self.sample_rate as f32,
            quantum_frames: self.quantum_frames,
            max_channels: self.max_channels,
            output_channels: self.output_channels,
            max_live_sessions: self.max_live_sessions,
            control_queue_depth: self.control_queue_depth,
            autoplay: self.autoplay.into(),
            ..ContextOptions::default()
        };
        options.validate()?;
        Ok(options)
    }
}
