//! Configuration for the rivulet audio engine.
//!
//! Loads an [`EngineConfig`] from TOML, validates it, and converts it into
//! [`rivulet_core::ContextOptions`].
//!
//! # Features
//!
//! - **Engine Config**: Sample rate, quantum size, channel limits, session cap, autoplay
//! - **Validation**: Range checks that report every violation at once
//! - **Paths**: Platform-specific config directory, `RIVULET_CONFIG` override
//!
//! # Example
//!
//! ```rust,no_run
//! use rivulet_config::{EngineConfig, paths};
//!
//! let path = paths::resolve_engine_config(None);
//! let config = EngineConfig::load_or_default(&path)?;
//! let options = config.context_options()?;
//! println!("rendering {} frames per quantum", options.quantum_frames);
//! # Ok::<(), rivulet_config::ConfigError>(())
//! ```

mod engine;
mod error;

/// Platform-specific configuration paths.
pub mod paths;

/// Engine configuration validation.
pub mod validation;

pub use engine::{Autoplay, DriverConfig, EngineConfig};
pub use error::ConfigError;
pub use paths::{ensure_user_config_dir, engine_config_path, resolve_engine_config, user_config_dir};
pub use validation::{ValidationError, ValidationResult, validate_engine_config};
