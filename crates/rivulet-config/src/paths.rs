//! Platform-specific configuration paths.
//!
//! - **User config**: `~/.config/rivulet/` (Linux), `~/Library/Application Support/rivulet/` (macOS), `%APPDATA%\rivulet\` (Windows)
//! - **Engine config**: `engine.toml` inside the user config directory
//!
//! The `RIVULET_CONFIG` environment variable overrides the engine config
//! location.

use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Application name used for directory paths.
const APP_NAME: &str = "rivulet";

/// File name of the engine configuration.
pub const ENGINE_CONFIG_FILE: &str = "engine.toml";

/// Environment variable overriding the engine config path.
pub const CONFIG_ENV_VAR: &str = "RIVULET_CONFIG";

/// Returns the user-specific configuration directory.
///
/// Returns a fallback path if the config directory cannot be determined.
pub fn user_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Returns the default engine configuration path.
pub fn engine_config_path() -> PathBuf {
    user_config_dir().join(ENGINE_CONFIG_FILE)
}

/// Ensures the user config directory exists.
pub fn ensure_user_config_dir() -> Result<PathBuf, ConfigError> {
    let dir = user_config_dir();
    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| ConfigError::create_dir(&dir, e))?;
    }
    Ok(dir)
}

/// Resolves which engine config file to use.
///
/// An explicit path wins, then `RIVULET_CONFIG`, then the default path.
/// The result may not exist yet.
pub fn resolve_engine_config(explicit: Option<&Path>) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => engine_config_path(),
    }
}
