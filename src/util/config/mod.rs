//! coopjobs configuration system
//!
//! Supports user-level and project-level configuration files.
//!
//! # Configuration hierarchy
//!
//! ```text
//! Priority (high → low):
//! 1. CLI arguments (--config <FILE>)
//! 2. Project-level (./coopjobs.toml)
//! 3. User-level (~/.config/coopjobs/config.toml)
//! 4. Default values
//! ```
//!
//! # Format
//!
//! ```toml
//! [jobs]
//! general_purpose_threads = 4
//! max_pooled_runners = 64
//!
//! [log]
//! level = "debug"
//! ```
//!
//! # Usage
//!
//! ```rust
//! use coopjobs::util::config::load_user_config;
//!
//! let config = load_user_config().unwrap();
//! assert!(config.jobs.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::runtime::scheduler::ManagerConfig;
use crate::util::logger::LogLevel;

/// Project-level file name.
pub const PROJECT_CONFIG_FILE: &str = "coopjobs.toml";

/// Full configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Job manager settings
    #[serde(default)]
    pub jobs: ManagerConfig,
    /// Logging settings
    #[serde(default)]
    pub log: LogConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Minimum level printed
    #[serde(default)]
    pub level: LogLevel,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Config parse error: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Config serialize error: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Cannot determine config directory")]
    NoConfigDir,
}

/// Get the user config directory
pub fn get_config_dir() -> Option<PathBuf> {
    // Try XDG config directory on Unix
    if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config).join("coopjobs"));
    }

    // Fallback to ~/.config/coopjobs
    if let Ok(home) = std::env::var("HOME") {
        return Some(PathBuf::from(home).join(".config").join("coopjobs"));
    }

    // On Windows, try %APPDATA%
    if let Ok(appdata) = std::env::var("APPDATA") {
        return Some(PathBuf::from(appdata).join("coopjobs"));
    }

    None
}

/// Get the user config file path (~/.config/coopjobs/config.toml)
pub fn get_config_path() -> Option<PathBuf> {
    get_config_dir().map(|dir| dir.join("config.toml"))
}

/// Load a configuration file
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    debug!("Loading config from {}", path.display());
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load user-level configuration
/// Returns default config if file doesn't exist
pub fn load_user_config() -> Result<Config, ConfigError> {
    match get_config_path() {
        Some(path) if path.exists() => load_config(&path),
        _ => Ok(Config::default()),
    }
}

/// Resolve the effective configuration.
///
/// An explicit path wins, then `coopjobs.toml` in `project_dir`, then the
/// user-level file, then defaults.
pub fn resolve_config(
    explicit: Option<&Path>,
    project_dir: &Path,
) -> Result<Config, ConfigError> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    let project = project_dir.join(PROJECT_CONFIG_FILE);
    if project.exists() {
        return load_config(&project);
    }
    load_user_config()
}

/// Write a configuration file, creating parent directories
pub fn save_config(
    config: &Config,
    path: &Path,
) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() && !dir.exists() {
            fs::create_dir_all(dir)?;
        }
    }
    fs::write(path, to_toml(config)?)?;
    Ok(())
}

/// Save user-level configuration
pub fn save_user_config(config: &Config) -> Result<PathBuf, ConfigError> {
    let path = get_config_path().ok_or(ConfigError::NoConfigDir)?;
    save_config(config, &path)?;
    Ok(path)
}

/// Render a configuration as TOML
pub fn to_toml(config: &Config) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}
