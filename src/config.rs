//! Configuration for the `ttyio` demo binary.
//!
//! The configuration file is located at `~/.ttyio/config.toml`:
//!
//! ```toml
//! # Switch the terminal to raw mode on start
//! raw_mode = true
//!
//! # Report window resizes
//! resize_events = true
//!
//! # Give up waiting for input after this many milliseconds (optional)
//! read_timeout_ms = 1000
//!
//! # Bytes requested per read
//! buffer_size = 64
//!
//! # trace, debug, info, warn or error. RUST_LOG takes precedence.
//! log_level = "info"
//! ```
//!
//! Missing keys take their defaults. A missing or malformed file means all
//! defaults.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{warn, Level};

const CONFIG_DIR: &str = ".ttyio";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enter raw mode before reading
    pub raw_mode: bool,
    /// Deliver resize notifications
    pub resize_events: bool,
    /// Per-read timeout, none to block
    pub read_timeout_ms: Option<u64>,
    /// Read buffer length
    pub buffer_size: usize,
    /// Log level name
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            raw_mode: true,
            resize_events: true,
            read_timeout_ms: None,
            buffer_size: 64,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(content) => Self::parse(&content).unwrap_or_else(|e| {
                warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(e) => {
                warn!("Failed to read config {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Get log file path, creating its directory
    pub fn log_path() -> PathBuf {
        match config_dir() {
            Some(dir) => {
                let _ = fs::create_dir_all(&dir);
                dir.join("ttyio.log")
            }
            None => PathBuf::from("ttyio.log"),
        }
    }

    /// Parsed log level, INFO when unrecognised
    pub fn level(&self) -> Level {
        self.log_level.trim().parse().unwrap_or(Level::INFO)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout_ms.map(Duration::from_millis)
    }
}

fn config_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(CONFIG_DIR))
}

/// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("USERPROFILE")
        .or_else(|| std::env::var_os("HOME"))
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        assert_eq!(Config::parse("").unwrap(), Config::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let config = Config::parse("read_timeout_ms = 250\nraw_mode = false\n").unwrap();
        assert!(!config.raw_mode);
        assert!(config.resize_events);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.buffer_size, 64);
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        assert!(Config::parse("buffer_size = \"large\"").is_err());
    }

    #[test]
    fn test_level_parsing() {
        let mut config = Config::default();
        assert_eq!(config.level(), Level::INFO);

        config.log_level = "debug".to_string();
        assert_eq!(config.level(), Level::DEBUG);

        config.log_level = "TRACE".to_string();
        assert_eq!(config.level(), Level::TRACE);

        config.log_level = "chatty".to_string();
        assert_eq!(config.level(), Level::INFO);
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = Config {
            read_timeout_ms: Some(10),
            log_level: "warn".to_string(),
            ..Config::default()
        };
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }
}
