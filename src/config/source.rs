//! Configuration sources
//!
//! This module defines traits and implementations for loading configuration
//! from different sources.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, warn};

use crate::config::error::{ConfigError, Result};
use crate::config::types::{ConfigValues, ProxyConfig, ValueSource};

/// Configuration source trait
pub trait ConfigSource {
    /// Load configuration from this source
    fn load(&self) -> Result<ProxyConfig>;

    /// Get the source type
    fn source_type(&self) -> ValueSource;
}

/// Default configuration source
pub struct DefaultSource;

impl ConfigSource for DefaultSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading default configuration");
        let mut config = ProxyConfig::default();
        config.set_default_values();
        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Default
    }
}

/// File configuration source
pub struct FileSource {
    pub path: PathBuf,
}

impl FileSource {
    /// Create a new file source
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ConfigSource for FileSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from file: {}", self.path.display());

        if !self.path.exists() {
            warn!("Configuration file not found: {}", self.path.display());
            warn!("Will use default values unless overridden by environment variables or command line arguments");
            return Ok(ProxyConfig::default());
        }

        let contents = fs::read_to_string(&self.path)
            .map_err(|e| ConfigError::FileReadError(self.path.clone(), e.to_string()))?;

        let values: ConfigValues = serde_json::from_str(&contents).map_err(|e| {
            let err_msg = format!("Error parsing {}: {}", self.path.display(), e);
            warn!("{}", err_msg);
            ConfigError::ParseError(err_msg)
        })?;

        let mut config = ProxyConfig::from_values(values, self.source_type());
        config.config_file = Some(self.path.clone());
        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::File
    }
}

/// Environment variable configuration source
pub struct EnvSource {
    pub prefix: String,
}

impl EnvSource {
    /// Create a new environment source
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
        }
    }

    fn var(&self, name: &str) -> Option<String> {
        let full_name = format!("{}{}", self.prefix, name);
        let value = env::var(&full_name).ok()?;
        debug!("Found environment variable {}={}", full_name, value);
        Some(value)
    }

    /// Parse a variable, warning about and skipping invalid values
    fn parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        let value = self.var(name)?;
        match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                warn!("Invalid {}{} in environment: {}", self.prefix, name, value);
                None
            }
        }
    }

    fn flag(&self, name: &str) -> Option<bool> {
        let value = self.var(name)?;
        match value.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Some(true),
            "0" | "false" | "no" | "off" => Some(false),
            _ => {
                warn!("Invalid {}{} in environment: {}", self.prefix, name, value);
                None
            }
        }
    }
}

impl ConfigSource for EnvSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from environment variables with prefix: {}", self.prefix);

        let values = ConfigValues {
            keys_dir: self.var("KEYS_DIR").map(PathBuf::from),
            host: self.var("HOST"),
            login_host: self.var("LOGIN_HOST"),
            login_port: self.parsed("LOGIN_PORT"),
            capture: self.var("CAPTURE").map(PathBuf::from),
            verbose: self.flag("VERBOSE"),
            log_level: self.var("LOG_LEVEL"),
            connection_timeout: self.parsed("CONNECTION_TIMEOUT"),
            idle_timeout: self.parsed("IDLE_TIMEOUT"),
        };

        let mut config = ProxyConfig::from_values(values, self.source_type());
        config.config_file = self.var("CONFIG_FILE").map(PathBuf::from);
        Ok(config)
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::Environment
    }
}

/// Command line configuration source
///
/// Holds values already parsed by the command line front end.
pub struct CliSource {
    pub values: ConfigValues,
}

impl CliSource {
    /// Create a new command line source
    pub fn new(values: ConfigValues) -> Self {
        Self { values }
    }
}

impl ConfigSource for CliSource {
    fn load(&self) -> Result<ProxyConfig> {
        debug!("Loading configuration from command line arguments");
        Ok(ProxyConfig::from_values(self.values.clone(), self.source_type()))
    }

    fn source_type(&self) -> ValueSource {
        ValueSource::CommandLine
    }
}
