//! Configuration types
//!
//! This module contains the main configuration types used throughout the application.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use log::debug;

use crate::common::AddressSpec;
use crate::proxy::RelaySettings;
use super::defaults::{self, CONNECTION_TIMEOUT, IDLE_TIMEOUT, LOGIN_HOST_STR, LOGIN_PORT, LOG_LEVEL_STR};

/// Source of a configuration value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueSource {
    /// Default value
    Default,
    /// From configuration file
    File,
    /// From environment variable
    Environment,
    /// From command line argument
    CommandLine,
}

impl std::fmt::Display for ValueSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueSource::Default => write!(f, "default"),
            ValueSource::File => write!(f, "file"),
            ValueSource::Environment => write!(f, "environment"),
            ValueSource::CommandLine => write!(f, "command line"),
        }
    }
}

/// Configuration values
///
/// Every value is optional so that each source only sets what it knows about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigValues {
    /// Directory holding `static_keys.json` and `session_keys.json`
    #[serde(default)]
    pub keys_dir: Option<PathBuf>,

    /// Interface shard listeners bind to
    #[serde(default)]
    pub host: Option<String>,

    /// Login server host
    #[serde(default)]
    pub login_host: Option<String>,

    /// Login server port
    #[serde(default)]
    pub login_port: Option<u16>,

    /// pcapng capture path
    #[serde(default)]
    pub capture: Option<PathBuf>,

    /// Log every packet
    #[serde(default)]
    pub verbose: Option<bool>,

    /// Log level (error, warn, info, debug, trace)
    #[serde(default)]
    pub log_level: Option<String>,

    /// Backend connect timeout in seconds
    #[serde(default)]
    pub connection_timeout: Option<u64>,

    /// Per-direction idle timeout in seconds
    #[serde(default)]
    pub idle_timeout: Option<u64>,
}

impl ConfigValues {
    /// Names of the values that are set
    pub fn present(&self) -> Vec<&'static str> {
        let fields = [
            ("keys_dir", self.keys_dir.is_some()),
            ("host", self.host.is_some()),
            ("login_host", self.login_host.is_some()),
            ("login_port", self.login_port.is_some()),
            ("capture", self.capture.is_some()),
            ("verbose", self.verbose.is_some()),
            ("log_level", self.log_level.is_some()),
            ("connection_timeout", self.connection_timeout.is_some()),
            ("idle_timeout", self.idle_timeout.is_some()),
        ];

        fields
            .into_iter()
            .filter_map(|(name, set)| set.then_some(name))
            .collect()
    }
}

/// Proxy configuration
///
/// Values merged from every source, with the source each value came from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    /// Configuration values
    pub values: ConfigValues,

    /// Configuration file path
    pub config_file: Option<PathBuf>,

    /// Source tracking for configuration values
    pub sources: HashMap<String, ValueSource>,
}

impl Deref for ProxyConfig {
    type Target = ConfigValues;

    fn deref(&self) -> &Self::Target {
        &self.values
    }
}

impl Serialize for ProxyConfig {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.values.serialize(serializer)
    }
}

impl ProxyConfig {
    /// Wrap values from one source, recording that source for each
    pub fn from_values(values: ConfigValues, source: ValueSource) -> Self {
        let sources = values
            .present()
            .into_iter()
            .map(|name| (name.to_string(), source))
            .collect();

        Self { values, config_file: None, sources }
    }

    /// Set default values for all options that have one
    pub fn set_default_values(&mut self) {
        macro_rules! default_field {
            ($name:ident, $value:expr) => {
                if self.values.$name.is_none() {
                    self.values.$name = Some($value);
                    self.sources.insert(stringify!($name).to_string(), ValueSource::Default);
                }
            };
        }

        default_field!(host, defaults::bind_host());
        default_field!(login_host, LOGIN_HOST_STR.to_string());
        default_field!(login_port, LOGIN_PORT);
        default_field!(verbose, false);
        default_field!(log_level, LOG_LEVEL_STR.to_string());
        default_field!(connection_timeout, CONNECTION_TIMEOUT);
        default_field!(idle_timeout, IDLE_TIMEOUT);
    }

    /// Get the source of a configuration value
    pub fn source(&self, name: &str) -> String {
        match self.sources.get(name) {
            Some(source) => source.to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Get the keys directory
    pub fn keys_dir(&self) -> Option<&Path> {
        self.values.keys_dir.as_deref()
    }

    /// Get the bind host
    pub fn host(&self) -> String {
        self.values.host.clone().unwrap_or_else(defaults::bind_host)
    }

    /// Get the login server address
    pub fn login_address(&self) -> AddressSpec {
        AddressSpec::new(
            self.values.login_host.as_deref().unwrap_or(LOGIN_HOST_STR),
            self.values.login_port.unwrap_or(LOGIN_PORT),
        )
    }

    /// Get the capture path
    pub fn capture(&self) -> Option<&Path> {
        self.values.capture.as_deref()
    }

    /// Whether packets are logged
    pub fn verbose(&self) -> bool {
        self.values.verbose.unwrap_or(false)
    }

    /// Get the log level
    pub fn log_level(&self) -> &str {
        self.values.log_level.as_deref().unwrap_or(LOG_LEVEL_STR)
    }

    /// Get the connection timeout
    pub fn connection_timeout(&self) -> u64 {
        self.values.connection_timeout.unwrap_or(CONNECTION_TIMEOUT)
    }

    /// Get the idle timeout
    pub fn idle_timeout(&self) -> u64 {
        self.values.idle_timeout.unwrap_or(IDLE_TIMEOUT)
    }

    /// Timeouts for the shards
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            connect_timeout: Duration::from_secs(self.connection_timeout()),
            idle_timeout: Some(Duration::from_secs(self.idle_timeout())),
        }
    }

    /// Get the configuration file path
    pub fn config_file(&self) -> Option<&Path> {
        self.config_file.as_deref()
    }

    /// Merge two configurations
    ///
    /// Values set in `other` win and are recorded as coming from `source`.
    pub fn merge(&self, other: &ProxyConfig, source: ValueSource) -> Self {
        let mut result = self.clone();

        macro_rules! merge_field {
            ($name:ident) => {
                if other.values.$name.is_some() {
                    result.values.$name = other.values.$name.clone();
                    result.sources.insert(stringify!($name).to_string(), source);
                }
            };
        }

        merge_field!(keys_dir);
        merge_field!(host);
        merge_field!(login_host);
        merge_field!(login_port);
        merge_field!(capture);
        merge_field!(verbose);
        merge_field!(log_level);
        merge_field!(connection_timeout);
        merge_field!(idle_timeout);

        if let Some(path) = &other.config_file {
            result.config_file = Some(path.clone());
        }

        result
    }

    /// Log the configuration
    pub fn log(&self) {
        debug!("=== Configuration ===");
        match self.keys_dir() {
            Some(dir) => debug!("  Keys directory: {} (from {})", dir.display(), self.source("keys_dir")),
            None => debug!("  Keys directory: <unset>"),
        }
        debug!("  Bind host: {} (from {})", self.host(), self.source("host"));
        debug!("  Login server: {} (from {}/{})", self.login_address(), self.source("login_host"), self.source("login_port"));
        if let Some(path) = self.capture() {
            debug!("  Capture file: {} (from {})", path.display(), self.source("capture"));
        }
        debug!("  Verbose: {} (from {})", self.verbose(), self.source("verbose"));
        debug!("  Log level: {} (from {})", self.log_level(), self.source("log_level"));
        debug!("  Connection timeout: {} seconds (from {})", self.connection_timeout(), self.source("connection_timeout"));
        debug!("  Idle timeout: {} seconds (from {})", self.idle_timeout(), self.source("idle_timeout"));

        if let Some(file) = self.config_file() {
            debug!("  Configuration file: {}", file.display());
        }
        debug!("=====================");
    }
}
