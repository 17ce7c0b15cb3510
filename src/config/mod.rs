//! Configuration module
//!
//! This module handles application configuration, loading it from defaults,
//! a JSON file, environment variables and the command line, in increasing
//! order of priority, and validating the result.

pub mod builder;
pub mod defaults;
pub mod error;
pub mod source;
pub mod types;
pub mod validator;

pub use self::builder::{load, ConfigBuilder};
pub use self::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
pub use self::error::ConfigError;
pub use self::source::{CliSource, ConfigSource, DefaultSource, EnvSource, FileSource};
pub use self::types::{ConfigValues, ProxyConfig, ValueSource};
pub use self::validator::validate_config;
