//! Configuration builder
//!
//! This module provides a builder pattern for constructing configuration.

use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::defaults::{DEFAULT_CONFIG_FILE, ENV_PREFIX};
use crate::config::error::Result;
use crate::config::source::{CliSource, ConfigSource, DefaultSource, EnvSource, FileSource};
use crate::config::types::{ConfigValues, ProxyConfig};
use crate::config::validator::validate_config;

/// Configuration builder
///
/// Provides a fluent API for building configuration from multiple sources.
pub struct ConfigBuilder {
    sources: Vec<Box<dyn ConfigSource>>,
    validate: bool,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            sources: Vec::new(),
            validate: true,
        }
    }

    /// Add default source
    pub fn with_defaults(mut self) -> Self {
        debug!("Adding default configuration source");
        self.sources.push(Box::new(DefaultSource));
        self
    }

    /// Add file source
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        let path = path.as_ref();
        debug!("Adding file configuration source: {}", path.display());
        self.sources.push(Box::new(FileSource::new(path)));
        self
    }

    /// Add environment source
    pub fn with_env(mut self, prefix: &str) -> Self {
        debug!("Adding environment configuration source with prefix: {}", prefix);
        self.sources.push(Box::new(EnvSource::new(prefix)));
        self
    }

    /// Add command line source
    pub fn with_cli(mut self, values: ConfigValues) -> Self {
        debug!("Adding command line configuration source");
        self.sources.push(Box::new(CliSource::new(values)));
        self
    }

    /// Disable validation
    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::default();

        debug!("Building configuration from {} sources", self.sources.len());

        // Apply sources in order (lowest to highest priority)
        for source in self.sources {
            let source_type = source.source_type();
            debug!("Loading configuration from source: {:?}", source_type);

            let source_config = source.load()?;
            config = config.merge(&source_config, source_type);
        }

        // Apply default values for any fields that are still None
        config.set_default_values();

        if self.validate {
            debug!("Validating configuration");
            validate_config(&config)?;
        }

        config.log();
        Ok(config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
            .with_defaults()
            .with_file(DEFAULT_CONFIG_FILE)
            .with_env(ENV_PREFIX)
    }
}

/// Load configuration with the usual priority
///
/// 1. Default values (lowest priority)
/// 2. Configuration file, if one exists
/// 3. Environment variables
/// 4. Command line values (highest priority)
///
/// # Parameters
///
/// * `cli` - Values given on the command line
/// * `config_file` - Configuration file named on the command line
pub fn load(cli: ConfigValues, config_file: Option<PathBuf>) -> Result<ProxyConfig> {
    let config_file = config_file
        .or_else(|| std::env::var(format!("{}CONFIG_FILE", ENV_PREFIX)).ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut builder = ConfigBuilder::new().with_defaults();

    if config_file.exists() {
        info!("Using configuration file: {}", config_file.display());
        builder = builder.with_file(&config_file);
    } else {
        debug!("No configuration file at {}", config_file.display());
    }

    builder.with_env(ENV_PREFIX).with_cli(cli).build()
}
