//! Configuration validator
//!
//! This module provides functionality for validating configuration.

use log::warn;

use crate::config::error::{ConfigError, Result};
use crate::config::types::ProxyConfig;

/// Validate the configuration
pub fn validate_config(config: &ProxyConfig) -> Result<()> {
    validate_keys_dir(config)?;
    validate_network_settings(config)?;
    validate_general_settings(config)?;
    Ok(())
}

/// The keys directory is required and must be a directory
fn validate_keys_dir(config: &ProxyConfig) -> Result<()> {
    let dir = config
        .keys_dir()
        .ok_or_else(|| ConfigError::MissingRequiredValue("keys_dir".to_string()))?;

    if !dir.is_dir() {
        return Err(ConfigError::InvalidValue(
            "keys_dir".to_string(),
            format!("Keys directory does not exist or is not a directory: {}", dir.display())
        ));
    }

    Ok(())
}

/// Validate network settings
fn validate_network_settings(config: &ProxyConfig) -> Result<()> {
    if config.login_address().port == 0 {
        return Err(ConfigError::InvalidValue(
            "login_port".to_string(),
            "Login port must be greater than 0".to_string()
        ));
    }

    if config.login_address().host.is_empty() {
        return Err(ConfigError::InvalidValue(
            "login_host".to_string(),
            "Login host must not be empty".to_string()
        ));
    }

    if config.connection_timeout() == 0 {
        return Err(ConfigError::InvalidValue(
            "connection_timeout".to_string(),
            "Connection timeout must be greater than 0".to_string()
        ));
    }

    if config.idle_timeout() == 0 {
        return Err(ConfigError::InvalidValue(
            "idle_timeout".to_string(),
            "Idle timeout must be greater than 0".to_string()
        ));
    }

    Ok(())
}

/// Validate general settings
fn validate_general_settings(config: &ProxyConfig) -> Result<()> {
    match config.log_level() {
        "error" | "warn" | "info" | "debug" | "trace" => {}
        level => {
            warn!("Invalid log level: {}. Using default: info", level);
        }
    }

    if let Some(path) = config.capture() {
        if path.is_dir() {
            return Err(ConfigError::InvalidValue(
                "capture".to_string(),
                format!("Capture path is a directory: {}", path.display())
            ));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{ConfigValues, ValueSource};

    fn config(values: ConfigValues) -> ProxyConfig {
        let mut config = ProxyConfig::from_values(values, ValueSource::CommandLine);
        config.set_default_values();
        config
    }

    #[test]
    fn test_missing_keys_dir() {
        let result = validate_config(&config(ConfigValues::default()));
        assert!(matches!(result, Err(ConfigError::MissingRequiredValue(name)) if name == "keys_dir"));
    }

    #[test]
    fn test_keys_dir_must_exist() {
        let values = ConfigValues {
            keys_dir: Some("/nonexistent/keys".into()),
            ..Default::default()
        };
        assert!(matches!(validate_config(&config(values)), Err(ConfigError::InvalidValue(..))));
    }

    #[test]
    fn test_zero_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();

        let zero_port = ConfigValues {
            keys_dir: Some(dir.path().to_path_buf()),
            login_port: Some(0),
            ..Default::default()
        };
        assert!(validate_config(&config(zero_port)).is_err());

        let zero_idle = ConfigValues {
            keys_dir: Some(dir.path().to_path_buf()),
            idle_timeout: Some(0),
            ..Default::default()
        };
        assert!(validate_config(&config(zero_idle)).is_err());
    }

    #[test]
    fn test_unknown_log_level_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let values = ConfigValues {
            keys_dir: Some(dir.path().to_path_buf()),
            log_level: Some("chatty".to_string()),
            ..Default::default()
        };
        assert!(validate_config(&config(values)).is_ok());
    }
}
