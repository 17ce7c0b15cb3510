//! Configuration errors

use std::path::PathBuf;

use thiserror::Error;

/// Why a configuration could not be built
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The configuration file exists but could not be read
    #[error("Error reading configuration file {}: {}", .0.display(), .1)]
    FileReadError(PathBuf, String),

    /// The configuration file is not valid JSON for the options
    #[error("Error parsing configuration: {0}")]
    ParseError(String),

    /// An option has a value the proxy cannot use
    #[error("Invalid value for '{0}': {1}")]
    InvalidValue(String, String),

    /// A required option was given by no source
    #[error("Missing required configuration value: {0}")]
    MissingRequiredValue(String),
}

/// Result type alias for configuration operations
pub type Result<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for crate::common::ProxyError {
    fn from(err: ConfigError) -> Self {
        crate::common::ProxyError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_value_converts_to_proxy_error() {
        let err: crate::common::ProxyError = ConfigError::MissingRequiredValue("keys_dir".to_string()).into();
        assert_eq!(
            err.to_string(),
            "Configuration error: Missing required configuration value: keys_dir"
        );
    }

    #[test]
    fn test_read_error_names_the_file() {
        let err = ConfigError::FileReadError(PathBuf::from("proxy.json"), "denied".to_string());
        assert_eq!(err.to_string(), "Error reading configuration file proxy.json: denied");
    }
}
