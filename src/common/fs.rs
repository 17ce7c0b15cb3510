//! Filesystem helpers

use std::fs;
use std::path::Path;

use super::error::{ProxyError, Result};

/// Check that a path exists and is a regular file
///
/// # Parameters
///
/// * `path` - File path
///
/// # Returns
///
/// `Ok(())` if the file exists, otherwise a configuration error.
pub fn check_file_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(ProxyError::Config(format!(
            "File does not exist: {}",
            path.display()
        )));
    }

    if !path.is_file() {
        return Err(ProxyError::Config(format!(
            "Path is not a file: {}",
            path.display()
        )));
    }

    Ok(())
}

/// Read a whole file as UTF-8 text
pub fn read_to_string(path: &Path) -> Result<String> {
    check_file_exists(path)?;

    fs::read_to_string(path).map_err(ProxyError::Io)
}
