//! Error handling module
//!
//! This module defines the error types and result type aliases used in the application.

use thiserror::Error;
use std::io;

/// Shard proxy error type
#[derive(Error, Debug)]
pub enum ProxyError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// OpenSSL error
    #[error("OpenSSL error: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A key table has no entry for the requested id
    #[error("No {table} key for id {id}")]
    KeyNotFound {
        /// Which table was consulted ("static", "client" or "session")
        table: &'static str,
        /// The id that was looked up
        id: String,
    },

    /// Key material has the wrong shape
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    /// Malformed or unsupported frame
    #[error("Frame error: {0}")]
    Frame(String),

    /// Session handshake could not be completed
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// DML record could not be decoded or encoded
    #[error("DML error: {0}")]
    Dml(String),

    /// An operation did not complete in time
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The proxy scope has been cancelled
    #[error("Proxy is shutting down")]
    ShuttingDown,

    /// `run` was called while another `run` is in progress
    #[error("Proxy is already running")]
    AlreadyRunning,

    /// A relay task panicked or was aborted
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias
///
/// This is a `Result` type alias that uses our custom `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
