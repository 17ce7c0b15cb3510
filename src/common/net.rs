//! Network address types
//!
//! `AddressSpec` names an endpoint the way the backend does: a host string
//! (hostname or literal IP) plus a port. It is used both as a dial target and
//! as the address a shard listens on.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::error::{ProxyError, Result};

/// Host and port of a network endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AddressSpec {
    /// Hostname or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl AddressSpec {
    /// Create a new address
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// `(host, port)` pair accepted by the tokio connect/bind functions
    pub fn as_pair(&self) -> (&str, u16) {
        (self.host.as_str(), self.port)
    }
}

impl From<SocketAddr> for AddressSpec {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for AddressSpec {
    type Err = ProxyError;

    /// Parse `host:port` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ProxyError::Config(format!("Missing port in address: {}", s)))?;

        let port = port
            .parse::<u16>()
            .map_err(|e| ProxyError::Config(format!("Invalid port in address {}: {}", s, e)))?;

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(ProxyError::Config(format!("Missing host in address: {}", s)));
        }

        Ok(Self::new(host, port))
    }
}
