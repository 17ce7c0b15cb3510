//! Default configuration values
//!
//! Single source of truth for defaults, so the sources, the validator and
//! the accessors agree.

/// Environment variable prefix for all configuration options
pub const ENV_PREFIX: &str = "SHARD_PROXY_";

/// Default configuration file name
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

/// Default login server host
pub const LOGIN_HOST_STR: &str = "login.us.wizard101.com";

/// Default login server port
pub const LOGIN_PORT: u16 = 12000;

/// Default log level as string
pub const LOG_LEVEL_STR: &str = "info";

/// Default connection timeout in seconds
pub const CONNECTION_TIMEOUT: u64 = 30;

/// Default idle timeout in seconds, twice the backend keep-alive interval
pub const IDLE_TIMEOUT: u64 = 120;

/// Default bind host for shard listeners
///
/// The Windows wildcard interface is not reachable by the game client, so
/// shards bind to loopback there.
pub fn bind_host() -> String {
    if cfg!(windows) {
        "127.0.0.1".to_string()
    } else {
        "0.0.0.0".to_string()
    }
}
