//! Logging helpers
//!
//! Thin wrapper over `env_logger` so the binary and tests configure logging
//! the same way.

/// Initialize the global logger
///
/// `RUST_LOG` takes precedence; `level` is used when it is unset.
///
/// # Parameters
///
/// * `level` - Fallback log filter (error, warn, info, debug, trace)
pub fn init_logger(level: &str) {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    env_logger::init_from_env(env);
}

/// Initialize the logger if nothing else has
///
/// Safe to call repeatedly, which makes it suitable for tests.
pub fn try_init_logger(level: &str) -> bool {
    let env = env_logger::Env::default()
        .filter_or("RUST_LOG", level);

    env_logger::Builder::from_env(env)
        .is_test(true)
        .try_init()
        .is_ok()
}
