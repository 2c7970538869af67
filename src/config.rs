//! Process-level configuration for the gateway.
//!
//! Everything here is loaded once at startup via environment variables:
//!
//! - `GATEWAY_HOST` - Optional. Bind address. Defaults to `127.0.0.1` (loopback;
//!   the proxy assumes a trusted local client, see the non-goals in SPEC_FULL §1).
//! - `GATEWAY_PORT` - Optional. Bind port. Defaults to `7788`.
//! - `GATEWAY_CONFIG_DB` - Optional. Path to the provider/settings SQLite file.
//! - `GATEWAY_LOG_DB` - Optional. Path to the request/usage-log SQLite file.
//! - `GATEWAY_STREAM_FIRST_BYTE_TIMEOUT` - Optional. Seconds. Defaults to `30`.
//! - `GATEWAY_STREAM_IDLE_TIMEOUT` - Optional. Seconds. Defaults to `60`.
//! - `GATEWAY_NON_STREAM_TIMEOUT` - Optional. Seconds. Defaults to `120`.
//! - `GATEWAY_DEBUG_LOG` - Optional. Boolean. Defaults to `false`.
//!
//! These timeout/debug defaults only seed the `TimeoutSettings`/`GatewaySettings`
//! singleton rows the first time the config store is opened; after that the
//! database rows are authoritative (see [`crate::store::config_store`]).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Top-level process configuration, loaded once in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub config_db_path: PathBuf,
    pub log_db_path: PathBuf,
    pub stream_first_byte_timeout: u64,
    pub stream_idle_timeout: u64,
    pub non_stream_timeout: u64,
    pub debug_log: bool,
}

impl Config {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("GATEWAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = parse_env_or("GATEWAY_PORT", 7788u16)?;
        let config_db_path = std::env::var("GATEWAY_CONFIG_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ccg_gateway.db"));
        let log_db_path = std::env::var("GATEWAY_LOG_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("ccg_logs.db"));

        let stream_first_byte_timeout = parse_env_or("GATEWAY_STREAM_FIRST_BYTE_TIMEOUT", 30u64)?;
        let stream_idle_timeout = parse_env_or("GATEWAY_STREAM_IDLE_TIMEOUT", 60u64)?;
        let non_stream_timeout = parse_env_or("GATEWAY_NON_STREAM_TIMEOUT", 120u64)?;
        let debug_log = env_var_bool("GATEWAY_DEBUG_LOG", false);

        Ok(Self {
            host,
            port,
            config_db_path,
            log_db_path,
            stream_first_byte_timeout,
            stream_idle_timeout,
            non_stream_timeout,
            debug_log,
        })
    }
}

fn parse_env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

/// Parse an environment variable as a boolean, returning `default` if unset.
///
/// Recognises `1`, `true`, `yes`, `y`, `on` (case-insensitive) as `true`;
/// everything else (including unset) maps to `default`.
fn env_var_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "y" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_bool_defaults_when_unset() {
        std::env::remove_var("CCG_TEST_BOOL_UNSET");
        assert!(!env_var_bool("CCG_TEST_BOOL_UNSET", false));
        assert!(env_var_bool("CCG_TEST_BOOL_UNSET", true));
    }

    #[test]
    fn env_var_bool_recognizes_truthy_values() {
        for v in ["1", "true", "TRUE", "yes", "y", "on"] {
            std::env::set_var("CCG_TEST_BOOL", v);
            assert!(env_var_bool("CCG_TEST_BOOL", false), "value {v} should be true");
        }
        std::env::remove_var("CCG_TEST_BOOL");
    }
}
