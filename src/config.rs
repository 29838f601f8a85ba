use std::time::Duration;

use crate::authz::{ControllerConfig, StoreConfig};
use crate::errors::PermissionError;

const DEFAULT_API_URL: &str = "http://127.0.0.1:8000";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_PORT: u16 = 8000;
const MIN_POLL_INTERVAL_SECS: u64 = 1;

#[derive(Debug, Clone)]
pub struct PermissionsConfig {
    pub api_url: String,
    pub poll_interval: Duration,
    pub fetch_timeout: Duration,
    pub bearer_token: Option<String>,
    pub port: u16,
}

impl Default for PermissionsConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            fetch_timeout: Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS),
            bearer_token: None,
            port: DEFAULT_PORT,
        }
    }
}

impl PermissionsConfig {
    pub fn from_env() -> Result<Self, PermissionError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from an arbitrary key lookup; `from_env` passes the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, PermissionError> {
        let api_url = lookup("PERMISSIONS_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let poll_secs = parse_or(&lookup, "PERMISSIONS_POLL_INTERVAL_SECS", DEFAULT_POLL_INTERVAL_SECS)?;
        if poll_secs < MIN_POLL_INTERVAL_SECS {
            return Err(PermissionError::configuration(format!(
                "PERMISSIONS_POLL_INTERVAL_SECS must be at least {MIN_POLL_INTERVAL_SECS}"
            )));
        }

        let timeout_ms = parse_or(&lookup, "PERMISSIONS_FETCH_TIMEOUT_MS", DEFAULT_FETCH_TIMEOUT_MS)?;
        let port = parse_or(&lookup, "APP_PORT", DEFAULT_PORT)?;
        let bearer_token = lookup("PERMISSIONS_BEARER_TOKEN").filter(|token| !token.is_empty());

        Ok(Self {
            api_url,
            poll_interval: Duration::from_secs(poll_secs),
            fetch_timeout: Duration::from_millis(timeout_ms),
            bearer_token,
            port,
        })
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            fetch_timeout: self.fetch_timeout,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            poll_interval: self.poll_interval,
        }
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, PermissionError> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| PermissionError::configuration(format!("{key} must be a valid integer"))),
        None => Ok(default),
    }
}
