use once_cell::sync::Lazy;
use std::time::Duration;

use crate::provider::{DEFAULT_API_URL, DEFAULT_REQUEST_TIMEOUT};

/// Base URL of the Datadog v1 API. Defaults to the US1 site; point it at
/// `https://api.datadoghq.eu/api/v1` or similar for other sites.
pub static DATADOG_API_URL: Lazy<String> = Lazy::new(|| {
    read_optional_env("DATADOG_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string())
});

/// Per-request timeout for Datadog calls, in seconds. Defaults to `10`.
pub static DATADOG_REQUEST_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("DATADOG_REQUEST_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT.as_secs())
});

/// When truthy, a failed application key creation under a `both` role deletes the API
/// key that was already created for that issuance. Defaults to `false`.
pub static CLEANUP_PARTIAL_ISSUANCE: Lazy<bool> = Lazy::new(|| {
    std::env::var("CLEANUP_PARTIAL_ISSUANCE")
        .map(|value| is_truthy(&value))
        .unwrap_or(false)
});

/// Postgres connection string. When unset, roles and configuration live in memory.
pub static DATABASE_URL: Lazy<Option<String>> = Lazy::new(|| read_optional_env("DATABASE_URL"));

/// Address the HTTP server should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the HTTP server should listen on. Defaults to `8200`.
pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8200)
});

/// Engine-level knobs, gathered once at startup.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub api_url: String,
    pub request_timeout: Duration,
    pub cleanup_partial_issuance: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            cleanup_partial_issuance: false,
        }
    }
}

impl EngineSettings {
    pub fn from_env() -> Self {
        Self {
            api_url: DATADOG_API_URL.clone(),
            request_timeout: Duration::from_secs(*DATADOG_REQUEST_TIMEOUT_SECS),
            cleanup_partial_issuance: *CLEANUP_PARTIAL_ISSUANCE,
        }
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn is_truthy(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes")
}
