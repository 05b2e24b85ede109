use serde::Deserialize;
use std::env;
use trackrelay_common::error::{RelayError, RelayResult};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub redis_url: String,
    pub integration_id: String,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> RelayResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        let integration_id = get_var("INTEGRATION_ID")?;
        if integration_id.trim().is_empty() {
            return Err(RelayError::Config("INTEGRATION_ID must not be blank".into()));
        }

        Ok(Self {
            redis_url: get_var_or("REDIS_URL", "redis://127.0.0.1:6379"),
            integration_id,
            log_level: get_var_or("LOG_LEVEL", "info"),
        })
    }
}

fn get_var(key: &str) -> RelayResult<String> {
    env::var(key).map_err(|_| RelayError::Config(format!("{key} is required but not set")))
}

pub fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parse an optional numeric env var, falling back to `default` when unset.
/// A value that is set but unparseable is a configuration error.
pub fn parse_var_or<T>(key: &str, default: T) -> RelayResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}
