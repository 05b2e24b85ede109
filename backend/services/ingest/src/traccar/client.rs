use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;

use trackrelay_common::retry::{with_retry, RetryError, RetryPolicy};

use super::models::{TraccarDevice, TraccarPosition};

/// Time bound format the positions endpoint expects.
const TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

#[derive(Debug, Clone)]
pub struct TraccarClientConfig {
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub timeout_secs: u64,
    /// Total time spent retrying one request before giving up.
    pub retry_budget_secs: u64,
}

impl TraccarClientConfig {
    /// Load Traccar config from environment.
    ///
    /// Returns `None` if the server URL or credentials are missing.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("TRACCAR_BASE_URL").ok()?;
        let email = std::env::var("TRACCAR_EMAIL").ok()?;
        let password = std::env::var("TRACCAR_PASSWORD").ok()?;
        let timeout_secs = std::env::var("TRACCAR_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(120);
        let retry_budget_secs = std::env::var("TRACCAR_RETRY_BUDGET_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
            password,
            timeout_secs,
            retry_budget_secs,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraccarClientError {
    /// 4xx other than 429: the request itself is wrong, retrying won't help.
    #[error("rejected with HTTP {status}: {body}")]
    Rejected { status: StatusCode, body: String },

    #[error("server error HTTP {status}: {body}")]
    ServerError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("upstream unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl TraccarClientError {
    pub fn is_transient(&self) -> bool {
        match self {
            TraccarClientError::ServerError { .. } => true,
            TraccarClientError::RequestError(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }
}

/// What the sync engine needs from the remote tracking API.
#[async_trait]
pub trait TrackingApi: Send + Sync {
    async fn list_devices(&self) -> Result<Vec<TraccarDevice>, TraccarClientError>;

    /// Positions for one device in `[lower_bound, now)`.
    async fn fetch_since(
        &self,
        device_id: &str,
        lower_bound: DateTime<Utc>,
    ) -> Result<Vec<TraccarPosition>, TraccarClientError>;
}

#[derive(Clone)]
pub struct TraccarClient {
    client: Client,
    config: TraccarClientConfig,
    retry: RetryPolicy,
}

impl TraccarClient {
    pub fn new(config: TraccarClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        let retry = RetryPolicy::upstream(Duration::from_secs(config.retry_budget_secs));
        Ok(Self {
            client,
            config,
            retry,
        })
    }

    /// For testing: shorten backoff so retry paths run in milliseconds.
    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Fetch the positions for one device within `[from, to)`.
    pub async fn fetch_positions(
        &self,
        device_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TraccarPosition>, TraccarClientError> {
        let url = format!("{}/positions", self.config.base_url);
        let query = [
            ("deviceId", device_id.to_string()),
            ("from", from.format(TIME_FORMAT).to_string()),
            ("to", to.format(TIME_FORMAT).to_string()),
        ];
        tracing::info!(device_id, from = %query[1].1, to = %query[2].1, "requesting positions");

        self.get_with_retry("positions", &url, &query).await
    }

    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        label: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, TraccarClientError> {
        with_retry(&self.retry, label, TraccarClientError::is_transient, || {
            self.get_once(url, query)
        })
        .await
        .map_err(|e| match e {
            RetryError::Exhausted { attempts, last } => {
                tracing::error!(
                    url,
                    attempts,
                    error = %last,
                    needs_attention = true,
                    "traccar request failed"
                );
                TraccarClientError::Unavailable {
                    attempts,
                    last_error: last.to_string(),
                }
            }
            RetryError::Permanent(err) => {
                tracing::error!(url, error = %err, needs_attention = true, "traccar request rejected");
                err
            }
        })
    }

    async fn get_once<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, TraccarClientError> {
        let response = self
            .client
            .get(url)
            .basic_auth(&self.config.email, Some(&self.config.password))
            .query(query)
            .send()
            .await?;

        let status = response.status();

        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();

        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TraccarClientError::ServerError { status, body });
        }

        Err(TraccarClientError::Rejected { status, body })
    }
}

#[async_trait]
impl TrackingApi for TraccarClient {
    async fn list_devices(&self) -> Result<Vec<TraccarDevice>, TraccarClientError> {
        let url = format!("{}/devices", self.config.base_url);
        self.get_with_retry("devices", &url, &[]).await
    }

    async fn fetch_since(
        &self,
        device_id: &str,
        lower_bound: DateTime<Utc>,
    ) -> Result<Vec<TraccarPosition>, TraccarClientError> {
        self.fetch_positions(device_id, lower_bound, Utc::now()).await
    }
}
