use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::models::Observation;

#[derive(Debug, Clone)]
pub struct SensorsClientConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
}

impl SensorsClientConfig {
    /// Load sensors API config from environment.
    ///
    /// Returns `None` if `SENSORS_API_URL` or `SENSORS_API_KEY` is missing.
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SENSORS_API_URL").ok()?;
        let api_key = std::env::var("SENSORS_API_KEY").ok()?;
        let timeout_secs = std::env::var("SENSORS_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);

        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout_secs,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SensorsClientError {
    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
}

/// Downstream consumer of normalized observations.
#[async_trait]
pub trait ObservationSink: Send + Sync {
    /// Deliver one batch. A single attempt; callers own the retry policy.
    async fn send_observations(
        &self,
        integration_id: &str,
        batch: &[Observation],
    ) -> Result<(), SensorsClientError>;
}

#[derive(Clone)]
pub struct SensorsClient {
    client: Client,
    config: SensorsClientConfig,
}

impl SensorsClient {
    pub fn new(config: SensorsClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn observations_url(&self) -> String {
        format!("{}/v2/observations/", self.config.base_url)
    }
}

#[async_trait]
impl ObservationSink for SensorsClient {
    async fn send_observations(
        &self,
        integration_id: &str,
        batch: &[Observation],
    ) -> Result<(), SensorsClientError> {
        let response = self
            .client
            .post(self.observations_url())
            .bearer_auth(&self.config.api_key)
            .header("X-Integration-Id", integration_id)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(count = batch.len(), %status, "observations accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(SensorsClientError::HttpError { status, body })
    }
}
