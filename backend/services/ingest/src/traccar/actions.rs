//! Operator actions that sit beside the sync cycle.

use reqwest::StatusCode;
use serde::Serialize;

use trackrelay_db::watermark::models::WatermarkKey;
use trackrelay_db::watermark::repositories::WatermarkRepository;

use super::client::{TraccarClientError, TrackingApi};
use super::config::FetchSamplesConfig;
use super::device_sync::STREAM_NAME;
use super::models::TraccarDevice;
use crate::error::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthCheck {
    pub valid_credentials: bool,
}

/// Check the configured credentials by listing devices.
///
/// 401/403 means the credentials are wrong; any other failure is an error.
pub async fn check_credentials<A: TrackingApi>(api: &A) -> Result<AuthCheck, SyncError> {
    match api.list_devices().await {
        Ok(_) => Ok(AuthCheck {
            valid_credentials: true,
        }),
        Err(TraccarClientError::Rejected { status, .. })
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN =>
        {
            tracing::warn!(%status, "tracking api rejected credentials");
            Ok(AuthCheck {
                valid_credentials: false,
            })
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Samples {
    pub devices_extracted: usize,
    pub devices: Vec<TraccarDevice>,
}

pub async fn fetch_samples<A: TrackingApi>(
    api: &A,
    config: &FetchSamplesConfig,
) -> Result<Samples, SyncError> {
    let mut devices = api.list_devices().await?;
    devices.truncate(config.observations_to_extract);
    tracing::info!(count = devices.len(), "sample devices fetched");
    Ok(Samples {
        devices_extracted: devices.len(),
        devices,
    })
}

/// Forget a device's progress; its next cycle starts from the lookback floor.
pub async fn reset_device_watermark<W: WatermarkRepository>(
    store: &W,
    integration_id: &str,
    device_id: &str,
) -> Result<(), SyncError> {
    let key = WatermarkKey::for_source(integration_id, STREAM_NAME, device_id);
    store.delete(&key).await?;
    tracing::info!(key = %key, "device watermark reset");
    Ok(())
}
