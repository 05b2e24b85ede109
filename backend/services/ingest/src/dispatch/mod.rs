//! Per-device work units and the bus that carries them to workers.

pub mod redis_stream;
pub mod worker;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::traccar::models::{RecordedAtField, TraccarDevice};

/// Everything a worker needs to run one device's pull cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceWorkUnit {
    pub device_id: String,
    pub device_name: String,
    #[serde(default)]
    pub recorded_at_field_name: RecordedAtField,
}

impl DeviceWorkUnit {
    pub fn for_device(device: &TraccarDevice, field: RecordedAtField) -> Self {
        Self {
            device_id: device.source_id(),
            device_name: device.name.clone(),
            recorded_at_field_name: field,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("encode work unit: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("malformed stream entry {id}: {reason}")]
    Malformed { id: String, reason: String },
}

#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Publish one unit; returns the id the bus assigned to it.
    async fn publish(&self, unit: &DeviceWorkUnit) -> Result<String, DispatchError>;
}
