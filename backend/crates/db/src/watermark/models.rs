use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source segment used when a watermark is not scoped to a single device.
pub const DEFAULT_SOURCE: &str = "no-source";

/// Progress marker for one (integration, stream, source): everything with a
/// primary time at or before `recorded_at` has been delivered downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Watermark {
    pub recorded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at_field_name: Option<String>,
}

impl Watermark {
    pub fn new(recorded_at: DateTime<Utc>) -> Self {
        Self {
            recorded_at,
            recorded_at_field_name: None,
        }
    }

    pub fn with_field_name(mut self, field: &str) -> Self {
        self.recorded_at_field_name = Some(field.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WatermarkKey {
    pub integration_id: String,
    pub stream: String,
    pub source_id: Option<String>,
}

impl WatermarkKey {
    pub fn for_source(integration_id: &str, stream: &str, source_id: &str) -> Self {
        Self {
            integration_id: integration_id.to_string(),
            stream: stream.to_string(),
            source_id: Some(source_id.to_string()),
        }
    }
}

impl fmt::Display for WatermarkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state.{}.{}.{}",
            self.integration_id,
            self.stream,
            self.source_id.as_deref().unwrap_or(DEFAULT_SOURCE)
        )
    }
}
