use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Value of `type` on every observation this relay produces.
pub const OBSERVATION_TYPE: &str = "tracking-device";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

/// One normalized record as accepted by `POST /v2/observations/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub source: String,
    pub source_name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub recorded_at: DateTime<Utc>,
    pub location: Location,
    /// Passthrough attributes from the raw position.
    #[serde(default)]
    pub additional: serde_json::Map<String, serde_json::Value>,
}
