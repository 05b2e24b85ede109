use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A device from the Traccar REST API (`/api/devices`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraccarDevice {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    pub unique_id: Option<String>,
    pub status: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl TraccarDevice {
    pub fn source_id(&self) -> String {
        self.id.to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAttributes {
    pub battery: Option<f64>,
    pub distance: Option<f64>,
    pub ip: Option<String>,
    pub total_distance: Option<f64>,
}

/// A position report from `/api/positions`.
///
/// One physical fix is often reported several times with the same `fix_time`
/// (retransmissions); see [`crate::traccar::sequencer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraccarPosition {
    pub device_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub device_id: i64,
    pub accuracy: Option<f64>,
    pub address: Option<serde_json::Value>,
    pub altitude: Option<f64>,
    pub attributes: Option<PositionAttributes>,
    pub course: Option<f64>,
    pub fix_time: Option<DateTime<Utc>>,
    pub id: Option<i64>,
    pub network: Option<serde_json::Value>,
    pub outdated: Option<bool>,
    pub protocol: Option<String>,
    pub server_time: Option<DateTime<Utc>>,
    pub speed: Option<f64>,
    #[serde(rename = "type")]
    pub kind: Option<serde_json::Value>,
    pub valid: Option<bool>,
}

impl TraccarPosition {
    /// The timestamp used for ordering and watermark comparison.
    pub fn primary_time(&self, field: RecordedAtField) -> Option<DateTime<Utc>> {
        match field {
            RecordedAtField::FixTime => self.fix_time,
            RecordedAtField::ServerTime => self.server_time,
        }
    }

    pub fn radio_type(&self) -> Option<&str> {
        self.network
            .as_ref()
            .and_then(|n| n.get("radioType"))
            .and_then(|v| v.as_str())
    }
}

/// Which position timestamp becomes the observation's `recorded_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RecordedAtField {
    #[default]
    #[serde(rename = "fixTime")]
    FixTime,
    #[serde(rename = "serverTime")]
    ServerTime,
}

impl RecordedAtField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordedAtField::FixTime => "fixTime",
            RecordedAtField::ServerTime => "serverTime",
        }
    }
}

impl fmt::Display for RecordedAtField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordedAtField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "fixTime" => Ok(RecordedAtField::FixTime),
            "serverTime" => Ok(RecordedAtField::ServerTime),
            other => Err(format!(
                "unknown recorded_at field '{other}' (expected fixTime or serverTime)"
            )),
        }
    }
}
