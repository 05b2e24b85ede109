use async_trait::async_trait;
use serde::Serialize;

use crate::error::SyncError;

/// Counts reported by one sync cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub source: String,
    /// Devices enumerated (account cycle) or 1 (device cycle).
    pub devices: usize,
    /// Raw positions fetched from the tracking API.
    pub extracted: usize,
    pub delivered: usize,
    /// Positions dropped by deduplication.
    pub skipped: usize,
    pub errors: usize,
    /// Work units published instead of syncing inline.
    pub dispatched: usize,
}

impl SyncResult {
    pub fn empty(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    /// Fold a device-level result into an account-level total.
    pub fn absorb(&mut self, other: &SyncResult) {
        self.extracted += other.extracted;
        self.delivered += other.delivered;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    fn source_name(&self) -> &str;
    async fn sync(&self) -> Result<SyncResult, SyncError>;
}
