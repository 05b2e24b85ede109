//! Worker loop: read work units, run the device cycle, acknowledge.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{DeviceWorkUnit, DispatchError};
use crate::connector::SyncResult;
use crate::traccar::device_sync::DeviceSync;

/// One entry read from the work stream.
#[derive(Debug)]
pub struct StreamEntry {
    pub id: String,
    /// `Err` when the payload could not be decoded.
    pub unit: Result<DeviceWorkUnit, DispatchError>,
    /// Times the entry has been handed to a consumer, this read included.
    pub deliveries: usize,
}

#[async_trait]
pub trait WorkSource: Send {
    /// Block until entries arrive or the read times out (empty vec).
    async fn next_batch(&mut self) -> Result<Vec<StreamEntry>, DispatchError>;
    async fn ack(&mut self, id: &str) -> Result<(), DispatchError>;
    async fn reconnect(&mut self) -> Result<(), DispatchError>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub acked: usize,
    /// Left pending for redelivery.
    pub failed: usize,
    /// Undecodable entries, acknowledged and dropped.
    pub discarded: usize,
    /// Failed on their last allowed delivery, acknowledged and dropped.
    pub abandoned: usize,
    pub totals: SyncResult,
}

pub struct Worker<S: WorkSource> {
    source: S,
    syncer: Arc<dyn DeviceSync>,
    max_deliveries: usize,
}

impl<S: WorkSource> Worker<S> {
    pub fn new(source: S, syncer: Arc<dyn DeviceSync>, max_deliveries: usize) -> Self {
        Self {
            source,
            syncer,
            max_deliveries: max_deliveries.max(1),
        }
    }

    /// Process one read from the stream.
    pub async fn process_batch(&mut self) -> Result<BatchOutcome, DispatchError> {
        let entries = self.source.next_batch().await?;
        let mut outcome = BatchOutcome::default();

        for entry in entries {
            let unit = match entry.unit {
                Ok(unit) => unit,
                Err(e) => {
                    tracing::error!(
                        entry_id = %entry.id,
                        error = %e,
                        needs_attention = true,
                        "discarding undecodable work unit"
                    );
                    self.source.ack(&entry.id).await?;
                    outcome.discarded += 1;
                    continue;
                }
            };

            match self.syncer.sync_device(&unit).await {
                Ok(result) => {
                    self.source.ack(&entry.id).await?;
                    outcome.totals.absorb(&result);
                    outcome.acked += 1;
                }
                Err(e) if entry.deliveries >= self.max_deliveries => {
                    tracing::error!(
                        entry_id = %entry.id,
                        device_id = %unit.device_id,
                        deliveries = entry.deliveries,
                        kind = e.kind(),
                        error = %e,
                        needs_attention = true,
                        "device sync failed on last delivery, dropping work unit"
                    );
                    self.source.ack(&entry.id).await?;
                    outcome.abandoned += 1;
                }
                Err(e) => {
                    tracing::error!(
                        entry_id = %entry.id,
                        device_id = %unit.device_id,
                        deliveries = entry.deliveries,
                        kind = e.kind(),
                        error = %e,
                        needs_attention = true,
                        "device sync failed, leaving work unit pending"
                    );
                    outcome.failed += 1;
                }
            }
        }

        Ok(outcome)
    }

    /// Consume until `shutdown` resolves. Redis errors trigger a reconnect.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: std::future::Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        tracing::info!("worker started");

        loop {
            let outcome = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("worker shutting down");
                    return;
                }
                outcome = self.process_batch() => outcome,
            };

            match outcome {
                Ok(o) if o.acked + o.failed + o.discarded + o.abandoned > 0 => {
                    tracing::info!(
                        acked = o.acked,
                        failed = o.failed,
                        discarded = o.discarded,
                        abandoned = o.abandoned,
                        delivered = o.totals.delivered,
                        "work batch processed"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "work stream error, reconnecting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    if let Err(e) = self.source.reconnect().await {
                        tracing::error!(error = %e, "failed to reconnect to work stream");
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        }
    }
}
