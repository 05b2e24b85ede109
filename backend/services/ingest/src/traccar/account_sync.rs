use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::client::TrackingApi;
use super::config::FanOutMode;
use super::device_sync::DeviceSync;
use super::models::RecordedAtField;
use crate::connector::{Connector, SyncResult};
use crate::dispatch::{DeviceWorkUnit, WorkDispatcher};
use crate::error::SyncError;

const SOURCE_NAME: &str = "traccar";

/// How an account cycle hands devices to the per-device cycle.
pub enum FanOut {
    /// Run every device here, one after another.
    Inline {
        syncer: Arc<dyn DeviceSync>,
        device_delay: Duration,
    },
    /// Publish one work unit per device for workers to pick up.
    Dispatched {
        dispatcher: Arc<dyn WorkDispatcher>,
        batch_size: usize,
        batch_delay: Duration,
    },
}

impl FanOut {
    pub fn mode(&self) -> FanOutMode {
        match self {
            FanOut::Inline { .. } => FanOutMode::Inline,
            FanOut::Dispatched { .. } => FanOutMode::Dispatched,
        }
    }
}

pub struct AccountSyncer<A: TrackingApi> {
    api: Arc<A>,
    integration_id: String,
    field: RecordedAtField,
    fan_out: FanOut,
}

impl<A: TrackingApi> AccountSyncer<A> {
    pub fn new(api: Arc<A>, integration_id: String, field: RecordedAtField, fan_out: FanOut) -> Self {
        Self {
            api,
            integration_id,
            field,
            fan_out,
        }
    }

    async fn run_inline(
        &self,
        units: &[DeviceWorkUnit],
        syncer: &dyn DeviceSync,
        device_delay: Duration,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        for (i, unit) in units.iter().enumerate() {
            if i > 0 && !device_delay.is_zero() {
                tokio::time::sleep(device_delay).await;
            }

            match syncer.sync_device(unit).await {
                Ok(device_result) => result.absorb(&device_result),
                Err(e) if e.aborts_account() => return Err(e),
                Err(e) => {
                    tracing::error!(
                        device_id = %unit.device_id,
                        integration_id = %self.integration_id,
                        kind = e.kind(),
                        error = %e,
                        needs_attention = true,
                        "device sync failed"
                    );
                    result.errors += 1;
                }
            }
        }
        Ok(())
    }

    async fn run_dispatched(
        &self,
        units: &[DeviceWorkUnit],
        dispatcher: &dyn WorkDispatcher,
        batch_size: usize,
        batch_delay: Duration,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        for (i, batch) in units.chunks(batch_size.max(1)).enumerate() {
            if i > 0 && !batch_delay.is_zero() {
                tokio::time::sleep(batch_delay).await;
            }

            tracing::info!(batch = i, size = batch.len(), "publishing work unit batch");
            for unit in batch {
                let id = dispatcher.publish(unit).await.map_err(|e| {
                    tracing::error!(
                        device_id = %unit.device_id,
                        integration_id = %self.integration_id,
                        error = %e,
                        needs_attention = true,
                        "failed to publish work unit"
                    );
                    e
                })?;
                tracing::debug!(device_id = %unit.device_id, entry_id = %id, "work unit published");
                result.dispatched += 1;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<A: TrackingApi> Connector for AccountSyncer<A> {
    fn source_name(&self) -> &str {
        SOURCE_NAME
    }

    async fn sync(&self) -> Result<SyncResult, SyncError> {
        let devices = self.api.list_devices().await.map_err(|e| {
            tracing::error!(
                integration_id = %self.integration_id,
                error = %e,
                needs_attention = true,
                "failed to enumerate devices"
            );
            SyncError::from(e)
        })?;

        tracing::info!(
            integration_id = %self.integration_id,
            devices = devices.len(),
            mode = %self.fan_out.mode(),
            "devices enumerated"
        );

        let units: Vec<DeviceWorkUnit> = devices
            .iter()
            .map(|d| DeviceWorkUnit::for_device(d, self.field))
            .collect();

        let mut result = SyncResult::empty(SOURCE_NAME);
        result.devices = units.len();

        match &self.fan_out {
            FanOut::Inline {
                syncer,
                device_delay,
            } => {
                self.run_inline(&units, syncer.as_ref(), *device_delay, &mut result)
                    .await?
            }
            FanOut::Dispatched {
                dispatcher,
                batch_size,
                batch_delay,
            } => {
                self.run_dispatched(
                    &units,
                    dispatcher.as_ref(),
                    *batch_size,
                    *batch_delay,
                    &mut result,
                )
                .await?
            }
        }

        tracing::info!(
            integration_id = %self.integration_id,
            devices = result.devices,
            delivered = result.delivered,
            dispatched = result.dispatched,
            errors = result.errors,
            "account sync completed"
        );

        Ok(result)
    }
}
