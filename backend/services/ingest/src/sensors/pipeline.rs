//! Batched delivery to the sensors API with watermark commits.
//!
//! Input must be ascending by `recorded_at` (sequencer output). Under
//! [`CommitPolicy::PerBatch`] batches go out oldest first and the watermark
//! follows each accepted batch, so a failure part-way leaves everything up
//! to the last accepted batch committed. Under [`CommitPolicy::PerRun`]
//! batches go out newest first and nothing is committed unless all of them
//! were accepted.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use trackrelay_common::retry::{with_retry, RetryPolicy};
use trackrelay_db::watermark::models::{Watermark, WatermarkKey};
use trackrelay_db::watermark::repositories::WatermarkRepository;

use super::client::{ObservationSink, SensorsClientError};
use super::models::Observation;
use crate::error::SyncError;
use crate::traccar::config::CommitPolicy;
use crate::traccar::models::RecordedAtField;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub batches: usize,
    /// Watermark in the store after this run.
    pub committed: Option<DateTime<Utc>>,
}

pub struct DeliveryPipeline<K: ObservationSink, W: WatermarkRepository> {
    sink: Arc<K>,
    store: Arc<W>,
    integration_id: String,
    batch_size: usize,
    policy: CommitPolicy,
    retry: RetryPolicy,
}

impl<K: ObservationSink, W: WatermarkRepository> DeliveryPipeline<K, W> {
    pub fn new(
        sink: Arc<K>,
        store: Arc<W>,
        integration_id: String,
        batch_size: usize,
        policy: CommitPolicy,
    ) -> Self {
        Self {
            sink,
            store,
            integration_id,
            batch_size: batch_size.max(1),
            policy,
            retry: RetryPolicy::delivery(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deliver `observations` and advance the watermark at `key`.
    ///
    /// `committed` is the watermark read at the start of the cycle; nothing
    /// at or before it is ever written back.
    pub async fn deliver(
        &self,
        key: &WatermarkKey,
        field: RecordedAtField,
        observations: &[Observation],
        committed: Option<DateTime<Utc>>,
    ) -> Result<DeliveryReport, SyncError> {
        let mut report = DeliveryReport {
            committed,
            ..Default::default()
        };

        if observations.is_empty() {
            return Ok(report);
        }

        let batches: Vec<&[Observation]> = observations.chunks(self.batch_size).collect();

        match self.policy {
            CommitPolicy::PerBatch => {
                for (index, batch) in batches.iter().enumerate() {
                    self.send_batch(index, batch).await?;
                    report.delivered += batch.len();
                    report.batches += 1;

                    if let Some(latest) = batch.iter().map(|o| o.recorded_at).max() {
                        self.commit(key, field, latest, &mut report.committed)
                            .await?;
                    }
                }
            }
            CommitPolicy::PerRun => {
                for (index, batch) in batches.iter().enumerate().rev() {
                    self.send_batch(index, batch).await?;
                    report.delivered += batch.len();
                    report.batches += 1;
                }

                if let Some(newest) = observations.iter().map(|o| o.recorded_at).max() {
                    self.commit(key, field, newest, &mut report.committed)
                        .await?;
                }
            }
        }

        Ok(report)
    }

    async fn send_batch(&self, index: usize, batch: &[Observation]) -> Result<(), SyncError> {
        with_retry(
            &self.retry,
            "deliver_observations",
            |_: &SensorsClientError| true,
            || self.sink.send_observations(&self.integration_id, batch),
        )
        .await
        .map_err(|e| {
            let attempts = e.attempts();
            let reason = e.into_inner().to_string();
            tracing::error!(
                batch = index,
                count = batch.len(),
                attempts,
                error = %reason,
                needs_attention = true,
                "observation delivery failed"
            );
            SyncError::Delivery {
                batch: index,
                attempts,
                reason,
            }
        })?;

        tracing::info!(batch = index, count = batch.len(), "observation batch delivered");
        Ok(())
    }

    async fn commit(
        &self,
        key: &WatermarkKey,
        field: RecordedAtField,
        candidate: DateTime<Utc>,
        high_water: &mut Option<DateTime<Utc>>,
    ) -> Result<(), SyncError> {
        if high_water.is_some_and(|hw| candidate <= hw) {
            tracing::debug!(
                key = %key,
                candidate = %candidate,
                "watermark not advanced, candidate is not newer"
            );
            return Ok(());
        }

        let watermark = Watermark::new(candidate).with_field_name(field.as_str());
        self.store.set(key, &watermark, None).await?;
        *high_water = Some(candidate);

        tracing::info!(key = %key, recorded_at = %candidate, "watermark advanced");
        Ok(())
    }
}
