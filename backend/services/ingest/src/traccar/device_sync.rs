use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map};

use trackrelay_common::error::RelayError;
use trackrelay_db::watermark::models::WatermarkKey;
use trackrelay_db::watermark::repositories::WatermarkRepository;

use super::client::TrackingApi;
use super::config::PullObservationsPerDeviceConfig;
use super::models::{RecordedAtField, TraccarPosition};
use super::sequencer::sequence_positions;
use crate::connector::SyncResult;
use crate::dispatch::DeviceWorkUnit;
use crate::error::SyncError;
use crate::sensors::client::ObservationSink;
use crate::sensors::models::{Location, Observation, OBSERVATION_TYPE};
use crate::sensors::pipeline::DeliveryPipeline;

/// Stream segment of every per-device watermark key.
pub const STREAM_NAME: &str = "pull_observations";

/// Convert a sequenced position into the downstream observation shape.
///
/// Returns `None` if the position has no value for `field`.
pub fn position_to_observation(
    unit: &DeviceWorkUnit,
    position: &TraccarPosition,
    field: RecordedAtField,
) -> Option<Observation> {
    let recorded_at = position.primary_time(field)?;

    let mut additional = Map::new();
    additional.insert("accuracy".into(), json!(position.accuracy));
    additional.insert("address".into(), json!(position.address));
    additional.insert("altitude".into(), json!(position.altitude));
    additional.insert("radio_type".into(), json!(position.radio_type()));
    additional.insert("course".into(), json!(position.course));
    additional.insert("id".into(), json!(position.id));
    additional.insert("protocol".into(), json!(position.protocol));
    additional.insert("serverTime".into(), json!(position.server_time));
    additional.insert("fixTime".into(), json!(position.fix_time));
    additional.insert("speed".into(), json!(position.speed));

    Some(Observation {
        source: unit.device_id.clone(),
        source_name: unit.device_name.clone(),
        kind: OBSERVATION_TYPE.to_string(),
        recorded_at,
        location: Location {
            lat: position.latitude,
            lon: position.longitude,
        },
        additional,
    })
}

/// One device's fetch → sequence → deliver cycle.
#[async_trait]
pub trait DeviceSync: Send + Sync {
    async fn sync_device(&self, unit: &DeviceWorkUnit) -> Result<SyncResult, SyncError>;
}

pub struct DeviceSyncer<A: TrackingApi, K: ObservationSink, W: WatermarkRepository> {
    api: Arc<A>,
    store: Arc<W>,
    pipeline: DeliveryPipeline<K, W>,
    integration_id: String,
    lookback: Duration,
}

impl<A, K, W> DeviceSyncer<A, K, W>
where
    A: TrackingApi,
    K: ObservationSink,
    W: WatermarkRepository,
{
    pub fn new(
        api: Arc<A>,
        sink: Arc<K>,
        store: Arc<W>,
        integration_id: String,
        config: &PullObservationsPerDeviceConfig,
    ) -> Self {
        let pipeline = DeliveryPipeline::new(
            sink,
            store.clone(),
            integration_id.clone(),
            config.observations_per_request,
            config.commit_policy,
        );
        Self {
            api,
            store,
            pipeline,
            integration_id,
            lookback: config.lookback,
        }
    }

    #[cfg(test)]
    pub fn with_delivery_retry(mut self, retry: trackrelay_common::retry::RetryPolicy) -> Self {
        self.pipeline = self.pipeline.with_retry_policy(retry);
        self
    }

    /// Stored watermark, or `None` when absent or unreadable.
    async fn committed_watermark(
        &self,
        key: &WatermarkKey,
    ) -> Result<Option<DateTime<Utc>>, SyncError> {
        match self.store.get(key).await {
            Ok(wm) => Ok(wm.map(|w| w.recorded_at)),
            Err(RelayError::InvalidPersistedState(reason)) => {
                tracing::warn!(
                    key = %key,
                    reason = %reason,
                    "invalid device state, falling back to lookback window"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<A, K, W> DeviceSync for DeviceSyncer<A, K, W>
where
    A: TrackingApi,
    K: ObservationSink,
    W: WatermarkRepository,
{
    async fn sync_device(&self, unit: &DeviceWorkUnit) -> Result<SyncResult, SyncError> {
        let device_id = unit.device_id.as_str();
        let field = unit.recorded_at_field_name;
        let key = WatermarkKey::for_source(&self.integration_id, STREAM_NAME, device_id);

        let mut result = SyncResult::empty(STREAM_NAME);
        result.devices = 1;

        let committed = self.committed_watermark(&key).await?;
        let floor = Utc::now()
            .checked_sub_signed(self.lookback)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = committed.map_or(floor, |wm| wm.max(floor));

        tracing::info!(
            device_id,
            device_name = %unit.device_name,
            start = %start,
            field = %field,
            "pulling observations for device"
        );

        let positions = match self.api.fetch_since(device_id, start).await {
            Ok(p) => p,
            Err(e) => {
                tracing::error!(
                    device_id,
                    integration_id = %self.integration_id,
                    error = %e,
                    needs_attention = true,
                    "failed to fetch positions, treating device as empty"
                );
                result.errors = 1;
                return Ok(result);
            }
        };
        result.extracted = positions.len();

        // Records older than the fetch bound are dropped even if the tracker
        // backdated them; `committed` only guards the watermark write.
        let sequenced = sequence_positions(positions, Some(start), field);
        result.skipped = sequenced.dropped;

        let observations: Vec<Observation> = sequenced
            .positions
            .iter()
            .filter_map(|p| position_to_observation(unit, p, field))
            .collect();

        if observations.is_empty() {
            tracing::info!(device_id, extracted = result.extracted, "no new observations for device");
            return Ok(result);
        }

        let report = self
            .pipeline
            .deliver(&key, field, &observations, committed)
            .await?;
        result.delivered = report.delivered;

        tracing::info!(
            device_id,
            extracted = result.extracted,
            delivered = result.delivered,
            skipped = result.skipped,
            batches = report.batches,
            "device sync completed"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{device, position, MockSink, MockStore, MockTrackingApi};
    use crate::traccar::config::CommitPolicy;
    use std::collections::HashSet;

    fn unit(id: i64) -> DeviceWorkUnit {
        DeviceWorkUnit::for_device(&device(id), RecordedAtField::FixTime)
    }

    fn key(id: &str) -> WatermarkKey {
        WatermarkKey::for_source("int-1", STREAM_NAME, id)
    }

    /// Whole-minute instant so comparisons survive second truncation.
    fn base() -> DateTime<Utc> {
        let now = Utc::now() - Duration::hours(3);
        DateTime::from_timestamp(now.timestamp() - now.timestamp() % 60, 0).unwrap()
    }

    fn syncer(
        api: MockTrackingApi,
        sink: &Arc<MockSink>,
        store: &Arc<MockStore>,
        batch: usize,
        policy: CommitPolicy,
    ) -> DeviceSyncer<MockTrackingApi, MockSink, MockStore> {
        let config = PullObservationsPerDeviceConfig {
            observations_per_request: batch,
            lookback: Duration::hours(24),
            commit_policy: policy,
        };
        DeviceSyncer::new(Arc::new(api), sink.clone(), store.clone(), "int-1".into(), &config)
            .with_delivery_retry(trackrelay_common::retry::RetryPolicy::fixed(
                3,
                std::time::Duration::from_millis(1),
            ))
    }

    #[tokio::test]
    async fn first_run_collapses_duplicates_and_commits_latest() {
        let t0 = base();
        let t5 = t0 + Duration::minutes(5);
        let api = MockTrackingApi::default().with_positions(
            "7",
            vec![position(7, 1, t0), position(7, 2, t0), position(7, 3, t5)],
        );
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());

        let result = syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap();

        assert_eq!(result.extracted, 3);
        assert_eq!(result.delivered, 2);
        assert_eq!(result.skipped, 1);
        assert_eq!(result.errors, 0);
        let times: Vec<_> = sink.delivered().iter().map(|o| o.recorded_at).collect();
        assert_eq!(times, vec![t0, t5]);
        assert_eq!(store.stored(&key("7")), Some(t5));
    }

    #[tokio::test]
    async fn first_run_fetches_from_lookback_floor() {
        let api = Arc::new(MockTrackingApi::default());
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        let config = PullObservationsPerDeviceConfig::default();
        let syncer = DeviceSyncer::new(api.clone(), sink, store, "int-1".into(), &config);

        let before = Utc::now();
        syncer.sync_device(&unit(7)).await.unwrap();

        let lower = api.fetches.lock().unwrap()[0].1;
        let expected = before - Duration::hours(24);
        assert!((lower - expected).num_seconds().abs() <= 2, "lower bound {lower}");
    }

    #[tokio::test]
    async fn drops_records_older_than_lookback_bound() {
        let now = Utc::now();
        let mut backdated = position(7, 1, now - Duration::hours(48));
        backdated.device_time = now - Duration::hours(1);
        let fresh = position(7, 2, now - Duration::minutes(30));
        let api = MockTrackingApi::default().with_positions("7", vec![backdated, fresh]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());

        let result = syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap();

        assert_eq!(result.extracted, 2);
        assert_eq!(result.delivered, 1);
        assert_eq!(result.skipped, 1);
        let delivered = sink.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].additional["id"], 2);
        assert!(delivered[0].recorded_at > now - Duration::hours(24));
    }

    #[tokio::test]
    async fn stale_watermark_does_not_let_old_records_through() {
        let now = Utc::now();
        let mut backdated = position(7, 1, now - Duration::hours(30));
        backdated.device_time = now - Duration::minutes(10);
        let api = MockTrackingApi::default().with_positions("7", vec![backdated]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        store.seed(&key("7"), now - Duration::days(3));

        let result = syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap();

        assert_eq!(result.delivered, 0);
        assert_eq!(result.skipped, 1);
        assert!(store.set_times().is_empty());
    }

    #[tokio::test]
    async fn resumes_from_watermark() {
        let t0 = base();
        let wm = t0 + Duration::minutes(60);
        let api = MockTrackingApi::default().with_positions(
            "7",
            vec![
                position(7, 1, t0),
                position(7, 2, wm + Duration::minutes(30)),
            ],
        );
        let api = Arc::new(api);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        store.seed(&key("7"), wm);

        let config = PullObservationsPerDeviceConfig::default();
        let syncer = DeviceSyncer::new(api.clone(), sink.clone(), store.clone(), "int-1".into(), &config);
        let result = syncer.sync_device(&unit(7)).await.unwrap();

        assert_eq!(result.delivered, 1);
        assert_eq!(api.fetches.lock().unwrap()[0].1, wm);
        assert_eq!(store.stored(&key("7")), Some(wm + Duration::minutes(30)));
    }

    #[tokio::test]
    async fn stale_watermark_is_clamped_to_lookback() {
        let api = Arc::new(MockTrackingApi::default());
        let store = Arc::new(MockStore::default());
        store.seed(&key("7"), Utc::now() - Duration::days(10));

        let config = PullObservationsPerDeviceConfig::default();
        let syncer = DeviceSyncer::new(
            api.clone(),
            Arc::new(MockSink::default()),
            store,
            "int-1".into(),
            &config,
        );
        syncer.sync_device(&unit(7)).await.unwrap();

        let lower = api.fetches.lock().unwrap()[0].1;
        assert!(lower > Utc::now() - Duration::hours(25));
    }

    #[tokio::test]
    async fn huge_lookback_saturates_instead_of_panicking() {
        let api = Arc::new(MockTrackingApi::default());
        let config = PullObservationsPerDeviceConfig {
            lookback: Duration::try_hours(2_500_000_000).unwrap(),
            ..Default::default()
        };
        let syncer = DeviceSyncer::new(
            api.clone(),
            Arc::new(MockSink::default()),
            Arc::new(MockStore::default()),
            "int-1".into(),
            &config,
        );
        syncer.sync_device(&unit(7)).await.unwrap();

        assert_eq!(api.fetches.lock().unwrap()[0].1, DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn corrupt_state_falls_back_and_recovers() {
        let t0 = base();
        let api = MockTrackingApi::default().with_positions("7", vec![position(7, 1, t0)]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        store.mark_corrupt(&key("7"));

        let result = syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap();

        assert_eq!(result.delivered, 1);
        assert_eq!(store.stored(&key("7")), Some(t0));
    }

    #[tokio::test]
    async fn store_unavailable_is_fatal() {
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        store.go_down();

        let err = syncer(MockTrackingApi::default(), &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "store_unavailable");
    }

    #[tokio::test]
    async fn fetch_failure_counts_error_without_touching_state() {
        let t0 = base();
        let api = MockTrackingApi {
            failing_devices: HashSet::from(["7".to_string()]),
            ..Default::default()
        };
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        store.seed(&key("7"), t0);

        let result = syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit(7))
            .await
            .unwrap();

        assert_eq!(result.errors, 1);
        assert_eq!(result.delivered, 0);
        assert_eq!(*sink.calls.lock().unwrap(), 0);
        assert!(store.set_times().is_empty());
    }

    #[tokio::test]
    async fn rerun_with_same_data_delivers_nothing() {
        let t0 = base();
        let positions = vec![
            position(7, 1, t0),
            position(7, 2, t0 + Duration::minutes(1)),
        ];
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        let syncer = syncer(
            MockTrackingApi::default().with_positions("7", positions),
            &sink,
            &store,
            500,
            CommitPolicy::PerBatch,
        );

        syncer.sync_device(&unit(7)).await.unwrap();
        let second = syncer.sync_device(&unit(7)).await.unwrap();

        assert_eq!(second.delivered, 0);
        assert_eq!(sink.delivered().len(), 2);
        assert_eq!(store.set_times().len(), 1);
    }

    #[tokio::test]
    async fn per_batch_delivery_failure_keeps_partial_progress() {
        let t0 = base();
        let positions = (0..5)
            .map(|i| position(7, i, t0 + Duration::minutes(i)))
            .collect();
        let sink = Arc::new(MockSink::failing_from(2));
        let store = Arc::new(MockStore::default());

        let err = syncer(
            MockTrackingApi::default().with_positions("7", positions),
            &sink,
            &store,
            2,
            CommitPolicy::PerBatch,
        )
        .sync_device(&unit(7))
        .await
        .unwrap_err();

        assert!(matches!(err, SyncError::Delivery { batch: 2, .. }));
        assert_eq!(store.stored(&key("7")), Some(t0 + Duration::minutes(3)));
    }

    #[tokio::test]
    async fn uses_server_time_when_configured() {
        let t0 = base();
        let api = MockTrackingApi::default().with_positions("7", vec![position(7, 1, t0)]);
        let sink = Arc::new(MockSink::default());
        let store = Arc::new(MockStore::default());
        let unit = DeviceWorkUnit::for_device(&device(7), RecordedAtField::ServerTime);

        syncer(api, &sink, &store, 500, CommitPolicy::PerBatch)
            .sync_device(&unit)
            .await
            .unwrap();

        let server_time = t0 + Duration::seconds(3);
        assert_eq!(sink.delivered()[0].recorded_at, server_time);
        let stored = store.values.lock().unwrap().get(&key("7").to_string()).cloned();
        let stored = stored.unwrap();
        assert_eq!(stored.recorded_at, server_time);
        assert_eq!(stored.recorded_at_field_name.as_deref(), Some("serverTime"));
    }

    #[test]
    fn transform_carries_passthrough_attributes() {
        let t0 = base();
        let mut p = position(7, 99, t0);
        p.network = Some(json!({ "radioType": "lte" }));

        let obs = position_to_observation(&unit(7), &p, RecordedAtField::FixTime).unwrap();
        assert_eq!(obs.source, "7");
        assert_eq!(obs.source_name, "Device 7");
        assert_eq!(obs.kind, "tracking-device");
        assert_eq!(obs.recorded_at, t0);
        assert_eq!(obs.additional["radio_type"], "lte");
        assert_eq!(obs.additional["id"], 99);
        assert_eq!(obs.additional["protocol"], "osmand");
        assert!(obs.additional.contains_key("serverTime"));
        assert!(obs.additional["address"].is_null());
    }

    #[test]
    fn transform_skips_missing_primary_time() {
        let mut p = position(7, 1, base());
        p.server_time = None;
        assert!(position_to_observation(&unit(7), &p, RecordedAtField::ServerTime).is_none());
    }
}
