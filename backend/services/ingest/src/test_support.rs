//! In-memory doubles for the store, the tracking API, the sink and the bus.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::StatusCode;

use trackrelay_common::error::{RelayError, RelayResult};
use trackrelay_db::watermark::models::{Watermark, WatermarkKey};
use trackrelay_db::watermark::repositories::WatermarkRepository;

use crate::dispatch::{DeviceWorkUnit, DispatchError, WorkDispatcher};
use crate::sensors::client::{ObservationSink, SensorsClientError};
use crate::sensors::models::Observation;
use crate::traccar::client::{TraccarClientError, TrackingApi};
use crate::traccar::models::{TraccarDevice, TraccarPosition};

pub fn position(device_id: i64, id: i64, fix: DateTime<Utc>) -> TraccarPosition {
    TraccarPosition {
        device_time: fix,
        latitude: 1.0 + id as f64 / 1000.0,
        longitude: 2.0,
        device_id,
        accuracy: Some(5.0),
        address: None,
        altitude: Some(10.0),
        attributes: None,
        course: Some(0.0),
        fix_time: Some(fix),
        id: Some(id),
        network: None,
        outdated: Some(false),
        protocol: Some("osmand".into()),
        server_time: Some(fix + Duration::seconds(3)),
        speed: Some(0.0),
        kind: None,
        valid: Some(true),
    }
}

pub fn device(id: i64) -> TraccarDevice {
    TraccarDevice {
        id,
        name: format!("Device {id}"),
        unique_id: None,
        status: None,
        last_update: None,
    }
}

// ── Watermark store ──

#[derive(Default)]
pub struct MockStore {
    pub values: Mutex<HashMap<String, Watermark>>,
    /// Every successful `set`, in call order.
    pub sets: Mutex<Vec<(String, DateTime<Utc>)>>,
    pub corrupt: Mutex<HashSet<String>>,
    pub unavailable: Mutex<bool>,
    pub deletes: Mutex<Vec<String>>,
}

impl MockStore {
    pub fn seed(&self, key: &WatermarkKey, recorded_at: DateTime<Utc>) {
        self.values
            .lock()
            .unwrap()
            .insert(key.to_string(), Watermark::new(recorded_at));
    }

    pub fn mark_corrupt(&self, key: &WatermarkKey) {
        self.corrupt.lock().unwrap().insert(key.to_string());
    }

    pub fn go_down(&self) {
        *self.unavailable.lock().unwrap() = true;
    }

    pub fn stored(&self, key: &WatermarkKey) -> Option<DateTime<Utc>> {
        self.values
            .lock()
            .unwrap()
            .get(&key.to_string())
            .map(|w| w.recorded_at)
    }

    pub fn set_times(&self) -> Vec<DateTime<Utc>> {
        self.sets.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    fn check_up(&self) -> RelayResult<()> {
        if *self.unavailable.lock().unwrap() {
            return Err(RelayError::StoreUnavailable("mock store down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkRepository for MockStore {
    async fn get(&self, key: &WatermarkKey) -> RelayResult<Option<Watermark>> {
        self.check_up()?;
        let k = key.to_string();
        if self.corrupt.lock().unwrap().contains(&k) {
            return Err(RelayError::InvalidPersistedState(format!("{k}: bad json")));
        }
        Ok(self.values.lock().unwrap().get(&k).cloned())
    }

    async fn set(
        &self,
        key: &WatermarkKey,
        watermark: &Watermark,
        _ttl_secs: Option<u64>,
    ) -> RelayResult<()> {
        self.check_up()?;
        let k = key.to_string();
        self.corrupt.lock().unwrap().remove(&k);
        self.sets
            .lock()
            .unwrap()
            .push((k.clone(), watermark.recorded_at));
        self.values.lock().unwrap().insert(k, watermark.clone());
        Ok(())
    }

    async fn delete(&self, key: &WatermarkKey) -> RelayResult<()> {
        self.check_up()?;
        let k = key.to_string();
        self.values.lock().unwrap().remove(&k);
        self.deletes.lock().unwrap().push(k);
        Ok(())
    }
}

// ── Observation sink ──

#[derive(Default)]
pub struct MockSink {
    /// Batches accepted, in call order.
    pub batches: Mutex<Vec<Vec<Observation>>>,
    pub calls: Mutex<usize>,
    /// Calls with a 0-based index in this set fail.
    pub failing_calls: Mutex<HashSet<usize>>,
    /// When set, every call from this index onward fails.
    pub fail_from: Mutex<Option<usize>>,
}

impl MockSink {
    pub fn failing_from(call: usize) -> Self {
        let sink = Self::default();
        *sink.fail_from.lock().unwrap() = Some(call);
        sink
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().unwrap().iter().map(Vec::len).collect()
    }

    pub fn delivered(&self) -> Vec<Observation> {
        self.batches.lock().unwrap().iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl ObservationSink for MockSink {
    async fn send_observations(
        &self,
        _integration_id: &str,
        batch: &[Observation],
    ) -> Result<(), SensorsClientError> {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let current = *calls;
            *calls += 1;
            current
        };

        let from = *self.fail_from.lock().unwrap();
        let failing = self.failing_calls.lock().unwrap().contains(&call)
            || from.is_some_and(|f| call >= f);
        if failing {
            return Err(SensorsClientError::HttpError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                body: "sink failure".into(),
            });
        }

        self.batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}

// ── Tracking API ──

#[derive(Default)]
pub struct MockTrackingApi {
    pub devices: Vec<TraccarDevice>,
    pub positions: HashMap<String, Vec<TraccarPosition>>,
    pub failing_devices: HashSet<String>,
    pub enumeration_fails: bool,
    /// `(device_id, lower_bound)` for every fetch.
    pub fetches: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl MockTrackingApi {
    pub fn with_positions(mut self, device_id: &str, positions: Vec<TraccarPosition>) -> Self {
        self.positions.insert(device_id.to_string(), positions);
        self
    }

    pub fn fetched_devices(&self) -> Vec<String> {
        self.fetches
            .lock()
            .unwrap()
            .iter()
            .map(|(d, _)| d.clone())
            .collect()
    }
}

#[async_trait]
impl TrackingApi for MockTrackingApi {
    async fn list_devices(&self) -> Result<Vec<TraccarDevice>, TraccarClientError> {
        if self.enumeration_fails {
            return Err(TraccarClientError::Unavailable {
                attempts: 5,
                last_error: "HTTP 503".into(),
            });
        }
        Ok(self.devices.clone())
    }

    async fn fetch_since(
        &self,
        device_id: &str,
        lower_bound: DateTime<Utc>,
    ) -> Result<Vec<TraccarPosition>, TraccarClientError> {
        self.fetches
            .lock()
            .unwrap()
            .push((device_id.to_string(), lower_bound));

        if self.failing_devices.contains(device_id) {
            return Err(TraccarClientError::Unavailable {
                attempts: 5,
                last_error: "timeout".into(),
            });
        }

        let now = Utc::now();
        Ok(self
            .positions
            .get(device_id)
            .map(|all| {
                all.iter()
                    .filter(|p| p.device_time >= lower_bound && p.device_time < now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

// ── Work dispatcher ──

#[derive(Default)]
pub struct MockDispatcher {
    pub published: Arc<Mutex<Vec<DeviceWorkUnit>>>,
    /// Publishing fails once this many units went out.
    pub fail_after: Option<usize>,
}

#[async_trait]
impl WorkDispatcher for MockDispatcher {
    async fn publish(&self, unit: &DeviceWorkUnit) -> Result<String, DispatchError> {
        let mut published = self.published.lock().unwrap();
        if self.fail_after.is_some_and(|n| published.len() >= n) {
            return Err(DispatchError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "bus unreachable",
            ))));
        }
        published.push(unit.clone());
        Ok(format!("{}-0", published.len()))
    }
}
