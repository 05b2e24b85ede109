use async_trait::async_trait;

use crate::watermark::models::{Watermark, WatermarkKey};
use trackrelay_common::error::RelayResult;

#[async_trait]
pub trait WatermarkRepository: Send + Sync {
    /// Read the watermark for `key`.
    ///
    /// Returns `Ok(None)` when nothing is stored, `InvalidPersistedState` when
    /// the stored value cannot be parsed and `StoreUnavailable` once backend
    /// retries are exhausted.
    async fn get(&self, key: &WatermarkKey) -> RelayResult<Option<Watermark>>;

    /// Store `watermark` under `key`, optionally expiring after `ttl_secs`.
    async fn set(
        &self,
        key: &WatermarkKey,
        watermark: &Watermark,
        ttl_secs: Option<u64>,
    ) -> RelayResult<()>;

    /// Remove the watermark; the next read falls back to the lookback bound.
    async fn delete(&self, key: &WatermarkKey) -> RelayResult<()>;
}
