use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisError};

use crate::watermark::models::{Watermark, WatermarkKey};
use crate::watermark::repositories::WatermarkRepository;
use trackrelay_common::error::{RelayError, RelayResult};
use trackrelay_common::retry::{with_retry, RetryError, RetryPolicy};

/// Connection-level failures worth another attempt. Server replies such as
/// `WRONGTYPE` will not change on retry.
fn is_transient(e: &RedisError) -> bool {
    e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
}

#[derive(Clone)]
pub struct RedisWatermarkRepository {
    conn: MultiplexedConnection,
    retry: RetryPolicy,
}

impl RedisWatermarkRepository {
    pub fn new(conn: MultiplexedConnection) -> Self {
        Self {
            conn,
            retry: RetryPolicy::store(),
        }
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn unavailable(op: &str, key: &str, err: RetryError<RedisError>) -> RelayError {
        tracing::error!(op, key, error = %err, "watermark store unavailable");
        RelayError::StoreUnavailable(format!("{op} {key}: {err}"))
    }
}

#[async_trait]
impl WatermarkRepository for RedisWatermarkRepository {
    async fn get(&self, key: &WatermarkKey) -> RelayResult<Option<Watermark>> {
        let redis_key = key.to_string();

        let raw: Option<Vec<u8>> = match with_retry(&self.retry, "watermark_get", is_transient, || {
            let mut conn = self.conn.clone();
            let k = redis_key.clone();
            async move { conn.get::<_, Option<Vec<u8>>>(&k).await }
        })
        .await
        {
            Ok(raw) => raw,
            Err(RetryError::Permanent(e)) => {
                return Err(RelayError::InvalidPersistedState(format!("{redis_key}: {e}")));
            }
            Err(e) => return Err(Self::unavailable("get", &redis_key, e)),
        };

        match raw {
            None => Ok(None),
            Some(raw) => serde_json::from_slice(&raw).map(Some).map_err(|e| {
                RelayError::InvalidPersistedState(format!("{redis_key}: {e}"))
            }),
        }
    }

    async fn set(
        &self,
        key: &WatermarkKey,
        watermark: &Watermark,
        ttl_secs: Option<u64>,
    ) -> RelayResult<()> {
        let redis_key = key.to_string();
        let value = serde_json::to_string(watermark)
            .map_err(|e| RelayError::Internal(format!("encode watermark: {e}")))?;

        with_retry(&self.retry, "watermark_set", is_transient, || {
            let mut conn = self.conn.clone();
            let k = redis_key.clone();
            let v = value.clone();
            async move {
                match ttl_secs {
                    Some(ttl) => conn.set_ex::<_, _, ()>(&k, &v, ttl).await,
                    None => conn.set::<_, _, ()>(&k, &v).await,
                }
            }
        })
        .await
        .map_err(|e| Self::unavailable("set", &redis_key, e))?;

        tracing::debug!(key = %redis_key, recorded_at = %watermark.recorded_at, "watermark stored");
        Ok(())
    }

    async fn delete(&self, key: &WatermarkKey) -> RelayResult<()> {
        let redis_key = key.to_string();

        with_retry(&self.retry, "watermark_delete", is_transient, || {
            let mut conn = self.conn.clone();
            let k = redis_key.clone();
            async move { conn.del::<_, ()>(&k).await }
        })
        .await
        .map_err(|e| Self::unavailable("delete", &redis_key, e))?;

        Ok(())
    }
}
