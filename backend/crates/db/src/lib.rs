pub mod watermark;

use redis::aio::MultiplexedConnection;
use trackrelay_common::error::{RelayError, RelayResult};

/// Open a multiplexed Redis connection shared by the watermark store and the
/// work dispatch stream.
pub async fn connect(redis_url: &str) -> RelayResult<MultiplexedConnection> {
    tracing::info!("connecting to redis");
    let client = redis::Client::open(redis_url)
        .map_err(|e| RelayError::Config(format!("invalid REDIS_URL: {e}")))?;
    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| RelayError::StoreUnavailable(e.to_string()))
}
