//! Redis Streams transport for device work units.
//!
//! Producers `XADD <stream> MAXLEN ~ n * payload <json>`; workers read
//! through a consumer group, then `XACK` and `XDEL` what they finished.
//! Unacknowledged entries stay in the group's pending list until a worker
//! reclaims them with `XAUTOCLAIM` once they have been idle long enough.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamAutoClaimOptions, StreamAutoClaimReply, StreamId, StreamMaxlen,
    StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

use trackrelay_common::error::RelayResult;
use trackrelay_config::{get_var_or, parse_var_or};

use super::worker::{StreamEntry, WorkSource};
use super::{DeviceWorkUnit, DispatchError, WorkDispatcher};

const PAYLOAD_FIELD: &str = "payload";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchConfig {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub block_ms: usize,
    /// Entries fetched per XREADGROUP.
    pub read_count: usize,
    /// Approximate stream length kept by `XADD MAXLEN ~`.
    pub max_len: usize,
    /// Pending entries idle this long are reclaimed for another attempt.
    pub claim_idle_ms: usize,
    /// How often the pending list is scanned for reclaimable entries.
    pub claim_interval: Duration,
    /// Deliveries after which a failing unit is acknowledged and dropped.
    pub max_deliveries: usize,
}

impl DispatchConfig {
    pub fn from_env() -> RelayResult<Self> {
        Ok(Self {
            stream: get_var_or("DISPATCH_STREAM", "traccar-actions-topic"),
            group: get_var_or("DISPATCH_GROUP", "trackrelay-workers"),
            consumer: std::env::var("DISPATCH_CONSUMER")
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            block_ms: parse_var_or("DISPATCH_BLOCK_MS", 5000)?,
            read_count: parse_var_or("DISPATCH_READ_COUNT", 10)?,
            max_len: parse_var_or("DISPATCH_MAX_LEN", 100_000)?,
            claim_idle_ms: parse_var_or("DISPATCH_CLAIM_IDLE_MS", 300_000)?,
            claim_interval: Duration::from_millis(parse_var_or(
                "DISPATCH_CLAIM_INTERVAL_MS",
                30_000,
            )?),
            max_deliveries: parse_var_or("DISPATCH_MAX_DELIVERIES", 5)?,
        })
    }
}

#[derive(Clone)]
pub struct RedisStreamDispatcher {
    conn: MultiplexedConnection,
    stream: String,
    max_len: usize,
}

impl RedisStreamDispatcher {
    pub fn new(conn: MultiplexedConnection, stream: String, max_len: usize) -> Self {
        Self {
            conn,
            stream,
            max_len,
        }
    }
}

#[async_trait]
impl WorkDispatcher for RedisStreamDispatcher {
    async fn publish(&self, unit: &DeviceWorkUnit) -> Result<String, DispatchError> {
        let payload = serde_json::to_string(unit)?;
        let mut conn = self.conn.clone();
        let id: String = conn
            .xadd_maxlen(
                &self.stream,
                StreamMaxlen::Approx(self.max_len),
                "*",
                &[(PAYLOAD_FIELD, payload)],
            )
            .await?;
        Ok(id)
    }
}

/// Decode the work unit carried by one stream entry.
pub fn decode_entry(entry: &StreamId) -> Result<DeviceWorkUnit, DispatchError> {
    let raw: String = entry
        .get(PAYLOAD_FIELD)
        .ok_or_else(|| DispatchError::Malformed {
            id: entry.id.clone(),
            reason: format!("missing '{PAYLOAD_FIELD}' field"),
        })?;

    serde_json::from_str(&raw).map_err(|e| DispatchError::Malformed {
        id: entry.id.clone(),
        reason: e.to_string(),
    })
}

/// Consumer-group reader over the work stream.
pub struct StreamConsumer {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: DispatchConfig,
    last_claim: Option<Instant>,
}

impl StreamConsumer {
    pub async fn connect(redis_url: &str, config: DispatchConfig) -> Result<Self, DispatchError> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let consumer = Self {
            client,
            conn,
            config,
            last_claim: None,
        };
        consumer.ensure_group().await?;
        Ok(consumer)
    }

    async fn ensure_group(&self) -> Result<(), DispatchError> {
        let mut conn = self.conn.clone();
        let result: RedisResult<()> = conn
            .xgroup_create_mkstream(&self.config.stream, &self.config.group, "0")
            .await;

        match result {
            Ok(()) => {
                tracing::info!(
                    stream = %self.config.stream,
                    group = %self.config.group,
                    "created consumer group"
                );
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {
                tracing::debug!(group = %self.config.group, "consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn claim_due(&self) -> bool {
        self.last_claim
            .map_or(true, |at| at.elapsed() >= self.config.claim_interval)
    }

    /// Take over pending entries that have sat idle past `claim_idle_ms`,
    /// whichever consumer last held them.
    async fn claim_idle(&mut self) -> Result<Vec<StreamEntry>, DispatchError> {
        self.last_claim = Some(Instant::now());

        let options = StreamAutoClaimOptions::default().count(self.config.read_count);
        let reply: StreamAutoClaimReply = self
            .conn
            .xautoclaim_options(
                &self.config.stream,
                &self.config.group,
                &self.config.consumer,
                self.config.claim_idle_ms,
                "0-0",
                options,
            )
            .await?;

        for id in &reply.deleted_ids {
            tracing::warn!(entry_id = %id, "pending work unit was trimmed from the stream");
            let _: i64 = self
                .conn
                .xack(&self.config.stream, &self.config.group, &[id])
                .await?;
        }

        let mut entries = Vec::with_capacity(reply.claimed.len());
        for entry in reply.claimed {
            let deliveries = self.delivery_count(&entry.id).await?;
            tracing::info!(entry_id = %entry.id, deliveries, "reclaimed idle work unit");
            entries.push(StreamEntry {
                unit: decode_entry(&entry),
                id: entry.id,
                deliveries,
            });
        }
        Ok(entries)
    }

    async fn delivery_count(&mut self, id: &str) -> Result<usize, DispatchError> {
        let reply: StreamPendingCountReply = self
            .conn
            .xpending_count(&self.config.stream, &self.config.group, id, id, 1)
            .await?;
        Ok(reply.ids.first().map_or(1, |p| p.times_delivered))
    }
}

#[async_trait]
impl WorkSource for StreamConsumer {
    async fn next_batch(&mut self) -> Result<Vec<StreamEntry>, DispatchError> {
        if self.claim_due() {
            let claimed = self.claim_idle().await?;
            if !claimed.is_empty() {
                return Ok(claimed);
            }
        }

        let options = StreamReadOptions::default()
            .group(&self.config.group, &self.config.consumer)
            .count(self.config.read_count)
            .block(self.config.block_ms);

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.config.stream], &[">"], &options)
            .await?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default()
            .into_iter()
            .map(|entry| StreamEntry {
                unit: decode_entry(&entry),
                id: entry.id,
                deliveries: 1,
            })
            .collect();

        Ok(entries)
    }

    async fn ack(&mut self, id: &str) -> Result<(), DispatchError> {
        let acked: i64 = self
            .conn
            .xack(&self.config.stream, &self.config.group, &[id])
            .await?;
        if acked != 1 {
            tracing::warn!(entry_id = id, acked, "XACK did not match a pending entry");
        }
        let _: i64 = self.conn.xdel(&self.config.stream, &[id]).await?;
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), DispatchError> {
        tracing::info!("reconnecting to redis");
        self.conn = self.client.get_multiplexed_async_connection().await?;
        self.last_claim = None;
        self.ensure_group().await
    }
}
