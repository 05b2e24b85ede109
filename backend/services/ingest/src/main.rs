mod connector;
mod dispatch;
mod error;
mod sensors;
mod traccar;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use serde_json::json;
use trackrelay_config::{init_tracing, AppConfig};
use trackrelay_db::watermark::redis_repository::RedisWatermarkRepository;

use crate::connector::Connector;
use crate::dispatch::redis_stream::{DispatchConfig, RedisStreamDispatcher, StreamConsumer};
use crate::dispatch::worker::Worker;
use crate::error::SyncError;
use crate::sensors::client::{SensorsClient, SensorsClientConfig};
use crate::traccar::account_sync::{AccountSyncer, FanOut};
use crate::traccar::actions::{check_credentials, fetch_samples, reset_device_watermark};
use crate::traccar::client::{TraccarClient, TraccarClientConfig};
use crate::traccar::config::{
    FanOutMode, FetchSamplesConfig, PullObservationsConfig, PullObservationsPerDeviceConfig,
};
use crate::traccar::device_sync::DeviceSyncer;

const USAGE: &str = "usage: trackrelay-ingest [pull | worker | auth | samples | reset <device_id>]";

type RedisDeviceSyncer = DeviceSyncer<TraccarClient, SensorsClient, RedisWatermarkRepository>;

fn device_syncer(
    api: Arc<TraccarClient>,
    store: Arc<RedisWatermarkRepository>,
    integration_id: &str,
) -> RedisDeviceSyncer {
    let sensors_config =
        SensorsClientConfig::from_env().expect("SENSORS_API_URL and SENSORS_API_KEY must be set");
    let sink = Arc::new(SensorsClient::new(sensors_config).expect("failed to create sensors client"));
    let per_device =
        PullObservationsPerDeviceConfig::from_env().expect("invalid per-device pull configuration");

    tracing::info!(
        batch_size = per_device.observations_per_request,
        lookback_hours = per_device.lookback.num_hours(),
        commit_policy = %per_device.commit_policy,
        "per-device pull configured"
    );

    DeviceSyncer::new(api, sink, store, integration_id.to_string(), &per_device)
}

async fn redis_store(redis_url: &str) -> (redis::aio::MultiplexedConnection, Arc<RedisWatermarkRepository>) {
    let conn = trackrelay_db::connect(redis_url)
        .await
        .expect("failed to connect to redis");
    let store = Arc::new(RedisWatermarkRepository::new(conn.clone()));
    (conn, store)
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    init_tracing("info");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = args.first().map(String::as_str).unwrap_or("pull");

    let app = AppConfig::from_env().expect("invalid configuration");
    tracing::info!(
        service = "trackrelay-ingest",
        command,
        integration_id = %app.integration_id,
        "starting"
    );

    let traccar_config = TraccarClientConfig::from_env()
        .expect("TRACCAR_BASE_URL, TRACCAR_EMAIL and TRACCAR_PASSWORD must be set");
    let api = Arc::new(TraccarClient::new(traccar_config).expect("failed to create traccar client"));

    let outcome: Result<serde_json::Value, SyncError> = match command {
        "auth" => check_credentials(api.as_ref()).await.map(|r| json!(r)),

        "samples" => {
            let config = FetchSamplesConfig::from_env().expect("invalid samples configuration");
            fetch_samples(api.as_ref(), &config).await.map(|r| json!(r))
        }

        "reset" => {
            let Some(device_id) = args.get(1) else {
                eprintln!("{USAGE}");
                std::process::exit(2);
            };
            let (_, store) = redis_store(&app.redis_url).await;
            reset_device_watermark(store.as_ref(), &app.integration_id, device_id)
                .await
                .map(|()| json!({ "reset": device_id }))
        }

        "worker" => {
            let (_, store) = redis_store(&app.redis_url).await;
            let syncer = Arc::new(device_syncer(api, store, &app.integration_id));
            let dispatch_config = DispatchConfig::from_env().expect("invalid dispatch configuration");
            tracing::info!(
                stream = %dispatch_config.stream,
                group = %dispatch_config.group,
                consumer = %dispatch_config.consumer,
                max_deliveries = dispatch_config.max_deliveries,
                "starting work stream consumer"
            );
            let max_deliveries = dispatch_config.max_deliveries;
            let consumer = StreamConsumer::connect(&app.redis_url, dispatch_config)
                .await
                .expect("failed to join work stream consumer group");

            let mut worker = Worker::new(consumer, syncer, max_deliveries);
            worker
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await;
            return;
        }

        "pull" => {
            let pull_config = PullObservationsConfig::from_env().expect("invalid pull configuration");
            let (conn, store) = redis_store(&app.redis_url).await;

            let fan_out = match pull_config.fan_out {
                FanOutMode::Inline => FanOut::Inline {
                    syncer: Arc::new(device_syncer(api.clone(), store, &app.integration_id)),
                    device_delay: pull_config.device_delay,
                },
                FanOutMode::Dispatched => {
                    let dispatch_config =
                        DispatchConfig::from_env().expect("invalid dispatch configuration");
                    FanOut::Dispatched {
                        dispatcher: Arc::new(RedisStreamDispatcher::new(
                            conn,
                            dispatch_config.stream,
                            dispatch_config.max_len,
                        )),
                        batch_size: pull_config.dispatch_batch_size,
                        batch_delay: pull_config.dispatch_batch_delay,
                    }
                }
            };

            let syncer = AccountSyncer::new(
                api,
                app.integration_id.clone(),
                pull_config.recorded_at_field,
                fan_out,
            );
            tracing::info!(source = syncer.source_name(), "starting account sync");
            syncer.sync().await.map(|r| json!(r))
        }

        other => {
            eprintln!("unknown command '{other}'\n{USAGE}");
            std::process::exit(2);
        }
    };

    match outcome {
        Ok(value) => {
            println!("{value}");
            tracing::info!(command, "ingest service finished");
        }
        Err(e) => {
            tracing::error!(command, kind = e.kind(), error = %e, "ingest service failed");
            println!(
                "{}",
                json!({ "error": e.kind(), "message": e.to_string() })
            );
            std::process::exit(1);
        }
    }
}
