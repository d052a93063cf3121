//! Aggregator component.
//!
//! Consumes parsed events, collapses bursts per `(source, _group)` and
//! re-publishes `event`/`suppressed` messages under the
//! `event.aggregated.` routing-key prefix. Deliveries and the periodic
//! inactivity sweep run on one cooperative task, so the state maps are
//! never shared across tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use tracing::{error, info, warn};

use crate::bus::{
    AmqpPusher, ConsumerConfig, ExchangeSpec, PusherConfig, QueueConsumer, Serialized,
};
use crate::config::Config;
use crate::model::Event;

pub mod state;

pub use state::{
    Aggregator, AggregatorData, AggregatorSettings, HiFreqEventData, OutputMessage,
    QueueProcessingError, SourceData, DEFAULT_AGGREGATE_WAIT_HOURS,
    DEFAULT_INACTIVITY_TIMEOUT_HOURS, DEFAULT_TIME_TOLERANCE_SECS,
};

/// Exchange carrying parsed/aggregated/enriched events.
pub const EVENT_EXCHANGE: &str = "event";

/// How often the inactivity sweep runs.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Run the aggregator until SIGINT.
pub async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let amqp_uri = config.broker.amqp_uri();
    let settings = AggregatorSettings {
        time_tolerance_secs: config.aggregator.time_tolerance,
        time_tolerance_per_source: config
            .aggregator
            .time_tolerance_per_source
            .iter()
            .map(|(source, secs)| (source.clone(), *secs))
            .collect(),
        aggregate_wait: chrono::Duration::hours(config.aggregator.aggregate_wait_hours as i64),
        inactivity_timeout: chrono::Duration::hours(
            config.aggregator.inactivity_timeout_hours as i64,
        ),
    };

    let data = config
        .aggregator
        .state_file
        .as_deref()
        .map(load_snapshot)
        .unwrap_or_default();
    let mut aggregator = Aggregator::with_data(settings, data);

    let pusher: AmqpPusher<Vec<u8>> = AmqpPusher::connect(
        PusherConfig::new(&amqp_uri, ExchangeSpec::topic(EVENT_EXCHANGE)),
        Arc::new(|data: &Vec<u8>| Ok(Serialized::Publish(data.clone()))),
        None,
    )
    .await?;

    let mut consumer = QueueConsumer::start(ConsumerConfig::new(
        &amqp_uri,
        EVENT_EXCHANGE,
        &config.aggregator.queue_name,
        config.aggregator.binding_keys.clone(),
    ));

    info!(queue = %config.aggregator.queue_name, "aggregator running");
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            delivery = consumer.recv() => {
                match delivery {
                    Some(delivery) => handle_delivery(&mut aggregator, &pusher, delivery).await,
                    None => {
                        error!("consumer channel closed, stopping");
                        break;
                    }
                }
            }
            _ = sweep.tick() => {
                let flushed = aggregator.flush_inactive_sources(Utc::now());
                if !flushed.is_empty() {
                    info!(count = flushed.len(), "flushing windows of inactive sources");
                }
                publish_all(&pusher, flushed).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    if let Some(path) = config.aggregator.state_file.as_deref() {
        save_snapshot(path, &aggregator.data);
    }
    pusher.shutdown().await?;
    Ok(())
}

async fn handle_delivery(
    aggregator: &mut Aggregator,
    pusher: &AmqpPusher<Vec<u8>>,
    delivery: Delivery,
) {
    let event: Event = match serde_json::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, routing_key = %delivery.routing_key, "unparseable event; rejecting");
            let _ = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await;
            return;
        }
    };

    match aggregator.process_event(&event, Utc::now()) {
        Ok(messages) => {
            publish_all(pusher, messages).await;
            if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %e, "failed to ack delivery");
            }
        }
        Err(e) => {
            // Per-event failures (out-of-order, missing fields) drop the
            // message; state built from earlier events persists.
            warn!(error = %e, "event not aggregatable; rejecting");
            let _ = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await;
        }
    }
}

async fn publish_all(pusher: &AmqpPusher<Vec<u8>>, messages: Vec<OutputMessage>) {
    for message in messages {
        match serde_json::to_vec(&message.event) {
            Ok(body) => {
                if let Err(e) = pusher.push(body, message.routing_key, None).await {
                    error!(error = %e, "failed to enqueue aggregated message");
                }
            }
            Err(e) => error!(error = %e, "failed to serialize aggregated message"),
        }
    }
}

fn load_snapshot(path: &Path) -> AggregatorData {
    match std::fs::read(path) {
        Ok(raw) => match serde_json::from_slice(&raw) {
            Ok(data) => {
                info!(path = %path.display(), "restored aggregation state");
                data
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt state snapshot, starting empty");
                AggregatorData::default()
            }
        },
        Err(_) => AggregatorData::default(),
    }
}

fn save_snapshot(path: &Path, data: &AggregatorData) {
    let tmp: PathBuf = path.with_extension("tmp");
    let result = serde_json::to_vec(data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
        .and_then(|raw| std::fs::write(&tmp, raw))
        .and_then(|_| std::fs::rename(&tmp, path));
    match result {
        Ok(()) => info!(path = %path.display(), "saved aggregation state"),
        Err(e) => error!(path = %path.display(), error = %e, "could not save aggregation state"),
    }
}
