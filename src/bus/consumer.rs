//! Reconnecting queue consumer for pipeline components.
//!
//! Declares the input exchange and queue, binds the configured routing
//! keys and forwards deliveries into a bounded channel. The background
//! task reconnects with exponential backoff and jitter whenever the
//! consumer stream breaks; consumers ack/reject via the delivery itself.

use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Connection, ConnectionProperties, ExchangeKind};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};

use super::{BusError, Result};

/// Consumer construction parameters.
#[derive(Clone)]
pub struct ConsumerConfig {
    /// AMQP URI; carries credentials, so it is never shown in full.
    pub amqp_uri: String,
    pub exchange: String,
    pub queue: String,
    pub binding_keys: Vec<String>,
    pub consumer_tag: String,
    /// Unacknowledged-message window.
    pub prefetch_count: u16,
}

impl ConsumerConfig {
    pub fn new(
        amqp_uri: impl Into<String>,
        exchange: impl Into<String>,
        queue: impl Into<String>,
        binding_keys: Vec<String>,
    ) -> Self {
        let queue = queue.into();
        Self {
            amqp_uri: amqp_uri.into(),
            exchange: exchange.into(),
            consumer_tag: format!("{}-{}", queue, std::process::id()),
            queue,
            binding_keys,
            prefetch_count: 100,
        }
    }
}

/// A queue consumer delivering into a bounded channel.
pub struct QueueConsumer {
    receiver: mpsc::Receiver<Delivery>,
    task: tokio::task::JoinHandle<()>,
}

impl QueueConsumer {
    /// Start consuming. The background task runs until the consumer is
    /// dropped, reconnecting on failure.
    pub fn start(config: ConsumerConfig) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        let task = tokio::spawn(consume_with_reconnect(config, tx));
        Self {
            receiver: rx,
            task,
        }
    }

    /// Next delivery, or `None` once the background task has stopped.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.receiver.recv().await
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Consumer loop with automatic reconnection and exponential backoff.
async fn consume_with_reconnect(config: ConsumerConfig, tx: mpsc::Sender<Delivery>) {
    let backoff_builder = ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(30))
        .with_jitter();

    let mut backoff_iter = backoff_builder.build();

    loop {
        match setup_consumer(&config).await {
            // The connection must stay alive while the stream is used.
            Ok((_connection, mut consumer)) => {
                info!(
                    queue = %config.queue,
                    binding_keys = ?config.binding_keys,
                    "Consumer connected, processing messages"
                );
                // Reset backoff on successful connection
                backoff_iter = backoff_builder.build();

                while let Some(delivery) = consumer.next().await {
                    match delivery {
                        Ok(delivery) => {
                            if tx.send(delivery).await.is_err() {
                                // The component is gone; stop consuming.
                                return;
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "Consumer delivery error, will reconnect");
                            break;
                        }
                    }
                }

                info!(queue = %config.queue, "Consumer stream ended, reconnecting...");
            }
            Err(e) => {
                let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
                error!(
                    error = %e,
                    backoff_ms = %delay.as_millis(),
                    queue = %config.queue,
                    "Failed to set up consumer, retrying after backoff"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
        }

        if tx.is_closed() {
            return;
        }
        let delay = backoff_iter.next().unwrap_or(Duration::from_secs(30));
        tokio::time::sleep(delay).await;
    }
}

/// Set up channel, exchange, queue and bindings, and start consuming.
async fn setup_consumer(config: &ConsumerConfig) -> Result<(Connection, lapin::Consumer)> {
    let connection = Connection::connect(
        &config.amqp_uri,
        ConnectionProperties::default().with_connection_name(config.consumer_tag.as_str().into()),
    )
    .await
    .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

    channel
        .basic_qos(config.prefetch_count, BasicQosOptions::default())
        .await
        .map_err(|e| BusError::Connection(format!("Failed to set QoS: {}", e)))?;

    channel
        .exchange_declare(
            &config.exchange,
            ExchangeKind::Topic,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare exchange: {}", e)))?;

    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Consume(format!("Failed to declare queue: {}", e)))?;

    for binding_key in &config.binding_keys {
        channel
            .queue_bind(
                &config.queue,
                &config.exchange,
                binding_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to bind queue: {}", e)))?;
    }

    let consumer = channel
        .basic_consume(
            &config.queue,
            &config.consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

    Ok((connection, consumer))
}
