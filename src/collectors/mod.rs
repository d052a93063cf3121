//! Collector runtime.
//!
//! This module contains:
//! - `CollectorSpec`: a collector's static identity and output shape
//! - `RawPublisher`: publishing of raw messages onto the `raw` exchange
//! - `StateStore`: durable per-source state with atomic writes
//! - Fetch strategies: `download` (HTTP), `rows` (time-ordered rows),
//!   `rss` (snapshot diff), `mail` (stdin email)
//!
//! The base contract is *fetch -> select -> publish -> commit state*:
//! a collector never commits new state unless its publish was flushed,
//! which gives at-most-once-per-fetched-record semantics across restarts.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::bus::{
    self, AmqpPusher, BusError, ExchangeSpec, MessageProps, PusherConfig, RawMessageType,
    Serialized,
};

pub mod download;
pub mod mail;
pub mod rows;
pub mod rss;
pub mod state;

pub use download::{DownloadConfig, UrlDownloader};
pub use rows::{RowsSource, RowsState, TimeOrderedRowsCollector};
pub use state::StateStore;

/// Result type for collector operations.
pub type Result<T> = std::result::Result<T, CollectorError>;

/// Errors that can occur while collecting.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("collector misconfigured: {0}")]
    Config(String),

    #[error("download failed ({url}): {message}")]
    Download { url: String, message: String },

    #[error("download gave up ({url}): deadline exceeded")]
    DownloadDeadline { url: String },

    #[error("state store failure: {0}")]
    State(String),

    #[error("row consistency problem: {0}")]
    RowCountMismatch(String),

    #[error("input data unusable: {0}")]
    BadInput(String),

    #[error(transparent)]
    Publish(#[from] BusError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A collector's static identity and output shape.
#[derive(Debug, Clone)]
pub struct CollectorSpec {
    /// The `label` part of the source id.
    pub source_label: String,
    /// The `channel` part of the source id.
    pub channel: String,
    pub message_type: RawMessageType,
    /// Required for `file`/`blacklist` message types.
    pub content_type: Option<String>,
    /// Optional raw-data format version tag appended to the routing key.
    pub raw_format_version_tag: Option<String>,
}

impl CollectorSpec {
    pub fn new(
        source_label: impl Into<String>,
        channel: impl Into<String>,
        message_type: RawMessageType,
    ) -> Self {
        Self {
            source_label: source_label.into(),
            channel: channel.into(),
            message_type,
            content_type: None,
            raw_format_version_tag: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// The source specification string `<label>.<channel>`.
    pub fn source(&self) -> String {
        format!("{}.{}", self.source_label, self.channel)
    }

    /// File-like collectors must declare a content type.
    pub fn validate(&self) -> Result<()> {
        if self.message_type.requires_content_type() && self.content_type.is_none() {
            return Err(CollectorError::Config(format!(
                "message type `{}` requires a content_type",
                self.message_type.as_str()
            )));
        }
        Ok(())
    }

    /// Assemble routing key, body and properties for one raw message.
    pub fn output_components(
        &self,
        body: Vec<u8>,
        meta: BTreeMap<String, serde_json::Value>,
    ) -> OutputComponents {
        let source = self.source();
        let created_timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut headers = BTreeMap::new();
        if !meta.is_empty() {
            headers.insert(
                "meta".to_string(),
                serde_json::Value::Object(meta.into_iter().collect()),
            );
        }

        let props = MessageProps {
            message_id: Some(bus::raw_message_id(&source, created_timestamp, &body)),
            kind: Some(self.message_type.as_str().to_string()),
            timestamp: Some(created_timestamp),
            content_type: self.content_type.clone(),
            delivery_mode: None,
            headers,
        };

        OutputComponents {
            routing_key: bus::raw_routing_key(&source, self.raw_format_version_tag.as_deref()),
            body,
            props,
        }
    }
}

/// Routing key, body and properties of one raw message.
#[derive(Debug)]
pub struct OutputComponents {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub props: MessageProps,
}

/// Publisher of raw collector output.
///
/// Wraps the pusher with the `raw` topic exchange and a pass-through
/// serializer; `flush` performs the drain-and-close that gates state
/// commits.
pub struct RawPublisher {
    pusher: AmqpPusher<Vec<u8>>,
}

impl RawPublisher {
    /// Default exchange raw messages are published to.
    pub const EXCHANGE: &'static str = "raw";

    pub async fn connect(amqp_uri: &str) -> Result<Self> {
        let config = PusherConfig::new(amqp_uri, ExchangeSpec::topic(Self::EXCHANGE));
        let pusher = AmqpPusher::connect(
            config,
            Arc::new(|data: &Vec<u8>| Ok(Serialized::Publish(data.clone()))),
            None,
        )
        .await?;
        Ok(Self { pusher })
    }

    pub async fn publish(&self, components: OutputComponents) -> Result<()> {
        self.pusher
            .push(
                components.body,
                components.routing_key,
                Some(components.props),
            )
            .await?;
        Ok(())
    }

    /// Wait until everything published so far has reached the broker,
    /// keeping the connection open.
    pub async fn drain(&self) -> Result<()> {
        self.pusher.drain().await?;
        Ok(())
    }

    /// Drain the output FIFO and close the connection.
    pub async fn flush(self) -> Result<()> {
        self.pusher.shutdown().await?;
        Ok(())
    }
}

/// One step of an iterative publishing session.
pub enum PublishStep {
    /// Publish this message, wait for the broker to take it, then
    /// commit durable state before continuing.
    PublishAndFlush(OutputComponents),
    /// Nothing to publish at this point.
    Continue,
}

/// Advance an explicit step sequence: each published step is flushed
/// to the broker and followed by a state commit (`commit`), so a crash
/// between steps never loses acknowledged work.
pub async fn publish_step_by_step<I, C>(
    publisher: &RawPublisher,
    steps: I,
    mut commit: C,
) -> Result<()>
where
    I: IntoIterator<Item = PublishStep>,
    C: FnMut() -> Result<()>,
{
    for step in steps {
        match step {
            PublishStep::PublishAndFlush(components) => {
                publisher.publish(components).await?;
                publisher.drain().await?;
                commit()?;
            }
            PublishStep::Continue => {}
        }
    }
    Ok(())
}

/// Long-running collector loop: run `iteration` on every tick until
/// SIGINT. The first iteration runs immediately.
pub async fn run_daemon<F, Fut>(interval: std::time::Duration, mut iteration: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("SIGINT received, stopping");
                return Ok(());
            }
            _ = ticker.tick() => {
                iteration().await?;
            }
        }
    }
}
