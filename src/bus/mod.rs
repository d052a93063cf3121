//! Message-bus plumbing shared by all components.
//!
//! This module contains:
//! - `BusError`: errors for publishing/consuming paths
//! - `AmqpPusher`: back-pressured publisher with a dedicated worker
//! - `QueueConsumer`: reconnecting consumer used by pipeline components
//! - Routing-key helpers and AMQP message properties

use std::collections::BTreeMap;

use lapin::types::{AMQPValue, FieldTable};

pub mod consumer;
pub mod pusher;

pub use consumer::{ConsumerConfig, QueueConsumer};
pub use pusher::{AmqpPusher, ExchangeSpec, PusherConfig, QueueSpec, Serialized};

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Serialization failed: {0}")]
    Serialize(String),

    #[error("Pusher is inactive (shut down or its worker has died)")]
    InactivePusher,

    #[error("{count} pending message(s) remained in the output FIFO at shutdown")]
    PendingMessages { count: usize },

    #[error("Publishing worker did not stop within the join timeout")]
    WorkerJoinTimeout,

    #[error("Could not acquire the connection lock during shutdown")]
    ShutdownLockTimeout,

    #[error("Consume failed: {0}")]
    Consume(String),
}

/// Message type of raw collector output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawMessageType {
    Stream,
    File,
    Blacklist,
}

impl RawMessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RawMessageType::Stream => "stream",
            RawMessageType::File => "file",
            RawMessageType::Blacklist => "blacklist",
        }
    }

    /// File-like types must carry a `content_type` property.
    pub fn requires_content_type(&self) -> bool {
        matches!(self, RawMessageType::File | RawMessageType::Blacklist)
    }
}

/// AMQP message properties used across the pipeline.
///
/// Per-call properties are merged over a pusher's defaults: a field set
/// here wins, everything else falls back to the default.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProps {
    pub message_id: Option<String>,
    pub kind: Option<String>,
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub delivery_mode: Option<u8>,
    /// Header map; nested maps (e.g. `meta`) are supported.
    pub headers: BTreeMap<String, serde_json::Value>,
}

impl MessageProps {
    /// Merge `self` over `defaults`, field by field.
    pub fn merged_over(&self, defaults: &MessageProps) -> MessageProps {
        let mut headers = defaults.headers.clone();
        headers.extend(self.headers.clone());
        MessageProps {
            message_id: self.message_id.clone().or_else(|| defaults.message_id.clone()),
            kind: self.kind.clone().or_else(|| defaults.kind.clone()),
            timestamp: self.timestamp.or(defaults.timestamp),
            content_type: self
                .content_type
                .clone()
                .or_else(|| defaults.content_type.clone()),
            delivery_mode: self.delivery_mode.or(defaults.delivery_mode),
            headers,
        }
    }

    pub fn to_basic_properties(&self) -> lapin::BasicProperties {
        let mut props = lapin::BasicProperties::default();
        if let Some(ref id) = self.message_id {
            props = props.with_message_id(id.as_str().into());
        }
        if let Some(ref kind) = self.kind {
            props = props.with_kind(kind.as_str().into());
        }
        if let Some(ts) = self.timestamp {
            props = props.with_timestamp(ts);
        }
        if let Some(ref ct) = self.content_type {
            props = props.with_content_type(ct.as_str().into());
        }
        if let Some(mode) = self.delivery_mode {
            props = props.with_delivery_mode(mode);
        }
        if !self.headers.is_empty() {
            props = props.with_headers(json_map_to_field_table(&self.headers));
        }
        props
    }
}

fn json_value_to_amqp(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::Null => AMQPValue::Void,
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                AMQPValue::LongLongInt(i)
            } else {
                AMQPValue::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        serde_json::Value::Array(items) => {
            AMQPValue::FieldArray(items.iter().map(json_value_to_amqp).collect::<Vec<_>>().into())
        }
        serde_json::Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, val) in map {
                table.insert(key.as_str().into(), json_value_to_amqp(val));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

fn json_map_to_field_table(map: &BTreeMap<String, serde_json::Value>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in map {
        table.insert(key.as_str().into(), json_value_to_amqp(value));
    }
    table
}

/// Compute a raw message id: MD5 over `source`, creation timestamp and
/// body, NUL-joined.
pub fn raw_message_id(source: &str, created_timestamp: u64, body: &[u8]) -> String {
    let mut input = Vec::with_capacity(source.len() + body.len() + 24);
    input.extend_from_slice(source.as_bytes());
    input.push(0);
    input.extend_from_slice(created_timestamp.to_string().as_bytes());
    input.push(0);
    input.extend_from_slice(body);
    format!("{:x}", md5::compute(input))
}

/// Routing key for raw collector output:
/// `raw.<label>.<channel>[.<format_version>]`.
pub fn raw_routing_key(source: &str, format_version_tag: Option<&str>) -> String {
    match format_version_tag {
        Some(tag) => format!("raw.{}.{}", source, tag),
        None => format!("raw.{}", source),
    }
}

/// Routing key for aggregator output: `event.aggregated.<source>`.
pub fn aggregated_routing_key(source: &str) -> String {
    format!("event.aggregated.{}", source)
}

/// Rewrite an incoming routing key's stage segment to `enriched`
/// (`event.parsed.x.y` / `event.aggregated.x.y` -> `event.enriched.x.y`).
pub fn enriched_routing_key(incoming: &str) -> String {
    let mut segments: Vec<&str> = incoming.split('.').collect();
    if segments.len() >= 2 {
        segments[1] = "enriched";
        segments.join(".")
    } else {
        format!("event.enriched.{}", incoming)
    }
}
