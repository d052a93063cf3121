//! threatpipe: a distributed security-event processing pipeline.
//!
//! Data flows through named components connected by a topic-routed
//! message bus:
//!
//! ```text
//! [collectors] --raw.<src>--> [parsers] --event.parsed.<src>--> [aggregator]
//!                                                                    |
//!                                            event.aggregated.<src>  v
//!                                                               [enricher]
//!                                                                    |
//!                                               event.enriched.<src> v
//!                                                        [filter/recorder]
//! ```
//!
//! This crate provides the pipeline runtime and its stateful
//! operators: the AMQP pusher and consumer plumbing (`bus`), the
//! collector runtime (`collectors`), the burst-collapsing aggregator
//! (`aggregator`), the DNS/GeoIP enricher (`enricher`) and the
//! event-DB query processor (`query`). The broker, the databases and
//! the external feeds are collaborators, not part of this crate.

pub mod aggregator;
pub mod bus;
pub mod collectors;
pub mod config;
pub mod enricher;
pub mod model;
pub mod query;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize process-wide logging from the `THREATPIPE_LOG`
/// environment variable (default `info`).
pub fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(config::LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
