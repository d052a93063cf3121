//! threatpipe-aggregator: the burst-collapsing pipeline stage.
//!
//! Consumes parsed events, publishes `event`/`suppressed` messages on
//! the `event.aggregated.` routing keys. SIGINT snapshots the
//! aggregation state and shuts down cleanly.
//!
//! Usage: `threatpipe-aggregator [config-file]`

use tracing::error;

use threatpipe::config::Config;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    threatpipe::init_logging();

    let config_path = std::env::args().nth(1);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    match threatpipe::aggregator::run(&config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "aggregator failed");
            std::process::ExitCode::FAILURE
        }
    }
}
