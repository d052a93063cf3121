//! threatpipe-enricher: the DNS/GeoIP enrichment stage.
//!
//! Consumes parsed and aggregated events, fills in `address` data and
//! re-publishes them on the `event.enriched.` routing keys. SIGINT
//! shuts down cleanly.
//!
//! Usage: `threatpipe-enricher [config-file]`

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

    match threatpipe::enricher::run(&config).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "enricher failed");
            std::process::ExitCode::FAILURE
        }
    }
}
