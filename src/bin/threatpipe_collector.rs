//! threatpipe-collector: one-shot collector entry point.
//!
//! Takes a configuration section name; the section's `kind` selects
//! the fetch strategy (`rows`, `rss` or `mail`). Exits 0 on a normal
//! run (including "nothing fresh"), non-zero on a fatal error.
//!
//! Usage: `threatpipe-collector <section-name> [config-file]`

use std::time::Duration;

use tracing::error;

use threatpipe::bus::RawMessageType;
use threatpipe::collectors::mail::{EmailCollector, PlainTextExtractor};
use threatpipe::collectors::rows::DownloadedCsvRows;
use threatpipe::collectors::rss::{DefaultRssReducer, RssCollector};
use threatpipe::collectors::{
    CollectorError, CollectorSpec, DownloadConfig, RawPublisher, StateStore,
    TimeOrderedRowsCollector, UrlDownloader,
};
use threatpipe::config::{CollectorSection, Config};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    threatpipe::init_logging();

    let mut args = std::env::args().skip(1);
    let Some(section_name) = args.next() else {
        eprintln!("usage: threatpipe-collector <section-name> [config-file]");
        return std::process::ExitCode::FAILURE;
    };
    let config_path = args.next();

    let result = run(&section_name, config_path.as_deref()).await;
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(section = %section_name, error = %e, "collector run failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run(
    section_name: &str,
    config_path: Option<&str>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Config::load(config_path)?;
    let section = config.collector_section(section_name)?;
    let publisher = RawPublisher::connect(&config.broker.amqp_uri()).await?;

    match section.kind.as_str() {
        "rows" => run_rows(&section, publisher).await?,
        "rss" => run_rss(&section, publisher).await?,
        "mail" => run_mail(&section, publisher).await?,
        other => {
            return Err(Box::new(CollectorError::Config(format!(
                "unknown collector kind `{}`",
                other
            ))))
        }
    }
    Ok(())
}

fn channel_of(section: &CollectorSection, default: &str) -> String {
    section
        .rest
        .get("channel")
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

fn downloader_for(section: &CollectorSection) -> Result<UrlDownloader, CollectorError> {
    let url = section
        .url
        .clone()
        .ok_or_else(|| CollectorError::Config("`url` is required".to_string()))?;
    let mut download = DownloadConfig::new(
        url,
        Duration::from_secs(section.download_timeout),
        Duration::from_secs(section.retry_timeout),
    );
    if let (Some(user), Some(password)) = (
        section.rest.get("auth_user"),
        section.rest.get("auth_passwd"),
    ) {
        download.auth = Some((user.clone(), password.clone()));
    }
    UrlDownloader::new(download)
}

async fn run_rows(
    section: &CollectorSection,
    publisher: RawPublisher,
) -> Result<(), CollectorError> {
    let channel = channel_of(section, "rows");
    let spec = CollectorSpec::new(&section.source, &channel, RawMessageType::File)
        .with_content_type("text/csv");
    let time_column_index = section
        .rest
        .get("time_column_index")
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(1);
    let source = DownloadedCsvRows::new(downloader_for(section)?, time_column_index);
    let state_store = StateStore::new(&section.cache_dir, &spec.source(), "DownloadedCsvRows");
    let collector = TimeOrderedRowsCollector::new(
        spec,
        source,
        state_store,
        section.row_count_mismatch_is_fatal,
    )?;
    collector.run(publisher).await
}

async fn run_rss(
    section: &CollectorSection,
    publisher: RawPublisher,
) -> Result<(), CollectorError> {
    let channel = channel_of(section, "rss");
    let spec = CollectorSpec::new(&section.source, &channel, RawMessageType::Stream);
    let state_store = StateStore::new(&section.cache_dir, &spec.source(), "RssCollector");
    let collector = RssCollector::new(
        spec,
        downloader_for(section)?,
        DefaultRssReducer,
        state_store,
    )?;
    collector.run(publisher).await
}

async fn run_mail(
    section: &CollectorSection,
    publisher: RawPublisher,
) -> Result<(), CollectorError> {
    let channel = channel_of(section, "mail");
    let spec = CollectorSpec::new(&section.source, &channel, RawMessageType::File)
        .with_content_type("text/plain");
    let collector = EmailCollector::from_stdin(spec, PlainTextExtractor)?;
    collector.run(publisher).await
}
