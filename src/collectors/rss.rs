//! RSS feed collector.
//!
//! Downloads the feed, reduces each `<item>` to a hashable value, and
//! publishes only the difference against the snapshot saved by the
//! previous run. An unchanged feed publishes an empty JSON list.

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::info;

use super::{
    CollectorError, CollectorSpec, RawPublisher, Result, StateStore, UrlDownloader,
};

#[derive(Debug, Deserialize)]
struct RssDocument {
    channel: RssChannel,
}

#[derive(Debug, Deserialize)]
struct RssChannel {
    #[serde(rename = "item", default)]
    items: Vec<RssItem>,
}

/// One `<item>` of the feed.
#[derive(Debug, Deserialize)]
pub struct RssItem {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Reduce one feed item to the value the snapshot diff operates on.
///
/// The default keeps the link when present, else the title.
pub trait RssItemReducer: Send {
    fn item_to_relevant_data(&self, item: &RssItem) -> Option<String> {
        item.link.clone().or_else(|| item.title.clone())
    }
}

/// Reducer using the default link-or-title rule.
pub struct DefaultRssReducer;

impl RssItemReducer for DefaultRssReducer {}

/// The RSS snapshot-diff collector.
pub struct RssCollector<R: RssItemReducer> {
    spec: CollectorSpec,
    downloader: UrlDownloader,
    reducer: R,
    state_store: StateStore,
}

impl<R: RssItemReducer> RssCollector<R> {
    pub fn new(
        spec: CollectorSpec,
        downloader: UrlDownloader,
        reducer: R,
        state_store: StateStore,
    ) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            downloader,
            reducer,
            state_store,
        })
    }

    /// One collection run: download, diff against the stored snapshot,
    /// publish the difference, commit the new snapshot after the flush.
    pub async fn run(mut self, publisher: RawPublisher) -> Result<()> {
        let last: Option<BTreeSet<String>> = self.state_store.load();

        let raw = self.downloader.download().await?;
        let current = parse_feed(&raw, &self.reducer)?;

        let diff: Vec<&String> = match &last {
            Some(last) => current.difference(last).collect(),
            None => current.iter().collect(),
        };
        info!(
            source = %self.spec.source(),
            items = current.len(),
            fresh = diff.len(),
            "RSS feed processed"
        );

        let body = serde_json::to_vec(&diff)
            .map_err(|e| CollectorError::BadInput(format!("cannot encode diff: {}", e)))?;
        let mut meta = std::collections::BTreeMap::new();
        if let Some(last_modified) = self.downloader.http_last_modified() {
            meta.insert(
                "http_last_modified".to_string(),
                serde_json::json!(last_modified.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
        }
        let components = self.spec.output_components(body, meta);
        publisher.publish(components).await?;
        publisher.flush().await?;
        self.state_store.save(&current)?;
        Ok(())
    }
}

fn parse_feed<R: RssItemReducer>(raw: &[u8], reducer: &R) -> Result<BTreeSet<String>> {
    let text = String::from_utf8_lossy(raw);
    let document: RssDocument = serde_xml_rs::from_str(&text)
        .map_err(|e| CollectorError::BadInput(format!("unparseable RSS document: {}", e)))?;
    Ok(document
        .channel
        .items
        .iter()
        .filter_map(|item| reducer.item_to_relevant_data(item))
        .collect())
}
