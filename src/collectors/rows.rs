//! Time-ordered-rows collector.
//!
//! The source exposes row-shaped data ordered by a time/order field.
//! One pass selects the rows that are strictly newer than the saved
//! watermark, plus rows sharing the new maximum that were not seen
//! before. Publication of the selected rows and the state commit are
//! ordered so a crash can duplicate work but never lose rows.
//!
//! Row times can be of any sortable type; a newer row must compare
//! greater than an older one and equal times must compare equal. The
//! value returned by `oldest_possible_row_time()` must sort below any
//! real row time.

use std::collections::BTreeSet;
use std::fmt::Debug;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{CollectorError, CollectorSpec, RawPublisher, Result, StateStore};

/// A source of time-ordered rows.
///
/// `obtain_orig_data`, `pick_raw_row_time` and `clean_row_time` must be
/// implemented; the remaining methods have sensible defaults.
#[async_trait]
pub trait RowsSource: Send {
    /// Sortable row time/order type.
    type RowTime: Ord + Clone + Debug + Serialize + DeserializeOwned + Send + Sync;

    /// Fetch the original raw data.
    async fn obtain_orig_data(&mut self) -> Result<String>;

    /// A value sorting below any real row time (e.g. `""` for
    /// ISO-formatted strings).
    fn oldest_possible_row_time(&self) -> Self::RowTime;

    /// Pick the raw time/order field out of a row; `None` skips the row.
    fn pick_raw_row_time<'r>(&self, row: &'r str) -> Option<&'r str>;

    /// Validate and normalize a raw time value; `None` skips the row.
    fn clean_row_time(&self, raw: &str) -> Option<Self::RowTime>;

    /// Skips blank rows and `#` comments by default.
    fn should_row_be_used(&self, row: &str) -> bool {
        let trimmed = row.trim();
        !trimmed.is_empty() && !row.starts_with('#')
    }

    fn split_orig_data_into_rows<'d>(&self, orig_data: &'d str) -> Vec<&'d str> {
        orig_data.split('\n').collect()
    }

    fn prepare_selected_data(&self, fresh_rows: &[&str]) -> String {
        fresh_rows.join("\n")
    }

    /// Extra `meta` headers for the published message.
    fn meta(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        Default::default()
    }
}

/// Durable state: the watermark plus everything needed to recognize
/// already-collected rows at the watermark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowsState<T> {
    pub newest_row_time: T,
    pub newest_rows: BTreeSet<String>,
    /// Total usable rows seen by the previous run; absent in legacy
    /// state files.
    #[serde(default)]
    pub rows_count: Option<u64>,
}

impl<T> RowsState<T> {
    pub fn initial(oldest_possible_row_time: T) -> Self {
        Self {
            newest_row_time: oldest_possible_row_time,
            newest_rows: BTreeSet::new(),
            rows_count: Some(0),
        }
    }
}

/// Outcome of one selection pass.
pub(crate) struct Selection<'d, T> {
    pub fresh_rows: Vec<&'d str>,
    /// New state to commit; `None` when nothing fresh was found.
    pub new_state: Option<RowsState<T>>,
    pub problems: Vec<String>,
}

/// Single-pass fresh-row selection against the previous state.
pub(crate) fn select_fresh_rows<'d, S: RowsSource>(
    source: &S,
    all_rows: &[&'d str],
    prev: &RowsState<S::RowTime>,
) -> Selection<'d, S::RowTime> {
    let mut newest_row_time: Option<S::RowTime> = None;
    let mut newest_rows: BTreeSet<String> = BTreeSet::new();
    let mut rows_count: u64 = 0;
    let mut fresh_rows: Vec<&str> = Vec::new();

    for &row in all_rows {
        let row_time = match extract_row_time(source, row) {
            Some(t) => t,
            None => continue,
        };

        rows_count += 1;

        if row_time < prev.newest_row_time {
            // old enough to assume it has already been collected
            continue;
        }

        let is_new_maximum = match &newest_row_time {
            None => true,
            Some(newest) => row_time > *newest,
        };
        if is_new_maximum {
            newest_row_time = Some(row_time.clone());
            newest_rows.clear();
        }

        debug_assert!(newest_row_time.as_ref().is_some_and(|n| row_time <= *n));
        if newest_row_time.as_ref() == Some(&row_time) {
            newest_rows.insert(row.to_string());
        }

        if prev.newest_rows.contains(row) {
            // amongst the previously-newest rows, already collected
            debug_assert!(row_time == prev.newest_row_time);
            continue;
        }

        fresh_rows.push(row);
    }

    let problems = check_counts(prev.rows_count, rows_count, &fresh_rows);

    let new_state = if fresh_rows.is_empty() {
        None
    } else {
        Some(RowsState {
            newest_row_time: newest_row_time.expect("fresh rows imply a newest row time"),
            newest_rows,
            rows_count: Some(rows_count),
        })
    };

    Selection {
        fresh_rows,
        new_state,
        problems,
    }
}

fn extract_row_time<S: RowsSource>(source: &S, row: &str) -> Option<S::RowTime> {
    if !source.should_row_be_used(row) {
        return None;
    }
    let raw = source.pick_raw_row_time(row)?;
    source.clean_row_time(raw)
}

/// The two data-source consistency signals: duplicates among the fresh
/// rows, and drift of the total row count.
fn check_counts(prev_rows_count: Option<u64>, rows_count: u64, fresh_rows: &[&str]) -> Vec<String> {
    let mut problems = Vec::new();

    let unique: BTreeSet<&str> = fresh_rows.iter().copied().collect();
    if unique.len() != fresh_rows.len() {
        problems.push("Found duplicates among fresh rows.".to_string());
    }

    if let Some(prev) = prev_rows_count {
        let expected = prev + fresh_rows.len() as u64;
        if rows_count != expected {
            problems.push(format!(
                "The currently stated count of all rows ({}) is not equal to the sum of \
                 the count stated by the previous run ({}) and the count of the currently \
                 collected fresh rows ({}); the source changed behind our back or some \
                 fresh rows duplicate rows collected earlier.",
                rows_count,
                prev,
                fresh_rows.len()
            ));
        }
    }

    problems
}

/// Runs a `RowsSource` to completion: fetch, select, publish, commit.
pub struct TimeOrderedRowsCollector<S: RowsSource> {
    spec: CollectorSpec,
    source: S,
    state_store: StateStore,
    row_count_mismatch_is_fatal: bool,
}

impl<S: RowsSource> TimeOrderedRowsCollector<S> {
    pub fn new(
        spec: CollectorSpec,
        source: S,
        state_store: StateStore,
        row_count_mismatch_is_fatal: bool,
    ) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            source,
            state_store,
            row_count_mismatch_is_fatal,
        })
    }

    /// One collection run. The state commit happens only after the
    /// publish has been flushed to the broker.
    pub async fn run(mut self, publisher: RawPublisher) -> Result<()> {
        let state = self
            .state_store
            .load_or_else(|| RowsState::initial(self.source.oldest_possible_row_time()));

        let orig_data = self.source.obtain_orig_data().await?;
        let all_rows = self.source.split_orig_data_into_rows(&orig_data);
        let selection = select_fresh_rows(&self.source, &all_rows, &state);

        if !selection.problems.is_empty() {
            let message = selection.problems.join("\n");
            if self.row_count_mismatch_is_fatal {
                return Err(CollectorError::RowCountMismatch(message));
            }
            warn!(source = %self.spec.source(), %message, "row consistency problems");
        }

        match selection.new_state {
            None => {
                info!(source = %self.spec.source(), "no fresh rows");
                publisher.flush().await?;
            }
            Some(new_state) => {
                let body = self.source.prepare_selected_data(&selection.fresh_rows);
                info!(
                    source = %self.spec.source(),
                    fresh_rows = selection.fresh_rows.len(),
                    "publishing fresh rows"
                );
                let components = self
                    .spec
                    .output_components(body.into_bytes(), self.source.meta());
                publisher.publish(components).await?;
                publisher.flush().await?;
                self.state_store.save(&new_state)?;
            }
        }
        Ok(())
    }
}

/// Rows source over a downloaded CSV-ish feed whose time/order field
/// is an ISO date or date+time in one column.
///
/// Cleaned row times are ISO strings normalized only by trimming and
/// unquoting, so newer values sort greater and equal times compare
/// equal; the empty string is the oldest possible value.
pub struct DownloadedCsvRows {
    downloader: super::UrlDownloader,
    time_column_index: usize,
}

impl DownloadedCsvRows {
    pub fn new(downloader: super::UrlDownloader, time_column_index: usize) -> Self {
        Self {
            downloader,
            time_column_index,
        }
    }
}

#[async_trait]
impl RowsSource for DownloadedCsvRows {
    type RowTime = String;

    async fn obtain_orig_data(&mut self) -> Result<String> {
        let raw = self.downloader.download().await?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn oldest_possible_row_time(&self) -> String {
        String::new()
    }

    fn pick_raw_row_time<'r>(&self, row: &'r str) -> Option<&'r str> {
        row.split(',').nth(self.time_column_index)
    }

    fn clean_row_time(&self, raw: &str) -> Option<String> {
        let cleaned = raw.trim().trim_matches('"').trim();
        let valid = chrono::NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%d %H:%M:%S").is_ok()
            || chrono::NaiveDateTime::parse_from_str(cleaned, "%Y-%m-%dT%H:%M:%S").is_ok()
            || chrono::NaiveDate::parse_from_str(cleaned, "%Y-%m-%d").is_ok();
        if valid {
            Some(cleaned.to_string())
        } else {
            warn!(value = %raw, "cannot parse a row time field, skipping the row");
            None
        }
    }

    fn meta(&self) -> std::collections::BTreeMap<String, serde_json::Value> {
        let mut meta = std::collections::BTreeMap::new();
        if let Some(last_modified) = self.downloader.http_last_modified() {
            meta.insert(
                "http_last_modified".to_string(),
                serde_json::json!(last_modified.format("%Y-%m-%d %H:%M:%S").to_string()),
            );
        }
        meta
    }
}
