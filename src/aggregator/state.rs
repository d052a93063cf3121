//! Aggregation state machine.
//!
//! Per `(source, group)` the aggregator keeps one live window
//! (`HiFreqEventData`) counting similar events. The first event of a
//! window is re-published as `type=event`; later ones are only counted.
//! A window closes when an event arrives on another calendar day or
//! more than the aggregate wait past the window's first event; closed
//! windows are parked in `buffer` until a later event (or the
//! inactivity sweep) flushes them as `type=suppressed`.
//!
//! Invariants:
//! - `first <= until <= source.time` for every window;
//! - `source.time` never decreases;
//! - for every `(source, group)`, the input event count equals the sum
//!   of the published `event` and `suppressed` counts once flushed.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::bus::aggregated_routing_key;
use crate::model::{Event, EventKind};

/// Default ordering slack, in seconds.
pub const DEFAULT_TIME_TOLERANCE_SECS: u64 = 600;
/// Default window split threshold, in hours.
pub const DEFAULT_AGGREGATE_WAIT_HOURS: u32 = 12;
/// Default source inactivity flush threshold, in hours.
pub const DEFAULT_INACTIVITY_TIMEOUT_HOURS: u32 = 24;

/// Errors raised while processing one queued event.
#[derive(Debug, thiserror::Error)]
pub enum QueueProcessingError {
    #[error("missing '_group' field in event")]
    MissingGroup,

    #[error("missing `{0}` field in event")]
    MissingField(&'static str),

    #[error(
        "event out of order: event time {event_time} is older than \
         {source_time} - tolerance for source {source_id}"
    )]
    EventOutOfOrder {
        source_id: String,
        event_time: DateTime<Utc>,
        source_time: DateTime<Utc>,
    },

    #[error("unparseable event: {0}")]
    Malformed(String),
}

/// One aggregation window: the first event's payload plus counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HiFreqEventData {
    pub payload: Event,
    #[serde(with = "crate::model::wire_time")]
    pub first: DateTime<Utc>,
    #[serde(with = "crate::model::wire_time")]
    pub until: DateTime<Utc>,
    pub count: u32,
}

impl HiFreqEventData {
    fn open(payload: Event, time: DateTime<Utc>) -> Self {
        Self {
            payload,
            first: time,
            until: time,
            count: 1,
        }
    }

    /// The window as a `suppressed` event payload.
    fn to_suppressed(&self) -> Event {
        Event {
            kind: Some(EventKind::Suppressed),
            count: Some(self.count),
            until: Some(self.until),
            first_time: Some(self.first),
            group: None,
            ..self.payload.clone()
        }
    }
}

/// Aggregation state of one source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceData {
    /// Max observed event time.
    #[serde(default, with = "crate::model::wire_time::option")]
    pub time: Option<DateTime<Utc>>,
    /// Wall-clock arrival of the most recent in-order event.
    #[serde(default, with = "crate::model::wire_time::option")]
    pub last_event: Option<DateTime<Utc>>,
    /// Live windows by group id.
    pub groups: BTreeMap<String, HiFreqEventData>,
    /// Closed windows awaiting a suppressed flush, by group id.
    pub buffer: BTreeMap<String, HiFreqEventData>,
    /// Ordering slack for this source, in seconds.
    pub time_tolerance_secs: u64,
}

impl SourceData {
    fn new(time_tolerance_secs: u64) -> Self {
        Self {
            time_tolerance_secs,
            ..Self::default()
        }
    }

    fn tolerance(&self) -> Duration {
        Duration::seconds(self.time_tolerance_secs as i64)
    }
}

/// All sources' aggregation state; serializable as a whole for the
/// between-runs snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregatorData {
    pub sources: BTreeMap<String, SourceData>,
}

impl AggregatorData {
    pub fn get_or_create_source_data(
        &mut self,
        source: &str,
        time_tolerance_secs: u64,
    ) -> &mut SourceData {
        self.sources
            .entry(source.to_string())
            .or_insert_with(|| SourceData::new(time_tolerance_secs))
    }
}

/// Aggregator tuning knobs.
#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub time_tolerance_secs: u64,
    pub time_tolerance_per_source: BTreeMap<String, u64>,
    pub aggregate_wait: Duration,
    pub inactivity_timeout: Duration,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            time_tolerance_secs: DEFAULT_TIME_TOLERANCE_SECS,
            time_tolerance_per_source: BTreeMap::new(),
            aggregate_wait: Duration::hours(DEFAULT_AGGREGATE_WAIT_HOURS as i64),
            inactivity_timeout: Duration::hours(DEFAULT_INACTIVITY_TIMEOUT_HOURS as i64),
        }
    }
}

impl AggregatorSettings {
    fn tolerance_secs_for(&self, source: &str) -> u64 {
        self.time_tolerance_per_source
            .get(source)
            .copied()
            .unwrap_or(self.time_tolerance_secs)
    }
}

/// One message the aggregator wants published.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputMessage {
    pub routing_key: String,
    pub event: Event,
}

fn output(source: &str, event: Event) -> OutputMessage {
    OutputMessage {
        routing_key: aggregated_routing_key(source),
        event,
    }
}

/// The aggregator itself: state plus the per-event and sweep logic.
///
/// Time is passed in explicitly (`now`) so the component loop owns the
/// clock and tests can replay scenarios deterministically.
#[derive(Debug, Default)]
pub struct Aggregator {
    pub data: AggregatorData,
    pub settings: AggregatorSettings,
}

impl Aggregator {
    pub fn new(settings: AggregatorSettings) -> Self {
        Self {
            data: AggregatorData::default(),
            settings,
        }
    }

    pub fn with_data(settings: AggregatorSettings, data: AggregatorData) -> Self {
        Self { data, settings }
    }

    /// Process one incoming event; returns the messages to publish.
    ///
    /// An out-of-order event (older than `source.time - tolerance` and
    /// not foldable into its group's live window) fails; state changes
    /// made for previously processed events persist.
    pub fn process_event(
        &mut self,
        event: &Event,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutputMessage>, QueueProcessingError> {
        let source = event
            .source
            .clone()
            .ok_or(QueueProcessingError::MissingField("source"))?;
        let group = event
            .group
            .clone()
            .ok_or(QueueProcessingError::MissingGroup)?;
        let event_time = event.time.ok_or(QueueProcessingError::MissingField("time"))?;

        let tolerance_secs = self.settings.tolerance_secs_for(&source);
        let source_data = self
            .data
            .get_or_create_source_data(&source, tolerance_secs);

        // Ordering check against the newest time seen for this source.
        if let Some(source_time) = source_data.time {
            if event_time < source_time - source_data.tolerance() {
                // A stale event still inside its group's live window is
                // folded in silently; `until`, `source.time` and
                // `last_event` stay untouched.
                if let Some(window) = source_data.groups.get_mut(&group) {
                    if event_time >= window.first {
                        window.count += 1;
                        return Ok(Vec::new());
                    }
                }
                return Err(QueueProcessingError::EventOutOfOrder {
                    source_id: source,
                    event_time,
                    source_time,
                });
            }
        }

        source_data.last_event = Some(now);
        source_data.time = Some(match source_data.time {
            Some(current) => current.max(event_time),
            None => event_time,
        });

        let aggregate_wait = self.settings.aggregate_wait;
        let publish_new = Self::absorb_into_window(
            source_data,
            &group,
            event,
            event_time,
            aggregate_wait,
        );

        let mut out = Vec::new();
        if publish_new {
            out.push(output(
                &source,
                Event {
                    kind: Some(EventKind::Event),
                    group: None,
                    ..event.clone()
                },
            ));
        }
        out.extend(Self::flush_triggered_windows(
            source_data,
            &source,
            event_time,
            aggregate_wait,
        ));
        Ok(out)
    }

    /// Fold the event into its group's window, or open a fresh window.
    /// Returns whether the event should be re-published as `event`.
    fn absorb_into_window(
        source_data: &mut SourceData,
        group: &str,
        event: &Event,
        event_time: DateTime<Utc>,
        aggregate_wait: Duration,
    ) -> bool {
        match source_data.groups.get_mut(group) {
            None => {
                source_data
                    .groups
                    .insert(group.to_string(), HiFreqEventData::open(event.clone(), event_time));
                true
            }
            Some(window) => {
                let next_day = event_time.date_naive() > window.until.date_naive();
                let waited_out = event_time > window.first + aggregate_wait;
                if next_day || waited_out {
                    let closed = std::mem::replace(
                        window,
                        HiFreqEventData::open(event.clone(), event_time),
                    );
                    source_data.buffer.insert(group.to_string(), closed);
                    true
                } else {
                    window.count += 1;
                    if event_time > window.until {
                        window.until = event_time;
                    }
                    false
                }
            }
        }
    }

    /// Flush windows whose suppression this event's time triggers.
    ///
    /// Groups are visited in ascending id order; for each, the parked
    /// window (if any) takes precedence over the live one. Iteration
    /// stops at the first group that does not meet the flush condition,
    /// preserving the "this source is still hot" semantics.
    fn flush_triggered_windows(
        source_data: &mut SourceData,
        source: &str,
        event_time: DateTime<Utc>,
        aggregate_wait: Duration,
    ) -> Vec<OutputMessage> {
        let tolerance = source_data.tolerance();
        let mut out = Vec::new();

        let group_ids: Vec<String> = source_data.groups.keys().cloned().collect();
        for group_id in group_ids {
            let until = source_data
                .buffer
                .get(&group_id)
                .or_else(|| source_data.groups.get(&group_id))
                .map(|window| window.until)
                .expect("group id collected from the live map");

            let day_or_wait = event_time.date_naive() > until.date_naive()
                || event_time > until + aggregate_wait;
            let beyond_tolerance = event_time > until + tolerance;
            if !(day_or_wait && beyond_tolerance) {
                break;
            }

            let window = match source_data.buffer.remove(&group_id) {
                // A parked window flushes alone; the live window stays hot.
                Some(parked) => parked,
                None => source_data
                    .groups
                    .remove(&group_id)
                    .expect("group id collected from the live map"),
            };
            if window.count > 1 {
                out.push(output(source, window.to_suppressed()));
            }
        }
        out
    }

    /// Flush everything belonging to sources inactive longer than the
    /// inactivity timeout, clearing their state.
    pub fn flush_inactive_sources(&mut self, now: DateTime<Utc>) -> Vec<OutputMessage> {
        let timeout = self.settings.inactivity_timeout;
        let mut out = Vec::new();

        for (source, source_data) in self.data.sources.iter_mut() {
            let Some(last_event) = source_data.last_event else {
                continue;
            };
            if now - last_event <= timeout {
                continue;
            }

            let mut group_ids: Vec<String> = source_data
                .buffer
                .keys()
                .chain(source_data.groups.keys())
                .cloned()
                .collect();
            group_ids.sort();
            group_ids.dedup();

            for group_id in group_ids {
                for window in [
                    source_data.buffer.remove(&group_id),
                    source_data.groups.remove(&group_id),
                ]
                .into_iter()
                .flatten()
                {
                    if window.count > 1 {
                        out.push(output(source, window.to_suppressed()));
                    }
                }
            }
            source_data.groups.clear();
            source_data.buffer.clear();
        }
        out
    }
}

#[cfg(test)]
#[path = "tests.rs"]
mod tests;
