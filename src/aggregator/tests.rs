use chrono::{DateTime, Utc};

use super::*;
use crate::model::{Event, EventKind};

const SOURCE: &str = "testsource.testchannel";
const OTHER_SOURCE: &str = "othersource.otherchannel";

fn t(s: &str) -> DateTime<Utc> {
    Event::parse_wire_time(s).unwrap()
}

fn ev(id: &str, group: &str, time: &str) -> Event {
    Event {
        id: Some(id.to_string()),
        source: Some(SOURCE.to_string()),
        group: Some(group.to_string()),
        time: Some(t(time)),
        ..Event::default()
    }
}

fn settings() -> AggregatorSettings {
    AggregatorSettings::default()
}

/// Feed events in order; panics on an unexpected processing error.
fn run_events(aggregator: &mut Aggregator, events: &[Event], now: DateTime<Utc>) -> Vec<OutputMessage> {
    let mut out = Vec::new();
    for event in events {
        out.extend(aggregator.process_event(event, now).unwrap());
    }
    out
}

fn ids_of_kind(messages: &[OutputMessage], kind: EventKind) -> Vec<String> {
    messages
        .iter()
        .filter(|m| m.event.kind == Some(kind))
        .map(|m| m.event.id.clone().unwrap())
        .collect()
}

fn suppressed_by_id<'m>(messages: &'m [OutputMessage], id: &str) -> &'m Event {
    messages
        .iter()
        .find(|m| m.event.kind == Some(EventKind::Suppressed) && m.event.id.as_deref() == Some(id))
        .map(|m| &m.event)
        .unwrap()
}

#[test]
fn test_three_groups_single_day_publish_three_events_no_suppressed() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("1", "group1", "2017-06-01 10:00:00"),
        ev("2", "group2", "2017-06-01 10:00:00"),
        ev("3", "group3", "2017-06-01 11:00:00"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["1", "2", "3"]);
    assert!(ids_of_kind(&out, EventKind::Suppressed).is_empty());
    // routing key carries the aggregated prefix; `_group` is stripped
    assert!(out
        .iter()
        .all(|m| m.routing_key == "event.aggregated.testsource.testchannel"));
    assert!(out.iter().all(|m| m.event.group.is_none()));
}

#[test]
fn test_next_day_event_flushes_suppressed_for_its_group() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("a", "group1", "2017-06-01 18:00:00"),
        ev("b", "group2", "2017-06-01 19:00:00"),
        ev("c", "group1", "2017-06-01 20:00:00"),
        ev("d", "group1", "2017-06-02 01:00:02"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "b", "d"]);
    // group2 has a single event, so its window flushes to nothing
    assert_eq!(ids_of_kind(&out, EventKind::Suppressed), vec!["a"]);
    let suppressed = suppressed_by_id(&out, "a");
    assert_eq!(suppressed.count, Some(2));
    assert_eq!(suppressed.first_time, Some(t("2017-06-01 18:00:00")));
    assert_eq!(suppressed.until, Some(t("2017-06-01 20:00:00")));
}

#[test]
fn test_aggregate_wait_exceeded_flushes_other_groups_too() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("1", "group1", "2017-06-01 10:00:00"),
        ev("2", "group2", "2017-06-01 10:00:00"),
        ev("3", "group3", "2017-06-01 10:00:00"),
        ev("4", "group1", "2017-06-01 11:00:00"),
        ev("5", "group2", "2017-06-01 11:00:00"),
        ev("6", "group1", "2017-06-01 12:00:00"),
        ev("7", "group1", "2017-06-02 00:00:00"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["1", "2", "3", "7"]);
    // group1's parked window and group2's live window both flush;
    // group3 had a single event
    assert_eq!(ids_of_kind(&out, EventKind::Suppressed), vec!["1", "2"]);

    let group1 = suppressed_by_id(&out, "1");
    assert_eq!(group1.count, Some(3));
    assert_eq!(group1.first_time, Some(t("2017-06-01 10:00:00")));
    assert_eq!(group1.until, Some(t("2017-06-01 12:00:00")));

    let group2 = suppressed_by_id(&out, "2");
    assert_eq!(group2.count, Some(2));
    assert_eq!(group2.until, Some(t("2017-06-01 11:00:00")));
}

#[test]
fn test_wait_is_measured_from_window_first_event() {
    let mut aggregator = Aggregator::new(settings());
    // 01:00 and 02:00 aggregate; 14:00:01 is > first + 12h, so it opens
    // a new window and flushes the old one.
    let events = [
        ev("a", "group1", "2017-06-01 01:00:00"),
        ev("b", "group1", "2017-06-01 02:00:00"),
        ev("c", "group1", "2017-06-01 14:00:01"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "c"]);
    let suppressed = suppressed_by_id(&out, "a");
    assert_eq!(suppressed.count, Some(2));
    assert_eq!(suppressed.until, Some(t("2017-06-01 02:00:00")));
}

#[test]
fn test_within_wait_events_keep_aggregating() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("a", "group1", "2017-06-01 01:00:00"),
        ev("b", "group1", "2017-06-01 11:00:01"),
        ev("c", "group1", "2017-06-01 12:00:01"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));
    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a"]);
    assert!(ids_of_kind(&out, EventKind::Suppressed).is_empty());

    let window = &aggregator.data.sources[SOURCE].groups["group1"];
    assert_eq!(window.count, 3);
    assert_eq!(window.until, t("2017-06-01 12:00:01"));
}

#[test]
fn test_next_day_within_tolerance_does_not_flush() {
    // The triggering event is on the next calendar day, but not past
    // the flushed group's `until` by more than the tolerance, so the
    // flush scan stops immediately.
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("a", "group1", "2017-06-01 17:00:00"),
        ev("b", "group2", "2017-06-01 18:00:00"),
        ev("c", "group2", "2017-06-01 19:00:00"),
        ev("d", "group1", "2017-06-01 23:57:00"),
        ev("e", "group1", "2017-06-02 00:03:01"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "b", "e"]);
    assert!(ids_of_kind(&out, EventKind::Suppressed).is_empty());
    // group1's closed window stays parked for a later flush
    assert!(aggregator.data.sources[SOURCE].buffer.contains_key("group1"));
}

#[test]
fn test_flush_scan_stops_at_first_still_hot_group() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("a", "group1", "2017-06-01 17:00:00"),
        ev("b", "group2", "2017-06-01 18:00:00"),
        ev("c", "group1", "2017-06-01 19:00:00"),
        ev("d", "group2", "2017-06-01 23:57:00"),
        ev("e", "group1", "2017-06-02 00:03:01"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "b", "e"]);
    // group1 flushes; group2 (until 23:57) is within tolerance, so the
    // scan stops there
    assert_eq!(ids_of_kind(&out, EventKind::Suppressed), vec!["a"]);
    let suppressed = suppressed_by_id(&out, "a");
    assert_eq!(suppressed.count, Some(2));
    assert_eq!(suppressed.until, Some(t("2017-06-01 19:00:00")));
}

#[test]
fn test_event_within_tolerance_is_aggregated_without_bumping_until() {
    let mut aggregator = Aggregator::new(settings());
    let events = [
        ev("a", "group1", "2017-06-01 10:00:00"),
        // 9 minutes old: within the 600 s tolerance
        ev("b", "group1", "2017-06-01 09:51:00"),
        ev("c", "group1", "2017-06-02 11:00:02"),
    ];
    let out = run_events(&mut aggregator, &events, t("2017-07-01 07:00:00"));

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "c"]);
    let suppressed = suppressed_by_id(&out, "a");
    assert_eq!(suppressed.count, Some(2));
    assert_eq!(suppressed.until, Some(t("2017-06-01 10:00:00")));
    assert_eq!(suppressed.first_time, Some(t("2017-06-01 10:00:00")));
}

#[test]
fn test_stale_event_inside_window_is_folded_silently() {
    let mut aggregator = Aggregator::new(settings());
    let now_first = t("2017-07-01 07:00:00");
    let now_later = t("2017-07-01 08:00:00");

    let mut out = Vec::new();
    out.extend(
        aggregator
            .process_event(&ev("a", "group1", "2017-06-01 10:00:00"), now_first)
            .unwrap(),
    );
    out.extend(
        aggregator
            .process_event(&ev("b", "group1", "2017-06-01 12:00:00"), now_first)
            .unwrap(),
    );
    // 11:00 is older than 12:00 - tolerance but not older than the
    // window's first event: folded in, nothing published, no clock update
    out.extend(
        aggregator
            .process_event(&ev("c", "group1", "2017-06-01 11:00:00"), now_later)
            .unwrap(),
    );
    assert_eq!(
        aggregator.data.sources[SOURCE].last_event,
        Some(now_first),
        "a stale event must not refresh the source's activity clock"
    );

    out.extend(
        aggregator
            .process_event(&ev("d", "group1", "2017-06-02 11:00:02"), now_later)
            .unwrap(),
    );

    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["a", "d"]);
    let suppressed = suppressed_by_id(&out, "a");
    assert_eq!(suppressed.count, Some(3));
    assert_eq!(suppressed.until, Some(t("2017-06-01 12:00:00")));
}

#[test]
fn test_out_of_order_event_errors_and_leaves_last_event_unchanged() {
    let mut aggregator = Aggregator::new(settings());
    let now_first = t("2017-07-01 07:00:00");
    let now_later = t("2017-07-01 08:00:00");

    aggregator
        .process_event(&ev("a", "group1", "2017-06-01 10:00:00"), now_first)
        .unwrap();

    // older than the window's first event
    let result = aggregator.process_event(&ev("b", "group1", "2017-06-01 08:00:00"), now_later);
    assert!(matches!(
        result,
        Err(QueueProcessingError::EventOutOfOrder { .. })
    ));

    // stale event of an unknown group
    let result = aggregator.process_event(&ev("c", "group2", "2017-06-01 08:00:00"), now_later);
    assert!(matches!(
        result,
        Err(QueueProcessingError::EventOutOfOrder { .. })
    ));

    assert_eq!(aggregator.data.sources[SOURCE].last_event, Some(now_first));
}

#[test]
fn test_missing_group_fails() {
    let mut aggregator = Aggregator::new(settings());
    let mut event = ev("a", "group1", "2017-06-01 10:00:00");
    event.group = None;
    let result = aggregator.process_event(&event, t("2017-07-01 07:00:00"));
    assert!(matches!(result, Err(QueueProcessingError::MissingGroup)));
}

#[test]
fn test_counts_are_conserved_per_group() {
    let mut aggregator = Aggregator::new(settings());
    let now = t("2017-07-01 07:00:00");
    let mut messages = Vec::new();
    for hour in 0..5 {
        let id = format!("g1-{}", hour);
        messages.extend(
            aggregator
                .process_event(
                    &ev(&id, "group1", &format!("2017-06-01 0{}:10:00", hour)),
                    now,
                )
                .unwrap(),
        );
    }
    for hour in 4..7 {
        let id = format!("g2-{}", hour);
        messages.extend(
            aggregator
                .process_event(
                    &ev(&id, "group2", &format!("2017-06-01 0{}:20:00", hour)),
                    now,
                )
                .unwrap(),
        );
    }
    // far-future event on a third group flushes everything else
    messages.extend(
        aggregator
            .process_event(&ev("x", "group3", "2017-06-03 00:00:00"), now)
            .unwrap(),
    );

    let total =
        |group_first_id: &str| -> u32 {
            messages
                .iter()
                .filter(|m| {
                    m.event.id.as_deref().map(|i| i.starts_with(group_first_id)) == Some(true)
                })
                .map(|m| match m.event.kind {
                    Some(EventKind::Event) => 1,
                    Some(EventKind::Suppressed) => m.event.count.unwrap() - 1,
                    None => 0,
                })
                .sum()
        };
    // each group's `event` plus its suppressed `count` covers every input
    assert_eq!(total("g1-"), 5);
    assert_eq!(total("g2-"), 3);
}

fn parked_window(id: &str, group: &str, first: &str, until: &str, count: u32) -> HiFreqEventData {
    HiFreqEventData {
        payload: ev(id, group, first),
        first: t(first),
        until: t(until),
        count,
    }
}

fn source_with_windows(source: &str) -> SourceData {
    let mut data = SourceData::new(DEFAULT_TIME_TOLERANCE_SECS);
    let mut payload = parked_window("b1", "group1", "2017-06-01 07:00:00", "2017-06-01 09:00:00", 5);
    payload.payload.source = Some(source.to_string());
    data.buffer.insert("group1".to_string(), payload);
    let mut live = parked_window("g2", "group2", "2017-06-01 08:00:00", "2017-06-01 10:00:00", 4);
    live.payload.source = Some(source.to_string());
    data.groups.insert("group2".to_string(), live);
    let mut single = parked_window("g3", "group3", "2017-06-01 07:30:00", "2017-06-01 07:30:00", 1);
    single.payload.source = Some(source.to_string());
    data.groups.insert("group3".to_string(), single);
    data.time = Some(t("2017-06-01 10:00:00"));
    data
}

#[test]
fn test_inactivity_sweep_flushes_only_stale_sources() {
    let mut aggregator = Aggregator::new(settings());
    let mut tested = source_with_windows(SOURCE);
    tested.last_event = Some(t("2017-06-01 14:00:00"));
    let mut other = source_with_windows(OTHER_SOURCE);
    other.last_event = Some(t("2017-06-01 20:00:00"));
    aggregator.data.sources.insert(SOURCE.to_string(), tested);
    aggregator.data.sources.insert(OTHER_SOURCE.to_string(), other);

    // only the first source has been quiet for more than 24 h
    let out = aggregator.flush_inactive_sources(t("2017-06-02 15:00:00"));
    let ids: Vec<String> = out.iter().map(|m| m.event.id.clone().unwrap()).collect();
    assert_eq!(ids, vec!["b1", "g2"]); // group3's count==1 window flushes to nothing
    assert!(out
        .iter()
        .all(|m| m.event.kind == Some(EventKind::Suppressed)));

    let flushed = &aggregator.data.sources[SOURCE];
    assert!(flushed.groups.is_empty() && flushed.buffer.is_empty());
    let intact = &aggregator.data.sources[OTHER_SOURCE];
    assert!(!intact.groups.is_empty() && !intact.buffer.is_empty());

    // later, the second source crosses the threshold too
    let out = aggregator.flush_inactive_sources(t("2017-06-02 20:02:00"));
    assert_eq!(out.len(), 2);
    assert!(out
        .iter()
        .all(|m| m.event.source.as_deref() == Some(OTHER_SOURCE)));
}

#[test]
fn test_inactivity_sweep_leaves_fresh_sources_alone() {
    let mut aggregator = Aggregator::new(settings());
    let mut tested = source_with_windows(SOURCE);
    tested.last_event = Some(t("2017-06-01 14:00:00"));
    aggregator.data.sources.insert(SOURCE.to_string(), tested);

    let out = aggregator.flush_inactive_sources(t("2017-06-02 14:00:00"));
    assert!(out.is_empty());
    assert!(!aggregator.data.sources[SOURCE].groups.is_empty());
}

#[test]
fn test_state_snapshot_round_trip() {
    let mut aggregator = Aggregator::new(settings());
    let now = t("2017-07-01 07:00:00");
    aggregator
        .process_event(&ev("a", "group1", "2017-06-01 10:00:00"), now)
        .unwrap();
    aggregator
        .process_event(&ev("b", "group1", "2017-06-01 11:00:00"), now)
        .unwrap();

    let snapshot = serde_json::to_string(&aggregator.data).unwrap();
    let restored: AggregatorData = serde_json::from_str(&snapshot).unwrap();
    let window = &restored.sources[SOURCE].groups["group1"];
    assert_eq!(window.count, 2);
    assert_eq!(window.first, t("2017-06-01 10:00:00"));
    assert_eq!(window.until, t("2017-06-01 11:00:00"));
    assert_eq!(restored.sources[SOURCE].time, Some(t("2017-06-01 11:00:00")));
}

#[test]
fn test_per_source_tolerance_override() {
    let mut custom = settings();
    custom
        .time_tolerance_per_source
        .insert(SOURCE.to_string(), 3600);
    let mut aggregator = Aggregator::new(custom);
    let now = t("2017-07-01 07:00:00");

    aggregator
        .process_event(&ev("a", "group1", "2017-06-01 10:00:00"), now)
        .unwrap();
    // 40 minutes old: beyond the default tolerance, within the override
    let out = aggregator
        .process_event(&ev("b", "group2", "2017-06-01 09:20:00"), now)
        .unwrap();
    assert_eq!(ids_of_kind(&out, EventKind::Event), vec!["b"]);
}
