use chrono::{DateTime, Utc};
use sea_query::{Expr, MysqlQueryBuilder};

use super::*;
use crate::model::Event;
use crate::query::schema::EventTab;
use crate::query::url_norm;

fn t(s: &str) -> DateTime<Utc> {
    Event::parse_wire_time(s).unwrap()
}

fn access_conditions() -> Vec<SimpleExpr> {
    vec![
        Expr::col((EventTab::Table, EventTab::Restriction)).eq("public"),
        Expr::col((EventTab::Table, EventTab::Source)).eq("own.channel"),
    ]
}

fn record(id: &str, time: &str) -> EventRecord {
    EventRecord {
        id: id.to_string(),
        rid: None,
        source: Some("testsource.testchannel".to_string()),
        restriction: None,
        confidence: None,
        category: Some("bots".to_string()),
        time: t(time),
        modified: None,
        name: None,
        proto: None,
        sport: None,
        dport: None,
        dip: None,
        fqdn: None,
        url: None,
        address: None,
        custom: serde_json::Map::new(),
        until: None,
        count: None,
    }
}

// ============================================================================
// Query composition
// ============================================================================

#[test]
fn test_base_query_applies_filters_and_or_ed_access_conditions() {
    let filters = vec![
        (
            "category".to_string(),
            vec![serde_json::json!("bots"), serde_json::json!("cnc")],
        ),
        ("asn".to_string(), vec![serde_json::json!(1234)]),
    ];
    let sql = build_query_base(&filters, &access_conditions())
        .unwrap()
        .to_string(MysqlQueryBuilder);

    assert!(sql.contains("`event`.`category` IN ('bots', 'cnc')"));
    assert!(sql.contains("`event`.`asn` IN (1234)"));
    assert!(sql.contains(
        "(`event`.`restriction` = 'public' OR `event`.`source` = 'own.channel')"
    ));
}

#[test]
fn test_base_query_refuses_empty_access_conditions() {
    let result = build_query_base(&[], &[]);
    assert!(matches!(result, Err(EventDbError::Access(_))));
}

#[test]
fn test_ip_filters_pack_dotted_quads() {
    let filters = vec![(
        "ip".to_string(),
        vec![serde_json::json!("1.2.3.4")],
    )];
    let sql = build_query_base(&filters, &access_conditions())
        .unwrap()
        .to_string(MysqlQueryBuilder);
    // 1.2.3.4 == 16909060
    assert!(sql.contains("`event`.`ip` IN (16909060)"));
}

#[test]
fn test_ip_net_filter_becomes_numeric_range() {
    let filters = vec![(
        "ip.net".to_string(),
        vec![serde_json::json!("10.0.0.0/8")],
    )];
    let sql = build_query_base(&filters, &access_conditions())
        .unwrap()
        .to_string(MysqlQueryBuilder);
    assert!(sql.contains("`event`.`ip` BETWEEN 167772160 AND 184549375"));
}

#[test]
fn test_sub_filter_becomes_escaped_like() {
    let filters = vec![(
        "fqdn.sub".to_string(),
        vec![serde_json::json!("al%a.example")],
    )];
    let sql = build_query_base(&filters, &access_conditions())
        .unwrap()
        .to_string(MysqlQueryBuilder);
    assert!(sql.contains("LIKE '%al\\\\%a.example%'"));
}

#[test]
fn test_unknown_filter_key_is_refused() {
    let filters = vec![("nonsense".to_string(), vec![serde_json::json!("x")])];
    assert!(matches!(
        build_query_base(&filters, &access_conditions()),
        Err(EventDbError::UnknownFilterField(_))
    ));
}

#[test]
fn test_window_query_bounds_and_order() {
    let base = build_query_base(&[], &access_conditions()).unwrap();
    let window = TimeWindow {
        lower: t("2024-01-07 00:00:00"),
        upper: t("2024-01-10 00:00:00"),
        upper_inclusive: true,
    };
    let sql = build_window_query(&base, &window, None).to_string(MysqlQueryBuilder);
    assert!(sql.contains("`event`.`time` >= '2024-01-07 00:00:00'"));
    assert!(sql.contains("`event`.`time` <= '2024-01-10 00:00:00'"));
    assert!(sql.ends_with("ORDER BY `event`.`time` DESC"));
    assert!(!sql.contains("client_to_event"));

    let open_window = TimeWindow {
        upper_inclusive: false,
        ..window
    };
    let sql = build_window_query(&base, &open_window, None).to_string(MysqlQueryBuilder);
    assert!(sql.contains("`event`.`time` < '2024-01-10 00:00:00'"));
}

#[test]
fn test_window_query_with_clients_joins_on_id_and_both_time_bounds() {
    let base = build_query_base(&[], &access_conditions()).unwrap();
    let window = TimeWindow {
        lower: t("2024-01-07 00:00:00"),
        upper: t("2024-01-10 00:00:00"),
        upper_inclusive: false,
    };
    let clients = vec!["org.one".to_string(), "org.two".to_string()];
    let sql = build_window_query(&base, &window, Some(&clients)).to_string(MysqlQueryBuilder);

    assert!(sql.contains("INNER JOIN `client_to_event`"));
    assert!(sql.contains("`client_to_event`.`id` = `event`.`id`"));
    assert!(sql.contains("`client_to_event`.`time` >= '2024-01-07 00:00:00'"));
    assert!(sql.contains("`client_to_event`.`time` < '2024-01-10 00:00:00'"));
    assert!(sql.contains("`client_to_event`.`client` IN ('org.one', 'org.two')"));
}

#[test]
fn test_actual_query_limit_includes_overfetch_reserve_and_offset() {
    let base = build_query_base(&[], &access_conditions()).unwrap();
    let window = TimeWindow {
        lower: t("2024-01-07 00:00:00"),
        upper: t("2024-01-10 00:00:00"),
        upper_inclusive: true,
    };
    let window_query = build_window_query(&base, &window, None);

    // small remainder: the flat reserve of 100 dominates
    let (sql, limit) = build_actual_query(&window_query, 0, Some(50), 0);
    assert_eq!(limit, Some(150));
    assert!(sql.contains("LIMIT 150"));

    // large remainder: a quarter of what is still expected
    let (sql, limit) = build_actual_query(&window_query, 0, Some(1000), 0);
    assert_eq!(limit, Some(1250));
    assert!(sql.contains("LIMIT 1250"));

    // a running offset skips rows already fetched in this window
    let (sql, _) = build_actual_query(&window_query, 600, Some(1000), 400);
    assert!(sql.contains("LIMIT 750"));
    assert!(sql.contains("OFFSET 600"));

    // without opt.limit there is neither LIMIT nor OFFSET
    let (sql, limit) = build_actual_query(&window_query, 0, None, 0);
    assert_eq!(limit, None);
    assert!(!sql.contains("LIMIT"));
}

// ============================================================================
// Row collapsing
// ============================================================================

#[test]
fn test_collapser_merges_same_id_rows_and_orders_by_id() {
    let mut collapser = RowCollapser::default();
    // three rows at one instant: two share an id
    assert!(collapser.push(record("bbb", "2024-01-09 10:00:00")).is_empty());
    assert!(collapser.push(record("aaa", "2024-01-09 10:00:00")).is_empty());
    assert!(collapser.push(record("bbb", "2024-01-09 10:00:00")).is_empty());

    // a row at an older time completes the group
    let done = collapser.push(record("ccc", "2024-01-09 09:00:00"));
    let ids: Vec<&str> = done.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["aaa", "bbb"]);

    let rest = collapser.finish();
    assert_eq!(rest.len(), 1);
    assert_eq!(rest[0].id, "ccc");
}

#[test]
fn test_collapser_takes_first_row_of_an_id_group() {
    let mut collapser = RowCollapser::default();
    let mut first = record("aaa", "2024-01-09 10:00:00");
    first.fqdn = Some("first.example".to_string());
    let mut second = record("aaa", "2024-01-09 10:00:00");
    second.fqdn = Some("second.example".to_string());
    collapser.push(first);
    collapser.push(second);
    let done = collapser.finish();
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].fqdn.as_deref(), Some("first.example"));
}

// ============================================================================
// URL post-matching
// ============================================================================

fn provisional_record(url_data: serde_json::Value) -> EventRecord {
    let mut rec = record("deadbeefdeadbeefdeadbeefdeadbeef", "2024-01-09 10:00:00");
    rec.url = Some(format!("{}xyz", PROVISIONAL_URL_SEARCH_KEY_PREFIX));
    rec.custom
        .insert("url_data".to_string(), url_data);
    rec
}

fn b64(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::URL_SAFE.encode(data)
}

#[test]
fn test_plain_records_pass_through_unchanged() {
    let mut matcher = UrlMatcher::new(&[]);
    let mut rec = record("aaa", "2024-01-09 10:00:00");
    rec.url = Some("http://plain.example/".to_string());
    let out = matcher.apply(rec.clone()).unwrap();
    assert_eq!(out.url, rec.url);
}

#[test]
fn test_provisional_url_without_url_data_is_dropped() {
    let mut matcher = UrlMatcher::new(&[]);
    let mut rec = record("aaa", "2024-01-09 10:00:00");
    rec.url = Some(format!("{}xyz", PROVISIONAL_URL_SEARCH_KEY_PREFIX));
    assert!(matcher.apply(rec).is_none());
}

#[test]
fn test_url_data_without_provisional_url_is_dropped() {
    let mut matcher = UrlMatcher::new(&[]);
    let mut rec = record("aaa", "2024-01-09 10:00:00");
    rec.url = Some("http://normal.example/".to_string());
    rec.custom.insert(
        "url_data".to_string(),
        serde_json::json!({"orig_b64": b64(b"http://x/"), "norm_brief": "umer"}),
    );
    assert!(matcher.apply(rec).is_none());
}

#[test]
fn test_modern_url_data_replaces_url_with_normalized_form() {
    let mut matcher = UrlMatcher::new(&[]);
    let rec = provisional_record(serde_json::json!({
        "orig_b64": b64(b"HTTP://Example.COM"),
        "norm_brief": "umer",
    }));
    let out = matcher.apply(rec).unwrap();
    assert_eq!(out.url.as_deref(), Some("http://example.com/"));
    assert!(!out.custom.contains_key("url_data"));
}

#[test]
fn test_legacy_url_data_uses_frozen_option_set() {
    let mut matcher = UrlMatcher::new(&[]);
    let rec = provisional_record(serde_json::json!({
        "url_orig": b64(b"HTTP://Example.COM"),
        "url_norm_opts": {"transcode1st": true, "epslash": true, "rmzone": true},
    }));
    let out = matcher.apply(rec).unwrap();
    assert_eq!(out.url.as_deref(), Some("http://example.com/"));

    // any other legacy combination is malformed
    let rec = provisional_record(serde_json::json!({
        "url_orig": b64(b"HTTP://Example.COM"),
        "url_norm_opts": {"transcode1st": true, "epslash": false, "rmzone": true},
    }));
    assert!(matcher.apply(rec).is_none());
}

#[test]
fn test_malformed_url_data_shapes_are_dropped() {
    let mut matcher = UrlMatcher::new(&[]);
    for url_data in [
        serde_json::json!({"orig_b64": "", "norm_brief": "umer"}),
        serde_json::json!({"orig_b64": b64(b"http://x/")}),
        serde_json::json!({"orig_b64": b64(b"http://x/"), "norm_brief": "umer", "extra": 1}),
        serde_json::json!("not an object"),
    ] {
        assert!(matcher.apply(provisional_record(url_data)).is_none());
    }
}

#[test]
fn test_request_url_matching_keeps_only_matching_events() {
    let wanted = b64(b"http://WANTED.example/");
    let mut matcher = UrlMatcher::new(&[wanted]);

    let matching = provisional_record(serde_json::json!({
        "orig_b64": b64(b"HTTP://wanted.EXAMPLE/"),
        "norm_brief": "umer",
    }));
    let out = matcher.apply(matching).unwrap();
    assert_eq!(out.url.as_deref(), Some("http://wanted.example/"));

    let other = provisional_record(serde_json::json!({
        "orig_b64": b64(b"http://other.example/"),
        "norm_brief": "umer",
    }));
    assert!(matcher.apply(other).is_none());
}

#[test]
fn test_normalization_round_trip_is_stable() {
    let once = url_norm::normalize_url(b"HTTP://Host.Example:80/a b", "umer");
    let twice = url_norm::normalize_url(once.as_bytes(), "umer");
    assert_eq!(once, twice);
}
