//! Ordered, resumable event search.
//!
//! One request turns into a sequence of per-window SQL queries (see
//! `windows`), newest first, each ordered by `event.time DESC`. Rows
//! sharing an `id` (the `(id, ip)` denormalization) collapse into one
//! result record. When `opt.limit` is set, each sub-query overfetches
//! by a reserve so the multi-row-to-one-result collapsing does not
//! force a long tail of narrow queries.
//!
//! Results are delivered through a bounded channel: the consumer's
//! pace drives the queries, dropping the stream cancels the work, and
//! yielded results stay valid if a later query fails.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sea_query::{Cond, Expr, MysqlQueryBuilder, Order, Query, SelectStatement, SimpleExpr};
use sqlx::mysql::MySqlRow;
use sqlx::{MySqlPool, Row};
use tokio_stream::StreamExt;
use tracing::{debug, error};

use crate::model::wire_time;

use super::schema::{ClientToEvent, EventTab, RESULT_COLUMNS};
use super::url_norm::{
    decode_url_b64, norm_brief_from_legacy_opts, normalize_url,
    PROVISIONAL_URL_SEARCH_KEY_PREFIX,
};
use super::windows::{DayStepWindows, TimeWindow};
use super::{wrap_db_error, EventDbError};

/// Rows fetched per batch from the server-side cursor.
pub const YIELD_PER: usize = 100;

/// Cleaned, deanonymized request parameters.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    /// Mandatory lower time bound.
    pub time_min: Option<DateTime<Utc>>,
    pub time_max: Option<DateTime<Utc>>,
    pub time_until: Option<DateTime<Utc>>,
    pub opt_limit: Option<u64>,
    /// The `client` parameter (must stay empty for `report/inside`).
    pub client: Vec<String>,
    /// Request-side URLs for `url_data`-based matching (base64).
    pub url_b64: Vec<String>,
    /// Remaining filter parameters: key -> one-or-more values.
    pub filters: Vec<(String, Vec<serde_json::Value>)>,
}

/// One event search result.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct EventRecord {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restriction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(with = "wire_time")]
    pub time: DateTime<Utc>,
    #[serde(
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Aggregated address data, as stored (JSON).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub custom: serde_json::Map<String, serde_json::Value>,
    #[serde(
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub until: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
}

impl EventRecord {
    fn from_row(row: &MySqlRow) -> Result<Self, EventDbError> {
        fn get<'r, T: sqlx::Decode<'r, sqlx::MySql> + sqlx::Type<sqlx::MySql>>(
            row: &'r MySqlRow,
            name: &str,
        ) -> Result<Option<T>, EventDbError> {
            row.try_get::<Option<T>, _>(name).map_err(wrap_db_error)
        }

        let time: chrono::NaiveDateTime = row.try_get("time").map_err(wrap_db_error)?;
        let custom = get::<String>(row, "custom")?
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok())
            .and_then(|value| match value {
                serde_json::Value::Object(map) => Some(map),
                _ => None,
            })
            .unwrap_or_default();
        let address = get::<String>(row, "address")?
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok());

        Ok(Self {
            id: row.try_get("id").map_err(wrap_db_error)?,
            rid: get(row, "rid")?,
            source: get(row, "source")?,
            restriction: get(row, "restriction")?,
            confidence: get(row, "confidence")?,
            category: get(row, "category")?,
            time: time.and_utc(),
            modified: get::<chrono::NaiveDateTime>(row, "modified")?.map(|dt| dt.and_utc()),
            name: get(row, "name")?,
            proto: get(row, "proto")?,
            sport: get::<u16>(row, "sport")?,
            dport: get::<u16>(row, "dport")?,
            dip: get::<u32>(row, "dip")?.map(|packed| std::net::Ipv4Addr::from(packed).to_string()),
            fqdn: get(row, "fqdn")?,
            url: get(row, "url")?,
            address,
            custom,
            until: get::<chrono::NaiveDateTime>(row, "until")?.map(|dt| dt.and_utc()),
            count: get::<u32>(row, "count")?,
        })
    }
}

// ============================================================================
// Filter expressions
// ============================================================================

fn column_for(key: &str) -> Result<EventTab, EventDbError> {
    Ok(match key {
        "id" => EventTab::Id,
        "rid" => EventTab::Rid,
        "source" => EventTab::Source,
        "restriction" => EventTab::Restriction,
        "confidence" => EventTab::Confidence,
        "category" => EventTab::Category,
        "name" => EventTab::Name,
        "proto" => EventTab::Proto,
        "sport" => EventTab::Sport,
        "dport" => EventTab::Dport,
        "dip" => EventTab::Dip,
        "ip" => EventTab::Ip,
        "asn" => EventTab::Asn,
        "cc" => EventTab::Cc,
        "fqdn" => EventTab::Fqdn,
        "url" => EventTab::Url,
        _ => return Err(EventDbError::UnknownFilterField(key.to_string())),
    })
}

fn is_packed_ip_column(column: EventTab) -> bool {
    matches!(column, EventTab::Ip | EventTab::Dip)
}

fn to_query_value(
    column: EventTab,
    value: &serde_json::Value,
) -> Result<sea_query::Value, EventDbError> {
    let bad = |v: &serde_json::Value| EventDbError::BadFilterValue {
        key: format!("{:?}", column).to_lowercase(),
        value: v.to_string(),
    };
    if is_packed_ip_column(column) {
        let raw = value.as_str().ok_or_else(|| bad(value))?;
        let ip: std::net::Ipv4Addr = raw.parse().map_err(|_| bad(value))?;
        return Ok(u32::from(ip).into());
    }
    match value {
        serde_json::Value::String(s) => Ok(s.as_str().into()),
        serde_json::Value::Number(n) => n
            .as_i64()
            .map(sea_query::Value::from)
            .ok_or_else(|| bad(value)),
        other => Err(bad(other)),
    }
}

/// `key -> SQL condition` resolution; the default is an `IN` over the
/// mapped column.
fn filter_expr(key: &str, values: &[serde_json::Value]) -> Result<SimpleExpr, EventDbError> {
    if values.is_empty() {
        return Err(EventDbError::BadFilterValue {
            key: key.to_string(),
            value: "<no values>".to_string(),
        });
    }
    if key == "ip.net" {
        return ip_net_expr(values);
    }
    if let Some(base) = key.strip_suffix(".sub") {
        let column = column_for(base)?;
        if !matches!(column, EventTab::Fqdn | EventTab::Url) {
            return Err(EventDbError::UnknownFilterField(key.to_string()));
        }
        return Ok(values
            .iter()
            .map(|value| {
                let raw = value.as_str().ok_or(EventDbError::BadFilterValue {
                    key: key.to_string(),
                    value: value.to_string(),
                })?;
                Ok(Expr::col((EventTab::Table, column)).like(format!("%{}%", escape_like(raw))))
            })
            .collect::<Result<Vec<SimpleExpr>, EventDbError>>()?
            .into_iter()
            .reduce(|a, b| a.or(b))
            .expect("values checked non-empty"));
    }

    let column = column_for(key)?;
    let converted = values
        .iter()
        .map(|value| to_query_value(column, value))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::col((EventTab::Table, column)).is_in(converted))
}

/// `ip.net` value(s) `a.b.c.d/len` become inclusive numeric ranges.
fn ip_net_expr(values: &[serde_json::Value]) -> Result<SimpleExpr, EventDbError> {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        let raw = value.as_str().ok_or(EventDbError::BadFilterValue {
            key: "ip.net".to_string(),
            value: value.to_string(),
        })?;
        let network: ipnetwork::Ipv4Network =
            raw.parse().map_err(|_| EventDbError::BadFilterValue {
                key: "ip.net".to_string(),
                value: raw.to_string(),
            })?;
        let min = u32::from(network.network());
        let max = u32::from(network.broadcast());
        parts.push(Expr::col((EventTab::Table, EventTab::Ip)).between(min, max));
    }
    Ok(parts
        .into_iter()
        .reduce(|a, b| a.or(b))
        .expect("values checked non-empty"))
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

// ============================================================================
// Query composition
// ============================================================================

/// The filters/access part shared by every sub-query of one request.
pub(crate) fn build_query_base(
    filters: &[(String, Vec<serde_json::Value>)],
    access_conditions: &[SimpleExpr],
) -> Result<SelectStatement, EventDbError> {
    if access_conditions.is_empty() {
        return Err(EventDbError::Access(
            "filtering conditions not provided".to_string(),
        ));
    }
    let mut query = Query::select();
    for column in RESULT_COLUMNS {
        query.column((EventTab::Table, column));
    }
    query.from(EventTab::Table);
    for (key, values) in filters {
        query.and_where(filter_expr(key, values)?);
    }
    let mut access = Cond::any();
    for condition in access_conditions {
        access = access.add(condition.clone());
    }
    query.cond_where(access);
    Ok(query)
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format(wire_time::FORMAT).to_string()
}

/// Narrow the base query to one time window; join `client_to_event`
/// (with the same bounds on both sides) when clients constrain results.
pub(crate) fn build_window_query(
    base: &SelectStatement,
    window: &TimeWindow,
    client_org_ids: Option<&[String]>,
) -> SelectStatement {
    let mut query = base.clone();

    let lower = Expr::col((EventTab::Table, EventTab::Time)).gte(fmt_time(window.lower));
    let upper = if window.upper_inclusive {
        Expr::col((EventTab::Table, EventTab::Time)).lte(fmt_time(window.upper))
    } else {
        Expr::col((EventTab::Table, EventTab::Time)).lt(fmt_time(window.upper))
    };
    query.and_where(lower).and_where(upper);

    if let Some(clients) = client_org_ids {
        let client_lower =
            Expr::col((ClientToEvent::Table, ClientToEvent::Time)).gte(fmt_time(window.lower));
        let client_upper = if window.upper_inclusive {
            Expr::col((ClientToEvent::Table, ClientToEvent::Time)).lte(fmt_time(window.upper))
        } else {
            Expr::col((ClientToEvent::Table, ClientToEvent::Time)).lt(fmt_time(window.upper))
        };
        query.inner_join(
            ClientToEvent::Table,
            Cond::all()
                .add(
                    Expr::col((ClientToEvent::Table, ClientToEvent::Id))
                        .equals((EventTab::Table, EventTab::Id)),
                )
                .add(client_lower)
                .add(client_upper),
        );
        query.and_where(
            Expr::col((ClientToEvent::Table, ClientToEvent::Client))
                .is_in(clients.iter().map(|c| c.as_str())),
        );
    }

    query.order_by((EventTab::Table, EventTab::Time), Order::Desc);
    query
}

/// Apply limit/offset for one paging query of a window. Returns the
/// SQL and the limit actually used (None without `opt.limit`).
pub(crate) fn build_actual_query(
    window_query: &SelectStatement,
    step_fetched: u64,
    opt_limit: Option<u64>,
    produced: u64,
) -> (String, Option<u64>) {
    match opt_limit {
        Some(limit) => {
            let still_expected = limit.saturating_sub(produced).max(1);
            let reserve = (still_expected / 4).max(100);
            let query_limit = still_expected + reserve;
            let sql = window_query
                .clone()
                .limit(query_limit)
                .offset(step_fetched)
                .to_string(MysqlQueryBuilder);
            (sql, Some(query_limit))
        }
        None => (window_query.to_string(MysqlQueryBuilder), None),
    }
}

// ============================================================================
// Row collapsing
// ============================================================================

/// Collapses the descending-by-time row stream: rows of one `time` are
/// gathered, ordered by `id`, and rows sharing an `id` merge into the
/// first one.
#[derive(Default)]
struct RowCollapser {
    current_time: Option<DateTime<Utc>>,
    same_time_rows: Vec<EventRecord>,
}

impl RowCollapser {
    fn push(&mut self, record: EventRecord) -> Vec<EventRecord> {
        if self.current_time == Some(record.time) || self.current_time.is_none() {
            self.current_time = Some(record.time);
            self.same_time_rows.push(record);
            Vec::new()
        } else {
            let done = Self::collapse(std::mem::take(&mut self.same_time_rows));
            self.current_time = Some(record.time);
            self.same_time_rows.push(record);
            done
        }
    }

    fn finish(mut self) -> Vec<EventRecord> {
        Self::collapse(std::mem::take(&mut self.same_time_rows))
    }

    fn collapse(mut rows: Vec<EventRecord>) -> Vec<EventRecord> {
        rows.sort_by(|a, b| a.id.cmp(&b.id));
        let mut out: Vec<EventRecord> = Vec::with_capacity(rows.len());
        for row in rows {
            if out.last().map(|last| last.id == row.id) != Some(true) {
                out.push(row);
            }
        }
        out
    }
}

// ============================================================================
// URL post-matching
// ============================================================================

/// Application-level `url_data` handling: normalization of the stored
/// original URL, optional matching against request URLs, and the final
/// `url` substitution. One instance caches per-brief data per request.
pub(crate) struct UrlMatcher {
    param_urls_b64: Option<Vec<String>>,
    normalized_params_per_brief: HashMap<String, Option<HashSet<String>>>,
}

impl UrlMatcher {
    pub(crate) fn new(url_b64_params: &[String]) -> Self {
        Self {
            param_urls_b64: if url_b64_params.is_empty() {
                None
            } else {
                Some(url_b64_params.to_vec())
            },
            normalized_params_per_brief: HashMap::new(),
        }
    }

    /// Post-process one collapsed record. `None` drops the record
    /// (malformed `url_data`, or the URL does not match the request).
    pub(crate) fn apply(&mut self, mut record: EventRecord) -> Option<EventRecord> {
        let url_data = record.custom.remove("url_data");
        let provisional = record
            .url
            .as_deref()
            .is_some_and(|u| u.starts_with(PROVISIONAL_URL_SEARCH_KEY_PREFIX));

        let url_data = match url_data {
            None if provisional => {
                error!(
                    id = %record.id,
                    "`url` is a provisional search key but no `url_data`; skipping event"
                );
                return None;
            }
            // normal case: plain `url` or no `url` at all
            None => return Some(record),
            Some(data) if !provisional => {
                error!(
                    id = %record.id,
                    url_data = %data,
                    "`url_data` present but `url` is not a provisional search key; skipping event"
                );
                return None;
            }
            Some(data) => data,
        };

        let (orig_b64, norm_brief) = match parse_url_data(&url_data) {
            Some(parsed) => parsed,
            None => {
                error!(id = %record.id, url_data = %url_data, "`url_data` is not valid; skipping event");
                return None;
            }
        };

        let url_orig_bin = match decode_url_b64(&orig_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(id = %record.id, error = %e, "undecodable `orig_b64`; skipping event");
                return None;
            }
        };

        let param_urls_norm = self
            .normalized_params_per_brief
            .entry(norm_brief.clone())
            .or_insert_with(|| {
                self.param_urls_b64.as_ref().map(|params| {
                    params
                        .iter()
                        .filter_map(|raw| decode_url_b64(raw).ok())
                        .map(|bytes| normalize_url(&bytes, &norm_brief))
                        .collect()
                })
            });

        let url_normalized = normalize_url(&url_orig_bin, &norm_brief);
        if let Some(wanted) = param_urls_norm {
            if !wanted.contains(&url_normalized) {
                return None;
            }
        }
        record.url = Some(url_normalized);
        Some(record)
    }
}

/// Accepts `{orig_b64, norm_brief}` or the frozen legacy
/// `{url_orig, url_norm_opts}`; anything else is malformed.
fn parse_url_data(url_data: &serde_json::Value) -> Option<(String, String)> {
    let object = url_data.as_object()?;

    if object.len() == 2 && object.contains_key("orig_b64") && object.contains_key("norm_brief") {
        let orig = object.get("orig_b64")?.as_str()?;
        let brief = object.get("norm_brief")?.as_str()?;
        if orig.is_empty() {
            return None;
        }
        return Some((orig.to_string(), brief.to_string()));
    }
    if object.len() == 2 && object.contains_key("url_orig") && object.contains_key("url_norm_opts")
    {
        let orig = object.get("url_orig")?.as_str()?;
        if orig.is_empty() {
            return None;
        }
        let brief = norm_brief_from_legacy_opts(object.get("url_norm_opts")?).ok()?;
        return Some((orig.to_string(), brief));
    }
    None
}

// ============================================================================
// The streaming driver
// ============================================================================

pub(crate) struct EventsQuery {
    pub base: SelectStatement,
    pub windows: Vec<TimeWindow>,
    pub client_org_ids: Option<Vec<String>>,
    pub opt_limit: Option<u64>,
    pub url_b64_params: Vec<String>,
}

impl EventsQuery {
    pub(crate) fn prepare(
        params: &QueryParams,
        access_conditions: &[SimpleExpr],
        client_org_ids: Option<Vec<String>>,
        day_step: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, EventDbError> {
        let time_min = params
            .time_min
            .ok_or(EventDbError::MissingParam("time.min"))?;
        let base = build_query_base(&params.filters, access_conditions)?;
        let windows =
            DayStepWindows::new(time_min, params.time_max, params.time_until, day_step, now)
                .collect();
        Ok(Self {
            base,
            windows,
            client_org_ids,
            opt_limit: params.opt_limit,
            url_b64_params: params.url_b64.clone(),
        })
    }

    /// Run the sub-queries, sending collapsed results into `tx`.
    pub(crate) async fn run(
        self,
        pool: MySqlPool,
        tx: tokio::sync::mpsc::Sender<Result<EventRecord, EventDbError>>,
    ) {
        let mut matcher = UrlMatcher::new(&self.url_b64_params);
        let mut collapser = RowCollapser::default();
        let mut produced: u64 = 0;

        for window in &self.windows {
            let window_query =
                build_window_query(&self.base, window, self.client_org_ids.as_deref());
            let mut step_fetched: u64 = 0;
            loop {
                if limit_reached(self.opt_limit, produced) {
                    return;
                }
                let (sql, query_limit) =
                    build_actual_query(&window_query, step_fetched, self.opt_limit, produced);
                debug!(%sql, "issuing sub-query");
                let mut query_fetched: u64 = 0;
                let mut rows = sqlx::query(&sql).fetch(&pool);
                while let Some(fetched) = rows.next().await {
                    let row = match fetched {
                        Ok(row) => row,
                        Err(e) => {
                            let _ = tx.send(Err(wrap_db_error(e))).await;
                            return;
                        }
                    };
                    let record = match EventRecord::from_row(&row) {
                        Ok(record) => record,
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    };
                    step_fetched += 1;
                    query_fetched += 1;
                    for ready in collapser.push(record) {
                        if !emit(&mut matcher, ready, &tx, &mut produced, self.opt_limit).await {
                            return;
                        }
                    }
                }
                match query_limit {
                    None => break,
                    Some(limit) if query_fetched < limit => break,
                    // the window is not exhausted: page deeper
                    Some(_) => {}
                }
            }
        }

        for ready in collapser.finish() {
            if !emit(&mut matcher, ready, &tx, &mut produced, self.opt_limit).await {
                return;
            }
        }
    }
}

fn limit_reached(opt_limit: Option<u64>, produced: u64) -> bool {
    opt_limit.is_some_and(|limit| produced >= limit)
}

/// Post-filter and deliver one result. `false` stops the whole run
/// (limit reached or the consumer is gone).
async fn emit(
    matcher: &mut UrlMatcher,
    record: EventRecord,
    tx: &tokio::sync::mpsc::Sender<Result<EventRecord, EventDbError>>,
    produced: &mut u64,
    opt_limit: Option<u64>,
) -> bool {
    let Some(record) = matcher.apply(record) else {
        return true;
    };
    if tx.send(Ok(record)).await.is_err() {
        return false;
    }
    *produced += 1;
    !limit_reached(opt_limit, *produced)
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
