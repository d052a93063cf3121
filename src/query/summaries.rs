//! Aggregated views over the event table: per-category counts,
//! most-frequent categories, daily counts and per-category name
//! rankings, all computed since a given instant (midnight-aligned) and
//! under the caller's access conditions.

use chrono::{DateTime, NaiveDate, Utc};
use sea_query::{
    Alias, Cond, Expr, Func, Iden, MysqlQueryBuilder, Order, Query, SelectStatement, SimpleExpr,
};
use sqlx::{MySqlPool, Row};
use std::collections::BTreeMap;

use crate::model::Category;

use super::schema::{ClientToEvent, EventTab};
use super::{wrap_db_error, EventDbError};

/// How many categories the most-frequent view returns.
const MOST_FREQUENT_CATEGORIES: usize = 6;
/// Ranking depth of the names view.
const NAMES_RANKING_DEPTH: usize = 10;

struct DateFunc;

impl Iden for DateFunc {
    fn unquoted(&self, s: &mut dyn std::fmt::Write) {
        s.write_str("DATE").unwrap();
    }
}

/// Truncate an instant to its day's midnight.
fn midnight(since: DateTime<Utc>) -> DateTime<Utc> {
    since
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.format(crate::model::wire_time::FORMAT).to_string()
}

/// The shared shape of every summary query: join `client_to_event` on
/// id and the midnight-aligned time bound, apply the (ORed) access
/// conditions and the optional client constraint.
fn summary_query_base(
    access_conditions: &[SimpleExpr],
    client_org_ids: &[String],
    since: DateTime<Utc>,
) -> Result<SelectStatement, EventDbError> {
    if access_conditions.is_empty() {
        return Err(EventDbError::Access(
            "filtering conditions not provided".to_string(),
        ));
    }
    let floor = fmt_time(midnight(since));

    let mut query = Query::select();
    query.from(EventTab::Table).inner_join(
        ClientToEvent::Table,
        Cond::all()
            .add(
                Expr::col((ClientToEvent::Table, ClientToEvent::Id))
                    .equals((EventTab::Table, EventTab::Id)),
            )
            .add(Expr::col((ClientToEvent::Table, ClientToEvent::Time)).gte(floor.clone())),
    );
    query.and_where(Expr::col((EventTab::Table, EventTab::Time)).gte(floor));

    let mut access = Cond::any();
    for condition in access_conditions {
        access = access.add(condition.clone());
    }
    query.cond_where(access);

    if !client_org_ids.is_empty() {
        query.and_where(
            Expr::col((ClientToEvent::Table, ClientToEvent::Client))
                .is_in(client_org_ids.iter().map(|c| c.as_str())),
        );
    }
    Ok(query)
}

fn count_distinct_ids() -> SimpleExpr {
    Func::count_distinct(Expr::col((EventTab::Table, EventTab::Id))).into()
}

/// Numbers of events per category since `since`, with every known
/// category present (zero when absent from the data). A category name
/// outside the closed set coming back from the DB is an error.
pub(crate) async fn counts_per_category(
    pool: &MySqlPool,
    access_conditions: &[SimpleExpr],
    client_org_ids: &[String],
    since: DateTime<Utc>,
) -> Result<BTreeMap<Category, u64>, EventDbError> {
    let mut query = summary_query_base(access_conditions, client_org_ids, since)?;
    query
        .column((EventTab::Table, EventTab::Category))
        .expr(count_distinct_ids())
        .group_by_col((EventTab::Table, EventTab::Category));
    let sql = query.to_string(MysqlQueryBuilder);

    let mut counts: BTreeMap<Category, u64> =
        Category::ALL.iter().map(|c| (*c, 0)).collect();
    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(wrap_db_error)?;
    for row in rows {
        let name: String = row.try_get(0).map_err(wrap_db_error)?;
        let count: i64 = row.try_get(1).map_err(wrap_db_error)?;
        let category = Category::parse(&name)
            .ok_or_else(|| EventDbError::IllegalCategory(name.clone()))?;
        counts.insert(category, count.max(0) as u64);
    }
    Ok(counts)
}

/// The most frequent categories since `since`: the top six by count;
/// if `other` is among them, the top seven with `other` removed.
pub(crate) async fn most_frequent_categories(
    pool: &MySqlPool,
    access_conditions: &[SimpleExpr],
    client_org_ids: &[String],
    since: DateTime<Utc>,
) -> Result<Vec<Category>, EventDbError> {
    let count_alias = Alias::new("categories_counts");
    let mut query = summary_query_base(access_conditions, client_org_ids, since)?;
    query
        .column((EventTab::Table, EventTab::Category))
        .expr_as(count_distinct_ids(), count_alias.clone())
        .group_by_col((EventTab::Table, EventTab::Category))
        .order_by(count_alias, Order::Desc);
    let sql = query.to_string(MysqlQueryBuilder);

    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(wrap_db_error)?;
    let mut names = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.try_get(0).map_err(wrap_db_error)?;
        names.push(name);
    }
    Ok(pick_most_frequent(names))
}

/// Pure selection step of the most-frequent view.
fn pick_most_frequent(names_by_count_desc: Vec<String>) -> Vec<Category> {
    let mut top: Vec<Category> = names_by_count_desc
        .iter()
        .filter_map(|name| Category::parse(name))
        .take(MOST_FREQUENT_CATEGORIES)
        .collect();
    if top.contains(&Category::Other) {
        top = names_by_count_desc
            .iter()
            .filter_map(|name| Category::parse(name))
            .take(MOST_FREQUENT_CATEGORIES + 1)
            .filter(|category| *category != Category::Other)
            .collect();
    }
    top
}

/// Per-day, per-category counts since `since`:
/// `YYYY-MM-DD -> [(category, n), ...]`, days ascending.
pub(crate) async fn counts_per_day_per_category(
    pool: &MySqlPool,
    access_conditions: &[SimpleExpr],
    client_org_ids: &[String],
    since: DateTime<Utc>,
) -> Result<BTreeMap<String, Vec<(String, u64)>>, EventDbError> {
    let day_alias = Alias::new("events_day");
    let mut query = summary_query_base(access_conditions, client_org_ids, since)?;
    query
        .expr_as(
            Func::cust(DateFunc).arg(Expr::col((EventTab::Table, EventTab::Time))),
            day_alias.clone(),
        )
        .column((EventTab::Table, EventTab::Category))
        .expr(count_distinct_ids())
        .add_group_by([
            SimpleExpr::from(
                Func::cust(DateFunc).arg(Expr::col((EventTab::Table, EventTab::Time))),
            ),
            Expr::col((EventTab::Table, EventTab::Category)).into(),
        ])
        .order_by(day_alias, Order::Asc);
    let sql = query.to_string(MysqlQueryBuilder);

    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(wrap_db_error)?;
    let mut day_to_data: BTreeMap<String, Vec<(String, u64)>> = BTreeMap::new();
    for row in rows {
        let day: NaiveDate = row.try_get(0).map_err(wrap_db_error)?;
        let category: String = row.try_get(1).map_err(wrap_db_error)?;
        let count: i64 = row.try_get(2).map_err(wrap_db_error)?;
        day_to_data
            .entry(day.format("%Y-%m-%d").to_string())
            .or_default()
            .push((category, count.max(0) as u64));
    }
    Ok(day_to_data)
}

/// Top-ten names for one category since `since`, padded with `None`
/// up to the ranking depth; `None` overall when nothing matched.
pub(crate) async fn names_ranking_per_category(
    pool: &MySqlPool,
    access_conditions: &[SimpleExpr],
    client_org_ids: &[String],
    since: DateTime<Utc>,
    category: Category,
) -> Result<Option<Vec<Option<(String, u64)>>>, EventDbError> {
    let mut query = summary_query_base(access_conditions, client_org_ids, since)?;
    query
        .column((EventTab::Table, EventTab::Name))
        .expr(count_distinct_ids())
        .and_where(Expr::col((EventTab::Table, EventTab::Category)).eq(category.as_str()))
        .group_by_col((EventTab::Table, EventTab::Name));
    let sql = query.to_string(MysqlQueryBuilder);

    let rows = sqlx::query(&sql)
        .fetch_all(pool)
        .await
        .map_err(wrap_db_error)?;
    let mut names_to_count: Vec<(String, u64)> = Vec::with_capacity(rows.len());
    for row in rows {
        let name: Option<String> = row.try_get(0).map_err(wrap_db_error)?;
        let count: i64 = row.try_get(1).map_err(wrap_db_error)?;
        // events without a name do not rank
        if let Some(name) = name {
            names_to_count.push((name, count.max(0) as u64));
        }
    }
    Ok(build_ranking(names_to_count))
}

/// Pure ranking step of the names view.
fn build_ranking(mut names_to_count: Vec<(String, u64)>) -> Option<Vec<Option<(String, u64)>>> {
    if names_to_count.is_empty() {
        return None;
    }
    names_to_count.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let mut ranking: Vec<Option<(String, u64)>> = names_to_count
        .into_iter()
        .take(NAMES_RANKING_DEPTH)
        .map(Some)
        .collect();
    ranking.resize(NAMES_RANKING_DEPTH, None);
    Some(ranking)
}
