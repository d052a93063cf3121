//! Event-DB query processing.
//!
//! This module contains:
//! - `EventDb`: the facade owning the connection pool
//! - `events`: the partitioned, ordered, resumable event search
//! - `summaries`: category/name aggregation views
//! - `windows`: day-step partitioning
//! - `url_norm`: URL normalization for `url_data`-based matching
//!
//! All reads run under `REPEATABLE READ`; session variables pin the
//! SQL mode and the UTC time zone on every pooled connection. Writes
//! go through `EventDb::transact`, which guarantees rollback on error
//! and refuses nesting within one task.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use sea_query::SimpleExpr;
use sqlx::mysql::MySqlPoolOptions;
use sqlx::{Executor, MySql, MySqlPool, Transaction};
use tokio_stream::wrappers::ReceiverStream;

use crate::config::EventDbConfig;
use crate::model::Category;

pub mod events;
pub mod schema;
pub mod summaries;
pub mod url_norm;
pub mod windows;

pub use events::{EventRecord, QueryParams, YIELD_PER};
pub use url_norm::PROVISIONAL_URL_SEARCH_KEY_PREFIX;
pub use windows::{DayStepWindows, TimeWindow};

/// Cap applied to DB error text carried in `EventDbError::Database`.
const DB_API_ERROR_MESSAGE_MAX_LENGTH: usize = 200;

/// Session variables applied to every new connection.
const SESSION_SQL_MODE: &str = "STRICT_TRANS_TABLES,ERROR_FOR_DIVISION_BY_ZERO,\
     NO_AUTO_CREATE_USER,NO_AUTO_VALUE_ON_ZERO,NO_ENGINE_SUBSTITUTION,NO_ZERO_DATE,NO_ZERO_IN_DATE";

/// Errors raised by Event-DB operations.
#[derive(Debug, thiserror::Error)]
pub enum EventDbError {
    /// A wrapped, truncated DB-API failure.
    #[error("DB API error - {0}...")]
    Database(String),

    #[error("access control misuse: {0}")]
    Access(String),

    #[error("request parameters are expected to include `{0}`")]
    MissingParam(&'static str),

    #[error("no query function for the `{0}` parameter")]
    UnknownFilterField(String),

    #[error("unusable value for the `{key}` parameter: {value}")]
    BadFilterValue { key: String, value: String },

    #[error("illegal category got from the Event DB: {0}")]
    IllegalCategory(String),

    #[error("nested transactions are not allowed")]
    NestedTransaction,
}

pub(crate) fn wrap_db_error(error: sqlx::Error) -> EventDbError {
    let mut summary = error.to_string().replace('\n', " ");
    summary.truncate(DB_API_ERROR_MESSAGE_MAX_LENGTH);
    EventDbError::Database(summary)
}

/// An authenticated client.
#[derive(Debug, Clone)]
pub struct AuthData {
    pub org_id: String,
    pub user_id: String,
}

/// The three query resources' access zones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessZone {
    Inside,
    Threats,
    Search,
}

/// Per-zone SQL access conditions (ORed at query time).
pub type AccessZoneConditions = BTreeMap<AccessZone, Vec<SimpleExpr>>;

/// Stream of search results; already-yielded records stay valid when a
/// later sub-query fails (the failure is the final item).
pub type EventRecordStream = ReceiverStream<Result<EventRecord, EventDbError>>;

tokio::task_local! {
    static IN_TRANSACTION: ();
}

/// The Event-DB facade.
pub struct EventDb {
    pool: MySqlPool,
    day_step: u32,
}

impl EventDb {
    /// Connect the pool: 15 + 12 overflow connections, pre-ping,
    /// 3600 s recycle, 20 s acquire timeout; every connection gets the
    /// strict SQL mode, the UTC time zone and `REPEATABLE READ`.
    pub async fn connect(config: &EventDbConfig) -> Result<Self, EventDbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(15 + 12)
            .acquire_timeout(Duration::from_secs(20))
            .max_lifetime(Duration::from_secs(3600))
            .test_before_acquire(true)
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    (&mut *conn)
                        .execute(
                            format!(
                                "SET SESSION sql_mode = '{}', SESSION time_zone = '+00:00'",
                                SESSION_SQL_MODE
                            )
                            .as_str(),
                        )
                        .await?;
                    (&mut *conn)
                        .execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
                        .await?;
                    Ok(())
                })
            })
            .connect(&config.url)
            .await
            .map_err(wrap_db_error)?;
        Ok(Self {
            pool,
            day_step: config.day_step.max(1),
        })
    }

    /// Facade over an existing pool (tests, embedding).
    pub fn with_pool(pool: MySqlPool, day_step: u32) -> Self {
        Self {
            pool,
            day_step: day_step.max(1),
        }
    }

    fn zone_conditions<'z>(
        zones: &'z AccessZoneConditions,
        zone: AccessZone,
    ) -> Result<&'z [SimpleExpr], EventDbError> {
        match zones.get(&zone) {
            Some(conditions) if !conditions.is_empty() => Ok(conditions),
            // access rights are involved: err on the safe side
            _ => Err(EventDbError::Access(format!(
                "filtering conditions for the {:?} access zone not provided",
                zone
            ))),
        }
    }

    /// Events of the "inside" zone: the `client` parameter must be
    /// absent; the constraint is the authenticated client's own org.
    pub fn report_inside(
        &self,
        auth_data: &AuthData,
        params: QueryParams,
        access_zone_conditions: &AccessZoneConditions,
    ) -> Result<EventRecordStream, EventDbError> {
        if !params.client.is_empty() {
            return Err(EventDbError::Access(
                "the `client` parameter is not expected for the \"inside\" access zone"
                    .to_string(),
            ));
        }
        let client_org_ids = Some(vec![auth_data.org_id.clone()]);
        self.generate_result_records(params, access_zone_conditions, AccessZone::Inside, client_org_ids)
    }

    /// Events of the "threats" zone; `client` (if given) constrains
    /// results to events owned by those clients.
    pub fn report_threats(
        &self,
        _auth_data: &AuthData,
        mut params: QueryParams,
        access_zone_conditions: &AccessZoneConditions,
    ) -> Result<EventRecordStream, EventDbError> {
        let client_org_ids = take_client_constraint(&mut params);
        self.generate_result_records(
            params,
            access_zone_conditions,
            AccessZone::Threats,
            client_org_ids,
        )
    }

    /// Events of the "search" zone; `client` works as in `threats`.
    pub fn search_events(
        &self,
        _auth_data: &AuthData,
        mut params: QueryParams,
        access_zone_conditions: &AccessZoneConditions,
    ) -> Result<EventRecordStream, EventDbError> {
        let client_org_ids = take_client_constraint(&mut params);
        self.generate_result_records(
            params,
            access_zone_conditions,
            AccessZone::Search,
            client_org_ids,
        )
    }

    fn generate_result_records(
        &self,
        params: QueryParams,
        access_zone_conditions: &AccessZoneConditions,
        access_zone: AccessZone,
        client_org_ids: Option<Vec<String>>,
    ) -> Result<EventRecordStream, EventDbError> {
        let conditions = Self::zone_conditions(access_zone_conditions, access_zone)?;
        let prepared = events::EventsQuery::prepare(
            &params,
            conditions,
            client_org_ids,
            self.day_step,
            Utc::now(),
        )?;

        let (tx, rx) = tokio::sync::mpsc::channel(YIELD_PER);
        let pool = self.pool.clone();
        tokio::spawn(prepared.run(pool, tx));
        Ok(ReceiverStream::new(rx))
    }

    /// Numbers of events per category since `since` (see `summaries`).
    pub async fn counts_per_category(
        &self,
        auth_data: &AuthData,
        access_filtering_conditions: &[SimpleExpr],
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<Category, u64>, EventDbError> {
        summaries::counts_per_category(
            &self.pool,
            access_filtering_conditions,
            std::slice::from_ref(&auth_data.org_id),
            since,
        )
        .await
    }

    /// The most frequent categories since `since`.
    pub async fn most_frequent_categories(
        &self,
        auth_data: &AuthData,
        access_filtering_conditions: &[SimpleExpr],
        since: DateTime<Utc>,
    ) -> Result<Vec<Category>, EventDbError> {
        summaries::most_frequent_categories(
            &self.pool,
            access_filtering_conditions,
            std::slice::from_ref(&auth_data.org_id),
            since,
        )
        .await
    }

    /// Per-day per-category counts since `since`.
    pub async fn counts_per_day_per_category(
        &self,
        auth_data: &AuthData,
        access_filtering_conditions: &[SimpleExpr],
        since: DateTime<Utc>,
    ) -> Result<BTreeMap<String, Vec<(String, u64)>>, EventDbError> {
        summaries::counts_per_day_per_category(
            &self.pool,
            access_filtering_conditions,
            std::slice::from_ref(&auth_data.org_id),
            since,
        )
        .await
    }

    /// Top-ten names of one category since `since`.
    pub async fn names_ranking_per_category(
        &self,
        auth_data: &AuthData,
        access_filtering_conditions: &[SimpleExpr],
        since: DateTime<Utc>,
        category: Category,
    ) -> Result<Option<Vec<Option<(String, u64)>>>, EventDbError> {
        summaries::names_ranking_per_category(
            &self.pool,
            access_filtering_conditions,
            std::slice::from_ref(&auth_data.org_id),
            since,
            category,
        )
        .await
    }

    /// Run `f` inside one write transaction: commit on `Ok`, rollback
    /// on `Err`. Nesting within one task is refused.
    pub async fn transact<T, F>(&self, f: F) -> Result<T, EventDbError>
    where
        F: for<'c> FnOnce(
            &'c mut Transaction<'static, MySql>,
        ) -> BoxFuture<'c, Result<T, EventDbError>>,
    {
        if IN_TRANSACTION.try_with(|_| ()).is_ok() {
            return Err(EventDbError::NestedTransaction);
        }
        IN_TRANSACTION
            .scope((), async {
                let mut tx = self.pool.begin().await.map_err(wrap_db_error)?;
                match f(&mut tx).await {
                    Ok(value) => {
                        tx.commit().await.map_err(wrap_db_error)?;
                        Ok(value)
                    }
                    Err(error) => {
                        if let Err(rollback_error) = tx.rollback().await {
                            tracing::error!(error = %rollback_error, "rollback failed");
                        }
                        Err(error)
                    }
                }
            })
            .await
    }
}

/// Pop the `client` parameter as the client-org constraint (empty
/// lists mean "no constraint").
fn take_client_constraint(params: &mut QueryParams) -> Option<Vec<String>> {
    let clients = std::mem::take(&mut params.client);
    if clients.is_empty() {
        None
    } else {
        Some(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::schema::EventTab;
    use super::*;
    use sea_query::Expr;

    fn zones_with(zone: AccessZone) -> AccessZoneConditions {
        let mut zones = AccessZoneConditions::new();
        zones.insert(
            zone,
            vec![Expr::col((EventTab::Table, EventTab::Restriction)).eq("public")],
        );
        zones
    }

    fn auth() -> AuthData {
        AuthData {
            org_id: "org.example".to_string(),
            user_id: "user@example".to_string(),
        }
    }

    fn minimal_params() -> QueryParams {
        QueryParams {
            time_min: crate::model::Event::parse_wire_time("2024-01-01 00:00:00"),
            ..QueryParams::default()
        }
    }

    fn dummy_db() -> EventDb {
        EventDb::with_pool(MySqlPool::connect_lazy("mysql://root@localhost/x").unwrap(), 1)
    }

    #[tokio::test]
    async fn test_report_inside_rejects_client_param() {
        let db = dummy_db();
        let mut params = minimal_params();
        params.client = vec!["some.org".to_string()];
        let result = db.report_inside(&auth(), params, &zones_with(AccessZone::Inside));
        assert!(matches!(result, Err(EventDbError::Access(_))));
    }

    #[tokio::test]
    async fn test_missing_zone_conditions_are_refused() {
        let db = dummy_db();
        let result = db.report_threats(&auth(), minimal_params(), &AccessZoneConditions::new());
        assert!(matches!(result, Err(EventDbError::Access(_))));
    }

    #[tokio::test]
    async fn test_missing_time_min_is_refused() {
        let db = dummy_db();
        let result = db.search_events(
            &auth(),
            QueryParams::default(),
            &zones_with(AccessZone::Search),
        );
        assert!(matches!(result, Err(EventDbError::MissingParam("time.min"))));
    }

    #[test]
    fn test_wrap_db_error_truncates() {
        let error = sqlx::Error::Protocol("x".repeat(1000));
        let wrapped = wrap_db_error(error);
        match wrapped {
            EventDbError::Database(summary) => {
                assert!(summary.len() <= DB_API_ERROR_MESSAGE_MAX_LENGTH)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
