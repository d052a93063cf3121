//! Event-DB schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building. The `event` table is denormalized: one row per
//! `(id, ip)`; the `ip`/`asn`/`cc` columns are search criteria only,
//! the aggregated `address` column carries the same data for results.

use sea_query::Iden;

/// `event` table (read side).
#[derive(Debug, Clone, Copy, Iden)]
pub enum EventTab {
    #[iden = "event"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "rid"]
    Rid,
    #[iden = "source"]
    Source,
    #[iden = "restriction"]
    Restriction,
    #[iden = "confidence"]
    Confidence,
    #[iden = "category"]
    Category,
    #[iden = "time"]
    Time,
    #[iden = "modified"]
    Modified,
    #[iden = "name"]
    Name,
    #[iden = "proto"]
    Proto,
    #[iden = "sport"]
    Sport,
    #[iden = "dport"]
    Dport,
    #[iden = "dip"]
    Dip,
    #[iden = "ip"]
    Ip,
    #[iden = "asn"]
    Asn,
    #[iden = "cc"]
    Cc,
    #[iden = "fqdn"]
    Fqdn,
    #[iden = "url"]
    Url,
    #[iden = "address"]
    Address,
    #[iden = "custom"]
    Custom,
    #[iden = "until"]
    Until,
    #[iden = "count"]
    Count,
}

/// `client_to_event` association table.
#[derive(Debug, Clone, Copy, Iden)]
pub enum ClientToEvent {
    #[iden = "client_to_event"]
    Table,
    #[iden = "id"]
    Id,
    #[iden = "client"]
    Client,
    #[iden = "time"]
    Time,
}

/// The columns selected for result records, in a stable order.
///
/// `ip`/`asn`/`cc` are intentionally absent: they vary across the
/// same-`id` rows produced by the denormalization and are covered by
/// the aggregated `address` column.
pub const RESULT_COLUMNS: [EventTab; 19] = [
    EventTab::Id,
    EventTab::Rid,
    EventTab::Source,
    EventTab::Restriction,
    EventTab::Confidence,
    EventTab::Category,
    EventTab::Time,
    EventTab::Modified,
    EventTab::Name,
    EventTab::Proto,
    EventTab::Sport,
    EventTab::Dport,
    EventTab::Dip,
    EventTab::Fqdn,
    EventTab::Url,
    EventTab::Address,
    EventTab::Custom,
    EventTab::Until,
    EventTab::Count,
];
