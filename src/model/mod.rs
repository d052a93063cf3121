//! The event data model shared by all pipeline stages.
//!
//! This module contains:
//! - `Event`: the record that flows on the bus (collector output after
//!   parsing, aggregator input/output, enricher input/output)
//! - `Address`: one resolved network address with optional ASN/CC
//! - Closed enums: `Category`, `Confidence`, `Restriction`, `EventKind`
//!
//! Events on the wire are JSON objects. Timestamps use the
//! `YYYY-MM-DD HH:MM:SS` UTC form. Fields this crate does not model are
//! preserved verbatim through the `extra` map so that a stage never
//! drops information it merely forwards.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod wire_time;

/// The fixed set of event categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Amplifier,
    Bots,
    Backdoor,
    Cnc,
    Deface,
    DnsQuery,
    DosAttacker,
    DosVictim,
    Flow,
    FlowAnomaly,
    Fraud,
    Leak,
    Malurl,
    MalwareAction,
    Other,
    Phish,
    Proxy,
    SandboxUrl,
    Scam,
    Scanning,
    ServerExploit,
    Spam,
    SpamUrl,
    Tor,
    Vulnerable,
    Webinject,
}

impl Category {
    /// All known categories, in a stable order.
    pub const ALL: [Category; 26] = [
        Category::Amplifier,
        Category::Bots,
        Category::Backdoor,
        Category::Cnc,
        Category::Deface,
        Category::DnsQuery,
        Category::DosAttacker,
        Category::DosVictim,
        Category::Flow,
        Category::FlowAnomaly,
        Category::Fraud,
        Category::Leak,
        Category::Malurl,
        Category::MalwareAction,
        Category::Other,
        Category::Phish,
        Category::Proxy,
        Category::SandboxUrl,
        Category::Scam,
        Category::Scanning,
        Category::ServerExploit,
        Category::Spam,
        Category::SpamUrl,
        Category::Tor,
        Category::Vulnerable,
        Category::Webinject,
    ];

    /// The wire name of the category (e.g. `dos-attacker`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Amplifier => "amplifier",
            Category::Bots => "bots",
            Category::Backdoor => "backdoor",
            Category::Cnc => "cnc",
            Category::Deface => "deface",
            Category::DnsQuery => "dns-query",
            Category::DosAttacker => "dos-attacker",
            Category::DosVictim => "dos-victim",
            Category::Flow => "flow",
            Category::FlowAnomaly => "flow-anomaly",
            Category::Fraud => "fraud",
            Category::Leak => "leak",
            Category::Malurl => "malurl",
            Category::MalwareAction => "malware-action",
            Category::Other => "other",
            Category::Phish => "phish",
            Category::Proxy => "proxy",
            Category::SandboxUrl => "sandbox-url",
            Category::Scam => "scam",
            Category::Scanning => "scanning",
            Category::ServerExploit => "server-exploit",
            Category::Spam => "spam",
            Category::SpamUrl => "spam-url",
            Category::Tor => "tor",
            Category::Vulnerable => "vulnerable",
            Category::Webinject => "webinject",
        }
    }

    /// Parse a wire name into a category.
    pub fn parse(name: &str) -> Option<Category> {
        Category::ALL.iter().copied().find(|c| c.as_str() == name)
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event confidence level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

/// Distribution restriction of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Restriction {
    Public,
    NeedToKnow,
    Internal,
}

/// Kind of an aggregator output message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Event,
    Suppressed,
}

/// One network address attached to an event.
///
/// `asn` and `cc` are filled in by the enricher; anything present on
/// input is dropped and recomputed there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub ip: Ipv4Addr,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asn: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cc: Option<String>,
}

impl Address {
    pub fn new(ip: Ipv4Addr) -> Self {
        Self {
            ip,
            asn: None,
            cc: None,
        }
    }
}

/// Which fields the enricher computed: `(top_level_fields, ip -> fields)`.
///
/// Serialized as a two-element JSON array. The per-IP list contains
/// `"ip"` iff the enricher itself produced that address entry.
pub type EnrichedInfo = (Vec<String>, BTreeMap<String, Vec<String>>);

/// The record that flows on the message bus.
///
/// Only `source` and `time` are needed by every stage; the rest is
/// optional so that partially-populated records pass through unharmed.
/// Unknown input fields survive round-trips via `extra`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<Category>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<Confidence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction: Option<Restriction>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub time: Option<DateTime<Utc>>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub address: Vec<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fqdn: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Aggregation group id; present only before aggregation.
    #[serde(default, rename = "_group", skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Assigned by the aggregator on its output messages.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<EventKind>,
    /// Number of collapsed events; on `suppressed` messages only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(
        default,
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub until: Option<DateTime<Utc>>,
    #[serde(
        default,
        rename = "_first_time",
        with = "wire_time::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub first_time: Option<DateTime<Utc>>,

    /// Tells the enricher to skip FQDN-to-IP resolution.
    #[serde(
        default,
        rename = "_do_not_resolve_fqdn_to_ip",
        skip_serializing_if = "std::ops::Not::not"
    )]
    pub do_not_resolve_fqdn_to_ip: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched: Option<EnrichedInfo>,

    /// Any fields this crate does not model, preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Event {
    /// Parse a `YYYY-MM-DD HH:MM:SS` wire timestamp.
    pub fn parse_wire_time(s: &str) -> Option<DateTime<Utc>> {
        NaiveDateTime::parse_from_str(s, wire_time::FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_dt(s: &str) -> DateTime<Utc> {
        Event::parse_wire_time(s).unwrap()
    }

    #[test]
    fn test_category_wire_names_round_trip() {
        for category in Category::ALL {
            let name = category.as_str();
            assert_eq!(Category::parse(name), Some(category));
            let json = serde_json::to_string(&category).unwrap();
            assert_eq!(json, format!("\"{}\"", name));
        }
        assert_eq!(Category::parse("dos-attacker"), Some(Category::DosAttacker));
        assert_eq!(Category::parse("bogus"), None);
    }

    #[test]
    fn test_event_round_trip_preserves_fields() {
        let json = serde_json::json!({
            "id": "c4ca4238a0b923820dcc509a6f75849b",
            "source": "testsource.testchannel",
            "category": "bots",
            "confidence": "medium",
            "restriction": "need-to-know",
            "time": "2017-06-01 10:00:00",
            "_group": "group1",
            "address": [{"ip": "1.2.3.4", "asn": 1234, "cc": "PL"}],
            "sport": 4000,
        });
        let event: Event = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(event.group.as_deref(), Some("group1"));
        assert_eq!(event.time, Some(wire_dt("2017-06-01 10:00:00")));
        assert_eq!(event.category, Some(Category::Bots));
        assert_eq!(event.address[0].ip, Ipv4Addr::new(1, 2, 3, 4));
        // an unmodelled field survives
        assert_eq!(event.extra.get("sport"), Some(&serde_json::json!(4000)));

        let back = serde_json::to_value(&event).unwrap();
        assert_eq!(back, json);
    }

    #[test]
    fn test_suppressed_fields_serialize_on_wire_names() {
        let event = Event {
            id: Some("d41d8cd98f00b204e9800998ecf8427b".into()),
            source: Some("testsource.testchannel".into()),
            time: Some(wire_dt("2017-06-01 18:00:00")),
            kind: Some(EventKind::Suppressed),
            count: Some(2),
            until: Some(wire_dt("2017-06-01 20:00:00")),
            first_time: Some(wire_dt("2017-06-01 18:00:00")),
            ..Event::default()
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "suppressed");
        assert_eq!(value["count"], 2);
        assert_eq!(value["until"], "2017-06-01 20:00:00");
        assert_eq!(value["_first_time"], "2017-06-01 18:00:00");
    }

    #[test]
    fn test_minimal_event_has_no_noise_fields() {
        let event = Event {
            source: Some("s.c".into()),
            ..Event::default()
        };
        let value = serde_json::to_value(&event).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 1);
        assert!(object.contains_key("source"));
    }
}
