//! Enricher component.
//!
//! Normalizes the addressing information of a record: derives a
//! hostname from `fqdn` or `url`, resolves it to IPs, attaches per-IP
//! ASN and country code from the GeoIP databases, drops configured
//! excluded IPs, and records exactly which fields it computed in the
//! `enriched` provenance pair.
//!
//! The result's `address` list is always sorted ascending by textual
//! IP and free of duplicates.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use tracing::{error, info, warn};

use crate::bus::{
    enriched_routing_key, AmqpPusher, ConsumerConfig, ExchangeSpec, PusherConfig, QueueConsumer,
    Serialized,
};
use crate::config::{Config, EnricherConfig};
use crate::model::{Address, Event};

pub mod geo;

pub use geo::{
    AsnDatabase, CityDatabase, DnsResolver, MaxmindAsnDatabase, MaxmindCityDatabase,
    SystemDnsResolver,
};

/// What the URL's host part turned out to be.
enum UrlHost {
    Ip(Ipv4Addr),
    Name(String),
}

/// Extract the host of a URL: an IPv4 literal or a hostname.
/// Unparseable URLs yield `None`.
fn url_to_fqdn_or_ip(raw_url: &str) -> Option<UrlHost> {
    let parsed = url::Url::parse(raw_url).ok()?;
    match parsed.host()? {
        url::Host::Ipv4(ip) => Some(UrlHost::Ip(ip)),
        url::Host::Domain(name) => Some(UrlHost::Name(name.to_ascii_lowercase())),
        url::Host::Ipv6(_) => None,
    }
}

/// The enrichment engine; the component loop drives it per delivery.
pub struct Enricher {
    resolver: Arc<dyn DnsResolver>,
    asn_db: Option<Arc<dyn AsnDatabase>>,
    city_db: Option<Arc<dyn CityDatabase>>,
    excluded_ips: Vec<IpNetwork>,
}

impl Enricher {
    pub fn new(
        resolver: Arc<dyn DnsResolver>,
        asn_db: Option<Arc<dyn AsnDatabase>>,
        city_db: Option<Arc<dyn CityDatabase>>,
        excluded_ips: Vec<IpNetwork>,
    ) -> Self {
        Self {
            resolver,
            asn_db,
            city_db,
            excluded_ips,
        }
    }

    /// Build the engine from configuration, opening the GeoIP readers
    /// that are configured (each is independently optional).
    pub fn from_config(config: &EnricherConfig) -> Self {
        let asn_db: Option<Arc<dyn AsnDatabase>> = config
            .geoip_path
            .as_ref()
            .zip(config.asn_database_filename.as_ref())
            .and_then(|(dir, name)| match MaxmindAsnDatabase::open(&dir.join(name)) {
                Ok(db) => Some(Arc::new(db) as Arc<dyn AsnDatabase>),
                Err(e) => {
                    warn!(error = %e, "ASN database unavailable; `asn` will not be added");
                    None
                }
            });
        let city_db: Option<Arc<dyn CityDatabase>> = config
            .geoip_path
            .as_ref()
            .zip(config.city_database_filename.as_ref())
            .and_then(|(dir, name)| match MaxmindCityDatabase::open(&dir.join(name)) {
                Ok(db) => Some(Arc::new(db) as Arc<dyn CityDatabase>),
                Err(e) => {
                    warn!(error = %e, "City database unavailable; `cc` will not be added");
                    None
                }
            });
        let excluded_ips = config
            .excluded_ips
            .iter()
            .filter_map(|raw| match parse_excluded(raw) {
                Ok(network) => Some(network),
                Err(message) => {
                    warn!(entry = %raw, %message, "ignoring unusable excluded_ips entry");
                    None
                }
            })
            .collect();
        Self::new(Arc::new(SystemDnsResolver), asn_db, city_db, excluded_ips)
    }

    /// Enrich one record in place.
    pub async fn enrich(&self, event: &mut Event) {
        let mut enriched_top: Vec<String> = Vec::new();
        let mut ip_to_fields: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut enricher_made_ips: Vec<Ipv4Addr> = Vec::new();

        // Derive a hostname from the URL whenever `fqdn` is absent;
        // the synthesized `fqdn` is recorded even when no resolution
        // will happen.
        let mut ip_from_url: Option<Ipv4Addr> = None;
        if event.fqdn.is_none() {
            if let Some(raw_url) = event.url.clone() {
                match url_to_fqdn_or_ip(&raw_url) {
                    Some(UrlHost::Ip(ip)) => ip_from_url = Some(ip),
                    Some(UrlHost::Name(name)) => {
                        event.fqdn = Some(name);
                        enriched_top.push("fqdn".to_string());
                    }
                    None => {}
                }
            }
        }

        // Resolution happens only for records without any address.
        if event.address.is_empty() {
            match (&event.fqdn, ip_from_url) {
                (Some(fqdn), _) if !event.do_not_resolve_fqdn_to_ip => {
                    match self.resolver.lookup_a(fqdn).await {
                        Ok(ips) => {
                            let resolved = textually_sorted_unique(ips);
                            enricher_made_ips.extend(&resolved);
                            event.address =
                                resolved.into_iter().map(Address::new).collect();
                        }
                        Err(e) => {
                            warn!(fqdn = %fqdn, error = %e, "FQDN not resolved");
                        }
                    }
                }
                (None, Some(ip)) => {
                    // an IP-literal URL host becomes the address directly
                    enricher_made_ips.push(ip);
                    event.address = vec![Address::new(ip)];
                }
                _ => {}
            }
        }

        // The output contract: unique IPs, ascending textual order.
        dedupe_and_sort_addresses(&mut event.address);

        // ASN/CC attachment; anything already present is dropped first.
        for address in &mut event.address {
            address.asn = None;
            address.cc = None;
            let mut fields = Vec::new();
            if let Some(asn_db) = &self.asn_db {
                match asn_db.asn(address.ip) {
                    Ok(Some(asn)) => {
                        address.asn = Some(asn);
                        fields.push("asn".to_string());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(ip = %address.ip, error = %e, "ASN lookup failed"),
                }
            }
            if let Some(city_db) = &self.city_db {
                match city_db.country_code(address.ip) {
                    Ok(Some(code)) => {
                        address.cc = Some(code);
                        fields.push("cc".to_string());
                    }
                    Ok(None) => {}
                    Err(e) => warn!(ip = %address.ip, error = %e, "country-code lookup failed"),
                }
            }
            if enricher_made_ips.contains(&address.ip) {
                fields.push("ip".to_string());
            }
            if !fields.is_empty() {
                ip_to_fields.insert(address.ip.to_string(), fields);
            }
        }

        self.filter_out_excluded_ips(event, &mut ip_to_fields);

        event.enriched = Some((enriched_top, ip_to_fields));
    }

    fn filter_out_excluded_ips(
        &self,
        event: &mut Event,
        ip_to_fields: &mut BTreeMap<String, Vec<String>>,
    ) {
        if self.excluded_ips.is_empty() {
            return;
        }
        event.address.retain(|address| {
            let excluded = self
                .excluded_ips
                .iter()
                .any(|network| network.contains(address.ip.into()));
            if excluded {
                ip_to_fields.remove(&address.ip.to_string());
            }
            !excluded
        });
    }
}

fn parse_excluded(raw: &str) -> Result<IpNetwork, String> {
    raw.parse::<IpNetwork>()
        .or_else(|_| raw.parse::<std::net::IpAddr>().map(IpNetwork::from))
        .map_err(|e| e.to_string())
}

fn dedupe_and_sort_addresses(addresses: &mut Vec<Address>) {
    let mut seen = std::collections::BTreeSet::new();
    addresses.retain(|address| seen.insert(address.ip));
    addresses.sort_by_key(|address| address.ip.to_string());
}

fn textually_sorted_unique(ips: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
    let mut ips: Vec<Ipv4Addr> = {
        let mut seen = std::collections::BTreeSet::new();
        ips.into_iter().filter(|ip| seen.insert(*ip)).collect()
    };
    ips.sort_by_key(|ip| ip.to_string());
    ips
}

/// Run the enricher until SIGINT.
pub async fn run(config: &Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let amqp_uri = config.broker.amqp_uri();
    let enricher = Enricher::from_config(&config.enricher);

    let pusher: AmqpPusher<Vec<u8>> = AmqpPusher::connect(
        PusherConfig::new(&amqp_uri, ExchangeSpec::topic(crate::aggregator::EVENT_EXCHANGE)),
        Arc::new(|data: &Vec<u8>| Ok(Serialized::Publish(data.clone()))),
        None,
    )
    .await?;

    let mut consumer = QueueConsumer::start(ConsumerConfig::new(
        &amqp_uri,
        crate::aggregator::EVENT_EXCHANGE,
        &config.enricher.queue_name,
        config.enricher.binding_keys.clone(),
    ));

    info!(queue = %config.enricher.queue_name, "enricher running");
    loop {
        tokio::select! {
            delivery = consumer.recv() => {
                match delivery {
                    Some(delivery) => handle_delivery(&enricher, &pusher, delivery).await,
                    None => {
                        error!("consumer channel closed, stopping");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    pusher.shutdown().await?;
    Ok(())
}

async fn handle_delivery(enricher: &Enricher, pusher: &AmqpPusher<Vec<u8>>, delivery: Delivery) {
    let mut event: Event = match serde_json::from_slice(&delivery.data) {
        Ok(event) => event,
        Err(e) => {
            error!(error = %e, routing_key = %delivery.routing_key, "unparseable event; rejecting");
            let _ = delivery
                .reject(BasicRejectOptions { requeue: false })
                .await;
            return;
        }
    };

    enricher.enrich(&mut event).await;

    let routing_key = enriched_routing_key(delivery.routing_key.as_str());
    match serde_json::to_vec(&event) {
        Ok(body) => {
            if let Err(e) = pusher.push(body, routing_key, None).await {
                error!(error = %e, "failed to enqueue enriched event");
            }
        }
        Err(e) => error!(error = %e, "failed to serialize enriched event"),
    }
    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        error!(error = %e, "failed to ack delivery");
    }
}
