//! External-resolution seams of the enricher: DNS and the GeoIP
//! databases. Each seam is a trait so components and tests choose the
//! implementation; either GeoIP database may be absent at run time.

use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

use async_trait::async_trait;

/// DNS resolution failure (any cause: NXDOMAIN, timeout, refusal).
#[derive(Debug, thiserror::Error)]
#[error("DNS lookup failed: {0}")]
pub struct DnsError(pub String);

/// GeoIP lookup failure for one IP.
#[derive(Debug, thiserror::Error)]
#[error("GeoIP lookup failed: {0}")]
pub struct GeoLookupError(pub String);

/// A-record resolution.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn lookup_a(&self, fqdn: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
}

/// Resolver using the operating system's name resolution.
pub struct SystemDnsResolver;

#[async_trait]
impl DnsResolver for SystemDnsResolver {
    async fn lookup_a(&self, fqdn: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let addrs = tokio::net::lookup_host((fqdn, 0))
            .await
            .map_err(|e| DnsError(e.to_string()))?;
        Ok(addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .collect())
    }
}

/// ASN database lookups.
pub trait AsnDatabase: Send + Sync {
    /// `Ok(None)` when the database has no record for the IP.
    fn asn(&self, ip: Ipv4Addr) -> Result<Option<u32>, GeoLookupError>;
}

/// Country-code (city) database lookups.
pub trait CityDatabase: Send + Sync {
    fn country_code(&self, ip: Ipv4Addr) -> Result<Option<String>, GeoLookupError>;
}

/// MaxMind `GeoLite2-ASN.mmdb` reader.
pub struct MaxmindAsnDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxmindAsnDatabase {
    pub fn open(path: &Path) -> Result<Self, GeoLookupError> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| GeoLookupError(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Self { reader })
    }
}

impl AsnDatabase for MaxmindAsnDatabase {
    fn asn(&self, ip: Ipv4Addr) -> Result<Option<u32>, GeoLookupError> {
        match self.reader.lookup::<maxminddb::geoip2::Asn>(IpAddr::V4(ip)) {
            Ok(record) => Ok(record.autonomous_system_number),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(GeoLookupError(e.to_string())),
        }
    }
}

/// MaxMind `GeoLite2-City.mmdb` reader.
pub struct MaxmindCityDatabase {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxmindCityDatabase {
    pub fn open(path: &Path) -> Result<Self, GeoLookupError> {
        let reader = maxminddb::Reader::open_readfile(path)
            .map_err(|e| GeoLookupError(format!("cannot open {}: {}", path.display(), e)))?;
        Ok(Self { reader })
    }
}

impl CityDatabase for MaxmindCityDatabase {
    fn country_code(&self, ip: Ipv4Addr) -> Result<Option<String>, GeoLookupError> {
        match self.reader.lookup::<maxminddb::geoip2::City>(IpAddr::V4(ip)) {
            Ok(record) => Ok(record
                .country
                .and_then(|country| country.iso_code)
                .map(|code| code.to_string())),
            Err(maxminddb::MaxMindDBError::AddressNotFoundError(_)) => Ok(None),
            Err(e) => Err(GeoLookupError(e.to_string())),
        }
    }
}
