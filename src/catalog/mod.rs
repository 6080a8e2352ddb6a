//! Server catalog
//!
//! Decodes the remote/cached directory document into typed country and
//! server records and partitions the servers into the free and premium pools.
//!
//! Document shape:
//!
//! ```json
//! { "servers": { "<countryKey>": { "name": "Germany", "requiresSubscription": false,
//!     "servers": { "<serverKey>": { "name": "de-fra-1", "city": "Frankfurt", ... } } } } }
//! ```
//!
//! A structurally invalid country or server entry is skipped, never fatal.

pub(crate) mod source;

pub use source::{CatalogFetcher, CatalogSource, HttpCatalogFetcher};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CatalogError;

/// Placeholder for missing country/city/state names
pub const UNKNOWN: &str = "Unknown";

fn unknown() -> String {
    UNKNOWN.to_string()
}

/// A relay server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    /// Unique identity
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default = "unknown")]
    pub country: String,
    #[serde(default = "unknown")]
    pub state: String,
    #[serde(default = "unknown")]
    pub city: String,
    #[serde(rename = "publicIP", default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os_version: Option<String>,
    pub requires_subscription: bool,
    pub capacity: i64,
    /// Current number of peers
    pub current_capacity: i64,
    /// Absent means new connections are allowed
    #[serde(default = "allow_by_default")]
    pub allow_new_connection: bool,
    pub last_updated: String,
}

fn allow_by_default() -> bool {
    true
}

impl Server {
    /// Remaining capacity in [0, 1], see [`signal_strength`]
    pub fn signal_strength(&self) -> f64 {
        signal_strength(self.current_capacity, self.capacity)
    }

    /// Which pool this server belongs to
    pub fn pool(&self) -> Pool {
        Pool::of(self.requires_subscription)
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("empty server name".to_string());
        }
        if self.capacity < 0 || self.current_capacity < 0 {
            return Err(format!("negative capacity on {}", self.name));
        }
        Ok(())
    }
}

/// Remaining strength for a utilization, clamped to [0, 1].
///
/// A non-positive capacity is treated as fully utilized.
pub fn signal_strength(current_peers: i64, capacity: i64) -> f64 {
    let utilization = if capacity > 0 {
        current_peers as f64 / capacity as f64
    } else {
        1.0
    };
    (1.0 - utilization).clamp(0.0, 1.0)
}

/// Free or premium subset of the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pool {
    Free,
    Premium,
}

impl Pool {
    pub fn of(requires_subscription: bool) -> Self {
        if requires_subscription {
            Pool::Premium
        } else {
            Pool::Free
        }
    }

    /// Directory section index (0 = free, 1 = premium)
    pub fn section(self) -> usize {
        match self {
            Pool::Free => 0,
            Pool::Premium => 1,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Pool::Free => "Free Locations",
            Pool::Premium => "Premium Locations",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Pool::Free => "free",
            Pool::Premium => "premium",
        }
    }
}

/// A country grouping of servers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Country {
    pub name: String,
    /// Pool tag; the same country can appear in both pools
    pub requires_subscription: bool,
    pub servers: BTreeMap<String, Server>,
}

impl Country {
    /// Sum of capacity over all servers
    pub fn total_capacity(&self) -> i64 {
        self.servers.values().map(|s| s.capacity.max(0)).sum()
    }

    /// Sum of current peers over all servers
    pub fn current_peers(&self) -> i64 {
        self.servers.values().map(|s| s.current_capacity.max(0)).sum()
    }

    pub fn signal_strength(&self) -> f64 {
        signal_strength(self.current_peers(), self.total_capacity())
    }
}

/// Decoded directory document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub countries: BTreeMap<String, Country>,
}

#[derive(Deserialize)]
struct RawCatalog {
    servers: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawCountry {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    requires_subscription: bool,
    #[serde(default)]
    servers: BTreeMap<String, Value>,
}

impl Catalog {
    /// Decode a raw directory document.
    ///
    /// Only a malformed top level fails; bad country or server entries are
    /// logged and skipped.
    pub fn load(raw: &[u8]) -> Result<Self, CatalogError> {
        let raw: RawCatalog = serde_json::from_slice(raw).map_err(|e| CatalogError::Decode {
            reason: e.to_string(),
        })?;

        let mut countries = BTreeMap::new();
        let mut skipped = 0usize;

        for (country_key, value) in raw.servers {
            let raw_country: RawCountry = match serde_json::from_value(value) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("Skipping country entry {}: {}", country_key, e);
                    skipped += 1;
                    continue;
                }
            };

            let mut servers = BTreeMap::new();
            for (server_key, value) in raw_country.servers {
                let server = serde_json::from_value::<Server>(value)
                    .map_err(|e| e.to_string())
                    .and_then(|s| s.validate().map(|_| s));
                match server {
                    Ok(server) => {
                        servers.insert(server.name.clone(), server);
                    }
                    Err(reason) => {
                        tracing::warn!(
                            "Skipping server entry {}/{}: {}",
                            country_key,
                            server_key,
                            reason
                        );
                        skipped += 1;
                    }
                }
            }

            countries.insert(
                country_key,
                Country {
                    name: raw_country.name.unwrap_or_else(unknown),
                    requires_subscription: raw_country.requires_subscription,
                    servers,
                },
            );
        }

        let catalog = Catalog { countries };
        tracing::info!(
            "Loaded {} free servers and {} premium servers ({} entries skipped)",
            catalog.free_servers().len(),
            catalog.premium_servers().len(),
            skipped
        );
        Ok(catalog)
    }

    /// All servers, flattened in document order
    pub fn servers(&self) -> impl Iterator<Item = &Server> {
        self.countries.values().flat_map(|c| c.servers.values())
    }

    /// Servers whose own flag says they are free
    pub fn free_servers(&self) -> Vec<Server> {
        self.pool(Pool::Free)
    }

    /// Servers whose own flag says they require a subscription
    pub fn premium_servers(&self) -> Vec<Server> {
        self.pool(Pool::Premium)
    }

    pub fn pool(&self, pool: Pool) -> Vec<Server> {
        self.servers().filter(|s| s.pool() == pool).cloned().collect()
    }

    /// Look up a server by its unique name
    pub fn find(&self, name: &str) -> Option<&Server> {
        self.servers().find(|s| s.name == name)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const TEST_CATALOG: &str = r#"{
        "servers": {
            "germany": {
                "name": "Germany",
                "requiresSubscription": false,
                "servers": {
                    "de-ber-1": {
                        "name": "de-ber-1", "city": "Berlin", "state": "Berlin", "country": "Germany",
                        "publicIP": "1.2.3.4", "port": 5000, "requiresSubscription": false,
                        "capacity": 100, "currentCapacity": 40, "lastUpdated": "2025-10-22T12:00:00Z",
                        "allowNewConnection": true
                    },
                    "de-fra-1": {
                        "name": "de-fra-1", "city": "Frankfurt", "state": "Hesse", "country": "Germany",
                        "publicIP": "1.2.3.5", "requiresSubscription": true,
                        "capacity": 100, "currentCapacity": 10, "lastUpdated": "2025-10-22T12:00:00Z"
                    }
                }
            },
            "usa": {
                "name": "United States",
                "requiresSubscription": true,
                "servers": {
                    "us-nyc-1": {
                        "name": "us-nyc-1", "city": "New York", "state": "New York", "country": "United States",
                        "publicIP": "5.6.7.8", "port": 5001, "requiresSubscription": true,
                        "capacity": 200, "currentCapacity": 50, "lastUpdated": "2025-10-22T12:00:00Z"
                    },
                    "us-dal-1": {
                        "name": "us-dal-1", "city": "Dallas", "state": "Texas", "country": "United States",
                        "publicIP": "5.6.7.9", "requiresSubscription": false,
                        "capacity": 0, "currentCapacity": 0, "lastUpdated": "2025-10-22T12:00:00Z"
                    }
                }
            }
        }
    }"#;

    pub(crate) fn test_catalog() -> Catalog {
        Catalog::load(TEST_CATALOG.as_bytes()).unwrap()
    }

    #[test]
    fn test_load_catalog() {
        let catalog = test_catalog();
        assert_eq!(catalog.countries.len(), 2);
        assert_eq!(catalog.countries["germany"].name, "Germany");
        assert_eq!(catalog.servers().count(), 4);

        let server = catalog.find("de-ber-1").unwrap();
        assert_eq!(server.public_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(server.port, Some(5000));
        assert!(server.allow_new_connection);
    }

    #[test]
    fn test_pools_partition_by_server_flag() {
        let catalog = test_catalog();
        let free = catalog.free_servers();
        let premium = catalog.premium_servers();

        // The server flag wins over the country tag
        assert!(free.iter().any(|s| s.name == "us-dal-1"));
        assert!(premium.iter().any(|s| s.name == "de-fra-1"));

        assert!(free.iter().all(|s| !s.requires_subscription));
        assert!(premium.iter().all(|s| s.requires_subscription));
        assert_eq!(free.len() + premium.len(), catalog.servers().count());
        assert!(free.iter().all(|f| !premium.iter().any(|p| p.name == f.name)));
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let raw = r#"{
            "servers": {
                "broken-country": 42,
                "france": {
                    "requiresSubscription": false,
                    "servers": {
                        "missing-capacity": { "name": "fr-par-1", "requiresSubscription": false, "lastUpdated": "x" },
                        "negative": { "name": "fr-par-2", "requiresSubscription": false,
                                      "capacity": -1, "currentCapacity": 0, "lastUpdated": "x" },
                        "ok": { "name": "fr-par-3", "requiresSubscription": false,
                                "capacity": 10, "currentCapacity": 1, "lastUpdated": "x" }
                    }
                }
            }
        }"#;

        let catalog = Catalog::load(raw.as_bytes()).unwrap();
        assert_eq!(catalog.countries.len(), 1);

        let france = &catalog.countries["france"];
        assert_eq!(france.name, UNKNOWN);
        assert_eq!(france.servers.len(), 1);

        let server = &france.servers["fr-par-3"];
        assert_eq!(server.city, UNKNOWN);
        assert_eq!(server.country, UNKNOWN);
        assert_eq!(server.public_ip, None);
    }

    #[test]
    fn test_malformed_top_level_fails() {
        assert!(matches!(
            Catalog::load(b"[1, 2, 3]"),
            Err(CatalogError::Decode { .. })
        ));
        assert!(Catalog::load(b"not json").is_err());
    }

    #[test]
    fn test_signal_strength_clamps() {
        assert_eq!(signal_strength(0, 0), 0.0);
        assert_eq!(signal_strength(5, -3), 0.0);
        assert_eq!(signal_strength(150, 100), 0.0);
        assert_eq!(signal_strength(-10, 100), 1.0);
        assert!((signal_strength(25, 100) - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_country_aggregates() {
        let catalog = test_catalog();
        let usa = &catalog.countries["usa"];
        assert_eq!(usa.total_capacity(), 200);
        assert_eq!(usa.current_peers(), 50);
        assert!((usa.signal_strength() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_server_snapshot_roundtrip() {
        let catalog = test_catalog();
        let server = catalog.find("us-nyc-1").unwrap().clone();
        let json = serde_json::to_string(&server).unwrap();
        assert!(json.contains("\"publicIP\":\"5.6.7.8\""));
        let parsed: Server = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, server);
    }
}
