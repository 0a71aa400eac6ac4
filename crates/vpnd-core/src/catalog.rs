//! Server Catalog
//!
//! Read-only set of servers the engine may connect to.
//!
//! The catalog is sourced externally (a JSON or TOML file, or the built-in
//! defaults) and never mutated after construction. Reloading builds a new
//! catalog and swaps it in; holders of the old one keep a consistent view.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// A VPN server entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Unique, stable identifier
    pub id: String,
    /// Display name
    pub name: String,
    /// Country code
    pub country: String,
    /// City
    pub city: String,
    /// Advertised protocol (informational)
    pub protocol: String,
    /// Network address of the server
    pub ip: IpAddr,
    /// Current load, 0.0 - 1.0
    pub load: f64,
    /// Round-trip latency estimate (ms)
    pub ping: u32,
}

impl Server {
    fn in_country(&self, code: &str) -> bool {
        self.country.eq_ignore_ascii_case(code)
    }
}

/// On-disk catalog layout: `{ "servers": [...] }`
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CatalogFile {
    servers: Vec<Server>,
}

/// Immutable server catalog
#[derive(Debug, Clone, Default)]
pub struct ServerCatalog {
    servers: Arc<[Server]>,
}

impl ServerCatalog {
    /// Build a catalog, rejecting duplicate ids and out-of-range loads
    pub fn new(servers: Vec<Server>) -> Result<Self, CatalogError> {
        let mut seen = HashSet::with_capacity(servers.len());
        for server in &servers {
            if !seen.insert(server.id.as_str()) {
                return Err(CatalogError::DuplicateId(server.id.clone()));
            }
            if !(0.0..=1.0).contains(&server.load) {
                return Err(CatalogError::InvalidLoad {
                    id: server.id.clone(),
                    load: server.load,
                });
            }
        }

        Ok(Self {
            servers: servers.into(),
        })
    }

    /// Load from a `.json` or `.toml` file
    pub fn from_file(path: &Path) -> Result<Self, CatalogError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let content =
            std::fs::read_to_string(path).map_err(|e| CatalogError::Io(e.to_string()))?;

        let catalog = match ext {
            "json" => Self::from_json(&content)?,
            "toml" => Self::from_toml(&content)?,
            _ => return Err(CatalogError::UnsupportedFormat(ext.to_string())),
        };

        info!(
            "Loaded {} servers from {}",
            catalog.len(),
            path.display()
        );
        Ok(catalog)
    }

    /// Parse from a JSON string
    pub fn from_json(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            serde_json::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(file.servers)
    }

    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, CatalogError> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| CatalogError::Parse(e.to_string()))?;
        Self::new(file.servers)
    }

    /// Built-in fallback catalog
    pub fn defaults() -> Self {
        let server = |id: &str, name: &str, country: &str, city: &str, ip: [u8; 4], load: f64, ping: u32| {
            Server {
                id: id.to_string(),
                name: name.to_string(),
                country: country.to_string(),
                city: city.to_string(),
                protocol: "UDP".to_string(),
                ip: IpAddr::from(ip),
                load,
                ping,
            }
        };

        let servers = vec![
            server("us-ny-1", "United States - New York", "US", "New York", [45, 33, 32, 156], 0.35, 12),
            server("us-la-1", "United States - Los Angeles", "US", "Los Angeles", [167, 99, 182, 125], 0.42, 28),
            server("uk-london-1", "United Kingdom - London", "UK", "London", [185, 2, 75, 150], 0.45, 85),
            server("au-sydney-1", "Australia - Sydney", "AU", "Sydney", [203, 0, 113, 45], 0.55, 145),
        ];

        debug!("Using built-in catalog with {} servers", servers.len());
        Self {
            servers: servers.into(),
        }
    }

    /// All servers, in catalog order
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    /// Find a server by id
    pub fn get(&self, id: &str) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Number of servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Is the catalog empty?
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Servers in a given country (case-insensitive code match)
    pub fn by_country(&self, code: &str) -> Vec<&Server> {
        self.servers
            .iter()
            .filter(|s| s.in_country(code))
            .collect()
    }

    /// Least loaded first
    pub fn sorted_by_load(&self) -> Vec<&Server> {
        let mut sorted: Vec<_> = self.servers.iter().collect();
        sorted.sort_by(|a, b| a.load.total_cmp(&b.load));
        sorted
    }

    /// Lowest ping first
    pub fn sorted_by_ping(&self) -> Vec<&Server> {
        let mut sorted: Vec<_> = self.servers.iter().collect();
        sorted.sort_by_key(|s| s.ping);
        sorted
    }

    /// Servers in `country` (all when unset), in `order` (catalog order when unset)
    pub fn query(&self, country: Option<&str>, order: Option<ServerOrder>) -> Vec<&Server> {
        let Some(order) = order else {
            return match country {
                Some(code) => self.by_country(code),
                None => self.servers.iter().collect(),
            };
        };

        let mut servers = match order {
            ServerOrder::Load => self.sorted_by_load(),
            ServerOrder::Ping => self.sorted_by_ping(),
        };
        if let Some(code) = country {
            servers.retain(|s| s.in_country(code));
        }
        servers
    }

    /// Lowest ping, ties broken by load
    pub fn best(&self) -> Option<&Server> {
        self.servers
            .iter()
            .min_by(|a, b| a.ping.cmp(&b.ping).then(a.load.total_cmp(&b.load)))
    }
}

/// Sort order for catalog listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerOrder {
    Load,
    Ping,
}

/// Catalog errors
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported catalog format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Duplicate server id: {0}")]
    DuplicateId(String),

    #[error("Server {id} has load {load} outside 0.0-1.0")]
    InvalidLoad { id: String, load: f64 },
}
