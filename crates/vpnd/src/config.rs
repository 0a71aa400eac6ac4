//! Daemon configuration
//!
//! Read from the TOML file named by `VPND_CONFIG` (default `vpnd.toml`).
//! A missing file means defaults.
//!
//! ```toml
//! log_level = "debug"
//! dry_run = true
//! servers_file = "servers.json"
//! auto_connect_server = "us-ny-1"
//!
//! [engine]
//! terminate_attempts = 5
//! log_file = "vpnd.log"
//!
//! [openvpn]
//! binary = "/usr/sbin/openvpn"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;
use vpnd_core::{EngineConfig, OpenVpnConfig, ServerCatalog};

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "VPND_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "vpnd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub openvpn: OpenVpnConfig,
    /// Server list (`.json` or `.toml`); built-in servers when unset
    pub servers_file: Option<PathBuf>,
    /// Simulate tunnels instead of running OpenVPN
    pub dry_run: bool,
    /// Fallback filter when `RUST_LOG` is unset
    pub log_level: String,
    /// Server for auto-connect; best server when unset
    pub auto_connect_server: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            openvpn: OpenVpnConfig::default(),
            servers_file: None,
            dry_run: false,
            log_level: "info".to_string(),
            auto_connect_server: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `$VPND_CONFIG` or `vpnd.toml`
    pub fn load() -> Result<Self> {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_path(&path)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config
            .engine
            .validate()
            .with_context(|| format!("validating {}", path.display()))?;
        Ok(config)
    }

    /// Build the server catalog
    pub fn catalog(&self) -> Result<ServerCatalog> {
        match &self.servers_file {
            Some(path) => ServerCatalog::from_file(path)
                .with_context(|| format!("loading servers from {}", path.display())),
            None => {
                info!("No servers_file configured, using built-in servers");
                Ok(ServerCatalog::defaults())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_means_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = DaemonConfig::from_path(&dir.path().join("absent.toml")).unwrap();

        assert!(!config.dry_run);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.engine.terminate_attempts, 3);
        assert_eq!(config.openvpn.port, 1194);
    }

    #[test]
    fn test_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
dry_run = true
auto_connect_server = "uk-london-1"

[engine]
terminate_attempts = 5

[engine.initial_settings]
killSwitch = true
encryptionLevel = "low"
protocol = "TCP"
dns = "1.1.1.1"
autoConnect = true

[openvpn]
binary = "/usr/sbin/openvpn"
"#
        )
        .unwrap();

        let config = DaemonConfig::from_path(file.path()).unwrap();
        assert!(config.dry_run);
        assert_eq!(config.auto_connect_server.as_deref(), Some("uk-london-1"));
        assert_eq!(config.engine.terminate_attempts, 5);
        assert!(config.engine.initial_settings.auto_connect);
        assert_eq!(config.openvpn.binary, PathBuf::from("/usr/sbin/openvpn"));
    }

    #[test]
    fn test_invalid_engine_section_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[engine]\nterminate_attempts = 0\n").unwrap();

        assert!(DaemonConfig::from_path(file.path()).is_err());
    }

    #[test]
    fn test_catalog_from_servers_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");
        std::fs::write(
            &path,
            r#"{"servers": [{"id": "de-1", "name": "Frankfurt", "country": "DE", "city": "Frankfurt",
                "protocol": "OpenVPN", "ip": "10.0.0.1", "load": 0.2, "ping": 30}]}"#,
        )
        .unwrap();

        let config = DaemonConfig {
            servers_file: Some(path),
            ..DaemonConfig::default()
        };
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 1);
        assert!(catalog.get("de-1").is_some());

        assert_eq!(DaemonConfig::default().catalog().unwrap().len(), 4);
    }
}
