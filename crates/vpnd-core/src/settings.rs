//! VPN Settings
//!
//! The active configuration is replaced as a whole unit. Enum fields are
//! validated when raw input is converted into [`Settings`]; unknown values
//! are rejected, never coerced.

use crate::file_sink::FileSink;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Tunnel encryption strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncryptionLevel {
    Low,
    Medium,
    #[default]
    High,
}

impl EncryptionLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionLevel::Low => "low",
            EncryptionLevel::Medium => "medium",
            EncryptionLevel::High => "high",
        }
    }

    /// Data-channel cipher used for this level
    pub fn cipher(&self) -> &'static str {
        match self {
            EncryptionLevel::Low => "AES-128-GCM",
            EncryptionLevel::Medium => "AES-192-GCM",
            EncryptionLevel::High => "AES-256-GCM",
        }
    }
}

impl FromStr for EncryptionLevel {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(EncryptionLevel::Low),
            "medium" => Ok(EncryptionLevel::Medium),
            "high" => Ok(EncryptionLevel::High),
            _ => Err(SettingsError::InvalidEncryptionLevel(s.to_string())),
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportProtocol {
    #[default]
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Tcp => "TCP",
        }
    }
}

impl FromStr for TransportProtocol {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UDP" => Ok(TransportProtocol::Udp),
            "TCP" => Ok(TransportProtocol::Tcp),
            _ => Err(SettingsError::InvalidProtocol(s.to_string())),
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated VPN settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Block traffic if the tunnel drops unexpectedly
    pub kill_switch: bool,
    pub encryption_level: EncryptionLevel,
    pub protocol: TransportProtocol,
    /// DNS server pushed into the tunnel
    pub dns: String,
    /// Connect on daemon start
    pub auto_connect: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            kill_switch: false,
            encryption_level: EncryptionLevel::High,
            protocol: TransportProtocol::Udp,
            dns: "8.8.8.8".to_string(),
            auto_connect: false,
        }
    }
}

/// Unvalidated settings as received from a client
///
/// Missing fields take the documented defaults; enum fields stay as
/// strings until [`Settings::try_from`] checks them.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RawSettings {
    pub kill_switch: bool,
    pub encryption_level: String,
    pub protocol: String,
    pub dns: String,
    pub auto_connect: bool,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            kill_switch: false,
            encryption_level: "high".to_string(),
            protocol: "UDP".to_string(),
            dns: "8.8.8.8".to_string(),
            auto_connect: false,
        }
    }
}

impl TryFrom<RawSettings> for Settings {
    type Error = SettingsError;

    fn try_from(raw: RawSettings) -> Result<Self, Self::Error> {
        Ok(Self {
            kill_switch: raw.kill_switch,
            encryption_level: raw.encryption_level.parse()?,
            protocol: raw.protocol.parse()?,
            dns: raw.dns,
            auto_connect: raw.auto_connect,
        })
    }
}

/// Settings validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("Invalid encryption level: {0:?} (expected low, medium or high)")]
    InvalidEncryptionLevel(String),

    #[error("Invalid protocol: {0:?} (expected UDP or TCP)")]
    InvalidProtocol(String),
}

/// Holder of the active settings
///
/// Reads never have side effects. When a path is configured every write is
/// persisted as TOML by a writer thread, in write order; persistence
/// failures are logged, the in-memory value is still replaced.
pub struct SettingsStore {
    settings: RwLock<Settings>,
    sink: Option<FileSink>,
}

impl SettingsStore {
    /// In-memory store
    pub fn new(initial: Settings) -> Self {
        Self {
            settings: RwLock::new(initial),
            sink: None,
        }
    }

    /// Store backed by a TOML file; a missing or unreadable file yields `fallback`
    pub fn with_file(path: PathBuf, fallback: Settings) -> Self {
        let initial = match Self::read_file(&path) {
            Ok(Some(settings)) => {
                debug!("Loaded settings from {}", path.display());
                settings
            }
            Ok(None) => fallback,
            Err(e) => {
                warn!("Ignoring settings file {}: {}", path.display(), e);
                fallback
            }
        };

        let sink = FileSink::replace("vpnd-settings", path.clone())
            .map_err(|e| warn!("Settings for {} will not be persisted: {}", path.display(), e))
            .ok();

        Self {
            settings: RwLock::new(initial),
            sink,
        }
    }

    fn read_file(path: &Path) -> Result<Option<Settings>, String> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        toml::from_str(&content).map(Some).map_err(|e| e.to_string())
    }

    /// Current settings
    pub fn get(&self) -> Settings {
        self.settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace settings atomically
    pub fn set(&self, settings: Settings) {
        let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
        *guard = settings;
        self.persist(&guard);
    }

    /// Mutate in place under the write lock
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Settings {
        let mut guard = self.settings.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
        self.persist(&guard);
        guard.clone()
    }

    /// Block until queued writes are on disk
    pub fn flush(&self) {
        if let Some(sink) = &self.sink {
            sink.flush();
        }
    }

    /// Queued under the write lock so the file ends with the last write
    fn persist(&self, settings: &Settings) {
        let Some(sink) = &self.sink else {
            return;
        };

        match toml::to_string_pretty(settings) {
            Ok(content) => sink.write(content),
            Err(e) => warn!("Failed to serialize settings: {}", e),
        }
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
