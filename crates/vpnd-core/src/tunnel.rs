//! Tunnel Supervisor contract
//!
//! The tunnel itself is an external process. The engine only sees two
//! operations, each with a binary outcome:
//!
//! - `start(config)`: bring a tunnel up, or fail
//! - `terminate()`: bring it down, or fail
//!
//! A supervisor owns at most one tunnel. It does not retry and does not
//! guard against overlapping calls; the engine's state machine guarantees
//! that `start` and `terminate` never overlap.
//!
//! A tunnel that dies on its own after a successful `start` is reported
//! through the [`ExitNotifier`] handed to `start`.

use crate::catalog::Server;
use crate::settings::{Settings, TransportProtocol};
use async_trait::async_trait;
use std::fmt::Write;
use std::net::IpAddr;
use tokio::sync::mpsc;
use tracing::debug;

/// Tunnel parameters derived from a server and the settings at connect time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub server_id: String,
    pub remote: IpAddr,
    pub protocol: TransportProtocol,
    pub cipher: String,
    pub dns: String,
    /// Kill-switch policy for this tunnel's lifetime
    pub kill_switch: bool,
}

impl TunnelConfig {
    pub fn new(server: &Server, settings: &Settings) -> Self {
        Self {
            server_id: server.id.clone(),
            remote: server.ip,
            protocol: settings.protocol,
            cipher: settings.encryption_level.cipher().to_string(),
            dns: settings.dns.clone(),
            kill_switch: settings.kill_switch,
        }
    }

    /// Render an OpenVPN client configuration
    pub fn render(&self, port: u16) -> String {
        let proto = match self.protocol {
            TransportProtocol::Udp => "udp",
            TransportProtocol::Tcp => "tcp-client",
        };

        let mut out = String::new();
        // Writing into a String cannot fail.
        let _ = writeln!(out, "client");
        let _ = writeln!(out, "dev tun");
        let _ = writeln!(out, "proto {}", proto);
        let _ = writeln!(out, "remote {} {}", self.remote, port);
        let _ = writeln!(out, "resolv-retry infinite");
        let _ = writeln!(out, "nobind");
        let _ = writeln!(out, "persist-key");
        let _ = writeln!(out, "persist-tun");
        let _ = writeln!(out, "cipher {}", self.cipher);
        let _ = writeln!(out, "data-ciphers {}", self.cipher);
        let _ = writeln!(out, "dhcp-option DNS {}", self.dns);
        let _ = writeln!(out, "verb 3");
        out
    }
}

/// Unrequested tunnel exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelExit {
    /// Connection attempt the tunnel belonged to
    pub generation: u64,
    /// Process exit code, if any
    pub code: Option<i32>,
}

/// One-shot channel for reporting that a started tunnel died on its own
#[derive(Debug)]
pub struct ExitNotifier {
    generation: u64,
    tx: mpsc::UnboundedSender<TunnelExit>,
}

impl ExitNotifier {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TunnelExit>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the exit; a no-op if the engine is gone
    pub fn notify(self, code: Option<i32>) {
        debug!(
            "Tunnel of generation {} exited unexpectedly ({:?})",
            self.generation, code
        );
        let _ = self.tx.send(TunnelExit {
            generation: self.generation,
            code,
        });
    }
}

/// Instantaneous tunnel throughput (bytes per second)
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Throughput {
    pub upload: f64,
    pub download: f64,
}

/// Owner of the external tunnel process
#[async_trait]
pub trait TunnelSupervisor: Send + Sync {
    /// Bring the tunnel up; resolves once it is usable or has failed
    async fn start(&self, config: &TunnelConfig, exits: ExitNotifier) -> Result<(), SupervisorError>;

    /// Bring the tunnel down; resolves once it is gone or has failed
    async fn terminate(&self) -> Result<(), SupervisorError>;

    /// Current throughput of the live tunnel
    fn throughput(&self) -> Throughput {
        Throughput::default()
    }
}

/// Supervisor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SupervisorError {
    #[error("Failed to spawn tunnel process: {0}")]
    Spawn(String),

    #[error("Tunnel startup timed out")]
    StartupTimeout,

    #[error("Tunnel process exited during startup (code {0:?})")]
    ExitedDuringStartup(Option<i32>),

    #[error("Tunnel process did not stop in time")]
    StopTimeout,

    #[error("No tunnel is running")]
    NotRunning,

    #[error("IO error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerCatalog;
    use crate::settings::EncryptionLevel;

    fn config(protocol: TransportProtocol) -> TunnelConfig {
        let catalog = ServerCatalog::defaults();
        let settings = Settings {
            protocol,
            encryption_level: EncryptionLevel::Medium,
            dns: "1.1.1.1".to_string(),
            kill_switch: true,
            ..Settings::default()
        };
        TunnelConfig::new(catalog.get("us-ny-1").unwrap(), &settings)
    }

    #[test]
    fn test_config_from_server_and_settings() {
        let config = config(TransportProtocol::Udp);

        assert_eq!(config.remote.to_string(), "45.33.32.156");
        assert_eq!(config.cipher, "AES-192-GCM");
        assert!(config.kill_switch);
    }

    #[test]
    fn test_render_udp() {
        let text = config(TransportProtocol::Udp).render(1194);

        assert!(text.contains("proto udp\n"));
        assert!(text.contains("remote 45.33.32.156 1194\n"));
        assert!(text.contains("dhcp-option DNS 1.1.1.1\n"));
    }

    #[test]
    fn test_render_tcp() {
        let text = config(TransportProtocol::Tcp).render(443);
        assert!(text.contains("proto tcp-client\n"));
        assert!(text.contains("remote 45.33.32.156 443\n"));
    }

    #[test]
    fn test_notifier_tags_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        ExitNotifier::new(7, tx).notify(Some(1));

        assert_eq!(
            rx.try_recv().unwrap(),
            TunnelExit {
                generation: 7,
                code: Some(1)
            }
        );
    }
}
