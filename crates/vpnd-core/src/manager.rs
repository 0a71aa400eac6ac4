//! Connection Manager
//!
//! Owns the lifecycle of the single logical tunnel:
//!
//! ```text
//!            connect                 ok
//!   Idle ─────────────▶ Connecting ─────▶ Connected
//!    ▲  ◀───────────────────┘ fail          │  │
//!    │                                       │  │ tunnel lost
//!    │        ok           disconnect        │  │ (kill switch on)
//!    └────── Disconnecting ◀─────────────────┘  ▼
//!                 │ retries exhausted         Blocked
//!                 ▼                            (connect restores,
//!        StuckDisconnecting                     disconnect releases)
//!        (disconnect retries)
//! ```
//!
//! Mutating commands are serialized through the state itself: a transition
//! is claimed under the write lock, the supervisor is awaited with the lock
//! released, and any command arriving meanwhile sees a transitional state
//! and is rejected. Status reads and log appends never wait on a pending
//! supervisor call.
//!
//! # Usage
//!
//! ```rust,ignore
//! let engine = Engine::new(EngineConfig::default(), ServerCatalog::defaults(), supervisor)?;
//! let status = engine.connect("us-ny-1").await?;
//! assert!(status.connected);
//! engine.disconnect().await?;
//! ```

use crate::catalog::{Server, ServerCatalog};
use crate::config::{ConfigError, EngineConfig};
use crate::events::{Event, EventBus};
use crate::kill_switch::{KillSwitch, KillSwitchError, KillSwitchState};
use crate::log_store::LogStore;
use crate::settings::{RawSettings, Settings, SettingsError, SettingsStore};
use crate::tunnel::{ExitNotifier, SupervisorError, TunnelConfig, TunnelExit, TunnelSupervisor};
use crossbeam_channel::Receiver;
use futures_util::FutureExt;
use serde::Serialize;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock as StdRwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionState {
    /// No tunnel
    #[default]
    Idle,
    /// Tunnel start in progress
    Connecting,
    /// Tunnel is up
    Connected,
    /// Tunnel termination in progress
    Disconnecting,
    /// Protected tunnel was lost; traffic is blocked
    Blocked,
    /// Termination failed; the tunnel may still exist
    StuckDisconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// A supervisor call is pending
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Disconnecting
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
            ConnectionState::Blocked => "blocked",
            ConnectionState::StuckDisconnecting => "stuck-disconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub connected: bool,
    /// Tunnel address, empty when not connected
    pub ip_address: String,
    pub upload_speed: f64,
    pub download_speed: f64,
    /// Seconds since the tunnel came up
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_server: Option<Server>,
    pub state: ConnectionState,
    pub kill_switch: KillSwitchState,
}

/// Engine errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Server {0} not found")]
    ServerNotFound(String),

    #[error("Server catalog is empty")]
    NoServers,

    #[error("Another operation conflicts with the current state ({0})")]
    AlreadyInProgress(ConnectionState),

    #[error("VPN not connected")]
    NotConnected,

    #[error("Tunnel start failed: {0}")]
    TunnelStartFailed(SupervisorError),

    #[error("Tunnel stop failed: {0}")]
    TunnelStopFailed(SupervisorError),

    #[error("Invalid settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    #[error("Previous tunnel could not be stopped; disconnect first")]
    StuckDisconnecting,
}

/// The live tunnel
struct Session {
    server: Arc<Server>,
    generation: u64,
    connected_at: Instant,
    /// Kill-switch policy captured at connect time
    kill_switch: bool,
}

#[derive(Default)]
struct Connection {
    state: ConnectionState,
    session: Option<Session>,
    /// Generation of the latest start attempt
    attempt: u64,
    /// Set when the attempt's tunnel died before it was confirmed
    early_exit: bool,
}

struct Inner {
    config: EngineConfig,
    catalog: StdRwLock<ServerCatalog>,
    settings: SettingsStore,
    log: LogStore,
    events: EventBus,
    kill_switch: KillSwitch,
    supervisor: Arc<dyn TunnelSupervisor>,
    conn: RwLock<Connection>,
    exit_tx: mpsc::UnboundedSender<TunnelExit>,
}

/// VPN connection engine
///
/// Cheap to clone; clones share one connection. Separate `Engine::new`
/// calls are fully independent.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Create an engine
    ///
    /// Must be called from within a Tokio runtime: a background task
    /// watches for tunnels that exit on their own.
    pub fn new(
        config: EngineConfig,
        catalog: ServerCatalog,
        supervisor: Arc<dyn TunnelSupervisor>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let events = EventBus::new();
        let log = match &config.log_file {
            Some(path) => LogStore::with_file(events.clone(), path),
            None => LogStore::new(events.clone()),
        };
        let settings = match &config.settings_file {
            Some(path) => SettingsStore::with_file(path.clone(), config.initial_settings.clone()),
            None => SettingsStore::new(config.initial_settings.clone()),
        };

        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            catalog: StdRwLock::new(catalog),
            settings,
            log,
            events,
            kill_switch: KillSwitch::new(),
            supervisor,
            conn: RwLock::new(Connection::default()),
            exit_tx,
        });

        runtime.spawn(watch_exits(Arc::downgrade(&inner), exit_rx));

        let engine = Self { inner };
        engine.note("VPN Engine initialized".to_string());
        Ok(engine)
    }

    // ---------------------------------------------------------------
    // Connection lifecycle
    // ---------------------------------------------------------------

    /// Connect to a catalog server
    ///
    /// Valid from `Idle`, and from `Blocked` to restore a lost tunnel.
    /// On failure the engine returns to the state it started from.
    pub async fn connect(&self, server_id: &str) -> Result<StatusSnapshot, EngineError> {
        self.note(format!("Attempting to connect to server: {}", server_id));

        let (server, generation, resting) = match self.begin_connect(server_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.warn(format!("Connect to {} rejected: {}", server_id, e));
                return Err(e);
            }
        };
        self.publish_status().await;

        let tunnel = TunnelConfig::new(&server, &self.inner.settings.get());
        let exits = ExitNotifier::new(generation, self.inner.exit_tx.clone());
        debug!("Starting tunnel with {:?}", tunnel);

        let started = contained(self.inner.supervisor.start(&tunnel, exits)).await;

        let mut conn = self.inner.conn.write().await;
        let result = match started {
            Ok(()) if conn.early_exit => Err(SupervisorError::ExitedDuringStartup(None)),
            other => other,
        };

        match result {
            Ok(()) => {
                conn.state = ConnectionState::Connected;
                conn.session = Some(Session {
                    server: server.clone(),
                    generation,
                    connected_at: Instant::now(),
                    kill_switch: tunnel.kill_switch,
                });
                self.inner.kill_switch.on_tunnel_up(tunnel.kill_switch);
                let status = self.snapshot(&conn);
                drop(conn);

                self.note(format!("Successfully connected to {}", server.name));
                self.inner.events.emit_status(status.clone());
                Ok(status)
            }
            Err(e) => {
                conn.state = resting;
                let status = self.snapshot(&conn);
                drop(conn);

                self.fail(format!("Failed to start tunnel to {}: {}", server.name, e));
                self.inner.events.emit_status(status);
                Err(EngineError::TunnelStartFailed(e))
            }
        }
    }

    /// Claim the `Connecting` transition
    async fn begin_connect(
        &self,
        server_id: &str,
    ) -> Result<(Arc<Server>, u64, ConnectionState), EngineError> {
        let mut conn = self.inner.conn.write().await;
        let resting = conn.state;
        match resting {
            ConnectionState::Idle | ConnectionState::Blocked => {}
            ConnectionState::StuckDisconnecting => return Err(EngineError::StuckDisconnecting),
            other => return Err(EngineError::AlreadyInProgress(other)),
        }

        let server = self
            .catalog()
            .get(server_id)
            .cloned()
            .map(Arc::new)
            .ok_or_else(|| EngineError::ServerNotFound(server_id.to_string()))?;

        conn.state = ConnectionState::Connecting;
        conn.attempt += 1;
        conn.early_exit = false;
        Ok((server, conn.attempt, resting))
    }

    /// Connect to the catalog's best server
    pub async fn connect_best(&self) -> Result<StatusSnapshot, EngineError> {
        let best = self
            .catalog()
            .best()
            .map(|s| s.id.clone())
            .ok_or(EngineError::NoServers)?;
        self.connect(&best).await
    }

    /// Connect on startup if the settings ask for it
    ///
    /// Uses `preferred` when given, the best server otherwise.
    pub async fn auto_connect(
        &self,
        preferred: Option<&str>,
    ) -> Result<Option<StatusSnapshot>, EngineError> {
        if !self.inner.settings.get().auto_connect {
            return Ok(None);
        }

        self.note("Auto-connect enabled".to_string());
        let status = match preferred {
            Some(id) => self.connect(id).await?,
            None => self.connect_best().await?,
        };
        Ok(Some(status))
    }

    /// Disconnect the tunnel
    ///
    /// Valid from `Connected`, `StuckDisconnecting` (retries termination) and
    /// `Blocked` (releases the kill switch; the tunnel is already gone).
    pub async fn disconnect(&self) -> Result<StatusSnapshot, EngineError> {
        let resting = {
            let mut conn = self.inner.conn.write().await;
            let current = conn.state;
            match current {
                ConnectionState::Connected | ConnectionState::StuckDisconnecting => {
                    conn.state = ConnectionState::Disconnecting;
                    current
                }
                ConnectionState::Blocked => {
                    conn.state = ConnectionState::Idle;
                    conn.session = None;
                    self.inner.kill_switch.release();
                    let status = self.snapshot(&conn);
                    drop(conn);

                    self.note("Disconnected; kill switch released".to_string());
                    self.inner.events.emit_status(status.clone());
                    return Ok(status);
                }
                ConnectionState::Idle => return Err(EngineError::NotConnected),
                other => return Err(EngineError::AlreadyInProgress(other)),
            }
        };

        if resting == ConnectionState::StuckDisconnecting {
            self.note("Retrying tunnel termination".to_string());
        } else {
            self.note("Disconnecting from VPN".to_string());
        }
        self.publish_status().await;

        let failure = self.terminate_with_retries().await;

        let mut conn = self.inner.conn.write().await;
        match failure {
            None => {
                conn.state = ConnectionState::Idle;
                conn.session = None;
                self.inner.kill_switch.release();
                let status = self.snapshot(&conn);
                drop(conn);

                self.note("Successfully disconnected".to_string());
                self.inner.events.emit_status(status.clone());
                Ok(status)
            }
            Some(e) => {
                conn.state = ConnectionState::StuckDisconnecting;
                let protected = conn.session.as_ref().is_some_and(|s| s.kill_switch);
                if protected {
                    self.inner.kill_switch.engage();
                }
                let status = self.snapshot(&conn);
                drop(conn);

                self.fail(format!(
                    "Failed to terminate tunnel, it may still be running: {}",
                    e
                ));
                self.inner.events.emit_status(status);
                Err(EngineError::TunnelStopFailed(e))
            }
        }
    }

    /// Bounded termination retries; returns the last error if all fail
    async fn terminate_with_retries(&self) -> Option<SupervisorError> {
        let attempts = self.inner.config.terminate_attempts;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match contained(self.inner.supervisor.terminate()).await {
                Ok(()) => return None,
                Err(e) => {
                    self.warn(format!(
                        "Terminate attempt {}/{} failed: {}",
                        attempt, attempts, e
                    ));
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(self.inner.config.retry_delay()).await;
                    }
                }
            }
        }

        last_error
    }

    /// React to a tunnel that exited without being asked to
    async fn handle_tunnel_exit(&self, exit: TunnelExit) {
        let mut conn = self.inner.conn.write().await;
        let state = conn.state;
        let live_generation = conn.session.as_ref().map(|s| s.generation);

        match state {
            ConnectionState::Connecting if conn.attempt == exit.generation => {
                conn.early_exit = true;
            }
            ConnectionState::Connected if live_generation == Some(exit.generation) => {
                let protected = conn.session.take().is_some_and(|s| s.kill_switch);
                if protected {
                    conn.state = ConnectionState::Blocked;
                    self.inner.kill_switch.on_tunnel_lost();
                } else {
                    conn.state = ConnectionState::Idle;
                    self.inner.kill_switch.release();
                }
                let status = self.snapshot(&conn);
                drop(conn);

                if protected {
                    self.fail(format!(
                        "Tunnel lost unexpectedly (exit code {:?}); kill switch is blocking traffic",
                        exit.code
                    ));
                } else {
                    self.warn(format!(
                        "Tunnel lost unexpectedly (exit code {:?})",
                        exit.code
                    ));
                    self.inner.events.emit_error("Tunnel lost unexpectedly");
                }
                self.inner.events.emit_status(status);
            }
            state => debug!(
                "Ignoring exit of tunnel generation {} in state {}",
                exit.generation, state
            ),
        }
    }

    // ---------------------------------------------------------------
    // Status
    // ---------------------------------------------------------------

    /// Current status, uptime recomputed on every call
    pub async fn status(&self) -> StatusSnapshot {
        let conn = self.inner.conn.read().await;
        self.snapshot(&conn)
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.conn.read().await.state
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await.is_connected()
    }

    fn snapshot(&self, conn: &Connection) -> StatusSnapshot {
        let kill_switch = self.inner.kill_switch.state();

        match (&conn.state, &conn.session) {
            (ConnectionState::Connected, Some(session)) => {
                let throughput = self.inner.supervisor.throughput();
                StatusSnapshot {
                    connected: true,
                    ip_address: session.server.ip.to_string(),
                    upload_speed: throughput.upload.max(0.0),
                    download_speed: throughput.download.max(0.0),
                    uptime: session.connected_at.elapsed().as_secs(),
                    current_server: Some(Server::clone(&session.server)),
                    state: conn.state,
                    kill_switch,
                }
            }
            _ => StatusSnapshot {
                connected: false,
                ip_address: String::new(),
                upload_speed: 0.0,
                download_speed: 0.0,
                uptime: 0,
                current_server: None,
                state: conn.state,
                kill_switch,
            },
        }
    }

    async fn publish_status(&self) {
        let status = self.status().await;
        self.inner.events.emit_status(status);
    }

    /// Measure tunnel speed
    ///
    /// Reports the live download throughput; 0.0 without a tunnel.
    pub async fn test_speed(&self) -> f64 {
        self.note("Testing connection speed...".to_string());
        let status = self.status().await;
        status.download_speed.max(0.0)
    }

    // ---------------------------------------------------------------
    // Settings and kill switch
    // ---------------------------------------------------------------

    pub fn settings(&self) -> Settings {
        self.inner.settings.get()
    }

    /// Replace all settings; a live tunnel keeps its current parameters
    pub fn set_settings(&self, settings: Settings) {
        let summary = format!(
            "VPN Settings updated - Encryption: {}, Protocol: {}",
            settings.encryption_level, settings.protocol
        );
        self.inner.settings.set(settings);
        self.note(summary);
    }

    /// Validate then replace settings
    pub fn apply_settings(&self, raw: RawSettings) -> Result<Settings, EngineError> {
        let settings = match Settings::try_from(raw) {
            Ok(settings) => settings,
            Err(e) => {
                self.warn(format!("Rejected settings: {}", e));
                return Err(e.into());
            }
        };
        self.set_settings(settings.clone());
        Ok(settings)
    }

    /// Takes effect on the next connect
    pub fn enable_kill_switch(&self) {
        self.inner.settings.update(|s| s.kill_switch = true);
        self.note("Kill switch enabled".to_string());
    }

    /// Takes effect on the next connect
    pub fn disable_kill_switch(&self) {
        self.inner.settings.update(|s| s.kill_switch = false);
        self.note("Kill switch disabled".to_string());
    }

    /// Shared kill switch for the traffic-enforcement layer
    pub fn kill_switch(&self) -> KillSwitch {
        self.inner.kill_switch.clone()
    }

    /// Check if outbound traffic may flow
    pub fn check_traffic(&self) -> Result<(), KillSwitchError> {
        self.inner.kill_switch.check()
    }

    // ---------------------------------------------------------------
    // Catalog
    // ---------------------------------------------------------------

    pub fn catalog(&self) -> ServerCatalog {
        self.inner
            .catalog
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in a new catalog; the live tunnel keeps its server snapshot
    pub fn reload_catalog(&self, catalog: ServerCatalog) {
        let count = catalog.len();
        *self.inner.catalog.write().unwrap_or_else(|e| e.into_inner()) = catalog;
        self.note(format!("Server catalog reloaded ({} servers)", count));
    }

    // ---------------------------------------------------------------
    // Logs and observers
    // ---------------------------------------------------------------

    /// Most recent `count` audit lines, oldest first
    pub fn logs(&self, count: usize) -> Vec<String> {
        self.inner.log.tail_lines(count)
    }

    /// Block until the audit log and settings files are written out
    pub fn flush_files(&self) {
        self.inner.log.flush();
        self.inner.settings.flush();
    }

    /// Register a channel observer
    pub fn subscribe(&self) -> Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Register a callback observer on its own delivery thread
    pub fn observe<F>(&self, name: &str, observer: F) -> std::io::Result<std::thread::JoinHandle<()>>
    where
        F: FnMut(&Event) + Send + 'static,
    {
        self.inner.events.observe(name, observer)
    }

    fn note(&self, message: String) {
        info!("{}", message);
        self.inner.log.append(message);
    }

    fn warn(&self, message: String) {
        warn!("{}", message);
        self.inner.log.append(message);
    }

    fn fail(&self, message: String) {
        error!("{}", message);
        self.inner.log.append(format!("Error: {}", message));
        self.inner.events.emit_error(message);
    }
}

/// Run a supervisor call; a panic becomes an ordinary failure so the
/// caller's rollback still runs
async fn contained<F>(call: F) -> Result<(), SupervisorError>
where
    F: Future<Output = Result<(), SupervisorError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let reason = panic_message(&*panic);
            error!("Tunnel supervisor panicked: {}", reason);
            Err(SupervisorError::Other(format!("supervisor panicked: {}", reason)))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

/// Forward unrequested tunnel exits to the engine while it lives
async fn watch_exits(inner: Weak<Inner>, mut exits: mpsc::UnboundedReceiver<TunnelExit>) {
    while let Some(exit) = exits.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        Engine { inner }.handle_tunnel_exit(exit).await;
    }
    debug!("Tunnel exit watcher stopped");
}
