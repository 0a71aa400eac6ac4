//! vpnd core - VPN connection engine
//!
//! Keeps at most one tunnel alive to a server chosen from a catalog,
//! exposes its status, settings and audit log, and fans events out to
//! observers.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Engine                              │
//! │                                                               │
//! │  ┌──────────────┐  ┌──────────┐  ┌──────────┐  ┌───────────┐  │
//! │  │ServerCatalog │  │ Settings │  │ LogStore │  │KillSwitch │  │
//! │  └──────────────┘  └──────────┘  └────┬─────┘  └───────────┘  │
//! │                                       │                       │
//! │  connection state ──────────────▶ EventBus ──▶ observers      │
//! │        │                                                      │
//! └────────│──────────────────────────────────────────────────────┘
//!          ▼ start / terminate
//!   ┌────────────────────┐
//!   │  TunnelSupervisor  │  OpenVPN process, or dry run
//!   └────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single tunnel**: commands that conflict with a pending transition
//!   are rejected, never queued
//! - **Kill Switch**: a protected tunnel that dies blocks traffic until it
//!   is restored or the user disconnects
//! - **Bounded audit log**: newest 1000 entries kept, optional file mirror

mod catalog;
mod config;
mod dry_run;
mod events;
mod file_sink;
mod kill_switch;
mod log_store;
mod manager;
mod process;
mod settings;
mod tunnel;

pub use catalog::{CatalogError, Server, ServerCatalog, ServerOrder};
pub use config::{ConfigError, EngineConfig};
pub use dry_run::DryRunSupervisor;
pub use events::{Event, EventBus};
pub use kill_switch::{KillSwitch, KillSwitchError, KillSwitchState};
pub use log_store::{LogEntry, LogStore, EVICT_BATCH, MAX_LOG};
pub use manager::{ConnectionState, Engine, EngineError, StatusSnapshot};
pub use process::{OpenVpnConfig, OpenVpnSupervisor};
pub use settings::{
    EncryptionLevel, RawSettings, Settings, SettingsError, SettingsStore, TransportProtocol,
};
pub use tunnel::{
    ExitNotifier, SupervisorError, Throughput, TunnelConfig, TunnelExit, TunnelSupervisor,
};
