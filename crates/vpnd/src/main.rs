//! vpnd: VPN connection daemon
//!
//! Loads the daemon config, builds the engine with the OpenVPN (or dry-run)
//! supervisor, and serves line-delimited JSON commands on stdin/stdout.
//! Diagnostics go to stderr. On Unix, SIGHUP reloads the server catalog.

mod config;
mod transport;

use anyhow::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vpnd_core::{ConnectionState, DryRunSupervisor, Engine, OpenVpnSupervisor, TunnelSupervisor};
use vpnd_ipc::{event_frame, Dispatcher};

use crate::config::DaemonConfig;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::load()?;

    // stdout carries the protocol
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();

    info!("vpnd starting...");

    let supervisor: Arc<dyn TunnelSupervisor> = if config.dry_run {
        warn!("Dry run: no tunnel process will be started");
        Arc::new(DryRunSupervisor::new())
    } else {
        let supervisor = OpenVpnSupervisor::new(config.openvpn.clone());
        if let Err(e) = supervisor.check_binary().await {
            warn!("OpenVPN unavailable, connects will fail: {}", e);
        }
        Arc::new(supervisor)
    };

    let engine = Engine::new(config.engine.clone(), config.catalog()?, supervisor)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    engine.observe("ipc", move |event| {
        let _ = events_tx.send(event_frame(event));
    })?;

    tokio::spawn({
        let engine = engine.clone();
        let preferred = config.auto_connect_server.clone();
        async move {
            match engine.auto_connect(preferred.as_deref()).await {
                Ok(Some(status)) => info!("Auto-connected to {}", status.ip_address),
                Ok(None) => {}
                Err(e) => warn!("Auto-connect failed: {}", e),
            }
        }
    });

    #[cfg(unix)]
    reload_on_hangup(engine.clone(), config.clone())?;

    let dispatcher = Dispatcher::new(engine.clone());
    transport::serve(
        dispatcher,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        events_rx,
    )
    .await?;

    shutdown(&engine).await;

    info!("vpnd shutting down");
    Ok(())
}

/// Re-read the servers file on every SIGHUP
#[cfg(unix)]
fn reload_on_hangup(engine: Engine, config: DaemonConfig) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangups = signal(SignalKind::hangup())?;
    tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            info!("SIGHUP received, reloading server catalog");
            match config.catalog() {
                Ok(catalog) => engine.reload_catalog(catalog),
                Err(e) => warn!("Catalog reload failed, keeping current servers: {:#}", e),
            }
        }
    });
    Ok(())
}

/// Take down whatever tunnel is left before exit
async fn shutdown(engine: &Engine) {
    match engine.state().await {
        ConnectionState::Idle => {}
        ConnectionState::Connected | ConnectionState::StuckDisconnecting | ConnectionState::Blocked => {
            info!("Closing tunnel before exit");
            if let Err(e) = engine.disconnect().await {
                warn!("Tunnel shutdown failed, the process is killed on exit: {}", e);
            }
        }
        // Only reachable if a request task outlived the transport
        state => warn!("Exiting while {}, the tunnel process is killed on exit", state),
    }

    let engine = engine.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || engine.flush_files()).await {
        warn!("Flushing log and settings files failed: {}", e);
    }
}
