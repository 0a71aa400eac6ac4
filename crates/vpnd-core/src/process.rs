//! OpenVPN process supervisor
//!
//! Starts `openvpn --config <file>` and treats the tunnel as up once the
//! process prints its initialization-complete marker. After that a monitor
//! task owns the child: it drains the output, serves stop requests, and
//! reports an unrequested exit through the [`ExitNotifier`].

use crate::tunnel::{ExitNotifier, TunnelConfig, TunnelSupervisor, SupervisorError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Printed by OpenVPN once the tunnel is usable
const READY_MARKER: &str = "Initialization Sequence Completed";

/// Timeout for `--version` probing
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type StopReply = oneshot::Sender<Result<(), SupervisorError>>;

/// OpenVPN supervisor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnConfig {
    /// Path to the openvpn binary
    pub binary: PathBuf,
    /// Directory for generated `.ovpn` files
    pub config_dir: PathBuf,
    /// Give up on startup after this many seconds
    pub startup_timeout_secs: u64,
    /// Give up on termination after this many seconds
    pub stop_timeout_secs: u64,
    /// Remote port on the VPN server
    pub port: u16,
}

impl Default for OpenVpnConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("openvpn"),
            config_dir: PathBuf::from("openvpn-configs"),
            startup_timeout_secs: 30,
            stop_timeout_secs: 5,
            port: 1194,
        }
    }
}

struct RunningTunnel {
    stop_tx: mpsc::Sender<StopReply>,
    config_path: PathBuf,
}

/// Supervisor for an external OpenVPN process
pub struct OpenVpnSupervisor {
    config: OpenVpnConfig,
    running: Mutex<Option<RunningTunnel>>,
}

enum Startup {
    Ready,
    Exited(Option<i32>),
}

enum Wake {
    Exited(Option<i32>),
    Stop(Option<StopReply>),
    Output(Option<String>),
}

impl OpenVpnSupervisor {
    pub fn new(config: OpenVpnConfig) -> Self {
        Self {
            config,
            running: Mutex::new(None),
        }
    }

    /// Check that the binary runs; returns its version banner
    pub async fn check_binary(&self) -> Result<String, SupervisorError> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--version");
        let output = tokio::time::timeout(PROBE_TIMEOUT, cmd.output())
            .await
            .map_err(|_| SupervisorError::Other("openvpn --version timed out".into()))?
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        let banner = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string();

        // openvpn --version exits with status 1 on most builds
        if banner.starts_with("OpenVPN") {
            info!("Found {}", banner);
            Ok(banner)
        } else {
            Err(SupervisorError::Other(format!(
                "{} is not an OpenVPN binary",
                self.config.binary.display()
            )))
        }
    }

    async fn write_config(&self, config: &TunnelConfig) -> Result<PathBuf, SupervisorError> {
        tokio::fs::create_dir_all(&self.config.config_dir)
            .await
            .map_err(|e| SupervisorError::Io(e.to_string()))?;

        let path = self.config.config_dir.join(format!("{}.ovpn", config.server_id));
        tokio::fs::write(&path, config.render(self.config.port))
            .await
            .map_err(|e| SupervisorError::Io(e.to_string()))?;

        debug!("Wrote tunnel config {}", path.display());
        Ok(path)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<RunningTunnel>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Read output until the ready marker or process exit
async fn wait_until_ready(child: &mut Child, lines: &mut Lines<BufReader<ChildStdout>>) -> Startup {
    let mut output_open = true;

    loop {
        let step = tokio::select! {
            line = lines.next_line(), if output_open => match line {
                Ok(Some(line)) => {
                    debug!("openvpn: {}", line);
                    line.contains(READY_MARKER).then_some(Startup::Ready)
                }
                // Output closed; the exit status follows
                _ => {
                    output_open = false;
                    None
                }
            },
            status = child.wait() => Some(Startup::Exited(status.ok().and_then(|s| s.code()))),
        };

        if let Some(step) = step {
            return step;
        }
    }
}

/// Kill the child and wait for it to go away
async fn stop_child(child: &mut Child, timeout: Duration) -> Result<(), SupervisorError> {
    if let Err(e) = child.start_kill() {
        // Already reaped
        if child.try_wait().ok().flatten().is_some() {
            return Ok(());
        }
        return Err(SupervisorError::Io(e.to_string()));
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => {
            debug!("openvpn stopped ({})", status);
            Ok(())
        }
        Ok(Err(e)) => Err(SupervisorError::Io(e.to_string())),
        Err(_) => Err(SupervisorError::StopTimeout),
    }
}

/// Own the child until it exits or is stopped
async fn monitor(
    mut child: Child,
    mut lines: Lines<BufReader<ChildStdout>>,
    mut stop_rx: mpsc::Receiver<StopReply>,
    exits: ExitNotifier,
    stop_timeout: Duration,
) {
    let mut output_open = true;

    loop {
        let wake = tokio::select! {
            status = child.wait() => Wake::Exited(status.ok().and_then(|s| s.code())),
            reply = stop_rx.recv() => Wake::Stop(reply),
            line = lines.next_line(), if output_open => Wake::Output(line.ok().flatten()),
        };

        match wake {
            Wake::Exited(code) => {
                warn!("openvpn exited unexpectedly (code {:?})", code);
                exits.notify(code);
                return;
            }
            Wake::Stop(Some(reply)) => {
                let result = stop_child(&mut child, stop_timeout).await;
                let stopped = result.is_ok();
                let _ = reply.send(result);
                if stopped {
                    return;
                }
            }
            Wake::Stop(None) => {
                // Supervisor dropped; kill_on_drop takes care of the child
                return;
            }
            Wake::Output(Some(line)) => debug!("openvpn: {}", line),
            Wake::Output(None) => output_open = false,
        }
    }
}

#[async_trait]
impl TunnelSupervisor for OpenVpnSupervisor {
    async fn start(&self, config: &TunnelConfig, exits: ExitNotifier) -> Result<(), SupervisorError> {
        let config_path = self.write_config(config).await?;

        let mut child = Command::new(&self.config.binary)
            .arg("--config")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn(e.to_string()))?;

        info!(
            "Started openvpn (pid {:?}) for {}",
            child.id(),
            config.server_id
        );

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Spawn("stdout not captured".into()))?;
        let mut lines = BufReader::new(stdout).lines();

        let timeout = Duration::from_secs(self.config.startup_timeout_secs);
        let startup = tokio::time::timeout(timeout, wait_until_ready(&mut child, &mut lines)).await;
        match startup {
            Ok(Startup::Ready) => {}
            Ok(Startup::Exited(code)) => {
                error!("openvpn exited during startup (code {:?})", code);
                return Err(SupervisorError::ExitedDuringStartup(code));
            }
            Err(_) => {
                error!("openvpn startup timed out after {:?}", timeout);
                let _ = child.kill().await;
                return Err(SupervisorError::StartupTimeout);
            }
        }

        let (stop_tx, stop_rx) = mpsc::channel(1);
        let stop_timeout = Duration::from_secs(self.config.stop_timeout_secs);
        tokio::spawn(monitor(child, lines, stop_rx, exits, stop_timeout));

        *self.lock() = Some(RunningTunnel {
            stop_tx,
            config_path,
        });
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SupervisorError> {
        let stop_tx = self
            .lock()
            .as_ref()
            .map(|r| r.stop_tx.clone())
            .ok_or(SupervisorError::NotRunning)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let result = if stop_tx.send(reply_tx).await.is_err() {
            debug!("openvpn monitor already finished");
            Ok(())
        } else {
            reply_rx.await.unwrap_or(Ok(()))
        };

        if result.is_ok() {
            let running = self.lock().take();
            if let Some(running) = running {
                let _ = tokio::fs::remove_file(&running.config_path).await;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerCatalog;
    use crate::settings::Settings;

    fn tunnel_config() -> TunnelConfig {
        let catalog = ServerCatalog::defaults();
        TunnelConfig::new(catalog.get("uk-london-1").unwrap(), &Settings::default())
    }

    fn supervisor(binary: &str, dir: &std::path::Path) -> OpenVpnSupervisor {
        OpenVpnSupervisor::new(OpenVpnConfig {
            binary: PathBuf::from(binary),
            config_dir: dir.to_path_buf(),
            startup_timeout_secs: 2,
            stop_timeout_secs: 2,
            ..OpenVpnConfig::default()
        })
    }

    #[tokio::test]
    async fn test_missing_binary_fails_to_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("/nonexistent/openvpn", dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = supervisor.start(&tunnel_config(), ExitNotifier::new(1, tx)).await;
        assert!(matches!(result, Err(SupervisorError::Spawn(_))));
        assert!(dir.path().join("uk-london-1.ovpn").exists());
    }

    #[tokio::test]
    async fn test_terminate_without_tunnel() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("openvpn", dir.path());

        assert_eq!(supervisor.terminate().await, Err(SupervisorError::NotRunning));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_exiting_during_startup() {
        let dir = tempfile::tempdir().unwrap();
        // `false --config x` exits immediately with status 1
        let supervisor = supervisor("false", dir.path());
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = supervisor.start(&tunnel_config(), ExitNotifier::new(1, tx)).await;
        assert!(matches!(result, Err(SupervisorError::ExitedDuringStartup(_))));
    }

    #[tokio::test]
    async fn test_check_missing_binary() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = supervisor("/nonexistent/openvpn", dir.path());

        assert!(supervisor.check_binary().await.is_err());
    }
}
