//! Dry-run supervisor
//!
//! Runs no process at all. Every call succeeds after an optional latency
//! unless failures have been scripted. Used when no tunnel binary is
//! available and as the supervisor in tests.

use crate::tunnel::{ExitNotifier, Throughput, TunnelConfig, TunnelSupervisor, SupervisorError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Default)]
struct Script {
    fail_starts: u32,
    fail_terminates: u32,
    notifier: Option<ExitNotifier>,
    last_config: Option<TunnelConfig>,
    throughput: Throughput,
}

/// Process-less tunnel supervisor
#[derive(Default)]
pub struct DryRunSupervisor {
    script: Mutex<Script>,
    latency: Duration,
    starts: AtomicUsize,
    terminates: AtomicUsize,
}

impl DryRunSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency`
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// Fail the next `n` starts
    pub fn fail_next_starts(&self, n: u32) {
        self.lock().fail_starts = n;
    }

    /// Fail the next `n` terminations
    pub fn fail_next_terminates(&self, n: u32) {
        self.lock().fail_terminates = n;
    }

    /// Report the given throughput while a tunnel is up
    pub fn set_throughput(&self, throughput: Throughput) {
        self.lock().throughput = throughput;
    }

    /// Pretend the tunnel process died on its own
    ///
    /// Returns false if no tunnel was up.
    pub fn simulate_exit(&self, code: Option<i32>) -> bool {
        let notifier = self.lock().notifier.take();
        match notifier {
            Some(notifier) => {
                info!("Dry run: simulating tunnel exit");
                notifier.notify(code);
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().notifier.is_some()
    }

    pub fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn terminate_calls(&self) -> usize {
        self.terminates.load(Ordering::SeqCst)
    }

    /// Config of the most recent successful start
    pub fn last_config(&self) -> Option<TunnelConfig> {
        self.lock().last_config.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TunnelSupervisor for DryRunSupervisor {
    async fn start(&self, config: &TunnelConfig, exits: ExitNotifier) -> Result<(), SupervisorError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut script = self.lock();
        if script.fail_starts > 0 {
            script.fail_starts -= 1;
            return Err(SupervisorError::Other("dry run: scripted start failure".into()));
        }

        debug!("Dry run: tunnel to {} up", config.remote);
        script.notifier = Some(exits);
        script.last_config = Some(config.clone());
        Ok(())
    }

    async fn terminate(&self) -> Result<(), SupervisorError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut script = self.lock();
        if script.fail_terminates > 0 {
            script.fail_terminates -= 1;
            return Err(SupervisorError::StopTimeout);
        }

        debug!("Dry run: tunnel down");
        script.notifier = None;
        Ok(())
    }

    fn throughput(&self) -> Throughput {
        let script = self.lock();
        if script.notifier.is_some() {
            script.throughput
        } else {
            Throughput::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServerCatalog;
    use crate::settings::Settings;
    use tokio::sync::mpsc;

    fn config() -> TunnelConfig {
        let catalog = ServerCatalog::defaults();
        TunnelConfig::new(catalog.get("us-la-1").unwrap(), &Settings::default())
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let supervisor = DryRunSupervisor::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        supervisor.fail_next_starts(1);
        assert!(supervisor.start(&config(), ExitNotifier::new(1, tx.clone())).await.is_err());
        assert!(supervisor.start(&config(), ExitNotifier::new(2, tx)).await.is_ok());
        assert_eq!(supervisor.start_calls(), 2);
        assert!(supervisor.is_running());
    }

    #[tokio::test]
    async fn test_simulated_exit_reaches_notifier() {
        let supervisor = DryRunSupervisor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        supervisor.start(&config(), ExitNotifier::new(3, tx)).await.unwrap();
        assert!(supervisor.simulate_exit(Some(137)));

        let exit = rx.recv().await.unwrap();
        assert_eq!(exit.generation, 3);
        assert!(!supervisor.simulate_exit(None));
    }

    #[tokio::test]
    async fn test_throughput_only_while_up() {
        let supervisor = DryRunSupervisor::new();
        supervisor.set_throughput(Throughput {
            upload: 10.0,
            download: 20.0,
        });
        assert_eq!(supervisor.throughput(), Throughput::default());

        let (tx, _rx) = mpsc::unbounded_channel();
        supervisor.start(&config(), ExitNotifier::new(1, tx)).await.unwrap();
        assert_eq!(supervisor.throughput().download, 20.0);
    }
}
