//! Bridges a local workload to a tunnel's lifetime.
//!
//! The spawned process is expected to consume a forwarded local port; when
//! it exits, for any reason, the owning session is closed and evicted from
//! the registry along with any other keys the caller designates. The
//! process's lifetime is the tunnel's lifetime.

use std::process::ExitStatus;
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::SessionRegistry;

/// Teardown targets for a bridged process.
#[derive(Debug, Clone, Default)]
pub struct BridgeOptions {
    /// Registry key of the session that owns the forwarded port.
    pub session_key: String,
    /// Additional registry keys to evict on exit.
    pub evict_keys: Vec<String>,
}

/// How the bridged process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

impl From<&ExitStatus> for ExitOutcome {
    fn from(status: &ExitStatus) -> Self {
        Self {
            success: status.success(),
            code: status.code(),
        }
    }
}

/// Handle on a spawned, monitored process.
pub struct ProcessHandle {
    pub pid: Option<u32>,
    exited: watch::Receiver<Option<ExitOutcome>>,
}

impl ProcessHandle {
    /// Wait for the process to exit. Clean exits return the outcome;
    /// abnormal termination returns [`Error::ProcessExit`]. The cascading
    /// session teardown has already run by the time this resolves.
    pub async fn wait(&mut self) -> Result<ExitOutcome> {
        let outcome = *self
            .exited
            .wait_for(|outcome| outcome.is_some())
            .await
            .map_err(|_| Error::Other("process monitor ended unexpectedly".to_string()))?;
        let outcome = outcome.expect("guarded by wait_for");
        if outcome.success {
            Ok(outcome)
        } else {
            Err(Error::ProcessExit { code: outcome.code })
        }
    }
}

/// Spawns local workloads whose exit cascades into session teardown.
pub struct ProcessBridge {
    registry: Arc<SessionRegistry>,
}

impl ProcessBridge {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Spawn `command` and monitor it. On exit — any code or signal — the
    /// owning session and every designated key are closed and removed from
    /// the registry. Exit handling runs exactly once: `wait` is the single
    /// path through which both exit and spawn-time I/O failures surface.
    pub fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: BridgeOptions,
    ) -> Result<ProcessHandle> {
        let mut child = Command::new(command)
            .args(args)
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id();
        info!(command, pid, "bridged process started");

        let (exit_tx, exit_rx) = watch::channel(None);
        let registry = self.registry.clone();
        let command = command.to_string();
        tokio::spawn(async move {
            let outcome = match child.wait().await {
                Ok(status) => {
                    let outcome = ExitOutcome::from(&status);
                    if outcome.success {
                        info!(command = %command, "bridged process exited cleanly");
                    } else {
                        warn!(command = %command, code = ?outcome.code, "bridged process exited abnormally");
                    }
                    outcome
                }
                Err(err) => {
                    warn!(command = %command, error = %err, "failed to observe bridged process exit");
                    ExitOutcome {
                        success: false,
                        code: None,
                    }
                }
            };

            let mut keys = vec![options.session_key];
            keys.extend(options.evict_keys);
            registry.close_all(Some(&keys)).await;

            let _ = exit_tx.send(Some(outcome));
        });

        Ok(ProcessHandle {
            pid,
            exited: exit_rx,
        })
    }
}
