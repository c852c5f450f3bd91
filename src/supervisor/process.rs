//! Named subprocesses that can be killed on request.
//!
//! K_i: Every in-flight subprocess is registered under its command name
//! until it exits; `kill(name)` reaches all of them.

use crate::models::{ExportError, Result};
use dashmap::DashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

struct Running {
    name: String,
    cancel: CancellationToken,
}

/// In-flight subprocesses by command name.
#[derive(Default)]
pub struct ProcessRegistry {
    next_id: AtomicU64,
    running: DashMap<u64, Running>,
}

/// Removes its entry from the registry when dropped.
pub struct Registration {
    registry: Arc<ProcessRegistry>,
    id: u64,
    cancel: CancellationToken,
}

impl Registration {
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.running.remove(&self.id);
    }
}

impl ProcessRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a subprocess; its token is a child of `parent`.
    pub fn register(self: &Arc<Self>, name: &str, parent: &CancellationToken) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = parent.child_token();
        self.running.insert(
            id,
            Running {
                name: name.to_string(),
                cancel: cancel.clone(),
            },
        );
        Registration {
            registry: Arc::clone(self),
            id,
            cancel,
        }
    }

    /// Cancel every subprocess registered under `name`.
    pub fn kill(&self, name: &str) -> Result<usize> {
        let mut killed = 0;
        for entry in self.running.iter().filter(|e| e.name == name) {
            entry.cancel.cancel();
            killed += 1;
        }
        if killed == 0 {
            return Err(ExportError::NotRunning(name.to_string()));
        }
        info!(command = name, killed, "Killed running command");
        Ok(killed)
    }

    /// Names of the registered subprocesses.
    pub fn running(&self) -> Vec<String> {
        self.running.iter().map(|e| e.name.clone()).collect()
    }
}

/// Spawns this binary's subcommands as registered subprocesses.
pub struct ProcessRunner {
    program: PathBuf,
    root: PathBuf,
    registry: Arc<ProcessRegistry>,
}

impl ProcessRunner {
    pub fn new(program: &Path, root: &Path, registry: Arc<ProcessRegistry>) -> Self {
        Self {
            program: program.to_path_buf(),
            root: root.to_path_buf(),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    /// `<program> <subcommand> [args..] --root <root>`
    pub fn subcommand(&self, subcommand: &str, args: &[OsString]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.arg(subcommand).args(args).arg("--root").arg(&self.root);
        cmd
    }

    /// Run `command` registered as `name` until it exits, `parent` is
    /// cancelled, or `kill(name)` is called.
    pub async fn run(&self, name: &str, mut command: Command, parent: &CancellationToken) -> Result<()> {
        let registration = self.registry.register(name, parent);
        command.kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| ExportError::io(format!("spawning {name}"), e))?;

        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(|e| ExportError::io(format!("waiting for {name}"), e))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(ExportError::ChildExited(format!("{name}: {status}")))
                }
            }
            _ = registration.token().cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!(command = name, error = %e, "Failed to kill subprocess");
                }
                Err(ExportError::Cancelled)
            }
        }
    }
}
