//! Process supervision.
//!
//! Provides:
//! - `Supervisor`: enroll once, then run the child with restarts until a
//!   termination signal
//! - `run_captured`: child runs with stderr kept in crash files
//! - `ProcessRegistry` / `ProcessRunner`: killable named subprocesses
//! - `CancelBus` / `InboxBus`: external cancel requests
//!
//! Epistemic foundation:
//! - K_i: The supervisor outlives any number of child crashes
//! - K_i: Shutdown cancels the child and waits for the loop to finish
//! - I^B: Why a child crashed is unknowable in-process → its stderr is kept

mod backoff;
mod cancel;
mod child;
mod crash;
mod process;

pub use backoff::*;
pub use cancel::*;
pub use child::*;
pub use crash::*;
pub use process::*;

use crate::models::{ExportError, Locations, Result, SupervisorConfig};
use std::ffi::OsString;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// One-shot enrollment before the supervised loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnrollOptions {
    pub code: String,
    pub skip_validate: bool,
}

/// Keeps the service child alive.
pub struct Supervisor {
    program: PathBuf,
    root: PathBuf,
    crash_dir: PathBuf,
    backoff: ExpBackoff,
    enroll: Option<EnrollOptions>,
    child_args: Vec<OsString>,
}

impl Supervisor {
    /// Supervise `<program> run-no-restarts --root <root>`.
    pub fn new(
        program: &Path,
        locations: &Locations,
        config: &SupervisorConfig,
        enroll: Option<EnrollOptions>,
    ) -> Self {
        Self {
            program: program.to_path_buf(),
            root: locations.root.clone(),
            crash_dir: locations.crash_dir.clone(),
            backoff: ExpBackoff::from_config(config),
            enroll,
            child_args: vec![
                "run-no-restarts".into(),
                "--root".into(),
                locations.root.clone().into_os_string(),
            ],
        }
    }

    /// Replace the child command line (program stays the same).
    pub fn with_child_args(mut self, args: Vec<OsString>) -> Self {
        self.child_args = args;
        self
    }

    pub fn with_backoff(mut self, backoff: ExpBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Block until SIGINT/SIGTERM, then stop the child and return.
    pub async fn run(&self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = shutdown_signal().await {
                warn!(error = %e, "Signal handling unavailable, stopping");
            }
        })
        .await
    }

    /// Like [`run`](Self::run) with an arbitrary shutdown trigger.
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        if let Some(enroll) = &self.enroll {
            self.run_enroll(enroll).await?;
        }
        info!("Starting service-run with restarts");

        let cancel = CancellationToken::new();
        let work = retrying(&self.backoff, &cancel, |token| self.run_child(token));
        tokio::pin!(work);
        tokio::pin!(shutdown);

        tokio::select! {
            restarts = &mut work => {
                info!(restarts, "Service loop finished, waiting for termination signal");
                shutdown.await;
                info!("Exited");
                return Ok(());
            }
            _ = &mut shutdown => {}
        }

        info!("Signal received, exiting");
        cancel.cancel();
        let restarts = work.await;
        info!(restarts, "Exited");
        Ok(())
    }

    async fn run_enroll(&self, enroll: &EnrollOptions) -> Result<()> {
        info!("Running enrollment");
        let mut cmd = Command::new(&self.program);
        cmd.arg("enroll-no-service-run")
            .arg(&enroll.code)
            .arg("--root")
            .arg(&self.root);
        if enroll.skip_validate {
            cmd.arg("--skip-validate");
        }
        let status = cmd
            .stdin(Stdio::null())
            .status()
            .await
            .map_err(|e| ExportError::io("spawning enrollment", e))?;
        if !status.success() {
            return Err(ExportError::ChildExited(format!("enroll-no-service-run: {status}")));
        }
        Ok(())
    }

    async fn run_child(&self, cancel: CancellationToken) -> Result<()> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.child_args);

        let run = run_captured(cmd, &self.crash_dir, &cancel).await?;
        if let Some(path) = &run.crash_file {
            warn!(path = %path.display(), "Child wrote to stderr, crash output kept");
        }
        if run.status.success() {
            Ok(())
        } else {
            Err(ExportError::ChildExited(run.status.to_string()))
        }
    }
}

/// Resolve on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut terminate = signal(SignalKind::terminate())
            .map_err(|e| ExportError::io("installing SIGTERM handler", e))?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res.map_err(|e| ExportError::io("waiting for ctrl-c", e))?,
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| ExportError::io("waiting for ctrl-c", e))?;
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn supervisor(dir: &TempDir, script: &str) -> Supervisor {
        let locations = Locations::new(dir.path());
        Supervisor::new(
            Path::new("sh"),
            &locations,
            &SupervisorConfig::default(),
            None,
        )
        .with_child_args(vec!["-c".into(), script.into()])
        .with_backoff(ExpBackoff::new(Duration::ZERO, Duration::ZERO, 2.0))
    }

    #[tokio::test]
    async fn test_crashing_child_restarts_and_leaves_crash_files() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "echo crashed >&2; exit 1");

        sup.run_until(tokio::time::sleep(Duration::from_millis(300)))
            .await
            .unwrap();

        let crash_dir = Locations::new(dir.path()).crash_dir;
        let files = std::fs::read_dir(crash_dir).unwrap().count();
        assert!(files >= 2, "expected restarts to leave crash files, got {files}");
    }

    #[tokio::test]
    async fn test_shutdown_kills_long_running_child() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "exec sleep 30");

        tokio::time::timeout(
            Duration::from_secs(10),
            sup.run_until(tokio::time::sleep(Duration::from_millis(100))),
        )
        .await
        .expect("supervisor did not stop")
        .unwrap();

        let crash_dir = Locations::new(dir.path()).crash_dir;
        assert_eq!(std::fs::read_dir(crash_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_clean_exit_waits_for_shutdown() {
        let dir = TempDir::new().unwrap();
        let sup = supervisor(&dir, "exit 0");
        let started = std::time::Instant::now();

        sup.run_until(tokio::time::sleep(Duration::from_millis(100)))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
