//! Child runs with stderr captured to crash files.
//!
//! Epistemic foundation:
//! - K_i: A crash file exists only if the child wrote to stderr
//! - K_i: Crash files are named by the UTC start time, nanosecond precision
//! - K_i: Cancelling a run stops the child's whole process group
//! - I^B: The child may die at any point → whatever it wrote is kept

use crate::models::{ExportError, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one captured child run.
#[derive(Debug)]
pub struct CapturedRun {
    pub status: ExitStatus,
    /// Kept only when the child wrote to stderr
    pub crash_file: Option<PathBuf>,
    /// True if the run was cut short by the token
    pub killed: bool,
}

/// Crash file name for a run started at `at`, e.g. `2024-01-02T03-04-05-123456789Z`.
pub fn crash_file_name(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
        .replace([':', '.'], "-")
}

/// Grace period between SIGTERM and SIGKILL on cancel.
const TERM_GRACE: Duration = Duration::from_secs(10);

/// How long stderr may stay open after the child exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Run `command`, mirroring its stderr to ours and to a crash file in
/// `crash_dir`. Cancelling `cancel` terminates the child's whole process
/// group, so subprocesses it started go down with it.
pub async fn run_captured(
    mut command: Command,
    crash_dir: &Path,
    cancel: &CancellationToken,
) -> Result<CapturedRun> {
    fs::create_dir_all(crash_dir)
        .await
        .map_err(|e| ExportError::io("could not create dir for err output", e))?;

    command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);
    let mut child = command
        .spawn()
        .map_err(|e| ExportError::io("spawning child process", e))?;

    let path = crash_dir.join(crash_file_name(Utc::now()));
    let file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            let _ = terminate(&mut child).await;
            return Err(ExportError::io("could not create file for err output", e));
        }
    };
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ExportError::Internal("child stderr not captured".into()))?;
    let mut copier = tokio::spawn(tee_stderr(stderr, file));

    let (status, killed) = tokio::select! {
        status = child.wait() => (status, false),
        _ = cancel.cancelled() => {
            debug!("Terminating child process group");
            (terminate(&mut child).await, true)
        }
    };
    let status = status.map_err(|e| ExportError::io("waiting for child process", e))?;

    // Orphaned descendants may still hold the pipe open.
    match tokio::time::timeout(DRAIN_GRACE, &mut copier).await {
        Ok(joined) => {
            let file = joined
                .map_err(|e| ExportError::Internal(format!("stderr copier panicked: {e}")))?
                .map_err(|e| ExportError::io("could not write err output", e))?;
            file.sync_all()
                .await
                .map_err(|e| ExportError::io("could not sync file for err output", e))?;
        }
        Err(_) => {
            warn!("Child stderr still open after exit, abandoning capture");
            copier.abort();
        }
    }

    let size = fs::metadata(&path)
        .await
        .map_err(|e| ExportError::io("could not check size of file for err output", e))?
        .len();
    let crash_file = if size == 0 {
        fs::remove_file(&path)
            .await
            .map_err(|e| ExportError::io("could not remove empty file for err output", e))?;
        None
    } else {
        Some(path)
    };

    Ok(CapturedRun {
        status,
        crash_file,
        killed,
    })
}

/// SIGTERM the child's process group, SIGKILL it after [`TERM_GRACE`].
async fn terminate(child: &mut Child) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        let group = Pid::from_raw(pid as i32);
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            warn!(error = %e, "Failed to signal child process group");
        }
        if let Ok(status) = tokio::time::timeout(TERM_GRACE, child.wait()).await {
            // Descendants that ignored SIGTERM do not outlive the child.
            let _ = killpg(group, Signal::SIGKILL);
            return status;
        }
        warn!("Child ignored SIGTERM, killing process group");
        let _ = killpg(group, Signal::SIGKILL);
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill child process");
    }
    child.wait().await
}

async fn tee_stderr<R: AsyncRead + Unpin>(mut from: R, mut file: File) -> std::io::Result<File> {
    let mut mirror = tokio::io::stderr();
    let mut buf = vec![0u8; 8 * 1024];
    loop {
        let n = from.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n]).await?;
        // Mirroring is best effort, the file is what must not lose bytes.
        let _ = mirror.write_all(&buf[..n]).await;
    }
    file.flush().await?;
    let _ = mirror.flush().await;
    Ok(file)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn files_in(dir: &Path) -> Vec<PathBuf> {
        std::fs::read_dir(dir)
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_crash_file_name_is_sanitized() {
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        assert_eq!(crash_file_name(at), "2024-01-02T03-04-05-123456789Z");
    }

    #[tokio::test]
    async fn test_silent_child_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let run = run_captured(sh("exit 0"), dir.path(), &CancellationToken::new())
            .await
            .unwrap();

        assert!(run.status.success());
        assert!(run.crash_file.is_none());
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_stderr_output_is_kept_exactly() {
        let dir = TempDir::new().unwrap();
        let run = run_captured(
            sh("printf 'panic: boom' >&2; exit 3"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(!run.status.success());
        let files = files_in(dir.path());
        assert_eq!(files.len(), 1);
        assert_eq!(run.crash_file.as_deref(), Some(files[0].as_path()));
        assert_eq!(std::fs::metadata(&files[0]).unwrap().len(), "panic: boom".len() as u64);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let run = run_captured(sh("exec sleep 30"), dir.path(), &cancel)
            .await
            .unwrap();
        assert!(run.killed);
        assert!(!run.status.success());
    }

    #[tokio::test]
    async fn test_cancel_stops_background_grandchild() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let run = run_captured(sh("sleep 20 & exec sleep 30"), dir.path(), &cancel)
            .await
            .unwrap();

        assert!(run.killed);
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert!(files_in(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let err = run_captured(
            Command::new("/nonexistent/exportkit"),
            dir.path(),
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ExportError::Io { .. }));
        assert!(files_in(dir.path()).is_empty());
    }
}
