//! The supervised child: scheduled exports plus the cancel listener.

use crate::models::Result;
use crate::supervisor::{CancelBus, CancelCommand, ProcessRunner, listen};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs `validate-config` then `export` subprocesses on a fixed interval and
/// serves cancel requests against them.
pub struct ServiceChild {
    runner: ProcessRunner,
    bus: Arc<dyn CancelBus>,
    export_interval: Duration,
    poll_interval: Duration,
}

impl ServiceChild {
    pub fn new(
        runner: ProcessRunner,
        bus: Arc<dyn CancelBus>,
        export_interval: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            runner,
            bus,
            export_interval,
            poll_interval,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let listener = listen(
            Arc::clone(&self.bus),
            Arc::clone(self.runner.registry()),
            cancel.clone(),
            self.poll_interval,
        );
        let exports = self.schedule_exports(&cancel);

        tokio::try_join!(listener, exports)?;
        info!("Service child stopped");
        Ok(())
    }

    async fn schedule_exports(&self, cancel: &CancellationToken) -> Result<()> {
        let mut runs = 0u64;
        loop {
            runs += 1;
            if self.run_step(CancelCommand::Integration, runs, cancel).await {
                self.run_step(CancelCommand::Export, runs, cancel).await;
            } else {
                warn!(run = runs, "Validation did not pass, skipping export");
            }

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.export_interval) => {}
            }
        }
    }

    /// Run one registered subcommand. Returns whether it succeeded.
    async fn run_step(&self, step: CancelCommand, run: u64, cancel: &CancellationToken) -> bool {
        let name = step.process_name();
        info!(run, command = name, "Starting scheduled step");
        let command = self.runner.subcommand(name, &[]);
        match self.runner.run(name, command, cancel).await {
            Ok(()) => {
                info!(run, command = name, "Scheduled step finished");
                true
            }
            Err(e) if e.is_cancelled() => {
                info!(run, command = name, "Scheduled step cancelled");
                false
            }
            Err(e) => {
                error!(run, command = name, error = %e, "Scheduled step failed");
                false
            }
        }
    }
}
