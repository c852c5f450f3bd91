//! External cancellation requests.
//!
//! Epistemic foundation:
//! - K_i: Requests name a command kind; three kinds map to subprocess names
//! - K_i: Every request gets exactly one response
//! - B_i: The named subprocess may not be running → error in the response

use crate::models::{ExportError, Result};
use crate::state::write_json_atomic;
use crate::supervisor::ProcessRegistry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Command kinds a cancel request may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCommand {
    Export,
    Onboard,
    Integration,
}

impl CancelCommand {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EXPORT" => Some(Self::Export),
            "ONBOARD" => Some(Self::Onboard),
            "INTEGRATION" => Some(Self::Integration),
            _ => None,
        }
    }

    /// Name the subprocess runs under.
    ///
    /// Nothing runs as `export-onboard-data` yet, so `ONBOARD` always answers
    /// with a "no running process" error.
    pub fn process_name(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::Onboard => "export-onboard-data",
            Self::Integration => "validate-config",
        }
    }
}

/// Inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Outbound response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
    pub cancel_date: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Kill the subprocess a request names and build the response.
///
/// `success` acknowledges that the request was processed; a request that
/// could not be acted on still succeeds and carries the reason in `error`.
pub fn handle_cancel(registry: &ProcessRegistry, request: &CancelRequest) -> CancelResponse {
    let outcome = match CancelCommand::parse(&request.command) {
        None => Err(format!("wrong command {}", request.command)),
        Some(command) => registry
            .kill(command.process_name())
            .map(|_| ())
            .map_err(|e| e.to_string()),
    };

    if let Err(e) = &outcome {
        error!(command = %request.command, error = %e, "Error in cancel request");
    }

    CancelResponse {
        success: true,
        cancel_date: Utc::now(),
        error: outcome.err(),
        request_id: request.request_id.clone(),
    }
}

/// Topic the agent receives cancel requests on and answers to.
#[async_trait]
pub trait CancelBus: Send + Sync {
    /// Take every pending request.
    async fn poll(&self) -> Result<Vec<CancelRequest>>;

    async fn respond(&self, response: &CancelResponse) -> Result<()>;
}

/// Directory-backed bus: `<root>/<group>/requests/*.json` in,
/// `<root>/<group>/responses/*.json` out.
pub struct InboxBus {
    requests: PathBuf,
    responses: PathBuf,
}

impl InboxBus {
    pub fn open(root: &Path, group: &str) -> Result<Self> {
        let base = root.join(group);
        let requests = base.join("requests");
        let responses = base.join("responses");
        for dir in [&requests, &responses] {
            fs::create_dir_all(dir)
                .map_err(|e| ExportError::io(format!("creating {}", dir.display()), e))?;
        }
        info!(group, "Listening for cancel requests");
        Ok(Self {
            requests,
            responses,
        })
    }

    pub fn requests_dir(&self) -> &Path {
        &self.requests
    }

    pub fn responses_dir(&self) -> &Path {
        &self.responses
    }
}

#[async_trait]
impl CancelBus for InboxBus {
    async fn poll(&self) -> Result<Vec<CancelRequest>> {
        let entries = fs::read_dir(&self.requests)
            .map_err(|e| ExportError::io(format!("listing {}", self.requests.display()), e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
            .collect();
        paths.sort();

        let mut requests = Vec::with_capacity(paths.len());
        for path in paths {
            let parsed = fs::read(&path)
                .map_err(|e| ExportError::io(format!("reading {}", path.display()), e))
                .and_then(|bytes| serde_json::from_slice::<CancelRequest>(&bytes).map_err(Into::into));
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "Could not remove consumed request");
            }
            match parsed {
                Ok(mut request) => {
                    if request.request_id.is_none() {
                        request.request_id = path
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned());
                    }
                    requests.push(request);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Dropping malformed cancel request"),
            }
        }
        Ok(requests)
    }

    async fn respond(&self, response: &CancelResponse) -> Result<()> {
        let name = response
            .request_id
            .clone()
            .unwrap_or_else(|| response.cancel_date.timestamp_nanos_opt().unwrap_or_default().to_string());
        write_json_atomic(&self.responses.join(format!("{name}.json")), response)
    }
}

/// Serve cancel requests until `cancel` fires.
pub async fn listen(
    bus: Arc<dyn CancelBus>,
    registry: Arc<ProcessRegistry>,
    cancel: CancellationToken,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let requests = match bus.poll().await {
            Ok(requests) => requests,
            Err(e) => {
                warn!(error = %e, "Polling cancel requests failed");
                continue;
            }
        };
        for request in requests {
            debug!(command = %request.command, "Cancel request received");
            let response = handle_cancel(&registry, &request);
            bus.respond(&response).await?;
        }
    }
    debug!("Cancel listener stopped");
    Ok(())
}
