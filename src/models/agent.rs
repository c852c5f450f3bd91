//! Agent identity persisted by enrollment.
//!
//! B_i: The identity file exists only after a successful enrollment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use super::{ExportError, Result};
use crate::state::write_json_atomic;

/// Who this agent is to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Stable device id, scopes the cancel topic
    pub device_id: String,

    /// Enrollment code the identity was created from
    pub enroll_code: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,

    /// Release channel
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    pub enrolled_at: DateTime<Utc>,
}

impl AgentIdentity {
    /// Create a fresh identity with a random device id.
    pub fn enroll(code: &str) -> Self {
        Self {
            device_id: uuid::Uuid::new_v4().to_string(),
            enroll_code: code.to_string(),
            customer_id: None,
            channel: None,
            enrolled_at: Utc::now(),
        }
    }

    /// Load the identity, `None` if the agent was never enrolled.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                ExportError::Parse(format!("invalid agent file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExportError::io(format!("reading {}", path.display()), e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    /// Message-bus group this agent listens on.
    pub fn group_id(&self) -> String {
        format!("agent-{}", self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.json");

        assert!(AgentIdentity::load(&path).unwrap().is_none());

        let agent = AgentIdentity::enroll("CODE-1");
        agent.save(&path).unwrap();

        let loaded = AgentIdentity::load(&path).unwrap().unwrap();
        assert_eq!(loaded, agent);
        assert_eq!(loaded.group_id(), format!("agent-{}", agent.device_id));
    }
}
