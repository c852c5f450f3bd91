//! Filesystem layout under the service root.

use std::path::{Path, PathBuf};

/// Every path the service reads or writes, derived from `--root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locations {
    pub root: PathBuf,
    /// TOML configuration
    pub config_file: PathBuf,
    /// Agent identity written by enrollment
    pub agent_file: PathBuf,
    /// Dedup snapshot
    pub dedup_file: PathBuf,
    /// One checkpoint file per collection
    pub checkpoints_dir: PathBuf,
    /// JSON-lines output of the file sink
    pub output_dir: PathBuf,
    /// Captured stderr of crashed child runs
    pub crash_dir: PathBuf,
    /// Directory-backed message bus
    pub bus_dir: PathBuf,
}

impl Locations {
    pub fn new(root: &Path) -> Self {
        let state = root.join("state");
        Self {
            root: root.to_path_buf(),
            config_file: root.join("config.toml"),
            agent_file: root.join("agent.json"),
            dedup_file: state.join("dedup.json"),
            checkpoints_dir: state.join("checkpoints"),
            output_dir: root.join("output"),
            crash_dir: root.join("logs").join("service-run-crashes"),
            bus_dir: root.join("bus"),
        }
    }
}
