//! Per-collection watermarks for incremental exports.
//!
//! Epistemic foundation:
//! - K_i: A watermark never regresses across successful runs
//! - K_i: State is persisted to disk atomically (write-then-rename)
//! - B_i: Checkpoint file may not exist → Option
//! - I^B: Crash during write → backup file provides recovery

use crate::models::{ExportError, Result};
use crate::state::atomic::write_json_atomic;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// How far a collection has been exported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Watermark {
    /// Everything updated before this instant has been sent
    LastProcessed(DateTime<Utc>),
    /// Everything before this offset has been sent
    LastOffset(u64),
}

impl Watermark {
    /// True if `self` is strictly ahead of `other`.
    ///
    /// Watermarks of different kinds are incomparable.
    pub fn is_ahead_of(&self, other: &Watermark) -> Result<bool> {
        match (self, other) {
            (Self::LastProcessed(a), Self::LastProcessed(b)) => Ok(a > b),
            (Self::LastOffset(a), Self::LastOffset(b)) => Ok(a > b),
            _ => Err(ExportError::Internal(format!(
                "cannot compare watermark {self:?} with {other:?}"
            ))),
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::LastProcessed(ts) => Some(*ts),
            Self::LastOffset(_) => None,
        }
    }

    pub fn as_offset(&self) -> Option<u64> {
        match self {
            Self::LastOffset(offset) => Some(*offset),
            Self::LastProcessed(_) => None,
        }
    }
}

/// On-disk checkpoint of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionCheckpoint {
    /// Collection (model) name
    pub collection: String,
    /// Current watermark
    pub watermark: Watermark,
    /// Last update time
    pub updated_at: DateTime<Utc>,
}

/// Loads and advances checkpoints, one JSON file per collection.
pub struct CheckpointStore {
    /// Directory for checkpoint files
    dir: PathBuf,
    /// Serializes read-compare-write on advance
    write_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Create a checkpoint store rooted at `dir`.
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ExportError::io("creating checkpoint dir", e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    /// Load the watermark of `collection`, if any.
    pub fn load(&self, collection: &str) -> Result<Option<Watermark>> {
        let path = self.path_for(collection);
        match read_checkpoint(&path) {
            Ok(cp) => Ok(cp.map(|cp| cp.watermark)),
            Err(e) => {
                let backup = self.backup_path_for(collection);
                warn!(collection, error = %e, "Checkpoint unreadable, trying backup");
                match read_checkpoint(&backup)? {
                    Some(cp) => Ok(Some(cp.watermark)),
                    None => Err(e),
                }
            }
        }
    }

    /// Move the watermark of `collection` forward to `next`.
    ///
    /// A `next` that is not ahead of the stored watermark is ignored. Returns
    /// the watermark in effect afterwards.
    pub fn advance(&self, collection: &str, next: Watermark) -> Result<Watermark> {
        let _guard = self.write_lock.lock();

        if let Some(current) = self.load(collection)? {
            if !next.is_ahead_of(&current)? {
                debug!(collection, ?current, ?next, "Checkpoint not advanced");
                return Ok(current);
            }
        }

        let path = self.path_for(collection);
        if path.exists() {
            fs::copy(&path, self.backup_path_for(collection))
                .map_err(|e| ExportError::io("backing up checkpoint", e))?;
        }

        let checkpoint = CollectionCheckpoint {
            collection: collection.to_string(),
            watermark: next,
            updated_at: Utc::now(),
        };
        write_json_atomic(&path, &checkpoint)?;

        info!(collection, watermark = ?next, "Checkpoint saved");
        Ok(next)
    }

    /// Get checkpoint directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(collection)))
    }

    fn backup_path_for(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.backup.json", file_stem(collection)))
    }
}

fn read_checkpoint(path: &Path) -> Result<Option<CollectionCheckpoint>> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| ExportError::Parse(format!("Invalid checkpoint {}: {}", path.display(), e))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ExportError::io(format!("opening {}", path.display()), e)),
    }
}

/// Collection names like "sourcecode.pull_request" map to safe file names.
fn file_stem(collection: &str) -> String {
    collection
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}
