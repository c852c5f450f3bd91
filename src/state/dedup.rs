//! Content-hash dedup store.
//!
//! Epistemic foundation:
//! - K_i: At most one current hashcode per (ref_type, id)
//! - K_i: Entries are never deleted, only overwritten
//! - B_i: Snapshot file may not exist yet → start empty
//! - I^B: Crash during save → previous snapshot survives (temp + rename)

use crate::models::{ExportError, Record, Result};
use crate::state::atomic::write_json_atomic;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// ref_type → id → hashcode
type HashIndex = HashMap<String, HashMap<String, String>>;

/// Remembers the last hashcode sent for every record.
pub struct DedupStore {
    /// Snapshot location
    path: PathBuf,
    /// Single lock over the whole read-modify-write
    data: Mutex<HashIndex>,
    /// Records seen for the first time or with a changed hashcode
    new: AtomicU64,
    /// Records seen unchanged
    dups: AtomicU64,
}

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub new: u64,
    pub dups: u64,
    /// Distinct (ref_type, id) pairs held
    pub entries: usize,
}

impl DedupStore {
    /// Load the snapshot at `path`, or start empty if it does not exist.
    pub fn open(path: &Path) -> Result<Self> {
        let data = match fs::read(path) {
            Ok(bytes) => serde_json::from_slice::<HashIndex>(&bytes).map_err(|e| {
                ExportError::Parse(format!("invalid dedup snapshot {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == ErrorKind::NotFound => HashIndex::new(),
            Err(e) => {
                return Err(ExportError::io(
                    format!("reading dedup snapshot {}", path.display()),
                    e,
                ));
            }
        };

        let entries: usize = data.values().map(HashMap::len).sum();
        info!(path = %path.display(), entries, "Opened dedup store");

        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
            new: AtomicU64::new(0),
            dups: AtomicU64::new(0),
        })
    }

    /// Record that `record` is being sent.
    ///
    /// Returns `true` iff the stored hashcode equals the record's, i.e. the
    /// record was already sent unchanged and can be suppressed.
    pub fn mark_as_sent(&self, record: &Record) -> Result<bool> {
        let ref_type = match record.get("ref_type") {
            Some(v) => v
                .as_str()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ExportError::InvalidInput("ref_type must be a non-empty string".into()))?,
            None => return Err(ExportError::MissingField("ref_type")),
        };
        let id = match record.get("id") {
            Some(v) => v
                .as_str()
                .ok_or_else(|| ExportError::InvalidInput("id must be a string".into()))?,
            None => return Err(ExportError::MissingField("id")),
        };
        let hashcode = match record.get("hashcode") {
            Some(v) => v
                .as_str()
                .ok_or_else(|| ExportError::InvalidInput("hashcode must be a string".into()))?,
            None => return Err(ExportError::MissingField("hashcode")),
        };

        let mut data = self.data.lock();
        let ids = data.entry(ref_type.to_string()).or_default();
        let dup = ids.get(id).is_some_and(|prev| prev == hashcode);
        if dup {
            self.dups.fetch_add(1, Ordering::Relaxed);
        } else {
            ids.insert(id.to_string(), hashcode.to_string());
            self.new.fetch_add(1, Ordering::Relaxed);
        }
        Ok(dup)
    }

    /// Replace the snapshot with the full in-memory map.
    pub fn save(&self) -> Result<()> {
        let data = self.data.lock();
        write_json_atomic(&self.path, &*data)?;
        debug!(path = %self.path.display(), "Dedup snapshot saved");
        Ok(())
    }

    pub fn stats(&self) -> DedupStats {
        DedupStats {
            new: self.new.load(Ordering::Relaxed),
            dups: self.dups.load(Ordering::Relaxed),
            entries: self.data.lock().values().map(HashMap::len).sum(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn rec(id: &str, hash: &str) -> Record {
        Record::from_value(json!({"ref_type": "github", "id": id, "hashcode": hash})).unwrap()
    }

    #[test]
    fn test_identical_record_is_dup_second_time() {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(&dir.path().join("dedup.json")).unwrap();

        assert!(!store.mark_as_sent(&rec("1", "h1")).unwrap());
        assert!(store.mark_as_sent(&rec("1", "h1")).unwrap());

        let stats = store.stats();
        assert_eq!(stats.new, 1);
        assert_eq!(stats.dups, 1);
    }

    #[test]
    fn test_changed_hashcode_is_not_dup() {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(&dir.path().join("dedup.json")).unwrap();

        assert!(!store.mark_as_sent(&rec("1", "h1")).unwrap());
        assert!(!store.mark_as_sent(&rec("1", "h2")).unwrap());
        assert!(store.mark_as_sent(&rec("1", "h2")).unwrap());
    }

    #[test]
    fn test_missing_and_malformed_fields() {
        let dir = TempDir::new().unwrap();
        let store = DedupStore::open(&dir.path().join("dedup.json")).unwrap();

        let no_type = Record::from_value(json!({"id": "1", "hashcode": "h"})).unwrap();
        assert!(matches!(
            store.mark_as_sent(&no_type),
            Err(ExportError::MissingField("ref_type"))
        ));

        let empty_type =
            Record::from_value(json!({"ref_type": "", "id": "1", "hashcode": "h"})).unwrap();
        assert!(store.mark_as_sent(&empty_type).is_err());

        let numeric_id =
            Record::from_value(json!({"ref_type": "t", "id": 1, "hashcode": "h"})).unwrap();
        assert!(store.mark_as_sent(&numeric_id).is_err());

        let no_hash = Record::from_value(json!({"ref_type": "t", "id": "1"})).unwrap();
        assert!(matches!(
            store.mark_as_sent(&no_hash),
            Err(ExportError::MissingField("hashcode"))
        ));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.json");

        let store = DedupStore::open(&path).unwrap();
        store.mark_as_sent(&rec("1", "h1")).unwrap();
        store.save().unwrap();

        let reopened = DedupStore::open(&path).unwrap();
        assert!(reopened.mark_as_sent(&rec("1", "h1")).unwrap());
        assert_eq!(reopened.stats().entries, 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dedup.json");
        fs::write(&path, "{not json").unwrap();
        assert!(DedupStore::open(&path).is_err());
    }

    #[test]
    fn test_concurrent_marks_count_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(DedupStore::open(&dir.path().join("dedup.json")).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.mark_as_sent(&rec("same", "h")).unwrap())
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|dup| !dup)
            .count();

        assert_eq!(fresh, 1);
        assert_eq!(store.stats().dups, 7);
    }
}
