//! Record and run types for exportkit.
//!
//! K_i: These types represent the core data flow through the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::{ExportError, Result};

/// One exported object.
///
/// K_i: A record is a JSON object. Once stamped it carries `ref_type`, `id`
/// and `hashcode`, which is what the dedup store keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wrap a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            other => Err(ExportError::InvalidInput(format!(
                "record must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn ref_type(&self) -> Option<&str> {
        self.0.get("ref_type").and_then(Value::as_str)
    }

    pub fn id(&self) -> Option<&str> {
        self.0.get("id").and_then(Value::as_str)
    }

    pub fn hashcode(&self) -> Option<&str> {
        self.0.get("hashcode").and_then(Value::as_str)
    }

    /// Parse `updated_at` as an RFC 3339 timestamp.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.0
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// SHA-256 hex of the canonical JSON form, excluding `hashcode`.
    ///
    /// Object keys are sorted at every depth, independent of the map order
    /// serde_json was built with.
    pub fn compute_hashcode(&self) -> String {
        let fields: BTreeMap<&str, Canonical<'_>> = self
            .0
            .iter()
            .filter(|(key, _)| key.as_str() != "hashcode")
            .map(|(key, value)| (key.as_str(), Canonical(value)))
            .collect();
        // Cannot fail: string keys and JSON values only.
        let canonical = serde_json::to_vec(&fields).unwrap_or_default();
        format!("{:x}", Sha256::digest(&canonical))
    }

    /// Fill in `ref_type` when absent and (re)compute `hashcode`.
    pub fn stamp(&mut self, ref_type: &str) {
        if self.ref_type().is_none() {
            self.set("ref_type", ref_type);
        }
        let hashcode = self.compute_hashcode();
        self.set("hashcode", hashcode);
    }

    /// Hint flags are booleans on the record. An absent flag means "unknown",
    /// which callers treat as "may have items".
    pub fn flag(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

/// Serializes a JSON value with object keys in sorted order.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Object(map) => {
                let sorted: BTreeMap<&str, Canonical<'_>> =
                    map.iter().map(|(k, v)| (k.as_str(), Canonical(v))).collect();
                sorted.serialize(serializer)
            }
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            other => other.serialize(serializer),
        }
    }
}

impl From<Map<String, Value>> for Record {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// Top-level entity every other collection hangs off (e.g. a repository).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryEntity {
    /// Origin identifier, matched against the exclusion list
    pub id: String,

    /// Human readable name (e.g., "org/repo")
    pub name: String,

    /// URL used by the external bulk copy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clone_url: Option<String>,

    /// Last modification reported by the origin
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Directive for the external bulk-copy side channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportGitRepo {
    pub repo_id: String,
    pub url: String,
}

/// One dependent-entity export unit, e.g. "pull request X of repo Y".
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineTask {
    /// Primary entity the task belongs to
    pub primary_id: String,

    /// Record of the task itself
    pub record: Record,
}

impl PipelineTask {
    pub fn new(primary_id: impl Into<String>, record: Record) -> Self {
        Self {
            primary_id: primary_id.into(),
            record,
        }
    }

    pub fn id(&self) -> Option<&str> {
        self.record.id()
    }

    /// Whether a dependent collection guarded by `hint` is worth fetching.
    ///
    /// No hint field, or a hint the origin did not report, means fetch.
    pub fn wants(&self, hint: Option<&str>) -> bool {
        match hint {
            Some(field) => self.record.flag(field).unwrap_or(true),
            None => true,
        }
    }
}

/// Per-model send counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStats {
    /// Records forwarded to the sink
    pub sent: u64,
    /// Records dropped because the dedup store had seen them unchanged
    pub suppressed: u64,
}

/// Statistics for an export run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    /// Primary entities returned by the origin
    pub primary_found: usize,

    /// Primary entities removed by the exclusion list
    pub primary_excluded: usize,

    /// Primary entities queued for external copy
    pub git_repos_queued: usize,

    /// Tasks produced for the dependent exporters
    pub tasks_produced: usize,

    /// Dependent fetches skipped on a zero-item hint
    pub dependents_skipped: usize,

    /// Send counters keyed by model
    pub models: BTreeMap<String, ModelStats>,

    /// Total runtime in seconds
    pub runtime_secs: f64,
}

impl RunSummary {
    /// Add the counters of one sender.
    pub fn record(&mut self, model: &str, stats: ModelStats) {
        let entry = self.models.entry(model.to_string()).or_default();
        entry.sent += stats.sent;
        entry.suppressed += stats.suppressed;
    }

    pub fn total_sent(&self) -> u64 {
        self.models.values().map(|m| m.sent).sum()
    }

    pub fn total_suppressed(&self) -> u64 {
        self.models.values().map(|m| m.suppressed).sum()
    }
}
