//! Downstream sinks for exported records.
//!
//! K_i: A sink receives post-dedup batches per model plus external-copy
//! directives. Delivery is at-least-once.

use crate::models::{ExportError, ExportGitRepo, Record, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Where exported records go.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Publish a batch of records of one model.
    async fn send(&self, model: &str, records: Vec<Record>) -> Result<()>;

    /// Queue a primary entity for the external bulk copy.
    async fn export_git_repo(&self, repo: ExportGitRepo) -> Result<()>;
}

/// Appends records to `<dir>/<model>.jsonl`, one JSON object per line.
pub struct JsonlSink {
    dir: PathBuf,
    writers: Mutex<HashMap<String, BufWriter<File>>>,
}

/// File name of the external-copy queue.
pub const GIT_REPOS_FILE: &str = "git_repos";

impl JsonlSink {
    pub fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| ExportError::io("creating output dir", e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            writers: Mutex::new(HashMap::new()),
        })
    }

    fn append<T: serde::Serialize>(&self, name: &str, items: &[T]) -> Result<()> {
        let mut writers = self.writers.lock();
        let writer = match writers.entry(name.to_string()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => {
                let path = self.dir.join(format!("{name}.jsonl"));
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .map_err(|err| ExportError::io(format!("opening {}", path.display()), err))?;
                e.insert(BufWriter::new(file))
            }
        };

        for item in items {
            serde_json::to_writer(&mut *writer, item)?;
            writer
                .write_all(b"\n")
                .map_err(|e| ExportError::io("writing output", e))?;
        }
        // Flush per batch so a killed run keeps what it reported as sent.
        writer
            .flush()
            .map_err(|e| ExportError::io("flushing output", e))?;
        Ok(())
    }
}

#[async_trait]
impl Sink for JsonlSink {
    async fn send(&self, model: &str, records: Vec<Record>) -> Result<()> {
        self.append(model, &records)?;
        debug!(model, count = records.len(), "Records written");
        Ok(())
    }

    async fn export_git_repo(&self, repo: ExportGitRepo) -> Result<()> {
        self.append(GIT_REPOS_FILE, std::slice::from_ref(&repo))
    }
}

/// Collects everything in memory.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<(String, Record)>>,
    git_repos: Mutex<Vec<ExportGitRepo>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records sent under `model`, in send order.
    pub fn records(&self, model: &str) -> Vec<Record> {
        self.records
            .lock()
            .iter()
            .filter(|(m, _)| m == model)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// Ids of the records sent under `model`.
    pub fn ids(&self, model: &str) -> Vec<String> {
        self.records(model)
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect()
    }

    pub fn git_repos(&self) -> Vec<ExportGitRepo> {
        self.git_repos.lock().clone()
    }

    pub fn total(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn send(&self, model: &str, records: Vec<Record>) -> Result<()> {
        let mut all = self.records.lock();
        all.extend(records.into_iter().map(|r| (model.to_string(), r)));
        Ok(())
    }

    async fn export_git_repo(&self, repo: ExportGitRepo) -> Result<()> {
        self.git_repos.lock().push(repo);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_jsonl_sink_appends_per_model() {
        let dir = TempDir::new().unwrap();
        let sink = JsonlSink::new(dir.path()).unwrap();

        let r1 = Record::from_value(json!({"id": "1"})).unwrap();
        let r2 = Record::from_value(json!({"id": "2"})).unwrap();
        sink.send("repo", vec![r1]).await.unwrap();
        sink.send("repo", vec![r2]).await.unwrap();
        sink.export_git_repo(ExportGitRepo {
            repo_id: "1".into(),
            url: "https://x/1.git".into(),
        })
        .await
        .unwrap();

        let repos = fs::read_to_string(dir.path().join("repo.jsonl")).unwrap();
        assert_eq!(repos.lines().count(), 2);
        let git = fs::read_to_string(dir.path().join("git_repos.jsonl")).unwrap();
        assert!(git.contains("https://x/1.git"));
    }

    #[tokio::test]
    async fn test_memory_sink() {
        let sink = MemorySink::new();
        let r = Record::from_value(json!({"id": "a"})).unwrap();
        sink.send("m", vec![r]).await.unwrap();
        assert_eq!(sink.ids("m"), vec!["a"]);
        assert!(sink.records("other").is_empty());
    }
}
