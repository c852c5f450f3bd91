//! Incremental senders.
//!
//! Epistemic foundation:
//! - K_i: Only records the dedup store has not seen unchanged reach the sink
//! - K_i: The checkpoint moves only in `done()`, after every batch was sent
//! - B_i: A previous run may have left a watermark → read once at open

use crate::models::{ModelStats, Record, Result};
use crate::sender::Sink;
use crate::state::{CheckpointStore, DedupStore, Watermark};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Watermark flavour of an incremental collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkKind {
    /// Pending watermark is the run's start time
    Timestamp,
    /// Pending watermark is the highest observed offset
    Offset,
}

enum Mode {
    NotIncremental,
    Incremental {
        kind: WatermarkKind,
        checkpoints: Arc<CheckpointStore>,
        last: Option<Watermark>,
        started_at: DateTime<Utc>,
        max_offset: AtomicU64,
    },
}

/// Sends the records of one model.
pub struct IncrementalSender {
    model: String,
    sink: Arc<dyn Sink>,
    dedup: Arc<DedupStore>,
    mode: Mode,
    sent: AtomicU64,
    suppressed: AtomicU64,
    progress: Mutex<Option<ProgressBar>>,
}

impl IncrementalSender {
    /// Sender without a checkpoint, for records re-scanned per parent.
    pub fn not_incremental(model: &str, sink: Arc<dyn Sink>, dedup: Arc<DedupStore>) -> Self {
        Self::build(model, sink, dedup, Mode::NotIncremental)
    }

    /// Sender tracking a watermark for `model` in `checkpoints`.
    pub fn incremental(
        model: &str,
        kind: WatermarkKind,
        sink: Arc<dyn Sink>,
        dedup: Arc<DedupStore>,
        checkpoints: Arc<CheckpointStore>,
    ) -> Result<Self> {
        let last = checkpoints.load(model)?;
        debug!(model, last = ?last, "Opened incremental sender");

        Ok(Self::build(
            model,
            sink,
            dedup,
            Mode::Incremental {
                kind,
                checkpoints,
                last,
                started_at: Utc::now(),
                max_offset: AtomicU64::new(last.and_then(|w| w.as_offset()).unwrap_or(0)),
            },
        ))
    }

    fn build(model: &str, sink: Arc<dyn Sink>, dedup: Arc<DedupStore>, mode: Mode) -> Self {
        Self {
            model: model.to_string(),
            sink,
            dedup,
            mode,
            sent: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            progress: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn is_incremental(&self) -> bool {
        matches!(self.mode, Mode::Incremental { .. })
    }

    /// Instant before which everything was sent by a previous run.
    pub fn last_processed(&self) -> Option<DateTime<Utc>> {
        match &self.mode {
            Mode::Incremental { last, .. } => last.and_then(|w| w.as_timestamp()),
            Mode::NotIncremental => None,
        }
    }

    /// Offset before which everything was sent by a previous run.
    pub fn last_offset(&self) -> Option<u64> {
        match &self.mode {
            Mode::Incremental { last, .. } => last.and_then(|w| w.as_offset()),
            Mode::NotIncremental => None,
        }
    }

    /// Declare the expected record count; drives a progress bar.
    pub fn set_total(&self, total: u64) {
        let mut progress = self.progress.lock();
        match progress.as_ref() {
            Some(pb) => pb.set_length(total),
            None => {
                let pb = ProgressBar::new(total);
                if let Ok(style) = ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}")
                {
                    pb.set_style(style.progress_chars("##-"));
                }
                pb.set_message(self.model.clone());
                *progress = Some(pb);
            }
        }
    }

    /// Record that the origin has been read up to `offset`.
    pub fn observe_offset(&self, offset: u64) {
        if let Mode::Incremental { max_offset, .. } = &self.mode {
            max_offset.fetch_max(offset, Ordering::Relaxed);
        }
    }

    /// Forward the records the dedup store has not seen unchanged.
    pub async fn send(&self, records: Vec<Record>) -> Result<()> {
        let fetched = records.len() as u64;
        let mut fresh = Vec::with_capacity(records.len());
        for record in records {
            if !self.dedup.mark_as_sent(&record)? {
                fresh.push(record);
            }
        }

        let fresh_count = fresh.len() as u64;
        if !fresh.is_empty() {
            self.sink.send(&self.model, fresh).await?;
        }

        self.sent.fetch_add(fresh_count, Ordering::Relaxed);
        self.suppressed
            .fetch_add(fetched - fresh_count, Ordering::Relaxed);
        if let Some(pb) = self.progress.lock().as_ref() {
            pb.inc(fetched);
        }
        Ok(())
    }

    /// Finish the collection and persist its watermark.
    ///
    /// Returns the watermark in effect, `None` for non-incremental senders.
    pub fn done(&self) -> Result<Option<Watermark>> {
        if let Some(pb) = self.progress.lock().take() {
            pb.finish_and_clear();
        }

        let stats = self.stats();
        let watermark = match &self.mode {
            Mode::NotIncremental => None,
            Mode::Incremental {
                kind,
                checkpoints,
                started_at,
                max_offset,
                ..
            } => {
                let next = match kind {
                    WatermarkKind::Timestamp => Watermark::LastProcessed(*started_at),
                    WatermarkKind::Offset => {
                        Watermark::LastOffset(max_offset.load(Ordering::Relaxed))
                    }
                };
                Some(checkpoints.advance(&self.model, next)?)
            }
        };

        info!(
            model = %self.model,
            sent = stats.sent,
            suppressed = stats.suppressed,
            "Export finished"
        );
        Ok(watermark)
    }

    pub fn stats(&self) -> ModelStats {
        ModelStats {
            sent: self.sent.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::MemorySink;
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        sink: Arc<MemorySink>,
        dedup: Arc<DedupStore>,
        checkpoints: Arc<CheckpointStore>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let dedup = Arc::new(DedupStore::open(&dir.path().join("dedup.json")).unwrap());
        let checkpoints = Arc::new(CheckpointStore::new(&dir.path().join("cp")).unwrap());
        Fixture {
            _dir: dir,
            sink: Arc::new(MemorySink::new()),
            dedup,
            checkpoints,
        }
    }

    fn rec(id: &str, title: &str) -> Record {
        let mut r = Record::from_value(json!({"id": id, "title": title})).unwrap();
        r.stamp("test");
        r
    }

    #[tokio::test]
    async fn test_unchanged_records_suppressed() {
        let f = fixture();
        let sender = IncrementalSender::not_incremental("pr", f.sink.clone(), f.dedup.clone());

        sender.send(vec![rec("1", "a"), rec("2", "b")]).await.unwrap();
        sender.send(vec![rec("1", "a"), rec("2", "changed")]).await.unwrap();

        assert_eq!(f.sink.ids("pr"), vec!["1", "2", "2"]);
        assert_eq!(sender.stats(), ModelStats { sent: 3, suppressed: 1 });
        assert_eq!(sender.done().unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_advances_only_on_done() {
        let f = fixture();
        let sender = IncrementalSender::incremental(
            "repo",
            WatermarkKind::Timestamp,
            f.sink.clone(),
            f.dedup.clone(),
            f.checkpoints.clone(),
        )
        .unwrap();
        assert!(sender.last_processed().is_none());

        sender.set_total(1);
        sender.send(vec![rec("1", "a")]).await.unwrap();
        assert!(f.checkpoints.load("repo").unwrap().is_none());

        let first = sender.done().unwrap().unwrap();
        assert_eq!(f.checkpoints.load("repo").unwrap(), Some(first));

        let reopened = IncrementalSender::incremental(
            "repo",
            WatermarkKind::Timestamp,
            f.sink.clone(),
            f.dedup.clone(),
            f.checkpoints.clone(),
        )
        .unwrap();
        assert_eq!(reopened.last_processed(), first.as_timestamp());

        let second = reopened.done().unwrap().unwrap();
        assert!(second.is_ahead_of(&first).unwrap() || second == first);
    }

    #[tokio::test]
    async fn test_offset_watermark_is_highest_observed() {
        let f = fixture();
        let sender = IncrementalSender::incremental(
            "issues",
            WatermarkKind::Offset,
            f.sink.clone(),
            f.dedup.clone(),
            f.checkpoints.clone(),
        )
        .unwrap();

        sender.observe_offset(50);
        sender.observe_offset(20);
        assert_eq!(sender.done().unwrap(), Some(Watermark::LastOffset(50)));
        assert_eq!(
            f.checkpoints.load("issues").unwrap(),
            Some(Watermark::LastOffset(50))
        );
    }

    #[tokio::test]
    async fn test_record_without_hashcode_fails_send() {
        let f = fixture();
        let sender = IncrementalSender::not_incremental("pr", f.sink.clone(), f.dedup.clone());
        let bare = Record::from_value(json!({"id": "1", "ref_type": "t"})).unwrap();
        assert!(sender.send(vec![bare]).await.is_err());
        assert_eq!(f.sink.total(), 0);
    }
}
