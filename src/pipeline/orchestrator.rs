//! Export run orchestration.
//!
//! Run flow:
//! FetchPrimary → FilterExclusions → QueueForExternalCopy → ExportPrimary →
//! ExportLinking → (produce tasks → split → dependent exporters ∥) → Join
//!
//! Epistemic foundation:
//! - K_i: Exclusions are validated before any side effect
//! - K_i: The first stage error cancels every sibling; records already sent
//!   stay sent
//! - K_i: Task checkpoint and dedup snapshot are persisted only after the join
//! - I^B: Any fetch may fail → fail fast, next run resumes from checkpoints

use crate::models::{
    Config, ExportError, ExportGitRepo, ModelStats, PipelineTask, PrimaryEntity, Record, Result,
    RunSummary, SourceConfig,
};
use crate::pagination::{CursorPaginator, OffsetPage, OffsetPaginator, OffsetRequest};
use crate::sender::{IncrementalSender, Sink, WatermarkKind};
use crate::source::Source;
use crate::state::{CheckpointStore, DedupStore};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Batches of tasks shared between every dependent queue.
type TaskBatch = Arc<Vec<PipelineTask>>;

/// Which collections a run exports, under which model names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportPlan {
    pub primary_model: String,
    pub linking_model: Option<String>,
    pub task_model: Option<String>,
    pub dependents: Vec<DependentPlan>,
}

/// One dependent exporter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependentPlan {
    pub model: String,
    /// Task flag that, when `false`, means the collection is empty
    pub hint_field: Option<String>,
}

impl ExportPlan {
    pub fn from_source(config: &SourceConfig) -> Self {
        Self {
            primary_model: config.primary.model.clone(),
            linking_model: config.linking.as_ref().map(|e| e.model.clone()),
            task_model: config.tasks.as_ref().map(|e| e.model.clone()),
            dependents: config
                .dependents
                .iter()
                .map(|d| DependentPlan {
                    model: d.model.clone(),
                    hint_field: d.hint_field.clone(),
                })
                .collect(),
        }
    }
}

/// Per-run knobs.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub excluded: Vec<String>,
    pub only_external_copy: bool,
    pub linking_concurrency: usize,
    pub queue_capacity: usize,
    pub page_size: u64,
}

impl RunOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            excluded: config.export.excluded.clone(),
            only_external_copy: config.export.only_external_copy,
            linking_concurrency: config.export.linking_concurrency,
            queue_capacity: config.export.queue_capacity,
            page_size: u64::from(config.source.page_size),
        }
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            excluded: Vec::new(),
            only_external_copy: false,
            linking_concurrency: 1,
            queue_capacity: 10,
            page_size: 100,
        }
    }
}

#[derive(Default)]
struct Counters {
    tasks: AtomicUsize,
    skipped: AtomicUsize,
}

/// Drives one export run from primary fetch to join.
pub struct Orchestrator {
    source: Arc<dyn Source>,
    sink: Arc<dyn Sink>,
    dedup: Arc<DedupStore>,
    checkpoints: Arc<CheckpointStore>,
    plan: ExportPlan,
    options: RunOptions,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn Source>,
        sink: Arc<dyn Sink>,
        dedup: Arc<DedupStore>,
        checkpoints: Arc<CheckpointStore>,
        plan: ExportPlan,
        options: RunOptions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            sink,
            dedup,
            checkpoints,
            plan,
            options,
            cancel,
        }
    }

    /// Run every stage. The first failure cancels the run token.
    pub async fn run(&self) -> Result<RunSummary> {
        let start = Instant::now();
        let mut summary = RunSummary::default();

        let all = guarded(&self.cancel, self.source.primary_entities()).await?;
        summary.primary_found = all.len();

        let (included, excluded) = filter_exclusions(all, &self.options.excluded)?;
        summary.primary_excluded = excluded;
        info!(
            found = summary.primary_found,
            excluded,
            included = included.len(),
            "Primary entities selected"
        );

        summary.git_repos_queued = self.queue_external_copies(&included).await?;
        if self.options.only_external_copy {
            info!("Only external copy requested, skipping API export");
            summary.runtime_secs = start.elapsed().as_secs_f64();
            return Ok(summary);
        }

        let included = Arc::new(included);

        let stats = self.export_primary(&included).await?;
        summary.record(&self.plan.primary_model, stats);

        if let Some(model) = &self.plan.linking_model {
            let stats = self.export_linking(model, &included).await?;
            summary.record(model, stats);
        }

        if let Some(model) = &self.plan.task_model {
            self.export_tasks(model, Arc::clone(&included), &mut summary)
                .await?;
        }

        self.dedup.save()?;

        summary.runtime_secs = start.elapsed().as_secs_f64();
        info!(
            sent = summary.total_sent(),
            suppressed = summary.total_suppressed(),
            runtime_secs = summary.runtime_secs,
            "Export run complete"
        );
        Ok(summary)
    }

    async fn queue_external_copies(&self, included: &[PrimaryEntity]) -> Result<usize> {
        let mut queued = 0;
        for entity in included {
            let Some(url) = &entity.clone_url else {
                warn!(id = %entity.id, "No clone URL, skipping external copy");
                continue;
            };
            let repo = ExportGitRepo {
                repo_id: entity.id.clone(),
                url: url.clone(),
            };
            guarded(&self.cancel, self.sink.export_git_repo(repo)).await?;
            queued += 1;
        }
        debug!(queued, "Queued external copies");
        Ok(queued)
    }

    async fn export_primary(&self, included: &[PrimaryEntity]) -> Result<ModelStats> {
        let sender = IncrementalSender::incremental(
            &self.plan.primary_model,
            WatermarkKind::Timestamp,
            Arc::clone(&self.sink),
            Arc::clone(&self.dedup),
            Arc::clone(&self.checkpoints),
        )?;
        let since = sender.last_processed();
        let wanted: HashSet<&str> = included.iter().map(|e| e.id.as_str()).collect();
        info!(model = %self.plan.primary_model, since = ?since, "Exporting primary records");

        sender.set_total(included.len() as u64);
        let source: &dyn Source = &*self.source;
        let mut paginator = CursorPaginator::new(since, move |req| source.primary_page(req));
        while let Some(page) = guarded(&self.cancel, paginator.next_page()).await? {
            let records: Vec<Record> = page
                .items
                .into_iter()
                .filter(|r| r.id().is_some_and(|id| wanted.contains(id)))
                .collect();
            sender.send(records).await?;
        }

        sender.done()?;
        Ok(sender.stats())
    }

    async fn export_linking(&self, model: &str, included: &Arc<Vec<PrimaryEntity>>) -> Result<ModelStats> {
        let sender = Arc::new(IncrementalSender::not_incremental(
            model,
            Arc::clone(&self.sink),
            Arc::clone(&self.dedup),
        ));
        let gate = Arc::new(Semaphore::new(self.options.linking_concurrency.max(1)));
        info!(
            model,
            concurrency = self.options.linking_concurrency,
            "Exporting linking records"
        );

        let mut set = JoinSet::new();
        for index in 0..included.len() {
            let source = Arc::clone(&self.source);
            let sender = Arc::clone(&sender);
            let gate = Arc::clone(&gate);
            let cancel = self.cancel.clone();
            let included = Arc::clone(included);
            let page_size = self.options.page_size;

            set.spawn(async move {
                let _permit = gate
                    .acquire()
                    .await
                    .map_err(|_| ExportError::Internal("Semaphore closed".to_string()))?;
                let src: &dyn Source = &*source;
                let entity = &included[index];
                drain_offset(&sender, page_size, &cancel, move |req| {
                    src.linking_page(entity, req)
                })
                .await
            });
        }
        join_fail_fast(&mut set, &self.cancel).await?;

        sender.done()?;
        Ok(sender.stats())
    }

    async fn export_tasks(
        &self,
        task_model: &str,
        included: Arc<Vec<PrimaryEntity>>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let task_sender = Arc::new(IncrementalSender::incremental(
            task_model,
            WatermarkKind::Timestamp,
            Arc::clone(&self.sink),
            Arc::clone(&self.dedup),
            Arc::clone(&self.checkpoints),
        )?);
        let dependent_senders: Vec<Arc<IncrementalSender>> = self
            .plan
            .dependents
            .iter()
            .map(|d| {
                Arc::new(IncrementalSender::not_incremental(
                    &d.model,
                    Arc::clone(&self.sink),
                    Arc::clone(&self.dedup),
                ))
            })
            .collect();
        let counters = Arc::new(Counters::default());
        let capacity = self.options.queue_capacity.max(1);

        info!(
            model = task_model,
            dependents = self.plan.dependents.len(),
            since = ?task_sender.last_processed(),
            "Exporting tasks"
        );

        let (task_tx, task_rx) = mpsc::channel::<TaskBatch>(capacity);
        let mut set: JoinSet<Result<()>> = JoinSet::new();

        set.spawn(produce_tasks(
            Arc::clone(&self.source),
            included,
            Arc::clone(&task_sender),
            task_tx,
            self.cancel.clone(),
            Arc::clone(&counters),
        ));

        let mut queues = Vec::with_capacity(dependent_senders.len());
        for (plan, sender) in self.plan.dependents.iter().zip(&dependent_senders) {
            let (tx, rx) = mpsc::channel::<TaskBatch>(capacity);
            queues.push(tx);
            set.spawn(export_dependents(
                Arc::clone(&self.source),
                plan.clone(),
                Arc::clone(sender),
                rx,
                self.options.page_size,
                self.cancel.clone(),
                Arc::clone(&counters),
            ));
        }
        set.spawn(split_tasks(task_rx, queues, self.cancel.clone()));

        join_fail_fast(&mut set, &self.cancel).await?;

        task_sender.done()?;
        summary.record(task_model, task_sender.stats());
        for sender in &dependent_senders {
            sender.done()?;
            summary.record(sender.model(), sender.stats());
        }
        summary.tasks_produced = counters.tasks.load(Ordering::Relaxed);
        summary.dependents_skipped = counters.skipped.load(Ordering::Relaxed);
        Ok(())
    }
}

/// Drop excluded entities. Every excluded id (or name) must exist.
///
/// Returns the kept entities and how many were removed.
pub fn filter_exclusions(
    entities: Vec<PrimaryEntity>,
    excluded: &[String],
) -> Result<(Vec<PrimaryEntity>, usize)> {
    for wanted in excluded {
        if !entities.iter().any(|e| &e.id == wanted || &e.name == wanted) {
            return Err(ExportError::UnknownExclusion(wanted.clone()));
        }
    }

    let before = entities.len();
    let kept: Vec<PrimaryEntity> = entities
        .into_iter()
        .filter(|e| !excluded.iter().any(|x| x == &e.id || x == &e.name))
        .collect();
    let removed = before - kept.len();
    Ok((kept, removed))
}

/// Race `fut` against the run token.
async fn guarded<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ExportError::Cancelled),
        out = fut => out,
    }
}

/// Send every page of an offset collection through `sender`.
async fn drain_offset<F, Fut>(
    sender: &IncrementalSender,
    page_size: u64,
    cancel: &CancellationToken,
    fetch: F,
) -> Result<()>
where
    F: FnMut(OffsetRequest) -> Fut,
    Fut: Future<Output = Result<OffsetPage<Record>>>,
{
    let mut paginator = OffsetPaginator::new(0, page_size, fetch);
    while let Some(page) = guarded(cancel, paginator.next_page()).await? {
        if let Some(total) = page.total {
            debug!(model = sender.model(), total, "Dependent page");
        }
        sender.send(page.items).await?;
    }
    Ok(())
}

/// Wait for every stage; the first error cancels the rest.
async fn join_fail_fast(set: &mut JoinSet<Result<()>>, cancel: &CancellationToken) -> Result<()> {
    let mut first_error: Option<ExportError> = None;

    while let Some(joined) = set.join_next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(ExportError::Internal(format!("stage panicked: {e}"))),
        };

        if let Err(e) = outcome {
            if first_error.is_none() {
                warn!(error = %e, "Stage failed, cancelling siblings");
                cancel.cancel();
                set.abort_all();
                first_error = Some(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Producer: task records of every included primary, one batch per page.
async fn produce_tasks(
    source: Arc<dyn Source>,
    included: Arc<Vec<PrimaryEntity>>,
    sender: Arc<IncrementalSender>,
    tx: mpsc::Sender<TaskBatch>,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) -> Result<()> {
    let src: &dyn Source = &*source;
    let since = sender.last_processed();

    for entity in included.iter() {
        let mut paginator = CursorPaginator::new(since, move |req| src.tasks_page(entity, req));
        while let Some(page) = guarded(&cancel, paginator.next_page()).await? {
            if page.items.is_empty() {
                continue;
            }
            let batch: Vec<PipelineTask> = page
                .items
                .iter()
                .map(|r| PipelineTask::new(entity.id.clone(), r.clone()))
                .collect();
            sender.send(page.items).await?;
            counters.tasks.fetch_add(batch.len(), Ordering::Relaxed);

            let batch = Arc::new(batch);
            guarded(&cancel, async {
                tx.send(batch).await.map_err(|_| ExportError::ChannelClosed)
            })
            .await?;
        }
    }

    debug!(tasks = counters.tasks.load(Ordering::Relaxed), "Task producer finished");
    Ok(())
}

/// Splitter: duplicate every batch onto each dependent queue.
async fn split_tasks(
    mut rx: mpsc::Receiver<TaskBatch>,
    queues: Vec<mpsc::Sender<TaskBatch>>,
    cancel: CancellationToken,
) -> Result<()> {
    while let Some(batch) = guarded(&cancel, async { Ok(rx.recv().await) }).await? {
        for queue in &queues {
            let batch = Arc::clone(&batch);
            guarded(&cancel, async {
                queue.send(batch).await.map_err(|_| ExportError::ChannelClosed)
            })
            .await?;
        }
    }
    Ok(())
}

/// Dependent exporter: single consumer of its queue.
async fn export_dependents(
    source: Arc<dyn Source>,
    plan: DependentPlan,
    sender: Arc<IncrementalSender>,
    mut rx: mpsc::Receiver<TaskBatch>,
    page_size: u64,
    cancel: CancellationToken,
    counters: Arc<Counters>,
) -> Result<()> {
    let src: &dyn Source = &*source;
    let model = plan.model.as_str();

    while let Some(batch) = guarded(&cancel, async { Ok(rx.recv().await) }).await? {
        for task in batch.iter() {
            if !task.wants(plan.hint_field.as_deref()) {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                debug!(model, task = ?task.id(), "Skipping dependent fetch, hint says empty");
                continue;
            }
            drain_offset(&sender, page_size, &cancel, move |req| {
                src.dependent_page(model, task, req)
            })
            .await?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(id: &str) -> PrimaryEntity {
        PrimaryEntity {
            id: id.to_string(),
            name: format!("org/{id}"),
            clone_url: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_filter_exclusions() {
        let (kept, removed) = filter_exclusions(
            vec![entity("A"), entity("B"), entity("C")],
            &["B".to_string()],
        )
        .unwrap();
        let ids: Vec<_> = kept.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["A", "C"]);
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_filter_exclusions_by_name() {
        let (kept, _) =
            filter_exclusions(vec![entity("A"), entity("B")], &["org/A".to_string()]).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "B");
    }

    #[test]
    fn test_unknown_exclusion_is_fatal() {
        let err = filter_exclusions(vec![entity("A")], &["Z".to_string()]).unwrap_err();
        assert!(matches!(err, ExportError::UnknownExclusion(ref id) if id == "Z"));
        assert!(err.to_string().contains("non existing"));
    }

    #[tokio::test]
    async fn test_join_fail_fast_cancels_siblings() {
        let cancel = CancellationToken::new();
        let mut set: JoinSet<Result<()>> = JoinSet::new();

        let sibling_cancel = cancel.clone();
        set.spawn(async move {
            sibling_cancel.cancelled().await;
            Err(ExportError::Cancelled)
        });
        set.spawn(async { Err(ExportError::Pagination("boom".into())) });

        let err = join_fail_fast(&mut set, &cancel).await.unwrap_err();
        assert!(matches!(err, ExportError::Pagination(_)));
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_join_success() {
        let cancel = CancellationToken::new();
        let mut set: JoinSet<Result<()>> = JoinSet::new();
        set.spawn(async { Ok(()) });
        set.spawn(async { Ok(()) });
        join_fail_fast(&mut set, &cancel).await.unwrap();
        assert!(!cancel.is_cancelled());
    }
}
