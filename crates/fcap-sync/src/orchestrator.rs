//! Runs one sync cycle: for every requested entity, fetch from all sources,
//! diff against the latest snapshot, propagate, and snapshot the result.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fcap_adapters::{SourceAdapter, SourceError};
use fcap_core::{diff, Entity, EntityId, Patch, SourceId};
use fcap_storage::{CallError, CallErrorKind, RateLimitedClient, SnapshotStore};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::report::{CycleReport, CycleStats};
use crate::updater::{PipelineStage, UpdateOutcome, Updater};

pub const DEFAULT_WORKER_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Unchanged,
    Updated,
    SourceFailed,
    SinkFailed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Unchanged => "unchanged",
            RunStatus::Updated => "updated",
            RunStatus::SourceFailed => "source_failed",
            RunStatus::SinkFailed => "sink_failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceFatal,
    SourceUnavailable,
    RateLimitTimeout,
    AuthoritativeSinkFailed,
    QuerySinkFailed,
    InvalidationFailed,
    SnapshotStoreFailed,
    DeadlineReached,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::SourceFatal => "source_fatal",
            ErrorKind::SourceUnavailable => "source_unavailable",
            ErrorKind::RateLimitTimeout => "rate_limit_timeout",
            ErrorKind::AuthoritativeSinkFailed => "authoritative_sink_failed",
            ErrorKind::QuerySinkFailed => "query_sink_failed",
            ErrorKind::InvalidationFailed => "invalidation_failed",
            ErrorKind::SnapshotStoreFailed => "snapshot_store_failed",
            ErrorKind::DeadlineReached => "deadline_reached",
        }
    }
}

impl From<CallErrorKind> for ErrorKind {
    fn from(kind: CallErrorKind) -> Self {
        match kind {
            CallErrorKind::RateLimitTimeout => ErrorKind::RateLimitTimeout,
            CallErrorKind::SourceUnavailable => ErrorKind::SourceUnavailable,
            CallErrorKind::SourceFatal => ErrorKind::SourceFatal,
            CallErrorKind::DeadlineReached => ErrorKind::DeadlineReached,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceFailure {
    pub source_id: SourceId,
    pub kind: ErrorKind,
    pub message: String,
}

impl SourceFailure {
    fn from_call_error(err: &CallError<SourceError>) -> Self {
        Self {
            source_id: err.source_id().to_string(),
            kind: err.kind().into(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepFailure {
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one entity's pipeline within a cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub entity_id: EntityId,
    pub status: RunStatus,
    pub stage: PipelineStage,
    /// Changes sent to the sinks, when any were attempted.
    pub patch: Option<Patch>,
    pub sources_succeeded: Vec<SourceId>,
    pub source_failures: Vec<SourceFailure>,
    pub failure: Option<StepFailure>,
    pub warnings: Vec<StepFailure>,
    pub snapshot_id: Option<Uuid>,
    pub cancel_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunResult {
    fn start(entity_id: EntityId) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            status: RunStatus::Cancelled,
            stage: PipelineStage::Pending,
            patch: None,
            sources_succeeded: Vec::new(),
            source_failures: Vec::new(),
            failure: None,
            warnings: Vec::new(),
            snapshot_id: None,
            cancel_reason: None,
            started_at: now,
            finished_at: now,
        }
    }

    fn cancelled(entity_id: EntityId, reason: &str) -> Self {
        let mut result = Self::start(entity_id);
        result.cancel(reason);
        result
    }

    fn cancel(&mut self, reason: &str) {
        debug!(entity_id = %self.entity_id, reason, "entity cancelled");
        self.status = RunStatus::Cancelled;
        self.cancel_reason = Some(reason.to_string());
        self.finished_at = Utc::now();
    }

    fn fail(&mut self, kind: ErrorKind, message: String) {
        self.status = RunStatus::SinkFailed;
        self.failure = Some(StepFailure { kind, message });
    }

    pub fn is_failure(&self) -> bool {
        matches!(self.status, RunStatus::SourceFailed | RunStatus::SinkFailed)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOptions {
    /// No entity step starts once this instant has passed.
    pub deadline: Option<Instant>,
    /// Diff against an empty baseline so every field is resent.
    pub force_full_sync: bool,
}

impl CycleOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Some(Instant::now() + timeout),
            force_full_sync: false,
        }
    }

    pub fn force_full_sync(mut self, force: bool) -> Self {
        self.force_full_sync = force;
        self
    }

    fn expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Serializes pipelines for the same entity id within this process.
#[derive(Debug, Default)]
struct EntityLocks {
    locks: Mutex<HashMap<EntityId, Arc<Mutex<()>>>>,
}

impl EntityLocks {
    async fn acquire(&self, entity_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(entity_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn release(&self, entity_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.locks.lock().await;
        if locks.get(entity_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(entity_id);
        }
    }
}

/// Cheap to clone; every worker task holds its own handle.
#[derive(Clone)]
pub struct Orchestrator {
    sources: Arc<Vec<Arc<dyn SourceAdapter>>>,
    client: Arc<RateLimitedClient>,
    snapshots: Arc<dyn SnapshotStore>,
    updater: Updater,
    worker_concurrency: usize,
    locks: Arc<EntityLocks>,
}

impl Orchestrator {
    /// Sources are merged in the given order; later sources win per field.
    pub fn new(
        sources: Vec<Arc<dyn SourceAdapter>>,
        client: RateLimitedClient,
        snapshots: Arc<dyn SnapshotStore>,
        updater: Updater,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            client: Arc::new(client),
            snapshots,
            updater,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            locks: Arc::new(EntityLocks::default()),
        }
    }

    pub fn with_worker_concurrency(mut self, workers: usize) -> Self {
        self.worker_concurrency = workers.max(1);
        self
    }

    pub fn source_ids(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.source_id()).collect()
    }

    pub fn snapshot_store(&self) -> Arc<dyn SnapshotStore> {
        self.snapshots.clone()
    }

    /// Always returns exactly one result per requested id, in request order.
    pub async fn run_cycle(&self, entity_ids: &[EntityId], options: CycleOptions) -> CycleReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("run_cycle", %run_id, entities = entity_ids.len());

        let results = self
            .run_entities(run_id, entity_ids, options)
            .instrument(span)
            .await;

        let stats = CycleStats::from_results(&results);
        info!(
            %run_id,
            updated = stats.updated,
            unchanged = stats.unchanged,
            source_failed = stats.source_failed,
            sink_failed = stats.sink_failed,
            cancelled = stats.cancelled,
            "cycle finished"
        );
        CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            results,
            stats,
        }
    }

    async fn run_entities(&self, run_id: Uuid, entity_ids: &[EntityId], options: CycleOptions) -> Vec<RunResult> {
        let permits = Arc::new(Semaphore::new(self.worker_concurrency));
        let mut tasks = JoinSet::new();

        for (index, entity_id) in entity_ids.iter().cloned().enumerate() {
            let this = self.clone();
            let permits = permits.clone();
            let span = info_span!("entity", %run_id, entity_id = %entity_id);
            tasks.spawn(
                async move {
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return (index, RunResult::cancelled(entity_id, "worker pool closed"));
                    };
                    if options.expired() {
                        return (index, RunResult::cancelled(entity_id, "deadline passed before start"));
                    }
                    (index, this.process_entity(entity_id, options).await)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<RunResult>> = entity_ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(err) => warn!(error = %err, "entity worker aborted"),
            }
        }

        slots
            .into_iter()
            .zip(entity_ids)
            .map(|(slot, entity_id)| {
                slot.unwrap_or_else(|| RunResult::cancelled(entity_id.clone(), "worker aborted"))
            })
            .collect()
    }

    async fn process_entity(&self, entity_id: EntityId, options: CycleOptions) -> RunResult {
        let guard = self.locks.acquire(&entity_id).await;
        let mut result = RunResult::start(entity_id.clone());
        self.run_pipeline(&mut result, options).await;
        self.locks.release(&entity_id, guard).await;
        result.finished_at = Utc::now();
        result
    }

    async fn run_pipeline(&self, result: &mut RunResult, options: CycleOptions) {
        let entity_id = result.entity_id.clone();

        let mut fresh = Entity::new(entity_id.clone());
        for source in self.sources.iter() {
            if options.expired() {
                result.cancel("deadline passed while fetching sources");
                return;
            }
            let source_id = source.source_id();
            let fetched = self
                .client
                .call_before(source_id, options.deadline, || source.fetch(&entity_id))
                .instrument(info_span!("source_call", source_id))
                .await;
            match fetched {
                Ok(record) => {
                    fresh.merge_record(&record);
                    result.sources_succeeded.push(source_id.to_string());
                }
                Err(err) if err.kind() == CallErrorKind::DeadlineReached || options.expired() => {
                    debug!(source_id, error = %err, "source call cut short by the deadline");
                    result.cancel("deadline passed while fetching sources");
                    return;
                }
                Err(err) => {
                    warn!(source_id, kind = ?err.kind(), error = %err, "source fetch failed");
                    result.source_failures.push(SourceFailure::from_call_error(&err));
                }
            }
        }

        if options.expired() {
            result.cancel("deadline passed while fetching sources");
            return;
        }
        if result.sources_succeeded.is_empty() {
            result.status = RunStatus::SourceFailed;
            return;
        }
        result.stage = PipelineStage::Fetched;

        if options.expired() {
            result.cancel("deadline passed before diff");
            return;
        }
        let previous = match self.snapshots.find_latest(&entity_id).await {
            Ok(previous) => previous,
            Err(err) => {
                warn!(error = %err, "could not read latest snapshot");
                result.fail(ErrorKind::SnapshotStoreFailed, err.to_string());
                return;
            }
        };

        let merged = match &previous {
            // A failed source must not read as "all its fields were removed":
            // keep the previous values for anything this cycle did not observe.
            Some(previous) if !result.source_failures.is_empty() => {
                let mut merged = previous.to_entity();
                merged.fields.extend(fresh.fields);
                merged.last_checked.extend(fresh.last_checked);
                merged
            }
            Some(previous) => {
                let mut last_checked = previous.last_checked.clone();
                last_checked.extend(fresh.last_checked);
                Entity {
                    last_checked,
                    ..fresh
                }
            }
            None => fresh,
        };

        let baseline = if options.force_full_sync {
            None
        } else {
            previous.as_ref().map(|snapshot| &snapshot.fields)
        };
        let patch = diff(baseline, &merged.fields);
        result.stage = PipelineStage::Diffed;
        debug!(changed = patch.len(), "diff computed");

        if options.expired() {
            result.cancel("deadline passed before update");
            return;
        }
        let outcome = self.updater.apply(&entity_id, &merged.fields, &patch).await;
        result.stage = outcome.stage();
        if !patch.is_empty() {
            result.patch = Some(patch);
        }
        match outcome {
            UpdateOutcome::NoOp => result.status = RunStatus::Unchanged,
            UpdateOutcome::Updated {
                invalidation_error, ..
            } => {
                result.status = RunStatus::Updated;
                if let Some(message) = invalidation_error {
                    result.warnings.push(StepFailure {
                        kind: ErrorKind::InvalidationFailed,
                        message,
                    });
                }
            }
            UpdateOutcome::AuthoritativeSinkFailed(err) => {
                result.fail(ErrorKind::AuthoritativeSinkFailed, err.to_string());
                return;
            }
            UpdateOutcome::QuerySinkFailed(err) => {
                result.fail(ErrorKind::QuerySinkFailed, err.to_string());
                return;
            }
        }

        match self.snapshots.put(&merged).await {
            Ok(snapshot) => result.snapshot_id = Some(snapshot.id),
            Err(err) => {
                warn!(error = %err, "snapshot persist failed");
                result.fail(ErrorKind::SnapshotStoreFailed, err.to_string());
            }
        }
    }
}
