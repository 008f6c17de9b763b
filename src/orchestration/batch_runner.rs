//! # Batch Runner
//!
//! Drives one job run: before-hooks, candidate selection, chunked processing
//! over up to `worker_count` concurrent workers, after-hooks.
//!
//! Each chunk is one transaction: every candidate is locked for the batch,
//! loaded, run through the pipeline and saved; the chunk then commits, flushes
//! the buffered events of its committed entities and releases their locks.
//! Entities whose pipeline failed keep their error lock and stay out of the
//! commit. Read/process/write failures go through the [`ErrorSkipListener`].

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::hooks::HookRegistry;
use super::listener::{ChunkFailure, ErrorSkipListener, SkipDecision};
use super::pipeline::{PipelineExecutor, PipelineOutcome, ResolvedPipeline};
use super::run_context::{ContextScope, RunContext};
use super::run_registry::{Counter, JobRunRegistry, RunHandle};
use crate::config::{CobConfig, ConfigResult, FaultTolerance};
use crate::constants::context_keys;
use crate::error::{CobError, Result};
use crate::events::PendingEvents;
use crate::locking::LockError;
use crate::logging::log_run_operation;
use crate::models::{CobEntity, EntityId, JobRunId, JobRunStatus, LockOwner};
use crate::repository::{CandidateSelector, EntityRepository, EntityTransaction};

/// Chunking and fault-tolerance settings of the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub chunk_size: usize,
    pub job_chunk_sizes: HashMap<String, usize>,
    pub worker_count: usize,
    pub fault_tolerance: FaultTolerance,
}

impl BatchSettings {
    pub fn new(chunk_size: usize, worker_count: usize, fault_tolerance: FaultTolerance) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            job_chunk_sizes: HashMap::new(),
            worker_count: worker_count.max(1),
            fault_tolerance,
        }
    }

    pub fn from_config(config: &CobConfig) -> ConfigResult<Self> {
        let mut settings = Self::new(
            config.batch.chunk_size,
            config.batch.worker_count,
            config.fault_tolerance()?,
        );
        for job in &config.jobs {
            if let Some(chunk_size) = job.chunk_size {
                settings.job_chunk_sizes.insert(job.name.clone(), chunk_size);
            }
        }
        Ok(settings)
    }

    pub fn chunk_size_for(&self, job_name: &str) -> usize {
        self.job_chunk_sizes
            .get(job_name)
            .copied()
            .unwrap_or(self.chunk_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Committed,
    Failed,
    NotStarted,
}

/// An entity saved in the chunk transaction, waiting for commit
struct Staged<E> {
    entity_id: EntityId,
    entity: E,
    events: PendingEvents,
}

/// State shared by the chunk workers of one run
struct RunScope<'a, E: CobEntity> {
    pipeline: &'a ResolvedPipeline<E>,
    handle: &'a RunHandle,
    context: &'a RunContext,
    listener: &'a ErrorSkipListener,
    escalated: &'a AtomicBool,
}

impl<E: CobEntity> RunScope<'_, E> {
    fn escalate(&self, reason: String) {
        error!(run_id = %self.handle.run_id(), reason = %reason, "Run failure escalated");
        self.handle.note_failure(reason);
        self.escalated.store(true, Ordering::SeqCst);
    }

    fn should_stop(&self) -> bool {
        self.escalated.load(Ordering::SeqCst) || self.handle.is_cancel_requested()
    }
}

pub struct BatchRunner<E: CobEntity> {
    executor: Arc<PipelineExecutor<E>>,
    repository: Arc<dyn EntityRepository<E>>,
    selector: Arc<dyn CandidateSelector>,
    hooks: HookRegistry,
    runs: Arc<JobRunRegistry>,
    settings: BatchSettings,
}

impl<E: CobEntity> BatchRunner<E> {
    pub fn new(
        executor: Arc<PipelineExecutor<E>>,
        repository: Arc<dyn EntityRepository<E>>,
        selector: Arc<dyn CandidateSelector>,
        hooks: HookRegistry,
        runs: Arc<JobRunRegistry>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            executor,
            repository,
            selector,
            hooks,
            runs,
            settings,
        }
    }

    pub fn runs(&self) -> &Arc<JobRunRegistry> {
        &self.runs
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    pub fn selector(&self) -> &Arc<dyn CandidateSelector> {
        &self.selector
    }

    pub async fn run(&self, job_name: &str, business_date: NaiveDate) -> Result<JobRunId> {
        self.run_with_context(job_name, business_date, RunContext::new(ContextScope::Job))
            .await
    }

    /// Run `job_name` for `business_date`, seeding the job context with
    /// `base` (request identifiers, tenant). The returned id identifies the run
    /// whatever its final status; `Err` means the run never started, including
    /// when another run of the same job is still live.
    #[instrument(skip(self, base))]
    pub async fn run_with_context(
        &self,
        job_name: &str,
        business_date: NaiveDate,
        base: RunContext,
    ) -> Result<JobRunId> {
        let pipeline = self.executor.resolve(job_name)?;

        let active = self
            .runs
            .try_start(job_name, business_date)
            .map_err(|live| CobError::JobAlreadyRunning {
                job_name: job_name.to_string(),
                run_id: live,
            })?;
        let handle = active.handle();
        let run_id = handle.run_id();
        log_run_operation("start", run_id, job_name, "running", None);

        let mut context = RunContext::for_job(job_name, business_date)
            .with(context_keys::RUN_ID, run_id);
        self.executor.propagator().propagate(&base, &mut context);

        let status = self.execute_run(&pipeline, handle, &mut context).await;
        handle.finish(status);

        let summary = handle.summary();
        for hook in self.hooks.hooks_for(job_name) {
            if let Err(e) = hook.after_job(&context, &summary).await {
                warn!(run_id = %run_id, hook = hook.name(), error = %e, "After-job hook failed");
                handle.incr(Counter::HookErrors);
            }
        }

        let summary = handle.summary();
        info!(
            run_id = %run_id,
            job_name,
            status = ?summary.status,
            candidates = summary.counters.candidates,
            succeeded = summary.counters.succeeded,
            step_failures = summary.counters.step_failures,
            skipped = summary.counters.skipped,
            lock_conflicts = summary.counters.lock_conflicts,
            "Batch run finished"
        );
        log_run_operation(
            "finish",
            run_id,
            job_name,
            &format!("{:?}", summary.status).to_lowercase(),
            summary.failure_reason.as_deref(),
        );

        Ok(run_id)
    }

    async fn execute_run(
        &self,
        pipeline: &ResolvedPipeline<E>,
        handle: &RunHandle,
        context: &mut RunContext,
    ) -> JobRunStatus {
        for hook in self.hooks.hooks_for(pipeline.job_name()) {
            if let Err(e) = hook.before_job(context).await {
                handle.note_failure(e.to_string());
                return JobRunStatus::Failed;
            }
        }

        let business_date = handle.business_date();
        let candidates = match self.selector.select_candidates(business_date).await {
            Ok(candidates) => candidates,
            Err(e) => {
                handle.note_failure(format!("Candidate selection failed: {e}"));
                return JobRunStatus::Failed;
            }
        };
        handle.add(Counter::Candidates, candidates.len() as u64);

        let chunk_size = self.settings.chunk_size_for(pipeline.job_name());
        let chunks: Vec<Vec<EntityId>> = candidates
            .chunks(chunk_size)
            .map(<[EntityId]>::to_vec)
            .collect();
        debug!(
            candidates = candidates.len(),
            chunks = chunks.len(),
            chunk_size,
            workers = self.settings.worker_count,
            "Partitioned candidates"
        );

        let listener = ErrorSkipListener::new(
            Arc::clone(self.executor.locks()),
            self.settings.fault_tolerance,
            LockOwner::Scheduled,
        );
        let escalated = AtomicBool::new(false);
        let scope = &RunScope {
            pipeline,
            handle,
            context: &*context,
            listener: &listener,
            escalated: &escalated,
        };

        let outcomes: Vec<ChunkOutcome> = stream::iter(chunks.into_iter().enumerate())
            .map(move |(index, ids)| self.process_chunk(scope, index, ids))
            .buffer_unordered(self.settings.worker_count)
            .collect()
            .await;

        if escalated.load(Ordering::SeqCst) {
            JobRunStatus::Failed
        } else if outcomes.contains(&ChunkOutcome::NotStarted) {
            JobRunStatus::Cancelled
        } else {
            JobRunStatus::Completed
        }
    }

    #[instrument(skip(self, scope, ids), fields(run_id = %scope.handle.run_id(), chunk = index))]
    async fn process_chunk(
        &self,
        scope: &RunScope<'_, E>,
        index: usize,
        ids: Vec<EntityId>,
    ) -> ChunkOutcome {
        if scope.should_stop() {
            return ChunkOutcome::NotStarted;
        }

        let mut chunk_context =
            RunContext::new(ContextScope::Chunk).with(context_keys::CHUNK_INDEX, index as i64);
        self.executor
            .propagator()
            .propagate(scope.context, &mut chunk_context);

        let mut tx = match self.repository.begin().await {
            Ok(tx) => tx,
            Err(e) => {
                scope.handle.incr(Counter::ChunksFailed);
                scope.escalate(format!("Chunk {index} could not open a transaction: {e}"));
                return ChunkOutcome::Failed;
            }
        };

        let mut staged: Vec<Staged<E>> = Vec::with_capacity(ids.len());
        for entity_id in ids {
            let item = self
                .process_item(scope, &mut tx, &chunk_context, entity_id)
                .await;
            match item {
                Ok(Some(entry)) => staged.push(entry),
                Ok(None) => {}
                Err(failure) => match scope.listener.on_failure(&failure).await {
                    SkipDecision::Skip => scope.handle.incr(Counter::Skipped),
                    SkipDecision::Fail => {
                        if let Err(e) = tx.rollback().await {
                            warn!(error = %e, "Rollback of failed chunk failed");
                        }
                        self.fail_staged(scope, staged, index).await;
                        scope.escalate(failure.to_string());
                        return ChunkOutcome::Failed;
                    }
                },
            }
        }

        match tx.commit().await {
            Ok(()) => {
                for entry in staged {
                    self.finalize(scope, entry).await;
                }
                scope.handle.incr(Counter::ChunksCommitted);
                ChunkOutcome::Committed
            }
            Err(e) => {
                warn!(chunk = index, error = %e, "Chunk commit failed");
                self.retry_individually(scope, staged, index).await
            }
        }
    }

    /// Lock, read, run and save one entity inside the chunk transaction.
    /// `Ok(None)` means the entity is not part of the commit but needs no
    /// further handling (lock conflict or recorded step failure).
    async fn process_item(
        &self,
        scope: &RunScope<'_, E>,
        tx: &mut Box<dyn EntityTransaction<E>>,
        chunk_context: &RunContext,
        entity_id: EntityId,
    ) -> std::result::Result<Option<Staged<E>>, ChunkFailure> {
        let business_date = scope.handle.business_date();

        match self
            .executor
            .locks()
            .try_acquire(entity_id, LockOwner::Scheduled, Some(business_date))
            .await
        {
            Ok(_) => {}
            Err(LockError::Conflict { held_by, .. }) => {
                debug!(entity_id, held_by = %held_by, "Entity held by another owner, skipping");
                scope.handle.incr(Counter::LockConflicts);
                return Ok(None);
            }
            Err(LockError::Store(e)) => {
                return Err(ChunkFailure::Process {
                    entity_id,
                    message: e.to_string(),
                })
            }
        }

        let entity = tx.load(entity_id).await.map_err(|e| ChunkFailure::Read {
            entity_id,
            message: e.to_string(),
        })?;

        let completed = entity.completed_steps(business_date);
        let entity_context = self.executor.entity_context(chunk_context, entity_id);
        let outcome = self
            .executor
            .execute(
                scope.pipeline,
                entity,
                &entity_context,
                LockOwner::Scheduled,
                &completed,
            )
            .await
            .map_err(|e| ChunkFailure::Process {
                entity_id,
                message: e.to_string(),
            })?;

        match outcome {
            PipelineOutcome::Completed { entity, events, .. } => {
                tx.save(entity.clone())
                    .await
                    .map_err(|e| ChunkFailure::Write {
                        entity_id,
                        message: e.to_string(),
                    })?;
                Ok(Some(Staged {
                    entity_id,
                    entity,
                    events,
                }))
            }
            PipelineOutcome::Failed { .. } => {
                scope.handle.incr(Counter::StepFailures);
                Ok(None)
            }
        }
    }

    /// Publish the committed entity's events, then release its lock
    async fn finalize(&self, scope: &RunScope<'_, E>, entry: Staged<E>) {
        if let Err(e) = entry.events.flush().await {
            warn!(entity_id = entry.entity_id, error = %e, "Failed to publish business events");
        }
        if let Err(e) = self
            .executor
            .locks()
            .release(entry.entity_id, LockOwner::Scheduled)
            .await
        {
            warn!(entity_id = entry.entity_id, error = %e, "Failed to release lock after commit");
        }
        scope.handle.incr(Counter::Succeeded);
    }

    /// After a failed chunk commit, save each staged entity in its own
    /// transaction so the offending one is identified. Without a skip policy
    /// the chunk fails and every staged entity gets an error record.
    async fn retry_individually(
        &self,
        scope: &RunScope<'_, E>,
        staged: Vec<Staged<E>>,
        index: usize,
    ) -> ChunkOutcome {
        if scope.listener.policy() == FaultTolerance::FailFast {
            self.fail_staged(scope, staged, index).await;
            scope.escalate(format!("Chunk {index} failed to commit"));
            return ChunkOutcome::Failed;
        }

        let mut remaining = staged.into_iter();
        while let Some(entry) = remaining.next() {
            match self.save_alone(&entry).await {
                Ok(()) => self.finalize(scope, entry).await,
                Err(failure) => match scope.listener.on_failure(&failure).await {
                    SkipDecision::Skip => scope.handle.incr(Counter::Skipped),
                    SkipDecision::Fail => {
                        self.fail_staged(scope, remaining.collect(), index).await;
                        scope.escalate(failure.to_string());
                        return ChunkOutcome::Failed;
                    }
                },
            }
        }

        scope.handle.incr(Counter::ChunksCommitted);
        ChunkOutcome::Committed
    }

    async fn save_alone(&self, entry: &Staged<E>) -> std::result::Result<(), ChunkFailure> {
        let write_failure = |message: String| ChunkFailure::Write {
            entity_id: entry.entity_id,
            message,
        };
        let mut tx = self
            .repository
            .begin()
            .await
            .map_err(|e| write_failure(e.to_string()))?;
        tx.save(entry.entity.clone())
            .await
            .map_err(|e| write_failure(e.to_string()))?;
        tx.commit().await.map_err(|e| write_failure(e.to_string()))
    }

    /// Record a chunk-level failure on every staged entity; their work was
    /// rolled back and their events are discarded
    async fn fail_staged(&self, scope: &RunScope<'_, E>, staged: Vec<Staged<E>>, index: usize) {
        scope.handle.incr(Counter::ChunksFailed);
        let message = format!("Chunk {index} of run {} was rolled back", scope.handle.run_id());
        for entry in staged {
            if let Err(e) = self
                .executor
                .locks()
                .record_error(entry.entity_id, LockOwner::Scheduled, &message, None)
                .await
            {
                error!(entity_id = entry.entity_id, error = %e, "Failed to record chunk failure");
            }
        }
    }
}
