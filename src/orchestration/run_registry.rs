//! In-process record of batch runs with cooperative cancellation.

use chrono::{DateTime, NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::{JobRunId, JobRunStatus, JobRunSummary, RunCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Candidates,
    Succeeded,
    StepFailures,
    Skipped,
    LockConflicts,
    ChunksCommitted,
    ChunksFailed,
    HookErrors,
}

#[derive(Debug, Default)]
struct LiveCounters {
    candidates: AtomicU64,
    succeeded: AtomicU64,
    step_failures: AtomicU64,
    skipped: AtomicU64,
    lock_conflicts: AtomicU64,
    chunks_committed: AtomicU64,
    chunks_failed: AtomicU64,
    hook_errors: AtomicU64,
}

impl LiveCounters {
    fn slot(&self, counter: Counter) -> &AtomicU64 {
        match counter {
            Counter::Candidates => &self.candidates,
            Counter::Succeeded => &self.succeeded,
            Counter::StepFailures => &self.step_failures,
            Counter::Skipped => &self.skipped,
            Counter::LockConflicts => &self.lock_conflicts,
            Counter::ChunksCommitted => &self.chunks_committed,
            Counter::ChunksFailed => &self.chunks_failed,
            Counter::HookErrors => &self.hook_errors,
        }
    }

    fn snapshot(&self) -> RunCounters {
        RunCounters {
            candidates: self.candidates.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            step_failures: self.step_failures.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            lock_conflicts: self.lock_conflicts.load(Ordering::SeqCst),
            chunks_committed: self.chunks_committed.load(Ordering::SeqCst),
            chunks_failed: self.chunks_failed.load(Ordering::SeqCst),
            hook_errors: self.hook_errors.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug)]
struct RunState {
    status: JobRunStatus,
    finished_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
}

/// Live view of one run, shared between the runner and operators
#[derive(Debug)]
pub struct RunHandle {
    run_id: JobRunId,
    job_name: String,
    business_date: NaiveDate,
    started_at: DateTime<Utc>,
    counters: LiveCounters,
    cancel_requested: AtomicBool,
    state: Mutex<RunState>,
}

impl RunHandle {
    fn new(job_name: &str, business_date: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            job_name: job_name.to_string(),
            business_date,
            started_at: Utc::now(),
            counters: LiveCounters::default(),
            cancel_requested: AtomicBool::new(false),
            state: Mutex::new(RunState {
                status: JobRunStatus::Running,
                finished_at: None,
                failure_reason: None,
            }),
        }
    }

    pub fn run_id(&self) -> JobRunId {
        self.run_id
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn business_date(&self) -> NaiveDate {
        self.business_date
    }

    pub fn add(&self, counter: Counter, amount: u64) {
        self.counters.slot(counter).fetch_add(amount, Ordering::SeqCst);
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn status(&self) -> JobRunStatus {
        self.state.lock().status
    }

    /// Request cooperative cancellation; honoured at the next chunk boundary
    pub fn request_cancel(&self) -> bool {
        if self.status().is_terminal() {
            return false;
        }
        self.cancel_requested.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Record the first failure reason; later reasons are dropped
    pub fn note_failure(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.failure_reason.is_none() {
            state.failure_reason = Some(reason.into());
        }
    }

    pub fn failure_reason(&self) -> Option<String> {
        self.state.lock().failure_reason.clone()
    }

    pub fn finish(&self, status: JobRunStatus) {
        let mut state = self.state.lock();
        state.status = status;
        state.finished_at = Some(Utc::now());
    }

    pub fn summary(&self) -> JobRunSummary {
        let state = self.state.lock();
        JobRunSummary {
            run_id: self.run_id,
            job_name: self.job_name.clone(),
            business_date: self.business_date,
            status: state.status,
            started_at: self.started_at,
            finished_at: state.finished_at,
            counters: self.counters.snapshot(),
            failure_reason: state.failure_reason.clone(),
        }
    }
}

/// Holds a job's live-run slot; the slot frees when this is dropped
#[derive(Debug)]
pub struct ActiveRun<'a> {
    registry: &'a JobRunRegistry,
    handle: Arc<RunHandle>,
}

impl ActiveRun<'_> {
    pub fn handle(&self) -> &RunHandle {
        &self.handle
    }
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        let run_id = self.handle.run_id;
        self.registry
            .active
            .remove_if(&self.handle.job_name, |_, live| *live == run_id);
    }
}

#[derive(Debug, Default)]
pub struct JobRunRegistry {
    runs: DashMap<JobRunId, Arc<RunHandle>>,
    /// At most one live run per job name
    active: DashMap<String, JobRunId>,
}

impl JobRunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run of `job_name` unless one is already live. `Err`
    /// carries the id of the live run.
    pub fn try_start(
        &self,
        job_name: &str,
        business_date: NaiveDate,
    ) -> Result<ActiveRun<'_>, JobRunId> {
        match self.active.entry(job_name.to_string()) {
            Entry::Occupied(live) => Err(*live.get()),
            Entry::Vacant(slot) => {
                let handle = Arc::new(RunHandle::new(job_name, business_date));
                slot.insert(handle.run_id);
                self.runs.insert(handle.run_id, Arc::clone(&handle));
                Ok(ActiveRun {
                    registry: self,
                    handle,
                })
            }
        }
    }

    /// Id of the live run of `job_name`, if any
    pub fn live_run(&self, job_name: &str) -> Option<JobRunId> {
        self.active.get(job_name).map(|entry| *entry.value())
    }

    pub fn get(&self, run_id: JobRunId) -> Option<Arc<RunHandle>> {
        self.runs.get(&run_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn summary(&self, run_id: JobRunId) -> Option<JobRunSummary> {
        self.get(run_id).map(|handle| handle.summary())
    }

    /// `false` when the run is unknown or already finished
    pub fn cancel(&self, run_id: JobRunId) -> bool {
        self.get(run_id)
            .is_some_and(|handle| handle.request_cancel())
    }

    /// Every known run, oldest first
    pub fn list(&self) -> Vec<JobRunSummary> {
        let mut runs: Vec<JobRunSummary> =
            self.runs.iter().map(|entry| entry.value().summary()).collect();
        runs.sort_by_key(|summary| summary.started_at);
        runs
    }

    pub fn running(&self) -> usize {
        self.runs
            .iter()
            .filter(|entry| entry.value().status() == JobRunStatus::Running)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 3, 1).unwrap()
    }

    #[test]
    fn test_counters_and_summary() {
        let registry = JobRunRegistry::new();
        let run = registry.try_start("JOB", date()).unwrap();
        let handle = run.handle();
        handle.add(Counter::Candidates, 10);
        handle.incr(Counter::Succeeded);
        handle.incr(Counter::StepFailures);

        let summary = registry.summary(handle.run_id()).unwrap();
        assert_eq!(summary.status, JobRunStatus::Running);
        assert_eq!(summary.counters.candidates, 10);
        assert_eq!(summary.counters.entities_with_errors(), 1);
        assert_eq!(registry.running(), 1);
    }

    #[test]
    fn test_cancel_only_running_runs() {
        let registry = JobRunRegistry::new();
        let run = registry.try_start("JOB", date()).unwrap();
        let handle = run.handle();
        assert!(registry.cancel(handle.run_id()));
        assert!(handle.is_cancel_requested());

        handle.finish(JobRunStatus::Cancelled);
        assert!(!registry.cancel(handle.run_id()));
        assert!(!registry.cancel(Uuid::new_v4()));
        assert!(registry.summary(handle.run_id()).unwrap().finished_at.is_some());
    }

    #[test]
    fn test_first_failure_reason_wins() {
        let registry = JobRunRegistry::new();
        let run = registry.try_start("JOB", date()).unwrap();
        let handle = run.handle();
        handle.note_failure("first");
        handle.note_failure("second");
        assert_eq!(handle.failure_reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_one_live_run_per_job() {
        let registry = JobRunRegistry::new();
        let first = registry.try_start("JOB", date()).unwrap();
        let first_id = first.handle().run_id();

        assert_eq!(registry.try_start("JOB", date()).unwrap_err(), first_id);
        assert_eq!(registry.live_run("JOB"), Some(first_id));
        let other = registry.try_start("OTHER", date()).unwrap();
        assert_ne!(other.handle().run_id(), first_id);

        first.handle().finish(JobRunStatus::Completed);
        drop(first);
        assert_eq!(registry.live_run("JOB"), None);
        let second = registry.try_start("JOB", date()).unwrap();
        assert_ne!(second.handle().run_id(), first_id);
        assert_eq!(registry.list().len(), 3);
    }
}
