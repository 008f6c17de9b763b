//! Shared fixtures for the integration tests: scripted business steps, a
//! repository wrapper that injects infrastructure failures, and builders for
//! configuration and services.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::NaiveDate;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use uuid::Uuid;

use cob_core::config::{
    BatchConfig, CobConfig, EventsConfig, FaultToleranceConfig, FaultToleranceMode, JobConfig,
    LockingConfig, StepEntry,
};
use cob_core::constants::context_keys;
use cob_core::events::{BusinessEvent, InMemoryEventSink};
use cob_core::locking::{InMemoryLockStore, OverruleMode};
use cob_core::models::{CobEntity, EntityId, Loan};
use cob_core::orchestration::{CobService, FixedBusinessDate, HookRegistry, JobRunRegistry};
use cob_core::repository::{
    CandidateSelector, EntityRepository, EntityTransaction, InMemoryEntityRepository,
    RepositoryError,
};
use cob_core::steps::{BusinessStep, BusinessStepRegistry, StepContext, StepFailure};

pub const JOB: &str = "LOAN_CLOSE_OF_BUSINESS";

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Shared log of `(entity_id, step, business_date)` in execution order
pub type ExecutionLog = Arc<Mutex<Vec<(EntityId, String, NaiveDate)>>>;

pub fn execution_log() -> ExecutionLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Steps run for one entity, in order
pub fn steps_for(log: &ExecutionLog, entity_id: EntityId) -> Vec<String> {
    log.lock()
        .iter()
        .filter(|(id, _, _)| *id == entity_id)
        .map(|(_, step, _)| step.clone())
        .collect()
}

/// Business dates one entity was processed for by `step`
pub fn dates_for(log: &ExecutionLog, entity_id: EntityId, step: &str) -> Vec<NaiveDate> {
    log.lock()
        .iter()
        .filter(|(id, name, _)| *id == entity_id && name == step)
        .map(|(_, _, date)| *date)
        .collect()
}

/// Records every invocation; fails for the configured entity ids
pub struct RecordingStep {
    name: String,
    log: ExecutionLog,
    fail_for: HashSet<EntityId>,
    emit: bool,
}

impl RecordingStep {
    pub fn new(name: &str, log: &ExecutionLog) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            fail_for: HashSet::new(),
            emit: false,
        }
    }

    pub fn failing_for(mut self, ids: impl IntoIterator<Item = EntityId>) -> Self {
        self.fail_for.extend(ids);
        self
    }

    pub fn emitting(mut self) -> Self {
        self.emit = true;
        self
    }
}

#[async_trait]
impl BusinessStep<Loan> for RecordingStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, mut loan: Loan, context: &StepContext<'_>) -> Result<Loan, StepFailure> {
        let business_date = context.business_date()?;
        self.log
            .lock()
            .push((loan.id, self.name.clone(), business_date));

        if self.emit {
            context
                .emit(BusinessEvent::new(
                    loan.id,
                    format!("{}_DONE", self.name),
                    business_date,
                    json!({ "step": self.name }),
                ))
                .await?;
        }

        if self.fail_for.contains(&loan.id) {
            return Err(StepFailure::new(format!(
                "{} rejected loan {}",
                self.name, loan.id
            )));
        }

        loan.days_overdue += 1;
        Ok(loan)
    }
}

/// Requests cancellation of the current run when it reaches one entity
pub struct CancellingStep {
    runs: Arc<JobRunRegistry>,
    trigger: EntityId,
}

impl CancellingStep {
    pub fn new(runs: &Arc<JobRunRegistry>, trigger: EntityId) -> Self {
        Self {
            runs: Arc::clone(runs),
            trigger,
        }
    }
}

#[async_trait]
impl BusinessStep<Loan> for CancellingStep {
    fn name(&self) -> &str {
        "CANCEL_RUN"
    }

    async fn execute(&self, loan: Loan, context: &StepContext<'_>) -> Result<Loan, StepFailure> {
        if loan.id == self.trigger {
            let run_id = context
                .run_context()
                .text(context_keys::RUN_ID)
                .and_then(|text| Uuid::parse_str(text).ok())
                .ok_or_else(|| StepFailure::new("run id missing from context"))?;
            self.runs.cancel(run_id);
        }
        Ok(loan)
    }
}

/// Parks the first step invocation until released, so a test can act while a
/// run is mid-flight
#[derive(Debug)]
pub struct Gate {
    armed: AtomicBool,
    entered: Notify,
    released: Notify,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            armed: AtomicBool::new(true),
            entered: Notify::new(),
            released: Notify::new(),
        })
    }

    /// Resolves once a step is parked at the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }
}

/// Records `"{name}:inline"` or `"{name}:batch"`; the first invocation waits
/// at the gate
pub struct GateStep {
    name: String,
    log: ExecutionLog,
    gate: Arc<Gate>,
}

impl GateStep {
    pub fn new(name: &str, log: &ExecutionLog, gate: &Arc<Gate>) -> Self {
        Self {
            name: name.to_string(),
            log: Arc::clone(log),
            gate: Arc::clone(gate),
        }
    }
}

#[async_trait]
impl BusinessStep<Loan> for GateStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, mut loan: Loan, context: &StepContext<'_>) -> Result<Loan, StepFailure> {
        let business_date = context.business_date()?;
        let path = if context.run_context().flag(context_keys::INLINE) == Some(true) {
            "inline"
        } else {
            "batch"
        };
        self.log
            .lock()
            .push((loan.id, format!("{}:{path}", self.name), business_date));

        if self.gate.armed.swap(false, Ordering::SeqCst) {
            self.gate.entered.notify_one();
            self.gate.released.notified().await;
        }

        loan.days_overdue += 1;
        Ok(loan)
    }
}

/// Failure injection around the in-memory repository
#[derive(Clone, Default)]
pub struct FaultPlan {
    pub fail_load: HashSet<EntityId>,
    pub fail_save: HashSet<EntityId>,
    /// Commits fail when they contain any of these ids
    pub fail_commit: HashSet<EntityId>,
    pub fail_selection: bool,
}

#[derive(Clone)]
pub struct FlakyRepository {
    pub inner: InMemoryEntityRepository<Loan>,
    plan: Arc<Mutex<FaultPlan>>,
}

impl FlakyRepository {
    pub fn new(inner: InMemoryEntityRepository<Loan>, plan: FaultPlan) -> Self {
        Self {
            inner,
            plan: Arc::new(Mutex::new(plan)),
        }
    }

    pub fn set_plan(&self, plan: FaultPlan) {
        *self.plan.lock() = plan;
    }
}

struct FlakyTransaction {
    inner: Box<dyn EntityTransaction<Loan>>,
    plan: FaultPlan,
    saved: HashSet<EntityId>,
}

#[async_trait]
impl EntityTransaction<Loan> for FlakyTransaction {
    async fn load(&mut self, entity_id: EntityId) -> Result<Loan, RepositoryError> {
        if self.plan.fail_load.contains(&entity_id) {
            return Err(RepositoryError::Read {
                entity_id,
                message: "row is unreadable".to_string(),
            });
        }
        self.inner.load(entity_id).await
    }

    async fn save(&mut self, entity: Loan) -> Result<(), RepositoryError> {
        let entity_id = entity.entity_id();
        if self.plan.fail_save.contains(&entity_id) {
            return Err(RepositoryError::Write {
                entity_id,
                message: "constraint violated".to_string(),
            });
        }
        self.saved.insert(entity_id);
        self.inner.save(entity).await
    }

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError> {
        if let Some(id) = self.saved.iter().find(|id| self.plan.fail_commit.contains(id)) {
            return Err(RepositoryError::Commit(format!("deferred constraint on loan {id}")));
        }
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError> {
        self.inner.rollback().await
    }
}

#[async_trait]
impl EntityRepository<Loan> for FlakyRepository {
    async fn begin(&self) -> Result<Box<dyn EntityTransaction<Loan>>, RepositoryError> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            plan: self.plan.lock().clone(),
            saved: HashSet::new(),
        }))
    }

    async fn find(&self, entity_id: EntityId) -> Result<Option<Loan>, RepositoryError> {
        self.inner.find(entity_id).await
    }
}

#[async_trait]
impl CandidateSelector for FlakyRepository {
    async fn select_candidates(
        &self,
        business_date: NaiveDate,
    ) -> Result<Vec<EntityId>, RepositoryError> {
        if self.plan.lock().fail_selection {
            return Err(RepositoryError::Backend("selection query timed out".to_string()));
        }
        self.inner.select_candidates(business_date).await
    }

    async fn oldest_last_closed_date(
        &self,
        cob_date: NaiveDate,
    ) -> Result<Option<NaiveDate>, RepositoryError> {
        self.inner.oldest_last_closed_date(cob_date).await
    }
}

pub fn fail_fast() -> FaultToleranceConfig {
    FaultToleranceConfig {
        mode: FaultToleranceMode::FailFast,
        skip_limit: None,
    }
}

pub fn skip(limit: u64) -> FaultToleranceConfig {
    FaultToleranceConfig {
        mode: FaultToleranceMode::Skip,
        skip_limit: Some(limit),
    }
}

pub fn config(steps: &[&str], chunk_size: usize, fault_tolerance: FaultToleranceConfig) -> CobConfig {
    CobConfig {
        batch: BatchConfig {
            chunk_size,
            worker_count: 1,
            fault_tolerance,
        },
        locking: LockingConfig::default(),
        events: EventsConfig {
            bulk_mode: true,
            broadcast_capacity: 16,
        },
        database: None,
        jobs: vec![JobConfig {
            name: JOB.to_string(),
            chunk_size: None,
            steps: steps
                .iter()
                .enumerate()
                .map(|(i, name)| StepEntry {
                    order: (i as u32 + 1) * 10,
                    name: (*name).to_string(),
                })
                .collect(),
        }],
    }
}

pub fn with_overrule(mut config: CobConfig, mode: OverruleMode) -> CobConfig {
    config.locking.inline_overrule = mode;
    config
}

/// Loans `1..=count`, all closed for `last_closed`
pub fn loans(count: i64, last_closed: NaiveDate) -> InMemoryEntityRepository<Loan> {
    InMemoryEntityRepository::with_entities(
        (1..=count).map(|id| Loan::new(id).with_last_closed(last_closed)),
    )
}

/// Everything a test needs to assert on after driving the service
pub struct Harness {
    pub service: CobService<Loan>,
    pub loans: InMemoryEntityRepository<Loan>,
    pub locks: Arc<InMemoryLockStore>,
    pub events: Arc<InMemoryEventSink>,
    pub dates: Arc<FixedBusinessDate>,
    pub runs: Arc<JobRunRegistry>,
}

pub struct HarnessBuilder {
    config: CobConfig,
    steps: BusinessStepRegistry<Loan>,
    hooks: HookRegistry,
    loans: InMemoryEntityRepository<Loan>,
    faults: Option<FaultPlan>,
    business_date: NaiveDate,
    runs: Arc<JobRunRegistry>,
}

impl HarnessBuilder {
    /// `business_date` is "today"; the COB date is the day before
    pub fn new(config: CobConfig, loans: InMemoryEntityRepository<Loan>, business_date: NaiveDate) -> Self {
        Self {
            config,
            steps: BusinessStepRegistry::new(),
            hooks: HookRegistry::empty(),
            loans,
            faults: None,
            business_date,
            runs: Arc::new(JobRunRegistry::new()),
        }
    }

    pub fn step(mut self, step: impl BusinessStep<Loan> + 'static) -> Self {
        self.steps = self.steps.with_step(step);
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn faults(mut self, plan: FaultPlan) -> Self {
        self.faults = Some(plan);
        self
    }

    pub fn runs(&self) -> Arc<JobRunRegistry> {
        Arc::clone(&self.runs)
    }

    pub fn build(self) -> Harness {
        let locks = Arc::new(InMemoryLockStore::new());
        let events = Arc::new(InMemoryEventSink::new());
        let dates = Arc::new(FixedBusinessDate::new(self.business_date));

        let builder = CobService::builder(self.config)
            .steps(self.steps)
            .hooks(self.hooks)
            .lock_store(locks.clone())
            .event_sink(events.clone())
            .business_dates(dates.clone())
            .run_registry(Arc::clone(&self.runs));

        let builder = match self.faults {
            Some(plan) => {
                let flaky = Arc::new(FlakyRepository::new(self.loans.clone(), plan));
                builder.repository(flaky.clone()).selector(flaky)
            }
            None => {
                let loans = Arc::new(self.loans.clone());
                builder.repository(loans.clone()).selector(loans)
            }
        };

        Harness {
            service: builder.build().expect("service should build"),
            loans: self.loans,
            locks,
            events,
            dates,
            runs: self.runs,
        }
    }
}

/// A registry with one recording step per name
pub fn recording_steps(names: &[&str], log: &ExecutionLog) -> Vec<RecordingStep> {
    names.iter().map(|name| RecordingStep::new(name, log)).collect()
}
