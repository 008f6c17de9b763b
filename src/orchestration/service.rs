//! # COB Service
//!
//! Operational facade over the close-of-business core, assembled once at
//! start-up from configuration and the host's registration tables.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cob_core::config::ConfigManager;
//! use cob_core::models::Loan;
//! use cob_core::orchestration::{CobService, RequestContext};
//! use cob_core::repository::InMemoryEntityRepository;
//! use cob_core::steps::BusinessStepRegistry;
//!
//! # async fn example(steps: BusinessStepRegistry<Loan>) -> cob_core::Result<()> {
//! let manager = ConfigManager::load()?;
//! let loans = Arc::new(InMemoryEntityRepository::<Loan>::new());
//! let service = CobService::builder(manager.config().clone())
//!     .steps(steps)
//!     .repository(loans.clone())
//!     .selector(loans)
//!     .build()?;
//!
//! let run_id = service.run_job("LOAN_CLOSE_OF_BUSINESS").await?;
//! let summary = service.run_status(run_id)?;
//! # Ok(())
//! # }
//! ```

use chrono::{Days, NaiveDate, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use super::batch_runner::{BatchRunner, BatchSettings};
use super::catch_up::{CatchUpReport, CatchUpRunner};
use super::hooks::HookRegistry;
use super::inline_runner::{InlineError, InlineOutcome, InlineRunner};
use super::pipeline::PipelineExecutor;
use super::run_context::{ContextScope, RunContext};
use super::run_registry::JobRunRegistry;
use crate::config::CobConfig;
use crate::constants::context_keys;
use crate::error::{CobError, Result};
use crate::events::{EventEmitter, EventSink, TracingEventSink};
use crate::locking::{InMemoryLockStore, LockManager, LockPolicy, LockStore};
use crate::models::{CobEntity, EntityId, EntityLock, ExecutionMapRegistry, JobRunId, JobRunSummary};
use crate::repository::{CandidateSelector, EntityRepository};
use crate::steps::BusinessStepRegistry;

/// Identifiers of the request or trigger that started a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub correlation_id: Option<String>,
    pub tenant_id: Option<String>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// Job-scope context seeded with these identifiers
    pub fn to_run_context(&self) -> RunContext {
        let mut context = RunContext::new(ContextScope::Job);
        if let Some(correlation_id) = &self.correlation_id {
            context.set(context_keys::CORRELATION_ID, correlation_id.as_str());
        }
        if let Some(tenant_id) = &self.tenant_id {
            context.set(context_keys::TENANT_ID, tenant_id.as_str());
        }
        context
    }
}

pub trait BusinessDateSource: Send + Sync {
    fn business_date(&self) -> NaiveDate;

    /// The date close-of-business processes: the day before the business date
    fn cob_date(&self) -> NaiveDate {
        let business_date = self.business_date();
        business_date
            .checked_sub_days(Days::new(1))
            .unwrap_or(business_date)
    }
}

/// Business date held in memory and moved explicitly
#[derive(Debug)]
pub struct FixedBusinessDate {
    date: RwLock<NaiveDate>,
}

impl FixedBusinessDate {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date: RwLock::new(date),
        }
    }

    pub fn set(&self, date: NaiveDate) {
        *self.date.write() = date;
    }
}

impl BusinessDateSource for FixedBusinessDate {
    fn business_date(&self) -> NaiveDate {
        *self.date.read()
    }
}

/// Today's UTC calendar date
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBusinessDate;

impl BusinessDateSource for SystemBusinessDate {
    fn business_date(&self) -> NaiveDate {
        Utc::now().date_naive()
    }
}

pub struct CobService<E: CobEntity> {
    config: Arc<CobConfig>,
    locks: Arc<LockManager>,
    executor: Arc<PipelineExecutor<E>>,
    batch: Arc<BatchRunner<E>>,
    inline: InlineRunner<E>,
    catch_up: CatchUpRunner<E>,
    runs: Arc<JobRunRegistry>,
    dates: Arc<dyn BusinessDateSource>,
}

impl<E: CobEntity> CobService<E> {
    pub fn builder(config: CobConfig) -> CobServiceBuilder<E> {
        CobServiceBuilder::new(config)
    }

    pub fn config(&self) -> &CobConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn executor(&self) -> &Arc<PipelineExecutor<E>> {
        &self.executor
    }

    pub fn runs(&self) -> &Arc<JobRunRegistry> {
        &self.runs
    }

    pub fn cob_date(&self) -> NaiveDate {
        self.dates.cob_date()
    }

    /// Run `job_name` for the current COB date
    pub async fn run_job(&self, job_name: &str) -> Result<JobRunId> {
        self.run_job_for(job_name, self.cob_date(), &RequestContext::default())
            .await
    }

    pub async fn run_job_for(
        &self,
        job_name: &str,
        business_date: NaiveDate,
        request: &RequestContext,
    ) -> Result<JobRunId> {
        self.batch
            .run_with_context(job_name, business_date, request.to_run_context())
            .await
    }

    pub async fn run_inline(
        &self,
        entity_id: EntityId,
        job_name: &str,
        request: &RequestContext,
    ) -> std::result::Result<InlineOutcome, InlineError> {
        self.inline
            .run(entity_id, job_name, self.cob_date(), &request.to_run_context())
            .await
    }

    pub async fn guard_entity(
        &self,
        entity_id: EntityId,
        job_name: &str,
        request: &RequestContext,
    ) -> std::result::Result<InlineOutcome, InlineError> {
        self.inline
            .guard_entity(entity_id, job_name, self.cob_date(), &request.to_run_context())
            .await
    }

    pub async fn run_inline_many(
        &self,
        entity_ids: &[EntityId],
        job_name: &str,
        request: &RequestContext,
    ) -> Vec<(EntityId, std::result::Result<InlineOutcome, InlineError>)> {
        self.inline
            .run_many(entity_ids, job_name, self.cob_date(), &request.to_run_context())
            .await
    }

    pub async fn get_lock_status(&self, entity_id: EntityId) -> Result<Option<EntityLock>> {
        Ok(self.locks.find_lock(entity_id).await?)
    }

    pub async fn failed_locks(&self) -> Result<Vec<EntityLock>> {
        Ok(self.locks.list_failed_locks().await?)
    }

    pub fn run_status(&self, run_id: JobRunId) -> Result<JobRunSummary> {
        self.runs
            .summary(run_id)
            .ok_or(CobError::RunNotFound(run_id))
    }

    pub fn list_runs(&self) -> Vec<JobRunSummary> {
        self.runs.list()
    }

    /// Request cancellation at the next chunk boundary. `Ok(false)` when the
    /// run already finished.
    pub fn cancel_run(&self, run_id: JobRunId) -> Result<bool> {
        if self.runs.get(run_id).is_none() {
            return Err(CobError::RunNotFound(run_id));
        }
        Ok(self.runs.cancel(run_id))
    }

    pub async fn catch_up(&self, job_name: &str) -> Result<CatchUpReport> {
        self.catch_up
            .run(job_name, self.cob_date(), RunContext::new(ContextScope::Job))
            .await
    }

    pub fn is_catch_up_running(&self) -> bool {
        self.catch_up.is_running()
    }
}

pub struct CobServiceBuilder<E: CobEntity> {
    config: CobConfig,
    steps: BusinessStepRegistry<E>,
    hooks: HookRegistry,
    repository: Option<Arc<dyn EntityRepository<E>>>,
    selector: Option<Arc<dyn CandidateSelector>>,
    lock_store: Option<Arc<dyn LockStore>>,
    sink: Option<Arc<dyn EventSink>>,
    dates: Option<Arc<dyn BusinessDateSource>>,
    runs: Option<Arc<JobRunRegistry>>,
}

impl<E: CobEntity> CobServiceBuilder<E> {
    pub fn new(config: CobConfig) -> Self {
        Self {
            config,
            steps: BusinessStepRegistry::new(),
            hooks: HookRegistry::empty(),
            repository: None,
            selector: None,
            lock_store: None,
            sink: None,
            dates: None,
            runs: None,
        }
    }

    pub fn steps(mut self, steps: BusinessStepRegistry<E>) -> Self {
        self.steps = steps;
        self
    }

    pub fn hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn repository(mut self, repository: Arc<dyn EntityRepository<E>>) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn selector(mut self, selector: Arc<dyn CandidateSelector>) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn lock_store(mut self, store: Arc<dyn LockStore>) -> Self {
        self.lock_store = Some(store);
        self
    }

    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn business_dates(mut self, dates: Arc<dyn BusinessDateSource>) -> Self {
        self.dates = Some(dates);
        self
    }

    pub fn run_registry(mut self, runs: Arc<JobRunRegistry>) -> Self {
        self.runs = Some(runs);
        self
    }

    /// Use the PostgreSQL lock store described by `database` in the
    /// configuration, if present
    #[cfg(feature = "postgres")]
    pub async fn connect_lock_store(mut self) -> Result<Self> {
        if let Some(database) = &self.config.database {
            let connection = crate::database::DatabaseConnection::connect(database).await?;
            self.lock_store = Some(Arc::new(crate::locking::PgLockStore::new(
                connection.pool().clone(),
            )));
        }
        Ok(self)
    }

    pub fn build(self) -> Result<CobService<E>> {
        self.config.validate()?;

        let repository = self.repository.ok_or_else(|| {
            CobError::InvalidState("an entity repository must be registered".to_string())
        })?;
        let selector = self.selector.ok_or_else(|| {
            CobError::InvalidState("a candidate selector must be registered".to_string())
        })?;

        let maps = Arc::new(ExecutionMapRegistry::from_jobs(&self.config.jobs)?);
        let store: Arc<dyn LockStore> = match self.lock_store {
            Some(store) => store,
            None => Arc::new(InMemoryLockStore::new()),
        };
        let locks = Arc::new(LockManager::new(
            store,
            LockPolicy::from(&self.config.locking),
        ));
        let sink: Arc<dyn EventSink> = match self.sink {
            Some(sink) => sink,
            None => Arc::new(TracingEventSink),
        };
        let emitter = EventEmitter::new(sink, self.config.events.bulk_mode);

        let executor = Arc::new(PipelineExecutor::new(
            Arc::new(self.steps),
            maps,
            Arc::clone(&locks),
            emitter,
        ));
        executor.validate_all()?;

        let runs = self.runs.unwrap_or_default();
        let batch = Arc::new(BatchRunner::new(
            Arc::clone(&executor),
            Arc::clone(&repository),
            selector,
            self.hooks,
            Arc::clone(&runs),
            BatchSettings::from_config(&self.config)?,
        ));
        let inline = InlineRunner::new(Arc::clone(&executor), repository);
        let catch_up = CatchUpRunner::new(Arc::clone(&batch));
        let dates: Arc<dyn BusinessDateSource> = match self.dates {
            Some(dates) => dates,
            None => Arc::new(SystemBusinessDate),
        };

        info!(
            jobs = self.config.jobs.len(),
            bulk_events = self.config.events.bulk_mode,
            inline_overrule = ?self.config.locking.inline_overrule,
            "COB service assembled"
        );

        Ok(CobService {
            config: Arc::new(self.config),
            locks,
            executor,
            batch,
            inline,
            catch_up,
            runs,
            dates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cob_date_is_day_before_business_date() {
        let dates = FixedBusinessDate::new(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(dates.cob_date(), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        dates.set(NaiveDate::from_ymd_opt(2024, 3, 2).unwrap());
        assert_eq!(dates.cob_date(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_request_context_seeds_identifiers() {
        let context = RequestContext::new()
            .with_correlation_id("req-1")
            .with_tenant("default")
            .to_run_context();
        assert_eq!(context.text(context_keys::CORRELATION_ID), Some("req-1"));
        assert_eq!(context.text(context_keys::TENANT_ID), Some("default"));
    }
}
