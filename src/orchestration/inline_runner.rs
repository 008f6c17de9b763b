//! # Inline Runner
//!
//! Brings a single entity current on demand from request-handling code. Every
//! business date between the entity's last closed date and the COB date is
//! processed in one transaction under an `Inline` lock. A failure leaves the
//! lock in place carrying the error so operators and the next scheduled run
//! see it.

use chrono::NaiveDate;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::pipeline::{PipelineExecutor, PipelineOutcome};
use super::run_context::RunContext;
use crate::constants::context_keys;
use crate::error::CobError;
use crate::events::PendingEvents;
use crate::locking::{LockError, LockGrant};
use crate::models::{CobEntity, EntityId, LockOwner};
use crate::repository::{EntityRepository, RepositoryError};

#[derive(Debug, Error)]
pub enum InlineError {
    #[error("Entity {entity_id} is locked by {held_by} processing and cannot be overruled")]
    LockedCannotOverrule {
        entity_id: EntityId,
        held_by: LockOwner,
    },

    #[error("{message}")]
    StepFailed {
        entity_id: EntityId,
        business_date: NaiveDate,
        step: String,
        message: String,
    },

    #[error("Entity {0} not found")]
    NotFound(EntityId),

    #[error(transparent)]
    Cob(#[from] CobError),
}

impl From<RepositoryError> for InlineError {
    fn from(err: RepositoryError) -> Self {
        InlineError::Cob(CobError::Repository(err))
    }
}

impl From<LockError> for InlineError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Conflict {
                entity_id, held_by, ..
            } => InlineError::LockedCannotOverrule { entity_id, held_by },
            other => InlineError::Cob(CobError::Lock(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineOutcome {
    /// Already closed for the COB date; nothing was locked or touched
    UpToDate,
    Processed {
        business_dates: Vec<NaiveDate>,
        steps_run: usize,
        events_published: usize,
    },
}

/// Business dates still to process: the day after `last_closed` through
/// `cob_date`, or just `cob_date` for an entity never closed
pub fn pending_business_dates(last_closed: Option<NaiveDate>, cob_date: NaiveDate) -> Vec<NaiveDate> {
    match last_closed {
        None => vec![cob_date],
        Some(closed) => closed
            .iter_days()
            .skip(1)
            .take_while(|date| *date <= cob_date)
            .collect(),
    }
}

pub struct InlineRunner<E: CobEntity> {
    executor: Arc<PipelineExecutor<E>>,
    repository: Arc<dyn EntityRepository<E>>,
}

impl<E: CobEntity> InlineRunner<E> {
    pub fn new(executor: Arc<PipelineExecutor<E>>, repository: Arc<dyn EntityRepository<E>>) -> Self {
        Self {
            executor,
            repository,
        }
    }

    /// Bring `entity_id` current through `cob_date`
    #[instrument(skip(self, base))]
    pub async fn run(
        &self,
        entity_id: EntityId,
        job_name: &str,
        cob_date: NaiveDate,
        base: &RunContext,
    ) -> Result<InlineOutcome, InlineError> {
        let pipeline = self.executor.resolve(job_name)?;

        let current = self
            .repository
            .find(entity_id)
            .await?
            .ok_or(InlineError::NotFound(entity_id))?;
        let dates = pending_business_dates(current.last_closed_business_date(), cob_date);
        if dates.is_empty() {
            return Ok(InlineOutcome::UpToDate);
        }

        let locks = self.executor.locks();
        let acquired = locks
            .try_acquire(entity_id, LockOwner::Inline, Some(cob_date))
            .await?;
        if acquired.grant == LockGrant::Overruled {
            info!(entity_id, "Processing inline past a scheduled lock");
        }

        let mut tx = match self.repository.begin().await {
            Ok(tx) => tx,
            Err(e) => return Err(self.record_infrastructure_failure(entity_id, e).await),
        };
        let mut entity = match tx.load(entity_id).await {
            Ok(entity) => entity,
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(entity_id, error = %rollback, "Rollback after inline load failure failed");
                }
                return Err(self.record_infrastructure_failure(entity_id, e).await);
            }
        };

        let mut pending: Option<PendingEvents> = None;
        let mut steps_run = 0;
        for business_date in &dates {
            let mut context = RunContext::for_job(job_name, *business_date)
                .with(context_keys::INLINE, true);
            self.executor.propagator().propagate(base, &mut context);
            let entity_context = self.executor.entity_context(&context, entity_id);
            let completed = entity.completed_steps(*business_date);

            match self
                .executor
                .execute(&pipeline, entity, &entity_context, LockOwner::Inline, &completed)
                .await?
            {
                PipelineOutcome::Completed {
                    entity: next,
                    events,
                    steps_run: ran,
                } => {
                    entity = next;
                    steps_run += ran;
                    match pending.as_mut() {
                        Some(all) => all.merge(events),
                        None => pending = Some(events),
                    }
                }
                PipelineOutcome::Failed { step, message, .. } => {
                    if let Err(e) = tx.rollback().await {
                        warn!(entity_id, error = %e, "Rollback after inline step failure failed");
                    }
                    return Err(InlineError::StepFailed {
                        entity_id,
                        business_date: *business_date,
                        step,
                        message,
                    });
                }
            }
        }

        if let Err(e) = tx.save(entity).await {
            return Err(self.record_infrastructure_failure(entity_id, e).await);
        }
        if let Err(e) = tx.commit().await {
            return Err(self.record_infrastructure_failure(entity_id, e).await);
        }

        let events_published = match pending {
            Some(events) => events.flush().await.unwrap_or_else(|e| {
                warn!(entity_id, error = %e, "Failed to publish business events");
                0
            }),
            None => 0,
        };

        if acquired.owns_row() {
            if let Err(e) = locks.release(entity_id, LockOwner::Inline).await {
                warn!(entity_id, error = %e, "Failed to release inline lock after commit");
            }
        }

        info!(entity_id, dates = dates.len(), steps_run, "Inline close-of-business completed");
        Ok(InlineOutcome::Processed {
            business_dates: dates,
            steps_run,
            events_published,
        })
    }

    /// Request gate used before writing to an entity: rejects while a lock the
    /// inline path may not pass is present, otherwise brings the entity current
    pub async fn guard_entity(
        &self,
        entity_id: EntityId,
        job_name: &str,
        cob_date: NaiveDate,
        base: &RunContext,
    ) -> Result<InlineOutcome, InlineError> {
        let locks = self.executor.locks();
        if let Some(lock) = locks.find_lock(entity_id).await? {
            if !locks.policy().inline_may_proceed(&lock) {
                return Err(InlineError::LockedCannotOverrule {
                    entity_id,
                    held_by: lock.owner,
                });
            }
        }
        self.run(entity_id, job_name, cob_date, base).await
    }

    /// Process each entity independently; one entity's failure does not stop
    /// the others
    pub async fn run_many(
        &self,
        entity_ids: &[EntityId],
        job_name: &str,
        cob_date: NaiveDate,
        base: &RunContext,
    ) -> Vec<(EntityId, Result<InlineOutcome, InlineError>)> {
        let mut results = Vec::with_capacity(entity_ids.len());
        for &entity_id in entity_ids {
            let result = self.run(entity_id, job_name, cob_date, base).await;
            results.push((entity_id, result));
        }
        results
    }

    async fn record_infrastructure_failure(
        &self,
        entity_id: EntityId,
        err: RepositoryError,
    ) -> InlineError {
        let message = format!("Inline close-of-business failed for entity {entity_id}: {err}");
        if let Err(e) = self
            .executor
            .locks()
            .record_error(entity_id, LockOwner::Inline, &message, None)
            .await
        {
            warn!(entity_id, error = %e, "Failed to record inline failure");
        }
        err.into()
    }
}
