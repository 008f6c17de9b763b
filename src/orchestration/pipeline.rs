//! # Pipeline Executor
//!
//! Runs a job's business steps over one entity in ascending sequence order.
//! A step failure stops the pipeline for that entity only: the failure is
//! recorded on the entity's lock in an independent unit of work and the
//! caller is told to leave the entity out of its commit.

use serde_json::json;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::run_context::{ContextPropagator, ContextScope, RunContext};
use crate::constants::context_keys;
use crate::error::{CobError, Result};
use crate::events::{EventEmitter, PendingEvents};
use crate::locking::LockManager;
use crate::logging::log_step_operation;
use crate::models::{CobEntity, EntityId, ExecutionMapRegistry, LockOwner};
use crate::steps::{BusinessStep, BusinessStepRegistry, StepContext};

pub struct ResolvedStep<E: CobEntity> {
    pub order: u32,
    pub name: String,
    pub step: Arc<dyn BusinessStep<E>>,
}

impl<E: CobEntity> Clone for ResolvedStep<E> {
    fn clone(&self) -> Self {
        Self {
            order: self.order,
            name: self.name.clone(),
            step: Arc::clone(&self.step),
        }
    }
}

/// A job's execution map bound to concrete step implementations
pub struct ResolvedPipeline<E: CobEntity> {
    job_name: String,
    steps: Vec<ResolvedStep<E>>,
}

impl<E: CobEntity> Clone for ResolvedPipeline<E> {
    fn clone(&self) -> Self {
        Self {
            job_name: self.job_name.clone(),
            steps: self.steps.clone(),
        }
    }
}

impl<E: CobEntity> fmt::Debug for ResolvedPipeline<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedPipeline")
            .field("job_name", &self.job_name)
            .field("steps", &self.step_names())
            .finish()
    }
}

impl<E: CobEntity> ResolvedPipeline<E> {
    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn steps(&self) -> &[ResolvedStep<E>] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Steps still to run given the names already completed
    pub fn remaining(&self, completed: &BTreeSet<String>) -> Vec<&ResolvedStep<E>> {
        self.steps
            .iter()
            .filter(|step| !completed.contains(&step.name))
            .collect()
    }
}

pub enum PipelineOutcome<E> {
    Completed {
        entity: E,
        /// Buffered events; flush only after the entity's transaction commits
        events: PendingEvents,
        steps_run: usize,
    },
    /// A step failed and the failure is recorded on the lock
    Failed {
        step: String,
        order: u32,
        message: String,
    },
}

impl<E> PipelineOutcome<E> {
    pub fn is_completed(&self) -> bool {
        matches!(self, PipelineOutcome::Completed { .. })
    }
}

impl<E> fmt::Debug for PipelineOutcome<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineOutcome::Completed {
                events, steps_run, ..
            } => f
                .debug_struct("Completed")
                .field("events", &events.len())
                .field("steps_run", steps_run)
                .finish(),
            PipelineOutcome::Failed {
                step,
                order,
                message,
            } => f
                .debug_struct("Failed")
                .field("step", step)
                .field("order", order)
                .field("message", message)
                .finish(),
        }
    }
}

pub struct PipelineExecutor<E: CobEntity> {
    steps: Arc<BusinessStepRegistry<E>>,
    maps: Arc<ExecutionMapRegistry>,
    locks: Arc<LockManager>,
    emitter: EventEmitter,
    propagator: ContextPropagator,
}

impl<E: CobEntity> PipelineExecutor<E> {
    pub fn new(
        steps: Arc<BusinessStepRegistry<E>>,
        maps: Arc<ExecutionMapRegistry>,
        locks: Arc<LockManager>,
        emitter: EventEmitter,
    ) -> Self {
        Self {
            steps,
            maps,
            locks,
            emitter,
            propagator: ContextPropagator::all(),
        }
    }

    pub fn with_propagator(mut self, propagator: ContextPropagator) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    pub fn emitter(&self) -> &EventEmitter {
        &self.emitter
    }

    pub fn propagator(&self) -> &ContextPropagator {
        &self.propagator
    }

    /// Bind a job's execution map to registered steps; an unknown step name
    /// fails here, before any entity is touched
    pub fn resolve(&self, job_name: &str) -> Result<ResolvedPipeline<E>> {
        let map = self.maps.get(job_name)?;
        let steps = map
            .iter()
            .map(|(order, name)| {
                self.steps
                    .get(name)
                    .map(|step| ResolvedStep {
                        order,
                        name: name.to_string(),
                        step,
                    })
                    .ok_or_else(|| CobError::UnknownStep {
                        job_name: job_name.to_string(),
                        step: name.to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ResolvedPipeline {
            job_name: job_name.to_string(),
            steps,
        })
    }

    /// Resolve every configured job
    pub fn validate_all(&self) -> Result<()> {
        for job_name in self.maps.job_names() {
            self.resolve(job_name)?;
        }
        Ok(())
    }

    /// Entity-scope context derived from a chunk or job context
    pub fn entity_context(&self, parent: &RunContext, entity_id: EntityId) -> RunContext {
        let mut context =
            RunContext::new(ContextScope::Entity).with(context_keys::ENTITY_ID, entity_id);
        self.propagator.propagate(parent, &mut context);
        context
    }

    /// Run the pipeline over `entity`, skipping steps named in `completed`.
    ///
    /// Returns `Err` only when recording a step failure itself fails.
    #[instrument(skip_all, fields(job_name = %pipeline.job_name, entity_id = entity.entity_id(), owner = %owner))]
    pub async fn execute(
        &self,
        pipeline: &ResolvedPipeline<E>,
        entity: E,
        context: &RunContext,
        owner: LockOwner,
        completed: &BTreeSet<String>,
    ) -> Result<PipelineOutcome<E>> {
        let business_date = context.business_date()?;
        let entity_id = entity.entity_id();
        let buffer = self.emitter.buffer();
        let mut working = entity;
        let mut steps_run = 0;

        for resolved in pipeline.remaining(completed) {
            let mut step_context = RunContext::new(ContextScope::Step)
                .with(context_keys::STEP_NAME, resolved.name.as_str())
                .with(context_keys::STEP_ORDER, i64::from(resolved.order));
            self.propagator.propagate(context, &mut step_context);

            let step_ctx = StepContext::new(&step_context, &self.emitter, &buffer);
            match resolved.step.execute(working, &step_ctx).await {
                Ok(next) => {
                    working = next;
                    steps_run += 1;
                    log_step_operation(
                        &pipeline.job_name,
                        entity_id,
                        &resolved.name,
                        resolved.order,
                        "completed",
                        None,
                    );
                }
                Err(failure) => {
                    buffer.reset();
                    let message = format!(
                        "Business step {} failed for entity {}: {}",
                        resolved.name, entity_id, failure
                    );
                    let detail = json!({
                        "job_name": pipeline.job_name,
                        "step": resolved.name,
                        "display_name": resolved.step.display_name(),
                        "order": resolved.order,
                        "business_date": business_date.to_string(),
                        "message": failure.message,
                        "cause_chain": failure.cause_chain(),
                    });

                    warn!(
                        entity_id,
                        step = %resolved.name,
                        order = resolved.order,
                        error = %failure,
                        "Business step failed"
                    );
                    log_step_operation(
                        &pipeline.job_name,
                        entity_id,
                        &resolved.name,
                        resolved.order,
                        "failed",
                        Some(&failure.message),
                    );

                    self.locks
                        .record_error(entity_id, owner, &message, Some(detail.to_string()))
                        .await?;

                    return Ok(PipelineOutcome::Failed {
                        step: resolved.name.clone(),
                        order: resolved.order,
                        message,
                    });
                }
            }
        }

        working.close_business_date(business_date);
        debug!(entity_id, steps_run, %business_date, "Pipeline completed");

        Ok(PipelineOutcome::Completed {
            entity: working,
            events: self.emitter.pending(buffer.take()),
            steps_run,
        })
    }
}
