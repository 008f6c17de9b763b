//! # Business Steps
//!
//! The unit of work the pipeline executes: a named transformation of one
//! entity for one business date. Steps are supplied by the domain layer,
//! registered once at start-up and referenced by name from execution maps.
//!
//! ```rust
//! use async_trait::async_trait;
//! use cob_core::models::Loan;
//! use cob_core::steps::{BusinessStep, StepContext, StepFailure};
//!
//! struct CheckLoanRepaymentOverdue;
//!
//! #[async_trait]
//! impl BusinessStep<Loan> for CheckLoanRepaymentOverdue {
//!     fn name(&self) -> &str {
//!         "CHECK_LOAN_REPAYMENT_OVERDUE"
//!     }
//!
//!     fn display_name(&self) -> &str {
//!         "Check Loan Repayment Overdue"
//!     }
//!
//!     async fn execute(&self, mut loan: Loan, _context: &StepContext<'_>) -> Result<Loan, StepFailure> {
//!         if loan.days_overdue > 0 {
//!             loan.overdue = true;
//!         }
//!         Ok(loan)
//!     }
//! }
//! ```

pub mod registry;

use async_trait::async_trait;
use chrono::NaiveDate;
use std::error::Error as StdError;
use thiserror::Error;

pub use registry::BusinessStepRegistry;

use crate::constants::context_keys;
use crate::events::{BusinessEvent, EventBuffer, EventEmitter};
use crate::models::CobEntity;
use crate::orchestration::run_context::RunContext;

/// Failure of one business step for one entity
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepFailure {
    pub message: String,
    #[source]
    pub source: Option<Box<dyn StdError + Send + Sync>>,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(
        message: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Messages of the underlying causes, outermost first
    pub fn cause_chain(&self) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = StdError::source(self);
        while let Some(cause) = current {
            chain.push(cause.to_string());
            current = cause.source();
        }
        chain
    }
}

/// What a step sees of the run while executing
pub struct StepContext<'a> {
    run: &'a RunContext,
    emitter: &'a EventEmitter,
    buffer: &'a EventBuffer,
}

impl<'a> StepContext<'a> {
    pub fn new(run: &'a RunContext, emitter: &'a EventEmitter, buffer: &'a EventBuffer) -> Self {
        Self {
            run,
            emitter,
            buffer,
        }
    }

    pub fn run_context(&self) -> &RunContext {
        self.run
    }

    pub fn business_date(&self) -> Result<NaiveDate, StepFailure> {
        self.run
            .business_date()
            .map_err(|e| StepFailure::new(e.to_string()))
    }

    pub fn step_name(&self) -> Option<&str> {
        self.run.text(context_keys::STEP_NAME)
    }

    /// Raise an event; buffered until commit in bulk mode, published
    /// immediately otherwise
    pub async fn emit(&self, event: BusinessEvent) -> Result<(), StepFailure> {
        if self.emitter.is_bulk() {
            self.buffer.emit_buffered(event);
            return Ok(());
        }
        self.emitter
            .emit(event)
            .await
            .map_err(|e| StepFailure::with_source("failed to publish business event", e))
    }
}

#[async_trait]
pub trait BusinessStep<E: CobEntity>: Send + Sync {
    /// Stable, enum-styled identifier referenced by execution maps
    fn name(&self) -> &str;

    fn display_name(&self) -> &str {
        self.name()
    }

    async fn execute(&self, entity: E, context: &StepContext<'_>) -> Result<E, StepFailure>;
}
