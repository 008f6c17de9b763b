//! # Catch-up Runner
//!
//! Replays the batch job once per missed business date, oldest first, until
//! every entity is closed for the COB date. Only one catch-up runs at a time.

use chrono::NaiveDate;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use super::batch_runner::BatchRunner;
use super::inline_runner::pending_business_dates;
use super::run_context::RunContext;
use crate::error::{CobError, Result};
use crate::models::{CobEntity, JobRunSummary};

#[derive(Debug, Clone, PartialEq)]
pub struct CatchUpReport {
    pub runs: Vec<JobRunSummary>,
    /// Every business date up to the COB date completed
    pub completed: bool,
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct CatchUpRunner<E: CobEntity> {
    batch: Arc<BatchRunner<E>>,
    running: AtomicBool,
}

impl<E: CobEntity> CatchUpRunner<E> {
    pub fn new(batch: Arc<BatchRunner<E>>) -> Self {
        Self {
            batch,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Business dates the catch-up would run, given the oldest last-closed date
    pub fn dates_to_run(oldest_closed: Option<NaiveDate>, cob_date: NaiveDate) -> Vec<NaiveDate> {
        pending_business_dates(oldest_closed, cob_date)
    }

    pub async fn run(
        &self,
        job_name: &str,
        cob_date: NaiveDate,
        base: RunContext,
    ) -> Result<CatchUpReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CobError::CatchUpInProgress);
        }
        let _running = RunningFlag(&self.running);

        let oldest = self
            .batch
            .selector()
            .oldest_last_closed_date(cob_date)
            .await?;
        let dates = Self::dates_to_run(oldest, cob_date);
        info!(job_name, ?oldest, %cob_date, dates = dates.len(), "Starting catch-up");

        let mut runs = Vec::with_capacity(dates.len());
        for business_date in dates {
            let run_id = self
                .batch
                .run_with_context(job_name, business_date, base.clone())
                .await?;
            let summary = self
                .batch
                .runs()
                .summary(run_id)
                .ok_or(CobError::RunNotFound(run_id))?;
            let completed = summary.is_completed();
            runs.push(summary);
            if !completed {
                warn!(job_name, %business_date, "Catch-up stopped at an incomplete run");
                return Ok(CatchUpReport {
                    runs,
                    completed: false,
                });
            }
        }

        Ok(CatchUpReport {
            runs,
            completed: true,
        })
    }
}
