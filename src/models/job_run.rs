//! # Job Run
//!
//! Snapshot of one batch run as reported to operators and after-hooks.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobRunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobRunStatus::Running)
    }
}

/// Per-run counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Entity ids returned by candidate selection
    pub candidates: u64,
    /// Entities whose pipeline completed and committed
    pub succeeded: u64,
    /// Entities left with an error lock by a business step failure
    pub step_failures: u64,
    /// Entities skipped by the fault-tolerance policy after a read/process/write failure
    pub skipped: u64,
    /// Entities held by another owner and left alone
    pub lock_conflicts: u64,
    pub chunks_committed: u64,
    pub chunks_failed: u64,
    pub hook_errors: u64,
}

impl RunCounters {
    /// Entities that ended the run with an error-flagged lock
    pub fn entities_with_errors(&self) -> u64 {
        self.step_failures + self.skipped
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRunSummary {
    pub run_id: JobRunId,
    pub job_name: String,
    pub business_date: NaiveDate,
    pub status: JobRunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub counters: RunCounters,
    pub failure_reason: Option<String>,
}

impl JobRunSummary {
    pub fn is_completed(&self) -> bool {
        self.status == JobRunStatus::Completed
    }
}
