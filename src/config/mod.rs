//! # COB Configuration
//!
//! Typed configuration for the close-of-business core, loaded by
//! [`ConfigManager`] from TOML files layered per environment.
//!
//! ## Structure
//!
//! ```toml
//! [batch]
//! chunk_size = 50
//! worker_count = 4
//!
//! [batch.fault_tolerance]
//! mode = "skip"      # or "fail_fast"
//! skip_limit = 25    # required when mode = "skip"
//!
//! [locking]
//! inline_overrule = "never"   # "never" | "failed_only" | "always"
//! reclaim_failed_inline_locks = true
//!
//! [events]
//! bulk_mode = true
//!
//! [[jobs]]
//! name = "LOAN_CLOSE_OF_BUSINESS"
//! steps = [
//!   { order = 1, name = "APPLY_CHARGE_TO_OVERDUE_LOANS" },
//!   { order = 2, name = "CHECK_LOAN_REPAYMENT_OVERDUE" },
//! ]
//! ```
//!
//! The fault-tolerance policy has no built-in default; a configuration that
//! does not state it explicitly is rejected.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

use crate::locking::OverruleMode;

/// Root configuration structure mirroring `config/cob/base.toml`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CobConfig {
    /// Chunking, worker and fault-tolerance settings
    pub batch: BatchConfig,

    /// Lock ownership policy
    #[serde(default)]
    pub locking: LockingConfig,

    /// Business event emission
    #[serde(default)]
    pub events: EventsConfig,

    /// Durable lock store connection; absent means the in-memory store
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Execution maps, one per job
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BatchConfig {
    pub chunk_size: usize,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    pub fault_tolerance: FaultToleranceConfig,
}

fn default_worker_count() -> usize {
    1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultToleranceMode {
    FailFast,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FaultToleranceConfig {
    pub mode: FaultToleranceMode,
    #[serde(default)]
    pub skip_limit: Option<u64>,
}

/// Resolved policy for read/process/write failures inside a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultTolerance {
    /// The first infrastructure failure fails the chunk and the run
    FailFast,
    /// Skip failing entities until `limit` skips have happened in one run
    Skip { limit: u64 },
}

impl FaultToleranceConfig {
    pub fn policy(&self) -> ConfigResult<FaultTolerance> {
        match (self.mode, self.skip_limit) {
            (FaultToleranceMode::FailFast, None) => Ok(FaultTolerance::FailFast),
            (FaultToleranceMode::FailFast, Some(limit)) => Err(ConfigurationError::invalid_value(
                "batch.fault_tolerance.skip_limit",
                limit.to_string(),
                "skip_limit is only valid with mode = \"skip\"",
            )),
            (FaultToleranceMode::Skip, Some(limit)) => Ok(FaultTolerance::Skip { limit }),
            (FaultToleranceMode::Skip, None) => Err(ConfigurationError::missing_required_field(
                "batch.fault_tolerance.skip_limit",
                "fault tolerance with mode = \"skip\"",
            )),
        }
    }
}

/// Lock policy between the scheduled batch and inline requests.
///
/// `inline_overrule` defaults to `never`: an inline request is refused while
/// any `Scheduled` row exists, including one carrying a recorded failure.
/// Deployments that want inline requests to proceed past a failed scheduled
/// row, leaving that row for the next batch, set `failed_only`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockingConfig {
    #[serde(default)]
    pub inline_overrule: OverruleMode,
    /// A scheduled run takes over an `Inline` row that carries a failure
    #[serde(default = "default_true")]
    pub reclaim_failed_inline_locks: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            inline_overrule: OverruleMode::Never,
            reclaim_failed_inline_locks: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EventsConfig {
    /// Buffer events per entity and flush only after a successful commit
    #[serde(default)]
    pub bulk_mode: bool,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            bulk_mode: false,
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

fn default_broadcast_capacity() -> usize {
    1024
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_acquire_timeout_seconds")]
    pub acquire_timeout_seconds: u64,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

fn default_max_connections() -> u32 {
    10
}

fn default_acquire_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    pub name: String,
    /// Overrides `batch.chunk_size` for this job
    #[serde(default)]
    pub chunk_size: Option<usize>,
    pub steps: Vec<StepEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StepEntry {
    pub order: u32,
    pub name: String,
}

impl CobConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn chunk_size_for(&self, job_name: &str) -> usize {
        self.job(job_name)
            .and_then(|job| job.chunk_size)
            .unwrap_or(self.batch.chunk_size)
    }

    pub fn fault_tolerance(&self) -> ConfigResult<FaultTolerance> {
        self.batch.fault_tolerance.policy()
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.batch.chunk_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.chunk_size",
                "0",
                "chunk size must be greater than 0",
            ));
        }

        if self.batch.worker_count == 0 {
            return Err(ConfigurationError::invalid_value(
                "batch.worker_count",
                "0",
                "worker count must be greater than 0",
            ));
        }

        self.batch.fault_tolerance.policy()?;

        if let Some(database) = &self.database {
            if database.url.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "database.url",
                    "database configuration",
                ));
            }
            if database.max_connections == 0 {
                return Err(ConfigurationError::invalid_value(
                    "database.max_connections",
                    "0",
                    "pool size must be greater than 0",
                ));
            }
        }

        let mut job_names = HashSet::new();
        for job in &self.jobs {
            if job.name.trim().is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    "jobs.name",
                    "job configuration",
                ));
            }
            if !job_names.insert(job.name.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "jobs.name",
                    job.name.clone(),
                    "job names must be unique",
                ));
            }
            if job.chunk_size == Some(0) {
                return Err(ConfigurationError::invalid_value(
                    format!("jobs.{}.chunk_size", job.name),
                    "0",
                    "chunk size must be greater than 0",
                ));
            }
            if job.steps.is_empty() {
                return Err(ConfigurationError::missing_required_field(
                    format!("jobs.{}.steps", job.name),
                    "job configuration",
                ));
            }

            let mut orders = HashSet::new();
            for step in &job.steps {
                if step.name.trim().is_empty() {
                    return Err(ConfigurationError::missing_required_field(
                        format!("jobs.{}.steps.name", job.name),
                        "execution map entry",
                    ));
                }
                if !orders.insert(step.order) {
                    return Err(ConfigurationError::invalid_value(
                        format!("jobs.{}.steps.order", job.name),
                        step.order.to_string(),
                        "sequence keys must be unique within a job",
                    ));
                }
            }
        }

        Ok(())
    }
}
