//! # Models
//!
//! Data types shared by the lock manager, the runners and the stores.

pub mod entity;
pub mod entity_lock;
pub mod execution_map;
pub mod job_run;
pub mod loan;

pub use entity::CobEntity;
pub use entity_lock::{EntityId, EntityLock, LockFailure, LockOwner, NewLock, UnknownLockOwner};
pub use execution_map::{ExecutionMap, ExecutionMapRegistry};
pub use job_run::{JobRunId, JobRunStatus, JobRunSummary, RunCounters};
pub use loan::{DelinquencyTag, Loan, LoanStatus};
