//! Error types for the COB core.
//!
//! Component errors live next to the component that raises them; [`CobError`]
//! is the crate-level error that operational entry points return.

use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::events::EventError;
use crate::locking::{LockError, LockStoreError};
use crate::repository::RepositoryError;

#[derive(Debug, Error)]
pub enum CobError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Unknown business step '{step}' in execution map of job '{job_name}'")]
    UnknownStep { job_name: String, step: String },

    #[error("Duplicate sequence key {order} in execution map of job '{job_name}'")]
    DuplicateStepOrder { job_name: String, order: u32 },

    #[error("Run context is missing required value '{0}'")]
    MissingContext(String),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    LockStore(#[from] LockStoreError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("Job run {0} not found")]
    RunNotFound(Uuid),

    #[error("A catch-up run is already in progress")]
    CatchUpInProgress,

    #[error("Job '{job_name}' is already running as run {run_id}")]
    JobAlreadyRunning { job_name: String, run_id: Uuid },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for CobError {
    fn from(err: sqlx::Error) -> Self {
        CobError::Database(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::migrate::MigrateError> for CobError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CobError::Database(format!("Migration failed: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, CobError>;
