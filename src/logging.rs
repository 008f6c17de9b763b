//! # Structured Logging Module
//!
//! Environment-aware structured logging for batch runs and inline requests.
//! Human-readable console output by default, JSON lines when
//! `COB_LOG_FORMAT=json`.

use chrono::Utc;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::{DEFAULT_ENVIRONMENT, ENVIRONMENT_VARIABLE};
use crate::models::{EntityId, JobRunId, LockOwner};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

const LOG_FORMAT_VARIABLE: &str = "COB_LOG_FORMAT";

/// Initialize structured logging with environment-specific configuration
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(get_log_level(&environment)));
        let json = std::env::var(LOG_FORMAT_VARIABLE)
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .json()
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(true)
                .with_filter(filter)
                .boxed()
        };

        // A host application may already own the global subscriber
        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            json = json,
            "Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var(ENVIRONMENT_VARIABLE).unwrap_or_else(|_| DEFAULT_ENVIRONMENT.to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for lock operations
pub fn log_lock_operation(
    operation: &str,
    entity_id: EntityId,
    owner: LockOwner,
    outcome: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        operation = %operation,
        entity_id = entity_id,
        owner = %owner,
        outcome = %outcome,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "LOCK_OPERATION"
    );
}

/// Log structured data for business step execution
pub fn log_step_operation(
    job_name: &str,
    entity_id: EntityId,
    step_name: &str,
    order: u32,
    status: &str,
    details: Option<&str>,
) {
    tracing::debug!(
        job_name = %job_name,
        entity_id = entity_id,
        step_name = %step_name,
        order = order,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "STEP_OPERATION"
    );
}

/// Log structured data for batch run lifecycle transitions
pub fn log_run_operation(
    operation: &str,
    run_id: JobRunId,
    job_name: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        run_id = %run_id,
        job_name = %job_name,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "RUN_OPERATION"
    );
}
