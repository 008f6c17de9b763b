//! # Error/Skip Listener
//!
//! Isolates read/process/write failures of one item inside a chunk. Every
//! failure is recorded on the entity's lock in its own unit of work before the
//! fault-tolerance policy decides whether the item is skipped or the chunk
//! fails. Step failures are handled by the pipeline executor and never reach
//! this listener.

use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

use crate::config::FaultTolerance;
use crate::locking::LockManager;
use crate::models::{EntityId, LockOwner};

/// Infrastructure failure attributable to one item
#[derive(Debug, Clone, Error)]
pub enum ChunkFailure {
    #[error("Failed to read entity {entity_id}: {message}")]
    Read { entity_id: EntityId, message: String },

    #[error("Failed to process entity {entity_id}: {message}")]
    Process { entity_id: EntityId, message: String },

    #[error("Failed to write entity {entity_id}: {message}")]
    Write { entity_id: EntityId, message: String },
}

impl ChunkFailure {
    pub fn entity_id(&self) -> EntityId {
        match self {
            ChunkFailure::Read { entity_id, .. }
            | ChunkFailure::Process { entity_id, .. }
            | ChunkFailure::Write { entity_id, .. } => *entity_id,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            ChunkFailure::Read { .. } => "read",
            ChunkFailure::Process { .. } => "process",
            ChunkFailure::Write { .. } => "write",
        }
    }

    fn message(&self) -> &str {
        match self {
            ChunkFailure::Read { message, .. }
            | ChunkFailure::Process { message, .. }
            | ChunkFailure::Write { message, .. } => message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    /// Leave the item out and continue the chunk
    Skip,
    /// Fail the chunk, and with it the run
    Fail,
}

#[derive(Debug)]
pub struct ErrorSkipListener {
    locks: Arc<LockManager>,
    policy: FaultTolerance,
    owner: LockOwner,
    skipped: AtomicU64,
}

impl ErrorSkipListener {
    pub fn new(locks: Arc<LockManager>, policy: FaultTolerance, owner: LockOwner) -> Self {
        Self {
            locks,
            policy,
            owner,
            skipped: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> FaultTolerance {
        self.policy
    }

    /// Items skipped so far in this run
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    pub async fn on_failure(&self, failure: &ChunkFailure) -> SkipDecision {
        let entity_id = failure.entity_id();
        let detail = json!({
            "phase": failure.phase(),
            "message": failure.message(),
        });

        if let Err(e) = self
            .locks
            .record_error(
                entity_id,
                self.owner,
                &failure.to_string(),
                Some(detail.to_string()),
            )
            .await
        {
            error!(
                entity_id,
                phase = failure.phase(),
                error = %e,
                "Could not record item failure; failing the chunk"
            );
            return SkipDecision::Fail;
        }

        match self.policy {
            FaultTolerance::FailFast => SkipDecision::Fail,
            FaultTolerance::Skip { limit } => {
                let admitted = self
                    .skipped
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |skipped| {
                        (skipped < limit).then_some(skipped + 1)
                    })
                    .is_ok();
                if admitted {
                    warn!(entity_id, phase = failure.phase(), "Skipping failed item");
                    SkipDecision::Skip
                } else {
                    error!(
                        entity_id,
                        limit,
                        "Skip limit exhausted; escalating to a run failure"
                    );
                    SkipDecision::Fail
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockPolicy;

    fn read_failure(entity_id: EntityId) -> ChunkFailure {
        ChunkFailure::Read {
            entity_id,
            message: "connection reset".to_string(),
        }
    }

    #[tokio::test]
    async fn test_skip_until_limit_then_fail() {
        let locks = Arc::new(LockManager::in_memory(LockPolicy::default()));
        let listener = ErrorSkipListener::new(
            locks.clone(),
            FaultTolerance::Skip { limit: 2 },
            LockOwner::Scheduled,
        );

        assert_eq!(listener.on_failure(&read_failure(1)).await, SkipDecision::Skip);
        assert_eq!(listener.on_failure(&read_failure(2)).await, SkipDecision::Skip);
        assert_eq!(listener.on_failure(&read_failure(3)).await, SkipDecision::Fail);
        assert_eq!(listener.skipped(), 2);

        // every failure is recorded, including the one that escalated
        assert_eq!(locks.list_failed_locks().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fail_fast_records_then_fails() {
        let locks = Arc::new(LockManager::in_memory(LockPolicy::default()));
        let listener =
            ErrorSkipListener::new(locks.clone(), FaultTolerance::FailFast, LockOwner::Scheduled);

        assert_eq!(listener.on_failure(&read_failure(4)).await, SkipDecision::Fail);
        let lock = locks.find_lock(4).await.unwrap().unwrap();
        assert!(lock.error.unwrap().contains("connection reset"));
        assert!(lock.error_detail.unwrap().contains("\"phase\":\"read\""));
    }
}
