//! # Lock Manager
//!
//! Durable per-entity mutual exclusion between the scheduled batch and inline
//! requests. Exclusivity is decided only by the persisted lock row; acquisition
//! is fail-fast and never blocks or retries.
//!
//! ## Ownership policy
//!
//! | existing row          | requested   | outcome                                   |
//! |-----------------------|-------------|-------------------------------------------|
//! | none                  | any         | created                                   |
//! | same owner            | any         | reused (except a live `Inline` row)       |
//! | `Scheduled`           | `Inline`    | conflict, or overruled per `OverruleMode` |
//! | `Inline` with error   | `Scheduled` | reclaimed when reclaim is enabled         |
//! | `Inline` without error| `Scheduled` | conflict                                  |
//!
//! Reusing or reclaiming a row that carries an error clears the error in the
//! same conditional update, so the row is live again while held and only one
//! of several concurrent takers succeeds. An overruled `Scheduled` row is left
//! untouched for later reconciliation.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

pub use in_memory::InMemoryLockStore;
#[cfg(feature = "postgres")]
pub use postgres::PgLockStore;
pub use store::{CreateOutcome, LockStore, LockStoreError};

use crate::config::LockingConfig;
use crate::logging::log_lock_operation;
use crate::models::{EntityId, EntityLock, LockFailure, LockOwner, NewLock};

/// When an inline request may proceed against a `Scheduled` lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverruleMode {
    #[default]
    Never,
    /// Only when the scheduled row carries a recorded failure
    FailedOnly,
    Always,
}

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Entity {entity_id} is locked by {held_by} and cannot be acquired by {requested}")]
    Conflict {
        entity_id: EntityId,
        held_by: LockOwner,
        requested: LockOwner,
    },

    #[error("Lock store failure: {0}")]
    Store(#[from] LockStoreError),
}

/// How a successful acquisition was granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockGrant {
    Created,
    /// An existing row of the same owner was taken over
    Reused,
    /// A failed inline row was moved to the batch
    Reclaimed,
    /// Inline proceeds past a scheduled row it does not own
    Overruled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquiredLock {
    pub lock: EntityLock,
    pub grant: LockGrant,
}

impl AcquiredLock {
    /// Whether the holder is responsible for deleting the row on success
    pub fn owns_row(&self) -> bool {
        self.grant != LockGrant::Overruled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub inline_overrule: OverruleMode,
    pub reclaim_failed_inline_locks: bool,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            inline_overrule: OverruleMode::Never,
            reclaim_failed_inline_locks: true,
        }
    }
}

impl From<&LockingConfig> for LockPolicy {
    fn from(config: &LockingConfig) -> Self {
        Self {
            inline_overrule: config.inline_overrule,
            reclaim_failed_inline_locks: config.reclaim_failed_inline_locks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Reuse,
    Overrule,
    Reclaim,
    Conflict,
}

impl LockPolicy {
    fn decide(&self, existing: &EntityLock, requested: LockOwner) -> Decision {
        match (existing.owner, requested) {
            (LockOwner::Inline, LockOwner::Inline) if existing.is_hard() => Decision::Conflict,
            (held, wanted) if held == wanted => Decision::Reuse,
            (LockOwner::Scheduled, LockOwner::Inline) => match self.inline_overrule {
                OverruleMode::Never => Decision::Conflict,
                OverruleMode::FailedOnly if existing.has_error() => Decision::Overrule,
                OverruleMode::FailedOnly => Decision::Conflict,
                OverruleMode::Always => Decision::Overrule,
            },
            (LockOwner::Inline, LockOwner::Scheduled) => {
                if existing.has_error() && self.reclaim_failed_inline_locks {
                    Decision::Reclaim
                } else {
                    Decision::Conflict
                }
            }
            _ => Decision::Conflict,
        }
    }

    /// Whether an inline request may proceed against `existing` without
    /// touching the store
    pub fn inline_may_proceed(&self, existing: &EntityLock) -> bool {
        !matches!(
            self.decide(existing, LockOwner::Inline),
            Decision::Conflict
        )
    }
}

pub struct LockManager {
    store: Arc<dyn LockStore>,
    policy: LockPolicy,
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl LockManager {
    pub fn new(store: Arc<dyn LockStore>, policy: LockPolicy) -> Self {
        Self { store, policy }
    }

    pub fn in_memory(policy: LockPolicy) -> Self {
        Self::new(Arc::new(InMemoryLockStore::new()), policy)
    }

    pub fn policy(&self) -> LockPolicy {
        self.policy
    }

    pub fn store(&self) -> &Arc<dyn LockStore> {
        &self.store
    }

    /// Acquire exclusivity over `entity_id` for `owner`
    #[instrument(skip(self))]
    pub async fn try_acquire(
        &self,
        entity_id: EntityId,
        owner: LockOwner,
        business_date: Option<NaiveDate>,
    ) -> Result<AcquiredLock, LockError> {
        let new_lock = NewLock {
            entity_id,
            owner,
            business_date,
        };

        let existing = match self.store.create(new_lock).await? {
            CreateOutcome::Created(lock) => {
                log_lock_operation("acquire", entity_id, owner, "created", None);
                return Ok(AcquiredLock {
                    lock,
                    grant: LockGrant::Created,
                });
            }
            CreateOutcome::Exists(existing) => existing,
        };

        match self.policy.decide(&existing, owner) {
            Decision::Reuse if !existing.has_error() => {
                debug!(entity_id, owner = %owner, "Reusing lock held by the same owner");
                log_lock_operation("acquire", entity_id, owner, "reused", None);
                Ok(AcquiredLock {
                    lock: existing,
                    grant: LockGrant::Reused,
                })
            }
            Decision::Reuse => {
                let lock = self.claim_failed(&existing, owner, business_date).await?;
                debug!(entity_id, owner = %owner, "Took over failed lock of the same owner");
                log_lock_operation("acquire", entity_id, owner, "reused", None);
                Ok(AcquiredLock {
                    lock,
                    grant: LockGrant::Reused,
                })
            }
            Decision::Overrule => {
                info!(
                    entity_id,
                    held_by = %existing.owner,
                    "Inline request overruling scheduled lock"
                );
                log_lock_operation("acquire", entity_id, owner, "overruled", None);
                Ok(AcquiredLock {
                    lock: existing,
                    grant: LockGrant::Overruled,
                })
            }
            Decision::Reclaim => {
                let lock = self.claim_failed(&existing, owner, business_date).await?;
                info!(entity_id, "Reclaimed failed inline lock for scheduled run");
                log_lock_operation("acquire", entity_id, owner, "reclaimed", None);
                Ok(AcquiredLock {
                    lock,
                    grant: LockGrant::Reclaimed,
                })
            }
            Decision::Conflict => Err(self.conflict(entity_id, existing.owner, owner)),
        }
    }

    /// Clear the error on `existing` and hand it to `owner`; losing a race
    /// against another taker is a conflict
    async fn claim_failed(
        &self,
        existing: &EntityLock,
        owner: LockOwner,
        business_date: Option<NaiveDate>,
    ) -> Result<EntityLock, LockError> {
        let observed = existing.error.as_deref().unwrap_or_default();
        match self
            .store
            .claim_failed(existing.entity_id, existing.owner, owner, observed, business_date)
            .await?
        {
            Some(lock) => Ok(lock),
            None => {
                let held_by = self
                    .store
                    .find_by_entity(existing.entity_id)
                    .await?
                    .map_or(existing.owner, |lock| lock.owner);
                Err(self.conflict(existing.entity_id, held_by, owner))
            }
        }
    }

    fn conflict(&self, entity_id: EntityId, held_by: LockOwner, requested: LockOwner) -> LockError {
        log_lock_operation(
            "acquire",
            entity_id,
            requested,
            "conflict",
            Some(&format!("held by {held_by}")),
        );
        LockError::Conflict {
            entity_id,
            held_by,
            requested,
        }
    }

    pub async fn find_lock(&self, entity_id: EntityId) -> Result<Option<EntityLock>, LockError> {
        Ok(self.store.find_by_entity(entity_id).await?)
    }

    /// Attach failure detail to the entity's lock in an independent unit of
    /// work. A missing row is created for `owner` so the failure is never lost.
    #[instrument(skip(self, detail))]
    pub async fn record_error(
        &self,
        entity_id: EntityId,
        owner: LockOwner,
        message: &str,
        detail: Option<String>,
    ) -> Result<EntityLock, LockError> {
        let failure = LockFailure {
            message: message.to_string(),
            detail,
        };
        let lock = self
            .store
            .update_with_error(entity_id, owner, failure)
            .await?;

        if lock.owner != owner {
            warn!(
                entity_id,
                owner = %owner,
                held_by = %lock.owner,
                "Recorded error on a lock held by another owner"
            );
        }
        log_lock_operation("record_error", entity_id, owner, "recorded", Some(message));
        Ok(lock)
    }

    /// Delete the lock row after successful completion. Returns `false` when no
    /// row held by `owner` existed.
    #[instrument(skip(self))]
    pub async fn release(&self, entity_id: EntityId, owner: LockOwner) -> Result<bool, LockError> {
        let released = self.store.delete(entity_id, owner).await?;
        if released {
            log_lock_operation("release", entity_id, owner, "released", None);
        } else {
            warn!(
                entity_id,
                owner = %owner,
                "Lock was not released - no row held by this owner"
            );
        }
        Ok(released)
    }

    /// A live (error-free) lock exists for the entity
    pub async fn is_hard_locked(&self, entity_id: EntityId) -> Result<bool, LockError> {
        Ok(self
            .store
            .find_by_entity(entity_id)
            .await?
            .is_some_and(|lock| lock.is_hard()))
    }

    pub async fn list_failed_locks(&self) -> Result<Vec<EntityLock>, LockError> {
        Ok(self.store.list_with_errors().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(inline_overrule: OverruleMode) -> LockManager {
        LockManager::in_memory(LockPolicy {
            inline_overrule,
            reclaim_failed_inline_locks: true,
        })
    }

    #[tokio::test]
    async fn test_inline_conflicts_with_scheduled_by_default() {
        let locks = manager(OverruleMode::Never);
        locks
            .try_acquire(5, LockOwner::Scheduled, None)
            .await
            .unwrap();

        let err = locks
            .try_acquire(5, LockOwner::Inline, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LockError::Conflict {
                held_by: LockOwner::Scheduled,
                requested: LockOwner::Inline,
                ..
            }
        ));

        let lock = locks.find_lock(5).await.unwrap().unwrap();
        assert_eq!(lock.owner, LockOwner::Scheduled);
        assert!(lock.is_hard());
    }

    #[tokio::test]
    async fn test_failed_only_overrules_errored_scheduled_lock() {
        let locks = manager(OverruleMode::FailedOnly);
        locks
            .try_acquire(6, LockOwner::Scheduled, None)
            .await
            .unwrap();
        assert!(locks.try_acquire(6, LockOwner::Inline, None).await.is_err());

        locks
            .record_error(6, LockOwner::Scheduled, "step failed", None)
            .await
            .unwrap();
        let acquired = locks
            .try_acquire(6, LockOwner::Inline, None)
            .await
            .unwrap();
        assert_eq!(acquired.grant, LockGrant::Overruled);
        assert!(!acquired.owns_row());
        assert_eq!(
            locks.find_lock(6).await.unwrap().unwrap().owner,
            LockOwner::Scheduled
        );
    }

    #[tokio::test]
    async fn test_same_owner_reuses_row() {
        let locks = manager(OverruleMode::Never);
        locks
            .try_acquire(7, LockOwner::Scheduled, None)
            .await
            .unwrap();
        let again = locks
            .try_acquire(7, LockOwner::Scheduled, None)
            .await
            .unwrap();
        assert_eq!(again.grant, LockGrant::Reused);
    }

    #[tokio::test]
    async fn test_retaking_failed_inline_lock_makes_it_live() {
        let locks = manager(OverruleMode::Never);
        locks
            .record_error(10, LockOwner::Inline, "accrual failed", None)
            .await
            .unwrap();

        let retry = locks.try_acquire(10, LockOwner::Inline, None).await.unwrap();
        assert_eq!(retry.grant, LockGrant::Reused);
        assert!(retry.lock.is_hard());
        assert!(locks.is_hard_locked(10).await.unwrap());
        assert!(locks
            .try_acquire(10, LockOwner::Scheduled, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_live_inline_lock_is_exclusive() {
        let locks = manager(OverruleMode::Always);
        locks.try_acquire(8, LockOwner::Inline, None).await.unwrap();
        assert!(locks.try_acquire(8, LockOwner::Inline, None).await.is_err());
        assert!(locks
            .try_acquire(8, LockOwner::Scheduled, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_release_with_wrong_owner_keeps_row() {
        let locks = manager(OverruleMode::Never);
        locks.try_acquire(9, LockOwner::Inline, None).await.unwrap();
        assert!(!locks.release(9, LockOwner::Scheduled).await.unwrap());
        assert!(locks.is_hard_locked(9).await.unwrap());
        assert!(locks.release(9, LockOwner::Inline).await.unwrap());
        assert!(locks.find_lock(9).await.unwrap().is_none());
    }
}
