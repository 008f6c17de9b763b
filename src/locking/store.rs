//! # Lock Store
//!
//! Persistence seam for entity locks. Implementations must enforce at most one
//! row per entity id and perform `update_with_error` in a unit of work that is
//! independent of any caller transaction.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use crate::models::{EntityId, EntityLock, LockFailure, LockOwner, NewLock};

#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("Lock store database error: {0}")]
    Database(String),

    #[error("Corrupt lock row for entity {entity_id}: {reason}")]
    CorruptRow { entity_id: EntityId, reason: String },

    #[error("Lock row for entity {0} changed concurrently")]
    Contended(EntityId),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for LockStoreError {
    fn from(err: sqlx::Error) -> Self {
        LockStoreError::Database(err.to_string())
    }
}

/// Result of an insert-if-absent
#[derive(Debug, Clone, PartialEq)]
pub enum CreateOutcome {
    /// The row was inserted by this call
    Created(EntityLock),
    /// A row already existed and was left unchanged
    Exists(EntityLock),
}

#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically insert a lock row unless one already exists for the entity
    async fn create(&self, new_lock: NewLock) -> Result<CreateOutcome, LockStoreError>;

    async fn find_by_entity(&self, entity_id: EntityId)
        -> Result<Option<EntityLock>, LockStoreError>;

    /// Attach failure detail to the entity's lock row in an independent unit of
    /// work, inserting a row for `owner` when none exists. An existing row keeps
    /// its owner.
    async fn update_with_error(
        &self,
        entity_id: EntityId,
        owner: LockOwner,
        failure: LockFailure,
    ) -> Result<EntityLock, LockStoreError>;

    /// Take over an error-carrying row: move it from `from` to `to` and clear
    /// the error so it is a live lock again. Applies only while the row is
    /// still held by `from` with exactly `observed_error`; of several
    /// concurrent callers at most one gets `Some`.
    async fn claim_failed(
        &self,
        entity_id: EntityId,
        from: LockOwner,
        to: LockOwner,
        observed_error: &str,
        business_date: Option<NaiveDate>,
    ) -> Result<Option<EntityLock>, LockStoreError>;

    /// Delete the row if held by `owner`; returns whether a row was deleted
    async fn delete(&self, entity_id: EntityId, owner: LockOwner) -> Result<bool, LockStoreError>;

    /// All rows carrying an error, ordered by entity id
    async fn list_with_errors(&self) -> Result<Vec<EntityLock>, LockStoreError>;
}
