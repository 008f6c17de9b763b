//! In-process lock store backed by a `DashMap`.
//!
//! Per-key entry locking gives the same insert-if-absent guarantee as the
//! primary key constraint in the PostgreSQL store.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::store::{CreateOutcome, LockStore, LockStoreError};
use crate::models::{EntityId, EntityLock, LockFailure, LockOwner, NewLock};

#[derive(Debug, Default)]
pub struct InMemoryLockStore {
    locks: DashMap<EntityId, EntityLock>,
}

impl InMemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Snapshot of every row, ordered by entity id
    pub fn snapshot(&self) -> Vec<EntityLock> {
        let mut locks: Vec<EntityLock> =
            self.locks.iter().map(|entry| entry.value().clone()).collect();
        locks.sort_by_key(|lock| lock.entity_id);
        locks
    }
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn create(&self, new_lock: NewLock) -> Result<CreateOutcome, LockStoreError> {
        match self.locks.entry(new_lock.entity_id) {
            Entry::Occupied(existing) => Ok(CreateOutcome::Exists(existing.get().clone())),
            Entry::Vacant(slot) => {
                let lock =
                    EntityLock::new(new_lock.entity_id, new_lock.owner, new_lock.business_date);
                slot.insert(lock.clone());
                Ok(CreateOutcome::Created(lock))
            }
        }
    }

    async fn find_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EntityLock>, LockStoreError> {
        Ok(self.locks.get(&entity_id).map(|lock| lock.value().clone()))
    }

    async fn update_with_error(
        &self,
        entity_id: EntityId,
        owner: LockOwner,
        failure: LockFailure,
    ) -> Result<EntityLock, LockStoreError> {
        let mut lock = self
            .locks
            .entry(entity_id)
            .or_insert_with(|| EntityLock::new(entity_id, owner, None));
        lock.error = Some(failure.message);
        lock.error_detail = failure.detail;
        lock.updated_at = Utc::now();
        Ok(lock.value().clone())
    }

    async fn claim_failed(
        &self,
        entity_id: EntityId,
        from: LockOwner,
        to: LockOwner,
        observed_error: &str,
        business_date: Option<NaiveDate>,
    ) -> Result<Option<EntityLock>, LockStoreError> {
        // check and update under the same shard guard
        match self.locks.get_mut(&entity_id) {
            Some(mut lock)
                if lock.owner == from && lock.error.as_deref() == Some(observed_error) =>
            {
                lock.owner = to;
                lock.business_date = business_date.or(lock.business_date);
                lock.error = None;
                lock.error_detail = None;
                lock.updated_at = Utc::now();
                Ok(Some(lock.value().clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete(&self, entity_id: EntityId, owner: LockOwner) -> Result<bool, LockStoreError> {
        Ok(self
            .locks
            .remove_if(&entity_id, |_, lock| lock.owner == owner)
            .is_some())
    }

    async fn list_with_errors(&self) -> Result<Vec<EntityLock>, LockStoreError> {
        Ok(self
            .snapshot()
            .into_iter()
            .filter(EntityLock::has_error)
            .collect())
    }
}
