//! # PostgreSQL Lock Store
//!
//! Durable lock rows in `cob_entity_locks`, keyed by `entity_id`. The primary
//! key provides cross-process insert-if-absent semantics; error recording runs
//! in its own transaction on a pooled connection so it survives a rollback of
//! the caller's work.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{FromRow, PgPool};
use tracing::{debug, instrument};

use super::store::{CreateOutcome, LockStore, LockStoreError};
use crate::models::{EntityId, EntityLock, LockFailure, LockOwner, NewLock};

/// Attempts before giving up when a row disappears between insert and read
const CREATE_ATTEMPTS: usize = 3;

const LOCK_COLUMNS: &str =
    "entity_id, lock_owner, business_date, error, error_detail, created_at, updated_at";

#[derive(Debug, FromRow)]
struct EntityLockRow {
    entity_id: i64,
    lock_owner: String,
    business_date: Option<NaiveDate>,
    error: Option<String>,
    error_detail: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EntityLockRow> for EntityLock {
    type Error = LockStoreError;

    fn try_from(row: EntityLockRow) -> Result<Self, Self::Error> {
        let owner = row
            .lock_owner
            .parse::<LockOwner>()
            .map_err(|e| LockStoreError::CorruptRow {
                entity_id: row.entity_id,
                reason: e.to_string(),
            })?;
        Ok(EntityLock {
            entity_id: row.entity_id,
            owner,
            business_date: row.business_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
            error: row.error,
            error_detail: row.error_detail,
        })
    }
}

#[derive(Debug, Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    #[instrument(skip_all, fields(entity_id = new_lock.entity_id, owner = %new_lock.owner))]
    async fn create(&self, new_lock: NewLock) -> Result<CreateOutcome, LockStoreError> {
        let insert = format!(
            "INSERT INTO cob_entity_locks (entity_id, lock_owner, business_date, created_at, updated_at) \
             VALUES ($1, $2, $3, NOW(), NOW()) \
             ON CONFLICT (entity_id) DO NOTHING \
             RETURNING {LOCK_COLUMNS}"
        );

        for attempt in 1..=CREATE_ATTEMPTS {
            let inserted = sqlx::query_as::<_, EntityLockRow>(&insert)
                .bind(new_lock.entity_id)
                .bind(new_lock.owner.as_str())
                .bind(new_lock.business_date)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = inserted {
                return Ok(CreateOutcome::Created(row.try_into()?));
            }

            if let Some(existing) = self.find_by_entity(new_lock.entity_id).await? {
                return Ok(CreateOutcome::Exists(existing));
            }

            debug!(attempt, "Lock row vanished between insert and read, retrying");
        }

        Err(LockStoreError::Contended(new_lock.entity_id))
    }

    async fn find_by_entity(
        &self,
        entity_id: EntityId,
    ) -> Result<Option<EntityLock>, LockStoreError> {
        let query = format!("SELECT {LOCK_COLUMNS} FROM cob_entity_locks WHERE entity_id = $1");
        sqlx::query_as::<_, EntityLockRow>(&query)
            .bind(entity_id)
            .fetch_optional(&self.pool)
            .await?
            .map(EntityLock::try_from)
            .transpose()
    }

    #[instrument(skip(self, failure))]
    async fn update_with_error(
        &self,
        entity_id: EntityId,
        owner: LockOwner,
        failure: LockFailure,
    ) -> Result<EntityLock, LockStoreError> {
        let query = format!(
            "INSERT INTO cob_entity_locks (entity_id, lock_owner, error, error_detail, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, NOW(), NOW()) \
             ON CONFLICT (entity_id) DO UPDATE \
             SET error = EXCLUDED.error, error_detail = EXCLUDED.error_detail, updated_at = NOW() \
             RETURNING {LOCK_COLUMNS}"
        );

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, EntityLockRow>(&query)
            .bind(entity_id)
            .bind(owner.as_str())
            .bind(&failure.message)
            .bind(&failure.detail)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        row.try_into()
    }

    async fn claim_failed(
        &self,
        entity_id: EntityId,
        from: LockOwner,
        to: LockOwner,
        observed_error: &str,
        business_date: Option<NaiveDate>,
    ) -> Result<Option<EntityLock>, LockStoreError> {
        let query = format!(
            "UPDATE cob_entity_locks \
             SET lock_owner = $3, business_date = COALESCE($5, business_date), \
                 error = NULL, error_detail = NULL, updated_at = NOW() \
             WHERE entity_id = $1 AND lock_owner = $2 AND error IS NOT DISTINCT FROM $4 \
             RETURNING {LOCK_COLUMNS}"
        );

        sqlx::query_as::<_, EntityLockRow>(&query)
            .bind(entity_id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(observed_error)
            .bind(business_date)
            .fetch_optional(&self.pool)
            .await?
            .map(EntityLock::try_from)
            .transpose()
    }

    async fn delete(&self, entity_id: EntityId, owner: LockOwner) -> Result<bool, LockStoreError> {
        let result =
            sqlx::query("DELETE FROM cob_entity_locks WHERE entity_id = $1 AND lock_owner = $2")
                .bind(entity_id)
                .bind(owner.as_str())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_with_errors(&self) -> Result<Vec<EntityLock>, LockStoreError> {
        let query = format!(
            "SELECT {LOCK_COLUMNS} FROM cob_entity_locks WHERE error IS NOT NULL ORDER BY entity_id"
        );
        sqlx::query_as::<_, EntityLockRow>(&query)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(EntityLock::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_conversion_rejects_unknown_owner() {
        let now = Utc::now();
        let row = EntityLockRow {
            entity_id: 11,
            lock_owner: "LOAN_INLINE_COB_PROCESSING".to_string(),
            business_date: None,
            error: None,
            error_detail: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            EntityLock::try_from(row),
            Err(LockStoreError::CorruptRow { entity_id: 11, .. })
        ));
    }
}
