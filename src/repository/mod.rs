//! # Entity Repository
//!
//! Persistence seams the runners drive: transactional load/save of the
//! processed entity and selection of the candidates for a business date.
//! Mapping the entity to storage belongs to the host application; the
//! in-memory implementation serves embedded use and tests.

pub mod in_memory;

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

pub use in_memory::InMemoryEntityRepository;

use crate::models::{CobEntity, EntityId};

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("Entity {0} not found")]
    NotFound(EntityId),

    #[error("Failed to read entity {entity_id}: {message}")]
    Read { entity_id: EntityId, message: String },

    #[error("Failed to write entity {entity_id}: {message}")]
    Write { entity_id: EntityId, message: String },

    #[error("Transaction commit failed: {0}")]
    Commit(String),

    #[error("Repository backend error: {0}")]
    Backend(String),
}

/// One unit of work over entities. Writes become visible to other readers only
/// after `commit`; dropping the transaction without committing discards them.
#[async_trait]
pub trait EntityTransaction<E: CobEntity>: Send {
    async fn load(&mut self, entity_id: EntityId) -> Result<E, RepositoryError>;

    async fn save(&mut self, entity: E) -> Result<(), RepositoryError>;

    async fn commit(self: Box<Self>) -> Result<(), RepositoryError>;

    async fn rollback(self: Box<Self>) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait EntityRepository<E: CobEntity>: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn EntityTransaction<E>>, RepositoryError>;

    /// Committed state of one entity, outside any transaction
    async fn find(&self, entity_id: EntityId) -> Result<Option<E>, RepositoryError>;
}

/// Source of the entity ids a batch run processes
#[async_trait]
pub trait CandidateSelector: Send + Sync {
    /// Ids eligible for `business_date`, in a stable order
    async fn select_candidates(
        &self,
        business_date: NaiveDate,
    ) -> Result<Vec<EntityId>, RepositoryError>;

    /// Oldest last-closed business date among entities behind `cob_date`
    async fn oldest_last_closed_date(
        &self,
        _cob_date: NaiveDate,
    ) -> Result<Option<NaiveDate>, RepositoryError> {
        Ok(None)
    }
}
