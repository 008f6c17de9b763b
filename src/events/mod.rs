//! # Business Events
//!
//! Events raised by business steps about the entity they process. In bulk mode
//! a pipeline's events are buffered and handed back as [`PendingEvents`], which
//! reach the sink only once the owning transaction has committed.

pub mod emitter;
pub mod sinks;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use emitter::{EventBuffer, EventEmitter, PendingEvents};
pub use sinks::{BroadcastEventSink, InMemoryEventSink, TracingEventSink};

use crate::models::EntityId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub event_id: Uuid,
    pub entity_id: EntityId,
    pub event_type: String,
    pub business_date: NaiveDate,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl BusinessEvent {
    pub fn new(
        entity_id: EntityId,
        event_type: impl Into<String>,
        business_date: NaiveDate,
        payload: Value,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            entity_id,
            event_type: event_type.into(),
            business_date,
            payload,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Event sink rejected {count} event(s): {message}")]
    Rejected { count: usize, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, events: Vec<BusinessEvent>) -> Result<(), EventError>;
}
