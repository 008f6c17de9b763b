use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::info;

use super::{BusinessEvent, EventError, EventSink};

/// Collects published events for inspection
#[derive(Debug, Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<BusinessEvent>>,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BusinessEvent> {
        self.events.lock().clone()
    }

    pub fn events_for(&self, entity_id: i64) -> Vec<BusinessEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.entity_id == entity_id)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn publish(&self, events: Vec<BusinessEvent>) -> Result<(), EventError> {
        self.events.lock().extend(events);
        Ok(())
    }
}

/// Fan-out of business events to in-process subscribers
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<BusinessEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusinessEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventSink for BroadcastEventSink {
    async fn publish(&self, events: Vec<BusinessEvent>) -> Result<(), EventError> {
        for event in events {
            // No subscribers is not an error for publication
            let _ = self.sender.send(event);
        }
        Ok(())
    }
}

/// Writes each event to the structured log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn publish(&self, events: Vec<BusinessEvent>) -> Result<(), EventError> {
        for event in events {
            info!(
                event_id = %event.event_id,
                entity_id = event.entity_id,
                event_type = %event.event_type,
                business_date = %event.business_date,
                payload = %serde_json::to_string(&event.payload)?,
                "BUSINESS_EVENT"
            );
        }
        Ok(())
    }
}
