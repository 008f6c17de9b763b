use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::{BusinessEvent, EventError, EventSink};

/// Entry point steps use to raise events
#[derive(Clone)]
pub struct EventEmitter {
    sink: Arc<dyn EventSink>,
    bulk_mode: bool,
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("bulk_mode", &self.bulk_mode)
            .finish_non_exhaustive()
    }
}

impl EventEmitter {
    pub fn new(sink: Arc<dyn EventSink>, bulk_mode: bool) -> Self {
        Self { sink, bulk_mode }
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk_mode
    }

    /// Publish immediately, bypassing any buffer
    pub async fn emit(&self, event: BusinessEvent) -> Result<(), EventError> {
        self.sink.publish(vec![event]).await
    }

    /// A fresh buffer scoped to one entity's pipeline
    pub fn buffer(&self) -> EventBuffer {
        EventBuffer::default()
    }

    /// Wrap buffered events so they reach the sink only when flushed
    pub fn pending(&self, events: Vec<BusinessEvent>) -> PendingEvents {
        PendingEvents {
            sink: Arc::clone(&self.sink),
            events,
        }
    }
}

#[derive(Debug, Default)]
pub struct EventBuffer {
    events: Mutex<Vec<BusinessEvent>>,
}

impl EventBuffer {
    pub fn emit_buffered(&self, event: BusinessEvent) {
        self.events.lock().push(event);
    }

    /// Drop everything buffered so far
    pub fn reset(&self) {
        self.events.lock().clear();
    }

    pub fn take(&self) -> Vec<BusinessEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

/// Events waiting for their transaction to commit. Flushing consumes the
/// value; dropping it discards the events.
#[must_use = "pending events are discarded unless flushed"]
pub struct PendingEvents {
    sink: Arc<dyn EventSink>,
    events: Vec<BusinessEvent>,
}

impl fmt::Debug for PendingEvents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingEvents")
            .field("events", &self.events.len())
            .finish_non_exhaustive()
    }
}

impl PendingEvents {
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[BusinessEvent] {
        &self.events
    }

    pub fn merge(&mut self, mut other: PendingEvents) {
        self.events.append(&mut other.events);
    }

    /// Deliver every pending event to the sink in one call
    pub async fn flush(mut self) -> Result<usize, EventError> {
        let events = std::mem::take(&mut self.events);
        let count = events.len();
        if count > 0 {
            self.sink.publish(events).await?;
        }
        Ok(count)
    }
}

impl Drop for PendingEvents {
    fn drop(&mut self) {
        if !self.events.is_empty() {
            debug!(
                discarded = self.events.len(),
                "Discarding business events of an uncommitted pipeline"
            );
        }
    }
}
