//! ## skansen-core::events
//! **Policy event bus on crossbeam's segmented queue**
//!
//! Producers (policy watchers) push from any task; the scheduler drains the
//! queue between ticks. Capacity is a soft bound: a full queue rejects the
//! event, and the next resync tick covers whatever was lost.

use crossbeam::queue::SegQueue;
use thiserror::Error;

use crate::policy::PolicyEvent;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Event queue capacity exceeded")]
    QueueFull,
}

pub struct EventBus {
    queue: SegQueue<PolicyEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            capacity,
        }
    }

    pub fn event_enqueue(&self, event: PolicyEvent) -> Result<(), EventError> {
        if self.queue.len() >= self.capacity {
            return Err(EventError::QueueFull);
        }
        self.queue.push(event);
        Ok(())
    }

    pub fn event_dequeue(&self) -> Option<PolicyEvent> {
        self.queue.pop()
    }

    /// Takes everything queued right now, oldest first.
    pub fn event_drain(&self) -> Vec<PolicyEvent> {
        let mut drained = Vec::with_capacity(self.queue.len());
        while let Some(event) = self.queue.pop() {
            drained.push(event);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(1024)
    }
}
