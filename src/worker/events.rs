//! Worker lifecycle events
//!
//! Observers subscribe through `tokio::sync::broadcast` receivers. Dropping a
//! receiver is the unsubscribe; there is no observer list to maintain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::core::ids::{InstanceId, ProcessId, RequestId, ThreadId};
use crate::worker::messages::WorkerMessage;

/// Observable transitions of a worker instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    Started {
        instance_id: InstanceId,
        process_id: ProcessId,
        thread_id: ThreadId,
    },
    Stopped {
        instance_id: InstanceId,
    },
    MessageReceived {
        instance_id: InstanceId,
        request_id: RequestId,
        message: WorkerMessage,
    },
}

impl WorkerEvent {
    pub fn instance_id(&self) -> InstanceId {
        match self {
            Self::Started { instance_id, .. }
            | Self::Stopped { instance_id }
            | Self::MessageReceived { instance_id, .. } => *instance_id,
        }
    }
}

/// Event with ordering metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub event: WorkerEvent,
}

/// Context-wide event bus shared by every instance of a registry
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wrap an event with the next sequence number
    pub fn envelope(&self, event: WorkerEvent) -> EventEnvelope {
        EventEnvelope {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            event,
        }
    }

    /// Publish to context-wide subscribers; no subscribers is not an error
    pub fn publish(&self, envelope: &EventEnvelope) {
        let _ = self.sender.send(envelope.clone());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_are_sequenced() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        let first = bus.envelope(WorkerEvent::Stopped {
            instance_id: InstanceId(1),
        });
        let second = bus.envelope(WorkerEvent::Stopped {
            instance_id: InstanceId(2),
        });
        bus.publish(&first);
        bus.publish(&second);

        assert_eq!(rx.try_recv().unwrap().sequence, 0);
        let received = rx.try_recv().unwrap();
        assert_eq!(received.sequence, 1);
        assert_eq!(received.event.instance_id(), InstanceId(2));
    }

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let bus = EventBus::new(1);
        let envelope = bus.envelope(WorkerEvent::Stopped {
            instance_id: InstanceId(9),
        });
        bus.publish(&envelope);
    }
}
