//! # Event Bus
//!
//! Typed lifecycle/processing events a dashboard or external watcher would
//! subscribe to (spec.md §9 Design Notes). The dashboard push itself is out of
//! scope, but the bus it would consume is: one `broadcast` channel per engine,
//! producers on the controller and pipeline, any number of consumers registered
//! for the lifetime of their subscription.

use crate::model::{ChannelId, ConnectorMessageStatus};
use tokio::sync::broadcast;

/// A channel's lifecycle transition, per the state graph in spec.md §4.G.
#[derive(Debug, Clone)]
pub struct StateChanged {
    pub channel_id: ChannelId,
    pub from: String,
    pub to: String,
}

/// One message finishing the pipeline (spec.md §4.E step 5).
#[derive(Debug, Clone)]
pub struct MessageProcessed {
    pub channel_id: ChannelId,
    pub message_id: i64,
    pub source_status: ConnectorMessageStatus,
    pub destination_statuses: Vec<(i32, ConnectorMessageStatus)>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    StateChanged(StateChanged),
    MessageProcessed(MessageProcessed),
}

/// A cloneable handle around a `tokio::sync::broadcast` sender. Cloning shares
/// the same underlying channel; each subscriber gets its own receiver and sees
/// every event published after it subscribes.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Silently drops it if there are no subscribers, matching
    /// `broadcast::Sender::send`'s semantics (an error there just means nobody
    /// is listening right now, not a failure of the publish itself).
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        bus.publish(EngineEvent::StateChanged(StateChanged {
            channel_id: Uuid::new_v4(),
            from: "STOPPED".to_string(),
            to: "STARTED".to_string(),
        }));
        let event = rx.recv().await.unwrap();
        matches!(event, EngineEvent::StateChanged(_));
    }
}
