use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Per-subscriber queue depth. Slow subscribers drop oldest events.
const TOPIC_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    Execution,
    NodeStatus,
    FlowStatus,
    Log,
    GpioState,
}

const ALL_TOPICS: [Topic; 5] = [
    Topic::Execution,
    Topic::NodeStatus,
    Topic::FlowStatus,
    Topic::Log,
    Topic::GpioState,
];

#[derive(Debug, Clone, Serialize)]
pub struct BusEvent {
    pub topic: Topic,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

/// In-process pub/sub over a closed topic set.
///
/// Publish never blocks and ignores the no-subscriber case; per-topic
/// delivery order matches publish order for every subscriber.
pub struct MessageBus {
    channels: HashMap<Topic, broadcast::Sender<BusEvent>>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let channels = ALL_TOPICS
            .into_iter()
            .map(|t| (t, broadcast::channel(TOPIC_CAPACITY).0))
            .collect();
        MessageBus { channels }
    }

    pub fn publish(&self, topic: Topic, payload: Value) {
        let event = BusEvent {
            topic,
            payload,
            timestamp: Utc::now(),
        };
        // send() errors only when there are no subscribers.
        let _ = self.channels[&topic].send(event);
    }

    pub fn subscribe(&self, topic: Topic) -> Subscription {
        Subscription {
            topic,
            rx: self.channels[&topic].subscribe(),
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.channels[&topic].receiver_count()
    }
}

/// A single subscriber's view of one topic.
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<BusEvent>,
}

impl Subscription {
    /// Next event, transparently skipping over dropped backlog. Returns
    /// `None` once the bus side is gone.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(topic = ?self.topic, dropped = n, "slow subscriber dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
