//! Outbound notifications from the router.
//!
//! One broadcast channel carries every event; subscribers (SSE handlers,
//! tests) filter by conversation id. Slow subscribers lag and lose old
//! events rather than backpressuring the router.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::router::{ConversationStatus, FailureCode};

const EVENT_CAPACITY: usize = 256;

/// Something a subscriber might care about.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    /// An agent produced a reply (intermediate hop or final answer).
    AgentReply {
        conversation_id: String,
        agent_id: String,
        content: String,
        turn_index: u32,
        model_id: String,
        /// True when the reply went to the user rather than another agent.
        is_final: bool,
    },
    /// The conversation left the ACTIVE state.
    ConversationEnded {
        conversation_id: String,
        status: ConversationStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        failure: Option<FailureCode>,
        turn_count: u32,
    },
}

impl RouterEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            RouterEvent::AgentReply {
                conversation_id, ..
            } => conversation_id,
            RouterEvent::ConversationEnded {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// Broadcast fan-out for router events.
pub struct EventBus {
    tx: broadcast::Sender<RouterEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouterEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. Nobody listening is fine.
    pub fn publish(&self, event: RouterEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RouterEvent::ConversationEnded {
            conversation_id: "c1".to_string(),
            status: ConversationStatus::Terminated,
            failure: None,
            turn_count: 4,
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.conversation_id(), "c1");
    }

    #[test]
    fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.publish(RouterEvent::AgentReply {
            conversation_id: "c1".to_string(),
            agent_id: "a".to_string(),
            content: "hi".to_string(),
            turn_index: 1,
            model_id: "test/mini".to_string(),
            is_final: true,
        });
    }

    #[test]
    fn test_events_serialize_with_type_tags() {
        let event = RouterEvent::ConversationEnded {
            conversation_id: "c1".to_string(),
            status: ConversationStatus::Escalated,
            failure: Some(FailureCode::LoopDetected),
            turn_count: 9,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "conversation_ended");
        assert_eq!(json["status"], "escalated");
        assert_eq!(json["failure"], "LOOP_DETECTED");
    }
}
