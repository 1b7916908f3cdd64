//! Fan-out pipeline for Rookery Server
//!
//! A durable send is split in two phases; this module is the publish side.
//! Events committed by the chat service are pushed onto an ordered
//! in-process log (a tokio broadcast channel) that every session gateway
//! subscribes to in full. Each event carries its topic and, for message
//! traffic, a conversation key (`group:{id}` or the unordered user pair
//! `dm:{min}:{max}`): consumers may rely on commit order within one key but
//! never across keys.
//!
//! Delivery is at-least-once and fire-and-forget. A gateway with no locally
//! attached session for the target drops the event; clients refetch history
//! on reconnect. Publishing never fails a send: with no subscribers the
//! event is simply dropped, and lagged subscribers are logged and skip
//! ahead.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::messages::MessageWire;

/// Default capacity of the broadcast log
pub const DEFAULT_CAPACITY: usize = 1024;

/// Ordering key: one conversation, private or group.
///
/// Private conversations use the unordered pair of user ids so both
/// directions of a 1:1 chat share a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct(i64, i64),
    Group(i64),
}

impl ConversationKey {
    /// Key for a private conversation between two users, order-insensitive
    pub fn direct(user_a: i64, user_b: i64) -> Self {
        ConversationKey::Direct(user_a.min(user_b), user_a.max(user_b))
    }

    pub fn group(group_id: i64) -> Self {
        ConversationKey::Group(group_id)
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationKey::Direct(a, b) => write!(f, "dm:{}:{}", a, b),
            ConversationKey::Group(id) => write!(f, "group:{}", id),
        }
    }
}

/// Read receipt on the `read-receipts` topic, delivered back to the
/// sender's live sessions
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptEvent {
    pub message_id: String,
    pub sender_username: String,
    pub receiver_username: String,
}

/// Roster delta kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RosterEventKind {
    Join,
    Leave,
}

/// Presence roster delta on the public presence channel.
///
/// `online_users` is the comma-joined full online set at the time of the
/// delta, matching the public channel's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RosterEvent {
    #[serde(rename = "type")]
    pub kind: RosterEventKind,
    pub username: String,
    pub online_users: String,
}

/// One event on the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Message(MessageWire),
    ReadReceipt(ReadReceiptEvent),
    Roster(RosterEvent),
}

impl PipelineEvent {
    /// Topic name, mirroring the external log's topic layout
    pub fn topic(&self) -> &'static str {
        match self {
            PipelineEvent::Message(_) => "messages",
            PipelineEvent::ReadReceipt(_) => "read-receipts",
            PipelineEvent::Roster(_) => "presence",
        }
    }

    /// Conversation ordering key; roster and receipt events are unkeyed
    pub fn key(&self) -> Option<ConversationKey> {
        match self {
            PipelineEvent::Message(m) => Some(match (m.receiver_id, m.group_id) {
                (_, Some(g)) => ConversationKey::group(g),
                (Some(r), None) => ConversationKey::direct(m.sender_id, r),
                (None, None) => return None,
            }),
            _ => None,
        }
    }
}

/// Handle to the fan-out log. Cheap to clone; every gateway task holds one.
#[derive(Clone)]
pub struct Pipeline {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Pipeline {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Never fails: with no live subscribers the event is
    /// dropped, which is the correct at-least-once behavior (clients refetch
    /// history on reconnect).
    pub fn publish(&self, event: PipelineEvent) {
        let topic = event.topic();
        let key = event.key().map(|k| k.to_string());
        match self.tx.send(event) {
            Ok(receivers) => {
                debug!(topic, key = key.as_deref(), receivers, "Published pipeline event");
            }
            Err(_) => {
                debug!(topic, key = key.as_deref(), "No pipeline subscribers, event dropped");
            }
        }
    }

    /// Subscribe to the full log
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Number of live subscribers (gateway sessions plus sweepers)
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DeliveryStatus;
    use chrono::Utc;

    fn wire(sender: i64, receiver: Option<i64>, group: Option<i64>, content: &str) -> MessageWire {
        MessageWire {
            id: uuid::Uuid::now_v7().to_string(),
            sender_id: sender,
            receiver_id: receiver,
            group_id: group,
            content: content.to_string(),
            timestamp: Utc::now(),
            status: DeliveryStatus::Delivered,
        }
    }

    #[test]
    fn test_conversation_key_unordered_pair() {
        assert_eq!(
            ConversationKey::direct(7, 3),
            ConversationKey::direct(3, 7)
        );
        assert_eq!(ConversationKey::direct(3, 7).to_string(), "dm:3:7");
        assert_eq!(ConversationKey::group(5).to_string(), "group:5");
    }

    #[test]
    fn test_event_topics_and_keys() {
        let msg = PipelineEvent::Message(wire(1, Some(2), None, "hi"));
        assert_eq!(msg.topic(), "messages");
        assert_eq!(msg.key(), Some(ConversationKey::direct(1, 2)));
        assert_eq!(msg, msg.clone());

        let group = PipelineEvent::Message(wire(1, None, Some(9), "hi"));
        assert_eq!(group.key(), Some(ConversationKey::group(9)));

        let receipt = PipelineEvent::ReadReceipt(ReadReceiptEvent {
            message_id: "m".to_string(),
            sender_username: "alice".to_string(),
            receiver_username: "bob".to_string(),
        });
        assert_eq!(receipt.topic(), "read-receipts");
        assert_eq!(receipt.key(), None);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_harmless() {
        let pipeline = Pipeline::default();
        pipeline.publish(PipelineEvent::Message(wire(1, Some(2), None, "hi")));
        assert_eq!(pipeline.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_commit_order_per_key() {
        let pipeline = Pipeline::default();
        let mut rx = pipeline.subscribe();

        for i in 0..3 {
            pipeline.publish(PipelineEvent::Message(wire(
                1,
                Some(2),
                None,
                &format!("msg {}", i),
            )));
        }

        for i in 0..3 {
            match rx.recv().await.unwrap() {
                PipelineEvent::Message(m) => assert_eq!(m.content, format!("msg {}", i)),
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_sees_every_event() {
        let pipeline = Pipeline::default();
        let mut rx_a = pipeline.subscribe();
        let mut rx_b = pipeline.subscribe();

        pipeline.publish(PipelineEvent::Roster(RosterEvent {
            kind: RosterEventKind::Join,
            username: "alice".to_string(),
            online_users: "alice".to_string(),
        }));

        assert!(matches!(
            rx_a.recv().await.unwrap(),
            PipelineEvent::Roster(_)
        ));
        assert!(matches!(
            rx_b.recv().await.unwrap(),
            PipelineEvent::Roster(_)
        ));
    }

    #[tokio::test]
    async fn test_subscriber_sees_only_events_published_after_subscribe() {
        let pipeline = Pipeline::default();

        // A session must subscribe before its JOIN is published or it will
        // never see its own roster delta
        pipeline.publish(PipelineEvent::Roster(RosterEvent {
            kind: RosterEventKind::Join,
            username: "early".to_string(),
            online_users: "early".to_string(),
        }));

        let mut rx = pipeline.subscribe();
        assert!(rx.try_recv().is_err());

        pipeline.publish(PipelineEvent::Roster(RosterEvent {
            kind: RosterEventKind::Join,
            username: "late".to_string(),
            online_users: "early,late".to_string(),
        }));
        match rx.recv().await.unwrap() {
            PipelineEvent::Roster(event) => assert_eq!(event.username, "late"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_roster_event_wire_shape() {
        let ev = RosterEvent {
            kind: RosterEventKind::Leave,
            username: "bob".to_string(),
            online_users: "alice,carol".to_string(),
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["type"], "LEAVE");
        assert_eq!(json["onlineUsers"], "alice,carol");
    }
}
