//! # Event Bus
//!
//! Fan-out of membership snapshots, chat messages, and system notices to
//! local subscribers. Built on `tokio::sync::broadcast`: multi-producer,
//! multi-consumer, with a bounded per-subscriber buffer that drops the
//! oldest events when a subscriber stalls, so publishing never blocks the
//! engine.

use std::net::IpAddr;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::diagnostics::Diagnostics;
use crate::identity::NodeId;
use crate::wire::ChatScope;

/// One peer entry in a membership snapshot.
#[derive(Clone, Debug, Serialize)]
pub struct PeerSummary {
    pub id: NodeId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
}

/// Membership snapshot emitted on every change.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MembershipUpdate {
    /// Size of the membership view, local node included.
    pub count: usize,
    /// Open peer sockets.
    pub direct: usize,
    /// Lifetime count of distinct admitted ids.
    pub total_unique: u64,
    /// The local node's id.
    pub id: NodeId,
    pub peers: Vec<PeerSummary>,
    pub diagnostics: Diagnostics,
}

/// A chat message surfaced to subscribers.
#[derive(Clone, Debug, Serialize)]
pub struct ChatEvent {
    pub sender: NodeId,
    pub content: String,
    pub timestamp: u64,
    pub scope: ChatScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<NodeId>,
}

/// Everything the engine pushes to local subscribers.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    #[serde(rename = "MEMBERSHIP")]
    Membership(MembershipUpdate),
    #[serde(rename = "CHAT")]
    Chat(ChatEvent),
    #[serde(rename = "SYSTEM")]
    System { content: String, timestamp: u64 },
}

/// Broadcast handle owned by the engine actor.
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers. A send with no subscribers is
    /// not an error; events are simply dropped.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(EngineEvent::System {
            content: "up".into(),
            timestamp: 1,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::System { content, timestamp } => {
                assert_eq!(content, "up");
                assert_eq!(timestamp, 1);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(16);
        bus.publish(EngineEvent::System {
            content: "dropped".into(),
            timestamp: 2,
        });
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for i in 0..4u64 {
            bus.publish(EngineEvent::System {
                content: format!("event {}", i),
                timestamp: i,
            });
        }

        // The first recv reports the lag, subsequent recvs see the newest
        // retained events.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        match rx.recv().await.unwrap() {
            EngineEvent::System { timestamp, .. } => assert_eq!(timestamp, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn membership_update_serializes_payload_shape() {
        let update = MembershipUpdate {
            count: 3,
            direct: 2,
            total_unique: 5,
            id: NodeId::from_bytes([1u8; 32]),
            peers: vec![PeerSummary {
                id: NodeId::from_bytes([2u8; 32]),
                ip: None,
            }],
            diagnostics: Diagnostics::default(),
        };
        let json = serde_json::to_value(EngineEvent::Membership(update)).unwrap();

        assert_eq!(json["type"], "MEMBERSHIP");
        assert_eq!(json["count"], 3);
        assert_eq!(json["totalUnique"], 5);
        assert!(json["peers"][0].get("ip").is_none());
        assert!(json["diagnostics"].get("heartbeatsReceived").is_some());
    }
}
