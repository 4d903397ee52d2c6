use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use log::debug;
use tokio::sync::RwLock;

use super::{RoomChannel, Sink};
use crate::error::ChannelError;
use crate::messages::ServerMessage;
use crate::room::RoomId;

type Groups = Arc<RwLock<HashMap<RoomId, HashMap<String, Sink>>>>;

/// In-process fan-out: room -> subscriber id -> outbound queue.
#[derive(Clone, Default)]
pub struct LocalChannel {
    groups: Groups,
}

impl LocalChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber and reports whether it is the room's first.
    pub async fn insert(&self, room: RoomId, subscriber: &str, sink: Sink) -> bool {
        let mut groups = self.groups.write().await;
        let group = groups.entry(room).or_default();
        let first = group.is_empty();
        group.insert(subscriber.to_string(), sink);
        first
    }

    /// Removes a subscriber and reports whether the room is now empty.
    pub async fn remove(&self, room: RoomId, subscriber: &str) -> bool {
        let mut groups = self.groups.write().await;
        let Some(group) = groups.get_mut(&room) else {
            return false;
        };
        if group.remove(subscriber).is_none() {
            return false;
        }
        if group.is_empty() {
            groups.remove(&room);
            return true;
        }
        false
    }

    /// Hands an already serialized frame to every subscriber of `room`.
    pub async fn deliver(&self, room: RoomId, frame: &str) {
        let groups = self.groups.read().await;
        let Some(group) = groups.get(&room) else {
            return;
        };
        for (subscriber, sink) in group {
            if sink.send(frame.to_string()).is_err() {
                debug!("Dropping frame for closed subscriber {}", subscriber);
            }
        }
    }

    #[cfg(test)]
    pub async fn subscriber_count(&self, room: RoomId) -> usize {
        self.groups.read().await.get(&room).map_or(0, HashMap::len)
    }
}

#[async_trait]
impl RoomChannel for LocalChannel {
    async fn subscribe(&self, room: RoomId, subscriber: &str, sink: Sink) -> Result<(), ChannelError> {
        self.insert(room, subscriber, sink).await;
        Ok(())
    }

    async fn unsubscribe(&self, room: RoomId, subscriber: &str) {
        self.remove(room, subscriber).await;
    }

    async fn publish(&self, room: RoomId, event: &ServerMessage) -> Result<(), ChannelError> {
        let frame = serde_json::to_string(event)?;
        self.deliver(room, &frame).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn publish_reaches_only_room_subscribers() {
        let channel = LocalChannel::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        channel.subscribe(RoomId(7), "a", tx_a).await.unwrap();
        channel.subscribe(RoomId(8), "b", tx_b).await.unwrap();

        channel
            .publish(RoomId(7), &ServerMessage::presence(Vec::new()))
            .await
            .unwrap();

        let frame = rx_a.try_recv().unwrap();
        assert_eq!(frame, r#"{"type":"presence","users":[],"count":0}"#);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let channel = LocalChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(channel.insert(RoomId(1), "a", tx.clone()).await);
        assert!(!channel.insert(RoomId(1), "b", tx).await);
        assert_eq!(channel.subscriber_count(RoomId(1)).await, 2);

        assert!(!channel.remove(RoomId(1), "a").await);
        assert!(channel.remove(RoomId(1), "b").await);
        assert!(!channel.remove(RoomId(1), "b").await);

        channel.deliver(RoomId(1), "x").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn frames_arrive_in_publish_order() {
        let channel = LocalChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        channel.subscribe(RoomId(3), "a", tx).await.unwrap();
        for frame in ["1", "2", "3"] {
            channel.deliver(RoomId(3), frame).await;
        }
        let received: Vec<String> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(received, vec!["1", "2", "3"]);
    }
}
