use std::collections::HashMap;
use std::sync::Arc;
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{group_name, LocalChannel, RoomChannel, Sink};
use crate::error::ChannelError;
use crate::messages::ServerMessage;
use crate::room::RoomId;

/// Fan-out across server processes over Redis pub/sub.
///
/// Each process keeps one Redis subscription per room that has local
/// subscribers and relays every payload into a [`LocalChannel`]. Publishes
/// always go through Redis, so the publishing process receives its own
/// events exactly like its peers do.
pub struct RedisChannel {
    client: redis::Client,
    publisher: MultiplexedConnection,
    local: LocalChannel,
    relays: Relays,
}

type RelaySlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Relay tasks keyed by room. The map lock is only held to look up a slot;
/// the slot lock serializes subscribe and unsubscribe within one room.
#[derive(Default)]
struct Relays {
    slots: Mutex<HashMap<RoomId, RelaySlot>>,
}

impl Relays {
    async fn slot(&self, room: RoomId) -> RelaySlot {
        self.slots.lock().await.entry(room).or_default().clone()
    }
}

/// A missing relay or one whose stream ended must be (re)started.
fn needs_relay(relay: Option<&JoinHandle<()>>) -> bool {
    relay.map_or(true, JoinHandle::is_finished)
}

impl RedisChannel {
    pub async fn connect(client: redis::Client) -> Result<Self, ChannelError> {
        let publisher = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            client,
            publisher,
            local: LocalChannel::new(),
            relays: Relays::default(),
        })
    }

    async fn start_relay(&self, room: RoomId) -> Result<JoinHandle<()>, ChannelError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(group_name(room)).await?;
        info!("Subscribed to {}", group_name(room));

        let local = self.local.clone();
        Ok(tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(frame) => local.deliver(room, &frame).await,
                    Err(e) => warn!("Dropping undecodable payload on {}: {}", group_name(room), e),
                }
            }
            warn!("Relay for {} ended, resubscribing on next join", group_name(room));
        }))
    }
}

#[async_trait]
impl RoomChannel for RedisChannel {
    async fn subscribe(&self, room: RoomId, subscriber: &str, sink: Sink) -> Result<(), ChannelError> {
        let slot = self.relays.slot(room).await;
        let mut relay = slot.lock().await;
        if needs_relay(relay.as_ref()) {
            // SUBSCRIBE is confirmed before returning so the caller's first
            // publish is not missed.
            *relay = Some(self.start_relay(room).await?);
        }
        self.local.insert(room, subscriber, sink).await;
        Ok(())
    }

    async fn unsubscribe(&self, room: RoomId, subscriber: &str) {
        let slot = self.relays.slot(room).await;
        let mut relay = slot.lock().await;
        if self.local.remove(room, subscriber).await {
            if let Some(handle) = relay.take() {
                handle.abort();
                info!("Unsubscribed from {}", group_name(room));
            }
        }
    }

    async fn publish(&self, room: RoomId, event: &ServerMessage) -> Result<(), ChannelError> {
        let frame = serde_json::to_string(event)?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn.publish(group_name(room), frame).await?;
        debug!("Published to {} ({} receivers)", group_name(room), receivers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ended_relay_is_restarted() {
        assert!(needs_relay(None));

        let running = tokio::spawn(std::future::pending::<()>());
        assert!(!needs_relay(Some(&running)));
        running.abort();

        let ended = tokio::spawn(async {});
        while !ended.is_finished() {
            tokio::task::yield_now().await;
        }
        assert!(needs_relay(Some(&ended)));
    }

    #[tokio::test]
    async fn rooms_lock_independently() {
        let relays = Relays::default();
        let first = relays.slot(RoomId(1)).await;
        let _held = first.lock().await;

        let other = relays.slot(RoomId(2)).await;
        assert!(other.try_lock().is_ok());
        assert!(Arc::ptr_eq(&first, &relays.slot(RoomId(1)).await));
    }
}
