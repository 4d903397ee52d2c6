//! Per-room fan-out.
//!
//! Delivery is best-effort and at-most-once. Publishes from one process are
//! observed in publish order by every current subscriber.

mod local;
mod redis;

pub use local::LocalChannel;
pub use self::redis::RedisChannel;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ChannelError;
use crate::messages::ServerMessage;
use crate::room::RoomId;

/// Outbound queue of one connection, carrying serialized frames.
pub type Sink = mpsc::UnboundedSender<String>;

#[async_trait]
pub trait RoomChannel: Send + Sync {
    /// Registers `sink` under `subscriber` for events published to `room`.
    async fn subscribe(&self, room: RoomId, subscriber: &str, sink: Sink) -> Result<(), ChannelError>;

    async fn unsubscribe(&self, room: RoomId, subscriber: &str);

    async fn publish(&self, room: RoomId, event: &ServerMessage) -> Result<(), ChannelError>;
}

/// Name of the room's address on a shared substrate.
pub fn group_name(room: RoomId) -> String {
    format!("room_{room}")
}
