use std::time::Duration;
use async_trait::async_trait;

use crate::error::StoreError;
use crate::room::{RoomId, UserId};

/// Room membership set key.
pub fn members_key(room: RoomId) -> String {
    format!("presence:room:{room}:members")
}

/// Per-user connection reference count key.
pub fn count_key(room: RoomId, user: UserId) -> String {
    format!("presence:room:{room}:user:{user}:count")
}

/// Per-user heartbeat marker key.
pub fn heartbeat_key(room: RoomId, user: UserId) -> String {
    format!("presence:room:{room}:user:{user}:hb")
}

/// One command inside a batched `execute`. Every variant yields an integer
/// reply: keys removed, members removed, or 0/1 for existence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    Delete(String),
    RemoveFromSet { set: String, member: String },
    Exists(String),
}

/// Shared TTL-capable key/value store holding presence state.
///
/// All methods are atomic per key. Implementations must be safe to share
/// between connections and server processes.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn increment(&self, key: &str) -> Result<i64, StoreError>;

    async fn decrement(&self, key: &str) -> Result<i64, StoreError>;

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError>;

    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Runs the ops in order and returns one reply per op.
    async fn execute(&self, ops: &[BatchOp]) -> Result<Vec<i64>, StoreError>;
}
