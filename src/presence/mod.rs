//! Live room presence: who is in a room right now.

mod coordinator;
mod memory;
mod redis;
mod store;

pub use coordinator::{PresenceCoordinator, DEFAULT_HEARTBEAT_TTL};
pub use memory::MemoryPresenceStore;
pub use self::redis::RedisPresenceStore;
pub use store::{BatchOp, PresenceStore};
