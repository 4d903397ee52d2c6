//! Durable-store collaborators: message history, room participants and
//! public user profiles.

use std::collections::{BTreeMap, HashMap};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::BackendError;
use crate::room::{MessageId, Room, RoomId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: MessageId,
    pub room: RoomId,
    pub user: UserId,
    pub body: String,
    pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    pub avatar: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn persist(&self, room: RoomId, user: UserId, body: &str) -> Result<StoredMessage, BackendError>;

    /// Messages of `room`, newest first, plus the room's total count.
    async fn read_page(
        &self,
        room: RoomId,
        offset: usize,
        limit: usize,
    ) -> Result<Page<StoredMessage>, BackendError>;

    /// Idempotent.
    async fn add_participant(&self, room: RoomId, user: UserId) -> Result<(), BackendError>;

    async fn participants(&self, room: RoomId) -> Result<Vec<UserId>, BackendError>;

    /// Deletes a message on behalf of `requester`, who must be its author.
    async fn delete(&self, id: MessageId, requester: UserId) -> Result<(), BackendError>;
}

#[async_trait]
pub trait ProfileResolver: Send + Sync {
    /// Unknown ids are skipped. Output order is unspecified.
    async fn resolve(&self, users: &[UserId]) -> Result<Vec<Profile>, BackendError>;
}

#[derive(Default)]
struct State {
    rooms: HashMap<RoomId, Room>,
    messages: BTreeMap<MessageId, StoredMessage>,
    profiles: HashMap<UserId, Profile>,
    next_message: i64,
}

/// In-process backend used for development and tests.
#[derive(Default)]
pub struct MemoryBackend {
    state: RwLock<State>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_room(&self, id: RoomId, name: &str) {
        let mut state = self.state.write().await;
        state.rooms.entry(id).or_insert_with(|| Room::new(id, name.to_string()));
    }

    pub async fn add_profile(&self, profile: Profile) {
        let mut state = self.state.write().await;
        state.profiles.insert(profile.id, profile);
    }

    #[cfg(test)]
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn persist(&self, room: RoomId, user: UserId, body: &str) -> Result<StoredMessage, BackendError> {
        let mut state = self.state.write().await;
        if !state.rooms.contains_key(&room) {
            return Err(BackendError::RoomNotFound(room));
        }
        state.next_message += 1;
        let message = StoredMessage {
            id: MessageId(state.next_message),
            room,
            user,
            body: body.to_string(),
            created: Utc::now(),
        };
        state.messages.insert(message.id, message.clone());
        Ok(message)
    }

    async fn read_page(
        &self,
        room: RoomId,
        offset: usize,
        limit: usize,
    ) -> Result<Page<StoredMessage>, BackendError> {
        let state = self.state.read().await;
        if !state.rooms.contains_key(&room) {
            return Err(BackendError::RoomNotFound(room));
        }
        let mut items: Vec<&StoredMessage> = state.messages.values().filter(|m| m.room == room).collect();
        items.sort_by(|a, b| b.created.cmp(&a.created).then(b.id.cmp(&a.id)));
        let total = items.len();
        let items = items.into_iter().skip(offset).take(limit).cloned().collect();
        Ok(Page { items, total })
    }

    async fn add_participant(&self, room: RoomId, user: UserId) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let record = state.rooms.get_mut(&room).ok_or(BackendError::RoomNotFound(room))?;
        record.add_participant(user);
        Ok(())
    }

    async fn participants(&self, room: RoomId) -> Result<Vec<UserId>, BackendError> {
        let state = self.state.read().await;
        let record = state.rooms.get(&room).ok_or(BackendError::RoomNotFound(room))?;
        Ok(record.participants.iter().copied().collect())
    }

    async fn delete(&self, id: MessageId, requester: UserId) -> Result<(), BackendError> {
        let mut state = self.state.write().await;
        let message = state.messages.get(&id).ok_or(BackendError::MessageNotFound(id))?;
        if message.user != requester {
            return Err(BackendError::Forbidden);
        }
        state.messages.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl ProfileResolver for MemoryBackend {
    async fn resolve(&self, users: &[UserId]) -> Result<Vec<Profile>, BackendError> {
        let state = self.state.read().await;
        Ok(users.iter().filter_map(|id| state.profiles.get(id).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.add_room(RoomId(7), "lobby").await;
        backend
    }

    #[tokio::test]
    async fn persist_requires_existing_room() {
        let backend = backend().await;
        let err = backend.persist(RoomId(99), UserId(1), "hi").await.unwrap_err();
        assert!(matches!(err, BackendError::RoomNotFound(RoomId(99))));
        assert_eq!(backend.message_count().await, 0);
    }

    #[tokio::test]
    async fn pages_are_newest_first() {
        let backend = backend().await;
        for body in ["one", "two", "three"] {
            backend.persist(RoomId(7), UserId(1), body).await.unwrap();
        }
        let page = backend.read_page(RoomId(7), 0, 2).await.unwrap();
        assert_eq!(page.total, 3);
        let bodies: Vec<&str> = page.items.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["three", "two"]);

        let rest = backend.read_page(RoomId(7), 2, 2).await.unwrap();
        assert_eq!(rest.items.len(), 1);
        assert_eq!(rest.items[0].body, "one");
    }

    #[tokio::test]
    async fn only_author_may_delete() {
        let backend = backend().await;
        let message = backend.persist(RoomId(7), UserId(1), "mine").await.unwrap();

        let err = backend.delete(message.id, UserId(2)).await.unwrap_err();
        assert!(matches!(err, BackendError::Forbidden));
        assert_eq!(backend.message_count().await, 1);

        backend.delete(message.id, UserId(1)).await.unwrap();
        let err = backend.delete(message.id, UserId(1)).await.unwrap_err();
        assert!(matches!(err, BackendError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn resolve_skips_unknown_users() {
        let backend = backend().await;
        backend
            .add_profile(Profile { id: UserId(1), username: "alice".to_string(), avatar: None })
            .await;
        let profiles = backend.resolve(&[UserId(1), UserId(2)]).await.unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].username, "alice");
    }

    #[tokio::test]
    async fn participants_are_deduplicated() {
        let backend = backend().await;
        backend.add_participant(RoomId(7), UserId(2)).await.unwrap();
        backend.add_participant(RoomId(7), UserId(2)).await.unwrap();
        assert_eq!(backend.participants(RoomId(7)).await.unwrap(), vec![UserId(2)]);
    }
}
