use std::sync::Arc;
use log::debug;

use crate::backend::{MessageStore, Profile, ProfileResolver, StoredMessage};
use crate::channel::RoomChannel;
use crate::error::SessionError;
use crate::messages::{ChatPayload, ServerMessage};
use crate::room::{RoomId, UserId};

/// Persists chat messages and fans them out to the room.
pub struct MessageRelay {
    messages: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileResolver>,
    channel: Arc<dyn RoomChannel>,
}

impl MessageRelay {
    pub fn new(
        messages: Arc<dyn MessageStore>,
        profiles: Arc<dyn ProfileResolver>,
        channel: Arc<dyn RoomChannel>,
    ) -> Self {
        Self {
            messages,
            profiles,
            channel,
        }
    }

    /// Nothing is published unless the message was stored.
    pub async fn send(&self, room: RoomId, user: UserId, body: &str) -> Result<ChatPayload, SessionError> {
        let stored = self.messages.persist(room, user, body).await?;
        self.messages.add_participant(room, user).await?;

        let author = self.profiles.resolve(&[user]).await?.into_iter().next();
        let payload = chat_payload(&stored, author.as_ref());
        self.channel
            .publish(room, &ServerMessage::Chat { message: payload.clone() })
            .await?;
        debug!("Relayed message {} from user {} in room {}", stored.id, user, room);
        Ok(payload)
    }
}

pub fn chat_payload(message: &StoredMessage, author: Option<&Profile>) -> ChatPayload {
    ChatPayload {
        id: message.id,
        user: message.user,
        username: author.map_or_else(|| format!("user{}", message.user), |p| p.username.clone()),
        body: message.body.clone(),
        created: message.created.to_rfc3339(),
        profile_img: author.and_then(|p| p.avatar.clone()),
    }
}
