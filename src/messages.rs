use serde::{Deserialize, Serialize};

use crate::room::{MessageId, UserId};

/// Inbound frame, resolved once at the socket boundary.
///
/// Wire vocabulary: `{"type":"ping"}`, `{"type":"bye"}` and untyped
/// `{"body": "..."}` chat frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Ping,
    Bye,
    Chat { body: String },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: Option<String>,
    body: Option<String>,
}

impl ClientMessage {
    /// Returns `None` for frames that are not JSON objects or carry an
    /// unknown `type`. A chat frame without a body parses to an empty body.
    pub fn parse(text: &str) -> Option<Self> {
        let raw: RawFrame = serde_json::from_str(text).ok()?;
        match raw.kind.as_deref() {
            Some("ping") => Some(ClientMessage::Ping),
            Some("bye") => Some(ClientMessage::Bye),
            Some(_) => None,
            None => Some(ClientMessage::Chat {
                body: raw.body.unwrap_or_default(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    pub id: MessageId,
    pub user: UserId,
    pub username: String,
    pub body: String,
    /// RFC 3339 creation timestamp.
    pub created: String,
    pub profile_img: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: UserId,
    pub username: String,
    pub profile_img: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "chat")]
    Chat { message: ChatPayload },
    #[serde(rename = "presence")]
    Presence { users: Vec<PresenceUser>, count: usize },
}

impl ServerMessage {
    pub fn presence(users: Vec<PresenceUser>) -> Self {
        let count = users.len();
        ServerMessage::Presence { users, count }
    }
}
