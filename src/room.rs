use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};

macro_rules! numeric_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                s.trim().parse().map($name)
            }
        }
    };
}

numeric_id!(RoomId);
numeric_id!(UserId);
numeric_id!(MessageId);

/// Durable room record as the backend keeps it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    /// Users who have ever chatted here. Unrelated to live presence.
    pub participants: BTreeSet<UserId>,
}

impl Room {
    pub fn new(id: RoomId, name: String) -> Self {
        Room {
            id,
            name,
            participants: BTreeSet::new(),
        }
    }

    /// Returns `true` if the user was not already a participant.
    pub fn add_participant(&mut self, user: UserId) -> bool {
        self.participants.insert(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_parse_and_display() {
        let room: RoomId = " 7 ".parse().unwrap();
        assert_eq!(room, RoomId(7));
        assert_eq!(room.to_string(), "7");
        assert!("seven".parse::<UserId>().is_err());
    }

    #[test]
    fn ids_serialize_as_plain_numbers() {
        assert_eq!(serde_json::to_string(&UserId(42)).unwrap(), "42");
        let id: MessageId = serde_json::from_str("9").unwrap();
        assert_eq!(id, MessageId(9));
    }

    #[test]
    fn participant_add_is_idempotent() {
        let mut room = Room::new(RoomId(1), "lobby".to_string());
        assert!(room.add_participant(UserId(3)));
        assert!(!room.add_participant(UserId(3)));
        assert_eq!(room.participants.len(), 1);
    }
}
