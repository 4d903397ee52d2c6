use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("presence store command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("room channel command failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("room {0} not found")]
    RoomNotFound(crate::room::RoomId),
    #[error("message {0} not found")]
    MessageNotFound(crate::room::MessageId),
    #[error("not allowed")]
    Forbidden,
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("connection carries no authenticated identity")]
    Unauthenticated,
    #[error("session is not joined")]
    NotJoined,
    #[error("session is closed")]
    Closed,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SessionError {
    /// Whether the session must close instead of processing further frames.
    /// Backend failures only fail the frame that caused them.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SessionError::Backend(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },
}
