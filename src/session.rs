//! One connection's lifecycle: `Connecting -> Joined -> Closed`.

use std::sync::Arc;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::{RoomChannel, Sink};
use crate::error::SessionError;
use crate::messages::ClientMessage;
use crate::presence::PresenceCoordinator;
use crate::relay::MessageRelay;
use crate::room::{RoomId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Joined,
    Closed,
}

/// Shared services every session talks to.
#[derive(Clone)]
pub struct SessionContext {
    pub presence: Arc<PresenceCoordinator>,
    pub relay: Arc<MessageRelay>,
    pub channel: Arc<dyn RoomChannel>,
}

pub struct ConnectionSession {
    id: String,
    room: RoomId,
    user: Option<UserId>,
    state: SessionState,
    sink: Sink,
    subscribed: bool,
    // Each session owns at most one presence reference.
    holds_presence: bool,
    ctx: SessionContext,
}

impl ConnectionSession {
    pub fn new(ctx: SessionContext, room: RoomId, user: Option<UserId>, sink: Sink) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            room,
            user,
            state: SessionState::Connecting,
            sink,
            subscribed: false,
            holds_presence: false,
            ctx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Subscribes to the room, enters presence and broadcasts a snapshot.
    ///
    /// Anonymous sessions close without touching the store or the channel.
    /// Any other failure closes the session before returning.
    pub async fn join(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connecting => {}
            SessionState::Joined => return Ok(()),
            SessionState::Closed => return Err(SessionError::Closed),
        }
        let Some(user) = self.user else {
            self.state = SessionState::Closed;
            warn!("Rejecting anonymous connection {} to room {}", self.id, self.room);
            return Err(SessionError::Unauthenticated);
        };

        if let Err(e) = self.enter(user).await {
            self.close().await;
            return Err(e);
        }
        self.state = SessionState::Joined;
        info!("Session {} joined room {} as user {}", self.id, self.room, user);

        if let Err(e) = self.ctx.presence.broadcast(self.room).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn enter(&mut self, user: UserId) -> Result<(), SessionError> {
        self.ctx
            .channel
            .subscribe(self.room, &self.id, self.sink.clone())
            .await?;
        self.subscribed = true;
        self.ctx.presence.enter(self.room, user).await?;
        self.holds_presence = true;
        Ok(())
    }

    /// Handles one inbound text frame. Malformed frames are dropped.
    pub async fn receive(&mut self, frame: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Joined {
            return Err(SessionError::NotJoined);
        }
        let Some(event) = ClientMessage::parse(frame) else {
            debug!("Dropping malformed frame on session {}", self.id);
            return Ok(());
        };
        self.handle(event).await
    }

    pub async fn handle(&mut self, event: ClientMessage) -> Result<(), SessionError> {
        let user = match (self.state, self.user) {
            (SessionState::Joined, Some(user)) => user,
            _ => return Err(SessionError::NotJoined),
        };
        match event {
            ClientMessage::Ping => self.on_heartbeat(user).await,
            ClientMessage::Bye => self.on_leave(user).await,
            ClientMessage::Chat { body } => self.on_chat(user, &body).await,
        }
    }

    async fn on_heartbeat(&self, user: UserId) -> Result<(), SessionError> {
        self.ctx.presence.touch(self.room, user).await?;
        self.ctx.presence.broadcast(self.room).await
    }

    async fn on_leave(&mut self, user: UserId) -> Result<(), SessionError> {
        if self.holds_presence {
            self.ctx.presence.leave(self.room, user).await?;
            self.holds_presence = false;
        }
        self.ctx.presence.broadcast(self.room).await
    }

    async fn on_chat(&self, user: UserId, body: &str) -> Result<(), SessionError> {
        let body = body.trim();
        if body.is_empty() {
            return Ok(());
        }
        self.ctx.relay.send(self.room, user, body).await?;
        Ok(())
    }

    /// Leaves presence, unsubscribes and re-broadcasts, in that order.
    /// Every step runs even if an earlier one fails. Idempotent.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_joined = self.state == SessionState::Joined;
        self.state = SessionState::Closed;
        let Some(user) = self.user else {
            return;
        };

        if self.holds_presence {
            if let Err(e) = self.ctx.presence.leave(self.room, user).await {
                error!("Failed to leave room {} for session {}: {}", self.room, self.id, e);
            }
            self.holds_presence = false;
        }
        if self.subscribed {
            self.ctx.channel.unsubscribe(self.room, &self.id).await;
            self.subscribed = false;
        }
        if was_joined {
            if let Err(e) = self.ctx.presence.broadcast(self.room).await {
                error!("Failed to broadcast presence for room {}: {}", self.room, e);
            }
        }
        info!("Session {} closed", self.id);
    }
}

/// Owns a session and guarantees its [`ConnectionSession::close`] runs.
///
/// `finish` closes in place. If the guard is dropped instead (task aborted,
/// panic unwinding) the close is spawned onto the current runtime.
pub struct SessionGuard {
    session: Option<ConnectionSession>,
}

impl SessionGuard {
    pub fn new(session: ConnectionSession) -> Self {
        Self {
            session: Some(session),
        }
    }

    pub async fn receive(&mut self, frame: &str) -> Result<(), SessionError> {
        match self.session.as_mut() {
            Some(session) => session.receive(frame).await,
            None => Err(SessionError::Closed),
        }
    }

    pub async fn finish(mut self) {
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.state() == SessionState::Closed {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("Session {} dropped before closing, cleaning up in background", session.id);
                handle.spawn(async move {
                    session.close().await;
                });
            }
            Err(_) => error!(
                "Session {} dropped outside a runtime; presence expires with its heartbeat",
                session.id
            ),
        }
    }
}
