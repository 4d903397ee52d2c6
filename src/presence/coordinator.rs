use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};

use super::store::{count_key, heartbeat_key, members_key, BatchOp, PresenceStore};
use crate::backend::ProfileResolver;
use crate::channel::RoomChannel;
use crate::error::{SessionError, StoreError};
use crate::messages::{PresenceUser, ServerMessage};
use crate::room::{RoomId, UserId};

pub const DEFAULT_HEARTBEAT_TTL: Duration = Duration::from_secs(70);

/// Maintains per-room presence on top of a shared [`PresenceStore`].
///
/// A user is a member of a room while at least one of their connections is
/// open there. Membership is only shown as live while the user's heartbeat
/// marker exists, which hides users whose connections died without leaving.
pub struct PresenceCoordinator {
    store: Arc<dyn PresenceStore>,
    profiles: Arc<dyn ProfileResolver>,
    channel: Arc<dyn RoomChannel>,
    heartbeat_ttl: Duration,
}

impl PresenceCoordinator {
    pub fn new(
        store: Arc<dyn PresenceStore>,
        profiles: Arc<dyn ProfileResolver>,
        channel: Arc<dyn RoomChannel>,
        heartbeat_ttl: Duration,
    ) -> Self {
        Self {
            store,
            profiles,
            channel,
            heartbeat_ttl,
        }
    }

    /// Registers one more connection of `user` in `room` and returns the
    /// user's open connection count.
    ///
    /// If a step after the increment fails, the reference is released again
    /// before the error is returned.
    pub async fn enter(&self, room: RoomId, user: UserId) -> Result<i64, StoreError> {
        let connections = self.store.increment(&count_key(room, user)).await?;
        if let Err(e) = self.register(room, user, connections).await {
            warn!("Entering room {} failed for user {}, releasing reference: {}", room, user, e);
            if let Err(rollback) = self.leave(room, user).await {
                error!("Failed to release reference of user {} in room {}: {}", user, room, rollback);
            }
            return Err(e);
        }
        Ok(connections)
    }

    async fn register(&self, room: RoomId, user: UserId, connections: i64) -> Result<(), StoreError> {
        // Only the increment that observes 1 adds the member, so concurrent
        // first connections cannot both add.
        if connections == 1 {
            self.store.add_to_set(&members_key(room), &user.to_string()).await?;
            info!("User {} entered room {}", user, room);
        } else {
            debug!("User {} opened connection {} in room {}", user, connections, room);
        }
        self.touch(room, user).await
    }

    /// Releases one connection of `user`. Returns `true` when it was the
    /// user's last one. Leaving without a reference is a no-op.
    pub async fn leave(&self, room: RoomId, user: UserId) -> Result<bool, StoreError> {
        let key = count_key(room, user);
        if !self.store.exists(&key).await? {
            return Ok(false);
        }
        let remaining = self.store.decrement(&key).await?;
        if remaining > 0 {
            debug!("User {} still has {} connection(s) in room {}", user, remaining, room);
            return Ok(false);
        }
        self.store
            .execute(&[
                BatchOp::Delete(key),
                BatchOp::RemoveFromSet {
                    set: members_key(room),
                    member: user.to_string(),
                },
            ])
            .await?;
        info!("User {} left room {}", user, room);
        Ok(true)
    }

    /// Refreshes the heartbeat marker. Does not touch the reference count.
    pub async fn touch(&self, room: RoomId, user: UserId) -> Result<(), StoreError> {
        self.store
            .set_with_expiry(&heartbeat_key(room, user), self.heartbeat_ttl)
            .await
    }

    /// Members of `room` whose heartbeat has not expired, ascending by id.
    pub async fn live_members(&self, room: RoomId) -> Result<Vec<UserId>, StoreError> {
        let members: Vec<UserId> = self
            .store
            .members(&members_key(room))
            .await?
            .into_iter()
            .filter_map(|member| match member.parse() {
                Ok(id) => Some(id),
                Err(_) => {
                    warn!("Ignoring malformed member {:?} in room {}", member, room);
                    None
                }
            })
            .collect();
        if members.is_empty() {
            return Ok(members);
        }

        let probes: Vec<BatchOp> = members
            .iter()
            .map(|user| BatchOp::Exists(heartbeat_key(room, *user)))
            .collect();
        let alive = self.store.execute(&probes).await?;

        let mut live: Vec<UserId> = members
            .into_iter()
            .zip(alive)
            .filter_map(|(user, flag)| (flag > 0).then_some(user))
            .collect();
        live.sort_unstable();
        Ok(live)
    }

    /// Full presence payload for `room`, recomputed from the store.
    pub async fn snapshot(&self, room: RoomId) -> Result<ServerMessage, SessionError> {
        let live = self.live_members(room).await?;
        let mut users: Vec<PresenceUser> = if live.is_empty() {
            Vec::new()
        } else {
            self.profiles
                .resolve(&live)
                .await?
                .into_iter()
                .map(|profile| PresenceUser {
                    id: profile.id,
                    username: profile.username,
                    profile_img: profile.avatar,
                })
                .collect()
        };
        users.sort_by_key(|user| user.id);
        Ok(ServerMessage::presence(users))
    }

    pub async fn broadcast(&self, room: RoomId) -> Result<(), SessionError> {
        let snapshot = self.snapshot(room).await?;
        self.channel.publish(room, &snapshot).await?;
        Ok(())
    }
}
