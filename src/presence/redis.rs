use std::time::Duration;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use super::store::{BatchOp, PresenceStore};
use crate::error::StoreError;

/// Presence store shared by every server process through one Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: MultiplexedConnection,
}

impl RedisPresenceStore {
    pub async fn connect(client: &redis::Client) -> Result<Self, StoreError> {
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.incr(key, 1).await?)
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.decr(key, 1).await?)
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.sadd(set, member).await?;
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.srem(set, member).await?;
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(set).await?)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let () = conn.set_ex(key, "1", ttl.as_secs().max(1)).await?;
        Ok(())
    }

    async fn execute(&self, ops: &[BatchOp]) -> Result<Vec<i64>, StoreError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for op in ops {
            match op {
                BatchOp::Delete(key) => pipe.del(key),
                BatchOp::RemoveFromSet { set, member } => pipe.srem(set, member),
                BatchOp::Exists(key) => pipe.exists(key),
            };
        }
        let mut conn = self.conn.clone();
        let replies: Vec<i64> = pipe.query_async(&mut conn).await?;
        Ok(replies)
    }
}
