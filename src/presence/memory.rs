use std::collections::{HashMap, HashSet};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::store::{BatchOp, PresenceStore};
use crate::error::StoreError;

#[derive(Default)]
struct State {
    counters: HashMap<String, i64>,
    sets: HashMap<String, HashSet<String>>,
    markers: HashMap<String, Instant>,
}

impl State {
    fn purge_expired(&mut self, now: Instant) {
        self.markers.retain(|_, deadline| *deadline > now);
    }

    fn exists(&self, key: &str) -> bool {
        self.counters.contains_key(key)
            || self.sets.get(key).is_some_and(|set| !set.is_empty())
            || self.markers.contains_key(key)
    }

    fn delete(&mut self, key: &str) -> i64 {
        let removed = self.counters.remove(key).is_some()
            | self.sets.remove(key).is_some_and(|set| !set.is_empty())
            | self.markers.remove(key).is_some();
        i64::from(removed)
    }

    fn remove_from_set(&mut self, set: &str, member: &str) -> i64 {
        let Some(entries) = self.sets.get_mut(set) else {
            return 0;
        };
        let removed = entries.remove(member);
        if entries.is_empty() {
            self.sets.remove(set);
        }
        i64::from(removed)
    }

    fn adjust(&mut self, key: &str, delta: i64) -> i64 {
        let value = self.counters.entry(key.to_string()).or_insert(0);
        *value += delta;
        *value
    }
}

/// Single-process presence store. Expiry follows the tokio clock, so paused
/// test time drives heartbeat expiry.
#[derive(Default)]
pub struct MemoryPresenceStore {
    state: Mutex<State>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops a key of any kind. Used to simulate a counter lost to a crash.
    #[cfg(test)]
    pub async fn forget(&self, key: &str) {
        self.state.lock().await.delete(key);
    }

    #[cfg(test)]
    pub async fn counter(&self, key: &str) -> Option<i64> {
        self.state.lock().await.counters.get(key).copied()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn increment(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.adjust(key, 1))
    }

    async fn decrement(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.adjust(key, -1))
    }

    async fn add_to_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn remove_from_set(&self, set: &str, member: &str) -> Result<(), StoreError> {
        self.state.lock().await.remove_from_set(set, member);
        Ok(())
    }

    async fn members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .sets
            .get(set)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        Ok(state.exists(key))
    }

    async fn set_with_expiry(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.markers.insert(key.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn execute(&self, ops: &[BatchOp]) -> Result<Vec<i64>, StoreError> {
        let mut state = self.state.lock().await;
        state.purge_expired(Instant::now());
        let replies = ops
            .iter()
            .map(|op| match op {
                BatchOp::Delete(key) => state.delete(key),
                BatchOp::RemoveFromSet { set, member } => state.remove_from_set(set, member),
                BatchOp::Exists(key) => i64::from(state.exists(key)),
            })
            .collect();
        Ok(replies)
    }
}
