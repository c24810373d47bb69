//! Session storage contract and the in-process default.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

use super::error::Result;

/// Opaque key/value session storage owned by the HTTP layer.
///
/// Sessions expire on the store's own TTL, independently of any token lifetime.
/// Each call must be atomic for its key; the reconciler relies on that to swap
/// a whole serialized token bundle in one write.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    /// Reads one field. Unknown and expired sessions read as empty.
    async fn get_field(&self, session_id: &str, key: &str) -> Result<Option<String>>;

    /// Writes one field, creating the session when needed.
    async fn set_field(&self, session_id: &str, key: &str, value: String) -> Result<()>;

    /// Deletes one field.
    async fn remove_field(&self, session_id: &str, key: &str) -> Result<()>;

    /// Drops every field of the session. Clearing an unknown session succeeds.
    async fn clear(&self, session_id: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
struct SessionEntry {
    expires_at: Instant,
    data: HashMap<String, String>,
}

/// Default session lifetime, one day of inactivity.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// In-memory session store with a sliding per-session TTL.
///
/// There is no background sweeper; expired sessions are dropped when touched
/// or by [`MemorySessionStore::purge_expired`].
#[derive(Clone)]
pub struct MemorySessionStore {
    sessions: Arc<DashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        MemorySessionStore { sessions: Arc::new(DashMap::new()), ttl }
    }

    /// Allocates an empty session and returns its id.
    pub fn new_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        self.sessions.insert(id.clone(), SessionEntry { expires_at: Instant::now() + self.ttl, data: HashMap::new() });
        id
    }

    /// Removes every expired session; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, entry| entry.expires_at > now);
        before - self.sessions.len()
    }

    /// Number of live or not-yet-purged sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of a session's fields, without touching its TTL.
    pub fn fields(&self, session_id: &str) -> HashMap<String, String> {
        let now = Instant::now();
        self.sessions
            .get(session_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.data.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_field(&self, session_id: &str, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let ttl = self.ttl;
        // Expired entries are removed only after the shard guard is released.
        let expired = match self.sessions.get_mut(session_id) {
            None => return Ok(None),
            Some(mut entry) if entry.expires_at > now => {
                entry.expires_at = now + ttl;
                return Ok(entry.data.get(key).cloned());
            }
            Some(_) => true,
        };
        if expired {
            self.sessions.remove_if(session_id, |_, entry| entry.expires_at <= now);
        }
        Ok(None)
    }

    async fn set_field(&self, session_id: &str, key: &str, value: String) -> Result<()> {
        let now = Instant::now();
        let mut entry = self
            .sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry { expires_at: now + self.ttl, data: HashMap::new() });
        if entry.expires_at <= now {
            entry.data.clear();
        }
        entry.expires_at = now + self.ttl;
        entry.data.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_field(&self, session_id: &str, key: &str) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.data.remove(key);
        }
        Ok(())
    }

    async fn clear(&self, session_id: &str) -> Result<()> {
        self.sessions.remove(session_id);
        Ok(())
    }
}
