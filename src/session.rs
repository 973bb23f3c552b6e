//! Session secret storage.
//!
//! Handlers depend on the [`SessionStore`] trait rather than a process
//! global. The in-memory implementation expires entries after a period of
//! disuse and a background sweeper reclaims them, so the map cannot grow
//! without bound across long server lifetimes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Mapping from session id to the PAKE-derived shared secret.
pub trait SessionStore: Send + Sync {
    fn put(&self, id: &str, secret: Vec<u8>);
    fn get(&self, id: &str) -> Option<Vec<u8>>;
    fn delete(&self, id: &str);
}

struct Entry {
    secret: Vec<u8>,
    expires_at: Instant,
}

pub struct MemorySessionStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        MemorySessionStore {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Drops expired entries; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Periodic reclamation of expired sessions.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let dropped = store.sweep();
                if dropped > 0 {
                    tracing::debug!(dropped, "swept expired sessions");
                }
            }
        })
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, id: &str, secret: Vec<u8>) {
        let entry = Entry {
            secret,
            expires_at: Instant::now() + self.ttl,
        };
        self.entries.write().insert(id.to_string(), entry);
    }

    fn get(&self, id: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        // sliding expiry: every lookup extends the session's lease
        let mut entries = self.entries.write();
        let entry = entries.get_mut(id)?;
        if entry.expires_at <= now {
            entries.remove(id);
            return None;
        }
        entry.expires_at = now + self.ttl;
        Some(entry.secret.clone())
    }

    fn delete(&self, id: &str) {
        self.entries.write().remove(id);
    }
}
