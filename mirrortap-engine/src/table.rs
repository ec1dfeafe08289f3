//! Bounded session store with least-recently-used eviction
//!
//! One coarse lock serializes every mutation; lookups refresh recency so the
//! eviction victim is always the entry with the oldest last access. The
//! table never closes sockets itself — eviction hands the victim back to the
//! caller, which schedules an asynchronous close through the multiplexer.

use crate::session::{Session, SessionKey};
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;

pub type SessionRef = Arc<RwLock<Session>>;

/// Bounded key -> session store
pub struct SessionTable {
    inner: Mutex<LruCache<SessionKey, SessionRef>>,
    capacity: usize,
}

impl SessionTable {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
        }
    }

    /// Look up a session, refreshing its recency.
    pub fn get(&self, key: &SessionKey) -> Option<SessionRef> {
        self.inner.lock().get(key).cloned()
    }

    /// Insert a session. When the table is full the least-recently-used
    /// entry is evicted and returned so its socket can be closed.
    pub fn put(&self, key: SessionKey, session: SessionRef) -> Option<(SessionKey, SessionRef)> {
        let evicted = self.inner.lock().push(key, session);
        if let Some((victim, _)) = &evicted {
            trace!("session evicted: {}", victim);
        }
        evicted
    }

    /// Remove a session; removing an absent key is a no-op.
    pub fn remove(&self, key: &SessionKey) -> Option<SessionRef> {
        self.inner.lock().pop(key)
    }

    /// Remove only if the table still holds this exact session. Guards the
    /// teardown paths against a key that was evicted and re-created.
    pub fn remove_if_same(&self, key: &SessionKey, session: &SessionRef) -> bool {
        let mut inner = self.inner.lock();
        match inner.peek(key) {
            Some(current) if Arc::ptr_eq(current, session) => {
                inner.pop(key);
                true
            }
            _ => false,
        }
    }

    /// Live sessions for maintenance sweeps; does not refresh recency.
    pub fn snapshot(&self) -> Vec<(SessionKey, SessionRef)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
