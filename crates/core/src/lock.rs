//! In-process advisory locks that expire on their own.
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct Holder {
    token: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct Inner<K> {
    held: Mutex<HashMap<K, Holder>>,
    next_token: AtomicU64,
}

/// A set of keyed try-locks with a TTL.
///
/// A lock whose guard was leaked (task panicked or hung) becomes acquirable
/// again once its TTL elapses.
pub struct TtlLockSet<K> {
    ttl: Duration,
    inner: Arc<Inner<K>>,
}

impl<K> Clone for TtlLockSet<K> {
    fn clone(&self) -> Self {
        Self {
            ttl: self.ttl,
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: fmt::Debug> fmt::Debug for TtlLockSet<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlLockSet")
            .field("ttl", &self.ttl)
            .field("held", &self.inner.held.lock().len())
            .finish()
    }
}

impl<K: Eq + Hash + Clone> TtlLockSet<K> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Arc::new(Inner {
                held: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(1),
            }),
        }
    }

    /// Acquires `key` unless a live holder exists.
    pub fn try_lock(&self, key: K) -> Option<TtlLockGuard<K>> {
        let now = Instant::now();
        let mut held = self.inner.held.lock();
        if let Some(holder) = held.get(&key) {
            if holder.expires_at > now {
                return None;
            }
        }

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        held.insert(
            key.clone(),
            Holder {
                token,
                expires_at: now + self.ttl,
            },
        );
        Some(TtlLockGuard {
            key,
            token,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.inner
            .held
            .lock()
            .get(key)
            .is_some_and(|holder| holder.expires_at > Instant::now())
    }
}

/// Releases its key on drop, unless the lock already expired and was re-taken.
pub struct TtlLockGuard<K: Eq + Hash> {
    key: K,
    token: u64,
    inner: Arc<Inner<K>>,
}

impl<K: Eq + Hash> TtlLockGuard<K> {
    pub const fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash + fmt::Debug> fmt::Debug for TtlLockGuard<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlLockGuard").field("key", &self.key).finish()
    }
}

impl<K: Eq + Hash> Drop for TtlLockGuard<K> {
    fn drop(&mut self) {
        let mut held = self.inner.held.lock();
        if held.get(&self.key).is_some_and(|holder| holder.token == self.token) {
            held.remove(&self.key);
        }
    }
}
