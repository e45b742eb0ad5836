//! Keyed in-memory store used by the rate limiters, the brute-force tracker
//! and the in-memory session store.
//!
//! The [`KeyedStore`] trait is the seam for swapping in a shared store
//! (Redis, Postgres) when running more than one instance. [`MemoryStore`]
//! is the process-local implementation backed by `DashMap`, whose per-shard
//! locking makes [`KeyedStore::update`] an atomic read-modify-write.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Minimal key-value contract shared by every counter/session map.
pub trait KeyedStore<V>: Send + Sync {
    fn get(&self, key: &str) -> Option<V>;

    fn set(&self, key: &str, value: V);

    /// Remove `key`, returning whether it was present.
    fn delete(&self, key: &str) -> bool;

    /// Atomically replace the value under `key` with `f(current)` and return
    /// the new value. No other writer observes the intermediate state.
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<V>) -> V) -> V;

    /// Drop every entry for which `expired` returns true. Returns the number
    /// of entries removed.
    fn sweep(&self, expired: &dyn Fn(&V) -> bool) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-local [`KeyedStore`]. Cloning shares the underlying map.
pub struct MemoryStore<V> {
    entries: Arc<DashMap<String, V>>,
}

impl<V> MemoryStore<V> {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }
}

impl<V> Default for MemoryStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for MemoryStore<V> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<V> fmt::Debug for MemoryStore<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl<V> KeyedStore<V> for MemoryStore<V>
where
    V: Clone + Send + Sync,
{
    fn get(&self, key: &str) -> Option<V> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    fn set(&self, key: &str, value: V) {
        self.entries.insert(key.to_string(), value);
    }

    fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<V>) -> V) -> V {
        // The entry guard holds the shard lock until the new value is written.
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let next = f(Some(occupied.get().clone()));
                occupied.insert(next.clone());
                next
            }
            Entry::Vacant(vacant) => {
                let next = f(None);
                vacant.insert(next.clone());
                next
            }
        }
    }

    fn sweep(&self, expired: &dyn Fn(&V) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, value| !expired(value));
        before.saturating_sub(self.entries.len())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
