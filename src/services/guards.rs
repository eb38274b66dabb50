//! In-flight markers for folder and thread syncs.
//!
//! A marker is taken with an atomic check-then-insert and released when its
//! [`GuardToken`] drops. Markers can also be cleared from outside, which is
//! how a running folder sync is asked to stop; a token only removes the entry
//! it created, so a sync started after a forced clear keeps its marker.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
pub(crate) struct GuardSet<K> {
    active: Mutex<HashMap<K, u64>>,
    generation: AtomicU64,
}

impl<K: Eq + Hash + Clone> GuardSet<K> {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<K, u64>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `key` as in flight, or returns `None` when it already is.
    pub fn try_acquire(&self, key: &K) -> Option<GuardToken<'_, K>> {
        let mut entries = self.entries();
        if entries.contains_key(key) {
            return None;
        }
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(key.clone(), generation);
        Some(GuardToken {
            set: self,
            key: key.clone(),
            generation,
        })
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries().contains_key(key)
    }

    /// Removes the marker regardless of who holds it.
    pub fn clear(&self, key: &K) -> bool {
        self.entries().remove(key).is_some()
    }

    fn release(&self, key: &K, generation: u64) {
        let mut entries = self.entries();
        if entries.get(key) == Some(&generation) {
            entries.remove(key);
        }
    }
}

/// Holds one marker until dropped.
#[derive(Debug)]
pub(crate) struct GuardToken<'a, K: Eq + Hash + Clone> {
    set: &'a GuardSet<K>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash + Clone> GuardToken<'_, K> {
    /// False once the marker was cleared from outside.
    pub fn is_held(&self) -> bool {
        self.set.entries().get(&self.key) == Some(&self.generation)
    }
}

impl<K: Eq + Hash + Clone> Drop for GuardToken<'_, K> {
    fn drop(&mut self) {
        self.set.release(&self.key, self.generation);
    }
}
