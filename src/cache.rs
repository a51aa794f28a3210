use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A single-value TTL cache.
///
/// `get` returns `None` once the entry has expired; expired entries are
/// dropped lazily on read.
pub struct Cache<V> {
    entry: Mutex<Option<(V, Instant)>>,
    ttl: Duration,
}

impl<V: Clone> Cache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entry: Mutex::new(None),
            ttl,
        }
    }

    pub fn get(&self) -> Option<V> {
        let mut guard = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some((value, expiry)) if Instant::now() < *expiry => Some(value.clone()),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    pub fn set(&self, value: V) {
        let mut guard = self.entry.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some((value, Instant::now() + self.ttl));
    }
}

/// A keyed TTL cache with per-entry expiry.
pub struct MapCache<K, V> {
    entries: Mutex<HashMap<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash, V: Clone> MapCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match guard.get(key) {
            Some((value, expiry)) if Instant::now() < *expiry => Some(value.clone()),
            Some(_) => {
                guard.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: K, value: V) {
        let mut guard = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(key, (value, Instant::now() + self.ttl));
    }
}
