//! Small time-bounded cache for expensive lookups (installed flows).

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;

struct Entry<V> {
    value: V,
    stored_at: Instant,
}

/// Key/value cache whose entries expire after a caller-chosen TTL.
///
/// The lock is never held across an `.await`; two concurrent misses may
/// both refresh, and the later write wins.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K, V> Default for TtlCache<K, V> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh cached value for `key`, if any.
    pub fn get(&self, key: &K, ttl: Duration) -> Option<V> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.value.clone())
    }

    pub fn put(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            Entry {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Return the cached value, or run `refresh` and cache its result.
    /// A failed refresh is not cached.
    pub async fn get_or_refresh<F, Fut>(&self, key: K, ttl: Duration, refresh: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(value) = self.get(&key, ttl) {
            return Ok(value);
        }
        let value = refresh().await?;
        self.put(key, value.clone());
        Ok(value)
    }

    pub fn invalidate(&self, key: &K) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    pub fn invalidate_all(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.clear();
    }
}
