//! In-memory dedup caches.
//!
//! [`Cache`] is a TTL'd string map. [`PersistableCache`] wraps it and
//! checkpoints its contents into a source's progress token at a fixed
//! insertion interval, which is what makes interrupted object scans
//! resumable.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::progress::Progress;

/// Entries older than this are treated as missing.
const DEFAULT_EXPIRATION: Duration = Duration::from_secs(12 * 60 * 60);

/// Expired entries are swept out of the map once this much time has passed
/// since the last sweep. The sweep runs lazily on mutation instead of on a
/// janitor thread.
const PURGE_INTERVAL: Duration = Duration::from_secs(13 * 60 * 60);

/// How many inserts between checkpoints of a [`PersistableCache`].
pub const DEFAULT_PERSIST_INCREMENT: usize = 2500;

struct Entry {
    value: String,
    inserted: Instant,
}

struct Inner {
    map: HashMap<String, Entry>,
    last_purge: Instant,
}

/// Thread-safe string cache with a fixed TTL.
pub struct Cache {
    inner: Mutex<Inner>,
    expiration: Duration,
    purge_interval: Duration,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        Self::with_expiration(DEFAULT_EXPIRATION, PURGE_INTERVAL)
    }

    pub fn with_expiration(expiration: Duration, purge_interval: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner { map: HashMap::new(), last_purge: Instant::now() }),
            expiration,
            purge_interval,
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        let mut inner = self.lock();
        if inner.last_purge.elapsed() >= self.purge_interval {
            let expiration = self.expiration;
            inner.map.retain(|_, e| e.inserted.elapsed() < expiration);
            inner.last_purge = Instant::now();
        }
        inner
            .map
            .insert(key.to_string(), Entry { value: value.to_string(), inserted: Instant::now() });
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let inner = self.lock();
        inner
            .map
            .get(key)
            .filter(|e| e.inserted.elapsed() < self.expiration)
            .map(|e| e.value.clone())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn delete(&self, key: &str) {
        self.lock().map.remove(key);
    }

    /// Number of live (unexpired) entries.
    pub fn count(&self) -> usize {
        let inner = self.lock();
        inner.map.values().filter(|e| e.inserted.elapsed() < self.expiration).count()
    }

    /// Comma-joined live keys, in arbitrary order.
    pub fn contents(&self) -> String {
        self.keys().join(",")
    }

    pub fn keys(&self) -> Vec<String> {
        let inner = self.lock();
        inner
            .map
            .iter()
            .filter(|(_, e)| e.inserted.elapsed() < self.expiration)
            .map(|(k, _)| k.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("cache lock poisoned")
    }
}

/// A dedup cache bound to a [`Progress`] value.
///
/// After every `set`, if the live entry count is a multiple of the persist
/// increment, the full key set is serialized into the progress's
/// `encoded_resume_info`. The progress write is advisory; last writer wins.
pub struct PersistableCache {
    cache: Cache,
    persist_increment: usize,
    progress: Arc<Mutex<Progress>>,
}

impl PersistableCache {
    pub fn new(progress: Arc<Mutex<Progress>>, persist_increment: usize) -> Self {
        let persist_increment = persist_increment.max(1);
        Self { cache: Cache::new(), persist_increment, progress }
    }

    /// Repopulate from a previously persisted resume string.
    pub fn load(&self, encoded: &str) {
        for key in encoded.split(',').map(str::trim).filter(|k| !k.is_empty()) {
            self.cache.set(key, key);
        }
    }

    pub fn set(&self, key: &str, value: &str) {
        self.cache.set(key, value);
        if self.cache.count() % self.persist_increment == 0 {
            let contents = self.cache.contents();
            self.progress.lock().expect("progress lock poisoned").encoded_resume_info = contents;
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.cache.get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.cache.exists(key)
    }

    pub fn delete(&self, key: &str) {
        self.cache.delete(key)
    }

    pub fn count(&self) -> usize {
        self.cache.count()
    }

    pub fn contents(&self) -> String {
        self.cache.contents()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persistable(increment: usize) -> (PersistableCache, Arc<Mutex<Progress>>) {
        let progress = Arc::new(Mutex::new(Progress::default()));
        (PersistableCache::new(progress.clone(), increment), progress)
    }

    #[test]
    fn cache_set_get_delete() {
        let cache = Cache::new();
        cache.set("k", "v");
        assert_eq!(cache.get("k").as_deref(), Some("v"));
        assert!(cache.exists("k"));
        cache.delete("k");
        assert!(!cache.exists("k"));
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn cache_expiry_hides_entries() {
        let cache = Cache::with_expiration(Duration::from_millis(0), Duration::from_secs(3600));
        cache.set("k", "v");
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.count(), 0);
    }

    #[test]
    fn contents_joins_keys_with_commas() {
        let cache = Cache::new();
        cache.set("a", "a");
        cache.set("b", "b");
        let mut keys: Vec<_> = cache.contents().split(',').map(str::to_string).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn persists_only_on_increment_multiples() {
        let (cache, progress) = persistable(3);
        cache.set("a", "a");
        cache.set("b", "b");
        assert!(progress.lock().unwrap().encoded_resume_info.is_empty());
        cache.set("c", "c");
        let persisted = progress.lock().unwrap().encoded_resume_info.clone();
        let mut keys: Vec<_> = persisted.split(',').collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn small_insert_count_leaves_resume_empty() {
        let (cache, progress) = persistable(DEFAULT_PERSIST_INCREMENT);
        for i in 0..4 {
            cache.set(&format!("md5-{i}"), &format!("md5-{i}"));
        }
        assert!(progress.lock().unwrap().encoded_resume_info.is_empty());
    }

    #[test]
    fn full_increment_persists_whole_set() {
        let (cache, progress) = persistable(DEFAULT_PERSIST_INCREMENT);
        for i in 0..DEFAULT_PERSIST_INCREMENT {
            cache.set(&format!("md5-{i}"), &format!("md5-{i}"));
        }
        let persisted = progress.lock().unwrap().encoded_resume_info.clone();
        assert_eq!(persisted.split(',').count(), DEFAULT_PERSIST_INCREMENT);
    }

    #[test]
    fn resume_round_trip_preserves_set() {
        let (cache, progress) = persistable(2);
        cache.set("aaa", "aaa");
        cache.set("bbb", "bbb");
        let persisted = progress.lock().unwrap().encoded_resume_info.clone();

        let (reloaded, _) = persistable(2);
        reloaded.load(&persisted);
        assert!(reloaded.exists("aaa"));
        assert!(reloaded.exists("bbb"));
        assert_eq!(reloaded.count(), 2);
    }
}
