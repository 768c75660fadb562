//! In-memory caches for registry-enumerated metadata.
//!
//! Two shapes: a single versions snapshot with a freshness window, and
//! per-tag indices that are populated once and never refreshed for the
//! lifetime of the process. Locks are held only across memory operations;
//! all registry I/O happens outside, behind a single-flight key.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use semver::Version;

/// The last successful listing of release versions.
struct Snapshot {
    versions: Vec<Version>,
    fetched_at: Instant,
}

/// TTL-windowed snapshot of available versions.
pub struct VersionsCache {
    window: Duration,
    inner: Mutex<Option<Snapshot>>,
}

impl VersionsCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            inner: Mutex::new(None),
        }
    }

    /// The current snapshot, only if it is still inside the freshness window.
    pub fn fresh(&self) -> Option<Vec<Version>> {
        let inner = self.inner.lock().expect("versions snapshot poisoned");
        inner
            .as_ref()
            .filter(|snapshot| snapshot.fetched_at.elapsed() < self.window)
            .map(|snapshot| snapshot.versions.clone())
    }

    /// The last committed snapshot regardless of age.
    pub fn current(&self) -> Option<Vec<Version>> {
        let inner = self.inner.lock().expect("versions snapshot poisoned");
        inner.as_ref().map(|snapshot| snapshot.versions.clone())
    }

    /// Commit a fresh snapshot. The timestamp is taken here, under the lock,
    /// so readers always observe a consistent (list, timestamp) pair.
    pub fn publish(&self, versions: Vec<Version>) {
        let mut inner = self.inner.lock().expect("versions snapshot poisoned");
        *inner = Some(Snapshot {
            versions,
            fetched_at: Instant::now(),
        });
    }
}

/// Tag-keyed metadata lists, populated at most once per tag.
pub struct TagIndex<T> {
    map: Mutex<HashMap<String, Vec<T>>>,
}

impl<T: Clone> Default for TagIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TagIndex<T> {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, tag: &str) -> Option<Vec<T>> {
        self.map
            .lock()
            .expect("tag index poisoned")
            .get(tag)
            .cloned()
    }

    /// Install the list for `tag`. An already-populated tag keeps its
    /// original list.
    pub fn insert(&self, tag: &str, items: Vec<T>) {
        self.map
            .lock()
            .expect("tag index poisoned")
            .entry(tag.to_string())
            .or_insert(items);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versions_cache_window() {
        let cache = VersionsCache::new(Duration::from_millis(50));
        assert!(cache.fresh().is_none());
        assert!(cache.current().is_none());

        cache.publish(vec![Version::new(1, 7, 0)]);
        assert_eq!(cache.fresh().unwrap(), vec![Version::new(1, 7, 0)]);

        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.fresh().is_none());
        // The stale snapshot is still readable for post-refresh fallback.
        assert_eq!(cache.current().unwrap(), vec![Version::new(1, 7, 0)]);
    }

    #[test]
    fn test_publish_replaces_snapshot() {
        let cache = VersionsCache::new(Duration::from_secs(60));
        cache.publish(vec![Version::new(1, 7, 0)]);
        cache.publish(vec![Version::new(1, 7, 0), Version::new(1, 8, 0)]);
        assert_eq!(cache.fresh().unwrap().len(), 2);
    }

    #[test]
    fn test_tag_index_inserts_once() {
        let index = TagIndex::new();
        assert!(index.get("v1.7.0").is_none());

        index.insert("v1.7.0", vec!["a"]);
        index.insert("v1.7.0", vec!["b"]);
        assert_eq!(index.get("v1.7.0").unwrap(), vec!["a"]);
        assert!(index.get("v1.8.0").is_none());
    }
}
