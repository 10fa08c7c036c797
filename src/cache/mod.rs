//! # Result cache
//!
//! A bounded, content-addressed memo of `(file, options) → result`. Concurrent requests for the
//! same key are serialized so the computation runs once; distinct keys never wait on each other.
//! Entries of a file are dropped as soon as its content fingerprint changes.
mod disk;
pub mod fingerprint;

pub use fingerprint::file_fingerprint;
pub use fingerprint::CacheKey;

use crate::cache::disk::DiskStore;
use chrono::DateTime;
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

pub const DEFAULT_CAPACITY: usize = 64;

/// Whether a result came from the cache.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Hit,
    Miss,
    /// Caching was disabled for the request
    Bypass,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    /// Absolute path of the source file
    pub path: PathBuf,
    pub fingerprint: String,
}

/// Thread-safe LRU cache with single-flight computation and optional disk persistence.
pub struct CacheLayer<V> {
    capacity: usize,
    /// Least recently used first
    entries: Mutex<IndexMap<String, Arc<CacheEntry<V>>>>,
    /// One lock per key that is being computed
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Last fingerprint seen for each source path
    fingerprints: Mutex<HashMap<PathBuf, String>>,
    disk: Option<DiskStore>,
}

impl<V> CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    pub fn new(capacity: usize) -> CacheLayer<V> {
        CacheLayer {
            capacity: capacity.max(1),
            entries: Mutex::new(IndexMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            fingerprints: Mutex::new(HashMap::new()),
            disk: None,
        }
    }

    /// Persists entries as JSON files under `directory` in addition to memory.
    pub fn with_directory(mut self, directory: &Path) -> CacheLayer<V> {
        self.disk = Some(DiskStore::new(directory));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the cached value for `key`, or runs `compute` once and stores its successful result.
    ///
    /// Callers racing on the same key wait for the first one and then share its result. Failed
    /// computations are not cached, the next caller computes again.
    pub fn get_or_compute<E, F>(&self, key: &CacheKey, compute: F) -> Result<(V, CacheStatus), E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        self.observe(key);
        if let Some(value) = self.lookup(&key.digest) {
            tracing::debug!("Cache hit for {key}");
            return Ok((value, CacheStatus::Hit));
        }

        let lock = self.in_flight.lock().entry(key.digest.clone()).or_default().clone();
        let result = {
            let _guard = lock.lock();
            self.compute_locked(key, compute)
        };
        drop(lock);
        // slots are only cloned under this lock, so a count of one means no caller holds it
        let mut in_flight = self.in_flight.lock();
        if in_flight.get(&key.digest).is_some_and(|slot| Arc::strong_count(slot) == 1) {
            in_flight.remove(&key.digest);
        }
        result
    }

    fn compute_locked<E, F>(&self, key: &CacheKey, compute: F) -> Result<(V, CacheStatus), E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(value) = self.lookup(&key.digest) {
            tracing::debug!("Cache hit for {key} after waiting");
            return Ok((value, CacheStatus::Hit));
        }
        if let Some(entry) = self.load_from_disk(key) {
            tracing::debug!("Disk cache hit for {key}");
            let value = entry.value.clone();
            self.insert(entry);
            return Ok((value, CacheStatus::Hit));
        }

        tracing::debug!("Cache miss for {key}");
        let value = compute()?;
        let entry = CacheEntry {
            key: key.digest.clone(),
            value: value.clone(),
            created_at: Utc::now(),
            path: key.path.clone(),
            fingerprint: key.fingerprint.clone(),
        };
        if let Some(disk) = &self.disk {
            if let Err(error) = disk.store(&entry) {
                tracing::warn!("Disk cache write failed for {key}: {error:#}");
            }
        }
        self.insert(entry);
        Ok((value, CacheStatus::Miss))
    }

    fn lookup(&self, digest: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let index = entries.get_index_of(digest)?;
        let last = entries.len() - 1;
        entries.move_index(index, last);
        entries.get_index(last).map(|(_, entry)| entry.value.clone())
    }

    fn load_from_disk(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        let disk = self.disk.as_ref()?;
        match disk.load::<V>(&key.digest) {
            Ok(Some(entry)) if entry.fingerprint == key.fingerprint => Some(entry),
            Ok(_) => None,
            Err(error) => {
                tracing::warn!("Disk cache read failed for {key}, treating as a miss: {error:#}");
                None
            }
        }
    }

    fn insert(&self, entry: CacheEntry<V>) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&entry.key);
        entries.insert(entry.key.clone(), Arc::new(entry));
        while entries.len() > self.capacity {
            if let Some((digest, _)) = entries.shift_remove_index(0) {
                tracing::debug!("Evicted cache entry {}", &digest[..digest.len().min(12)]);
            }
        }
    }

    /// Drops the entries of `key.path` when its fingerprint differs from the last one seen.
    fn observe(&self, key: &CacheKey) {
        let previous = self.fingerprints.lock().insert(key.path.clone(), key.fingerprint.clone());
        if let Some(previous) = previous {
            if previous != key.fingerprint {
                tracing::debug!("{} changed, invalidating its cache entries", key.path.display());
                self.remove_source(&key.path);
            }
        }
    }

    /// Removes every entry computed from `path`, in memory and on disk. Returns the number of
    /// in-memory entries removed.
    pub fn invalidate(&self, path: &Path) -> usize {
        let path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        self.fingerprints.lock().remove(&path);
        self.remove_source(&path)
    }

    fn remove_source(&self, path: &Path) -> usize {
        let removed = {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| entry.path != path);
            before - entries.len()
        };
        if let Some(disk) = &self.disk {
            if let Err(error) = disk.remove_source::<V>(path) {
                tracing::warn!("Disk cache invalidation failed for {}: {error:#}", path.display());
            }
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.fingerprints.lock().clear();
    }
}

impl<V> Default for CacheLayer<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    fn default() -> Self {
        CacheLayer::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn key(path: &str, fingerprint: &str, options: &str) -> CacheKey {
        CacheKey::new(Path::new(path), fingerprint, options)
    }

    #[test]
    fn second_call_is_a_hit() {
        let cache: CacheLayer<String> = CacheLayer::new(8);
        let calls = AtomicUsize::new(0);
        let compute = || -> Result<String, ()> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("rows".to_owned())
        };
        let first = key("/a.xlsx", "f1", "range=A1:B2");
        assert_eq!(cache.get_or_compute(&first, compute), Ok(("rows".to_owned(), CacheStatus::Miss)));
        assert_eq!(cache.get_or_compute(&first, compute), Ok(("rows".to_owned(), CacheStatus::Hit)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let other_options = key("/a.xlsx", "f1", "range=A1:B3");
        assert_eq!(cache.get_or_compute(&other_options, compute).map(|(_, status)| status), Ok(CacheStatus::Miss));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failures_are_not_cached() {
        let cache: CacheLayer<u32> = CacheLayer::new(8);
        let target = key("/a.xlsx", "f1", "");
        assert_eq!(cache.get_or_compute(&target, || Err::<u32, _>("boom")), Err("boom"));
        assert_eq!(cache.get_or_compute(&target, || Ok::<_, &str>(7)), Ok((7, CacheStatus::Miss)));
    }

    #[test]
    fn concurrent_callers_share_one_computation() {
        let cache: CacheLayer<u32> = CacheLayer::new(8);
        let calls = AtomicUsize::new(0);
        let target = key("/a.xlsx", "f1", "");
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let result = cache.get_or_compute(&target, || -> Result<u32, ()> {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(42)
                    });
                    assert_eq!(result.map(|(value, _)| value), Ok(42));
                });
            }
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.in_flight.lock().is_empty());
    }

    #[test]
    fn in_flight_slots_are_released_after_racing_failures() {
        let cache: CacheLayer<u32> = CacheLayer::new(8);
        for round in 0..20 {
            let targets: Vec<CacheKey> = (0..3).map(|n| key(&format!("/{round}-{n}.xlsx"), "f1", "")).collect();
            std::thread::scope(|scope| {
                for thread in 0..12 {
                    let target = &targets[thread % targets.len()];
                    let cache = &cache;
                    scope.spawn(move || {
                        let result = cache.get_or_compute(target, || Err::<u32, _>("boom"));
                        assert_eq!(result, Err("boom"));
                    });
                }
            });
            assert!(cache.in_flight.lock().is_empty(), "round {round} leaked a slot");
        }
        assert!(cache.is_empty());
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let cache: CacheLayer<u32> = CacheLayer::new(2);
        let (a, b, c) = (key("/a", "1", ""), key("/b", "1", ""), key("/c", "1", ""));
        let _ = cache.get_or_compute(&a, || Ok::<_, ()>(1));
        let _ = cache.get_or_compute(&b, || Ok::<_, ()>(2));
        let _ = cache.get_or_compute(&a, || Ok::<_, ()>(1));
        let _ = cache.get_or_compute(&c, || Ok::<_, ()>(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get_or_compute(&a, || Ok::<_, ()>(0)), Ok((1, CacheStatus::Hit)));
        assert_eq!(cache.get_or_compute(&b, || Ok::<_, ()>(0)), Ok((0, CacheStatus::Miss)));
    }

    #[test]
    fn fingerprint_change_and_explicit_invalidation() {
        let cache: CacheLayer<u32> = CacheLayer::new(8);
        let _ = cache.get_or_compute(&key("/a", "v1", "x"), || Ok::<_, ()>(1));
        let _ = cache.get_or_compute(&key("/a", "v1", "y"), || Ok::<_, ()>(2));
        assert_eq!(cache.len(), 2);

        let _ = cache.get_or_compute(&key("/a", "v2", "x"), || Ok::<_, ()>(3));
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.invalidate(Path::new("/a")), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn disk_entries_survive_a_new_layer() -> Result<(), Box<dyn std::error::Error>> {
        let directory = tempfile::tempdir()?;
        let target = key("/a.xlsx", "f1", "");
        let cache: CacheLayer<Vec<String>> = CacheLayer::new(4).with_directory(directory.path());
        cache.get_or_compute(&target, || Ok::<_, ()>(vec!["x".to_owned()])).map_err(|_| "compute failed")?;

        let reopened: CacheLayer<Vec<String>> = CacheLayer::new(4).with_directory(directory.path());
        let (value, status) = reopened
            .get_or_compute(&target, || Err::<Vec<String>, _>("must not compute"))?;
        assert_eq!(value, vec!["x".to_owned()]);
        assert_eq!(status, CacheStatus::Hit);
        Ok(())
    }
}
