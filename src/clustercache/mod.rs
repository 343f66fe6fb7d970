//! Shared in-memory read cache of cluster payloads
//!
//! Two keying disciplines share one cache: content-based entries are keyed
//! by the cluster's hash and live in a set of shards common to all volumes
//! (handle 0); location-based entries are keyed by cluster address inside a
//! private per-volume handle with its own entry cap. Content and location
//! entries never share a shard, so a volume switching discipline cannot
//! observe stale entries from the other.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::types::{CacheHandle, ClusterAddress, ClusterHash};

/// Number of shards backing the shared content-based namespace
const CONTENT_SHARDS: usize = 16;

/// Default per-handle entry cap for location-based volumes
pub const DEFAULT_LOCATION_LIMIT: usize = 4096;

/// Cluster cache error types
#[derive(Error, Debug)]
pub enum ClusterCacheError {
    /// Handle was never registered or already dropped
    #[error("unknown cache handle {0:?}")]
    UnknownHandle(CacheHandle),

    /// Content-based entries cannot be retargeted to location keys
    #[error("cache mode transition not allowed: {0}")]
    ForbiddenTransition(String),
}

/// Result type for cluster cache operations
pub type ClusterCacheResult<T> = Result<T, ClusterCacheError>;

/// Keying discipline of a volume's cluster-cache traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClusterCacheMode {
    /// Key by content hash in the shared namespace; deduplicating
    ContentBased,
    /// Key by cluster address in a private per-volume handle
    LocationBased,
}

/// When cluster payloads are admitted to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ClusterCacheBehaviour {
    /// Never cache
    NoCache,
    /// Populate on read miss only
    CacheOnRead,
    /// Populate on write and on read miss
    CacheOnWrite,
}

/// Cache key: one of the two disciplines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Content-hash key in the shared namespace
    Content(ClusterHash),
    /// Address key inside a private handle
    Location(CacheHandle, ClusterAddress),
}

/// Per-handle hit/miss counters
#[derive(Debug, Clone, Default)]
pub struct ClusterCacheStats {
    /// Lookup hits
    pub hits: u64,
    /// Lookup misses
    pub misses: u64,
    /// Entries currently held
    pub entries: usize,
    /// Entry cap (0 for the shared content namespace's per-shard caps)
    pub limit: usize,
}

struct HandleState {
    cache: Mutex<LruCache<ClusterAddress, Arc<Vec<u8>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

struct ContentShard {
    cache: Mutex<LruCache<ClusterHash, Arc<Vec<u8>>>>,
}

/// The shared cluster read cache
pub struct ClusterCache {
    content_shards: Vec<ContentShard>,
    content_hits: AtomicU64,
    content_misses: AtomicU64,
    handles: Mutex<HashMap<CacheHandle, Arc<HandleState>>>,
    next_handle: AtomicU64,
}

impl ClusterCache {
    /// Create a cache with the given total content-entry budget
    pub fn new(content_capacity: usize) -> Self {
        let per_shard = (content_capacity / CONTENT_SHARDS).max(1);
        let content_shards = (0..CONTENT_SHARDS)
            .map(|_| ContentShard {
                cache: Mutex::new(LruCache::new(NonZeroUsize::new(per_shard).unwrap())),
            })
            .collect();
        Self {
            content_shards,
            content_hits: AtomicU64::new(0),
            content_misses: AtomicU64::new(0),
            handles: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    fn content_shard(&self, hash: &ClusterHash) -> &ContentShard {
        &self.content_shards[hash.0[0] as usize % CONTENT_SHARDS]
    }

    /// Allocate a private location-based handle
    pub fn register_handle(&self, limit: usize) -> CacheHandle {
        let handle = CacheHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        let state = Arc::new(HandleState {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(limit.max(1)).unwrap(),
            )),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        });
        self.handles.lock().insert(handle, state);
        handle
    }

    /// Drop a private handle and all of its entries
    pub fn evict_handle(&self, handle: CacheHandle) {
        if !handle.is_content() {
            self.handles.lock().remove(&handle);
        }
    }

    /// Change a private handle's entry cap, evicting down if shrunk
    pub fn set_limit(&self, handle: CacheHandle, limit: usize) -> ClusterCacheResult<()> {
        let state = self
            .handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(ClusterCacheError::UnknownHandle(handle))?;
        state
            .cache
            .lock()
            .resize(NonZeroUsize::new(limit.max(1)).unwrap());
        Ok(())
    }

    /// Look up a cluster payload
    pub fn lookup(&self, key: &CacheKey) -> Option<Arc<Vec<u8>>> {
        match key {
            CacheKey::Content(hash) => {
                let hit = self.content_shard(hash).cache.lock().get(hash).cloned();
                match &hit {
                    Some(_) => self.content_hits.fetch_add(1, Ordering::Relaxed),
                    None => self.content_misses.fetch_add(1, Ordering::Relaxed),
                };
                hit
            }
            CacheKey::Location(handle, ca) => {
                let state = self.handles.lock().get(handle).cloned()?;
                let hit = state.cache.lock().get(ca).cloned();
                match &hit {
                    Some(_) => state.hits.fetch_add(1, Ordering::Relaxed),
                    None => state.misses.fetch_add(1, Ordering::Relaxed),
                };
                hit
            }
        }
    }

    /// Insert a cluster payload
    ///
    /// Unknown handles are ignored rather than failed: a handle can be
    /// dropped concurrently with in-flight reads that still try to prime it.
    pub fn insert(&self, key: CacheKey, data: Arc<Vec<u8>>) {
        match key {
            CacheKey::Content(hash) => {
                self.content_shard(&hash).cache.lock().put(hash, data);
            }
            CacheKey::Location(handle, ca) => {
                if let Some(state) = self.handles.lock().get(&handle).cloned() {
                    state.cache.lock().put(ca, data);
                }
            }
        }
    }

    /// Invalidate one location entry, e.g. after a restore cut
    pub fn invalidate_location(&self, handle: CacheHandle, ca: ClusterAddress) {
        if let Some(state) = self.handles.lock().get(&handle).cloned() {
            state.cache.lock().pop(&ca);
        }
    }

    /// Per-handle statistics; handle 0 reports the shared content namespace
    pub fn stats(&self, handle: CacheHandle) -> ClusterCacheResult<ClusterCacheStats> {
        if handle.is_content() {
            let entries = self
                .content_shards
                .iter()
                .map(|s| s.cache.lock().len())
                .sum();
            return Ok(ClusterCacheStats {
                hits: self.content_hits.load(Ordering::Relaxed),
                misses: self.content_misses.load(Ordering::Relaxed),
                entries,
                limit: self.content_shards.iter().map(|s| s.cache.lock().cap().get()).sum(),
            });
        }
        let state = self
            .handles
            .lock()
            .get(&handle)
            .cloned()
            .ok_or(ClusterCacheError::UnknownHandle(handle))?;
        let cache = state.cache.lock();
        Ok(ClusterCacheStats {
            hits: state.hits.load(Ordering::Relaxed),
            misses: state.misses.load(Ordering::Relaxed),
            entries: cache.len(),
            limit: cache.cap().get(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; 4096])
    }

    #[test]
    fn content_entries_are_shared() {
        let cache = ClusterCache::new(1024);
        let data = payload(0xaa);
        let hash = ClusterHash::of(&data);
        cache.insert(CacheKey::Content(hash), Arc::clone(&data));
        assert_eq!(cache.lookup(&CacheKey::Content(hash)), Some(data));

        let stats = cache.stats(CacheHandle::CONTENT).unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[test]
    fn location_handles_are_private() {
        let cache = ClusterCache::new(1024);
        let h1 = cache.register_handle(16);
        let h2 = cache.register_handle(16);
        let ca = ClusterAddress(42);

        cache.insert(CacheKey::Location(h1, ca), payload(1));
        assert!(cache.lookup(&CacheKey::Location(h1, ca)).is_some());
        assert!(cache.lookup(&CacheKey::Location(h2, ca)).is_none());
    }

    #[test]
    fn limit_is_enforced_lru() {
        let cache = ClusterCache::new(1024);
        let h = cache.register_handle(2);
        for i in 0..3u64 {
            cache.insert(CacheKey::Location(h, ClusterAddress(i)), payload(i as u8));
        }
        // 0 is the least recently used entry and must be gone.
        assert!(cache.lookup(&CacheKey::Location(h, ClusterAddress(0))).is_none());
        assert!(cache.lookup(&CacheKey::Location(h, ClusterAddress(2))).is_some());
    }

    #[test]
    fn evict_handle_drops_entries() {
        let cache = ClusterCache::new(1024);
        let h = cache.register_handle(16);
        cache.insert(CacheKey::Location(h, ClusterAddress(1)), payload(9));
        cache.evict_handle(h);
        assert!(cache.lookup(&CacheKey::Location(h, ClusterAddress(1))).is_none());
        assert!(cache.stats(h).is_err());
    }

    #[test]
    fn shrinking_limit_evicts_down() {
        let cache = ClusterCache::new(1024);
        let h = cache.register_handle(8);
        for i in 0..8u64 {
            cache.insert(CacheKey::Location(h, ClusterAddress(i)), payload(i as u8));
        }
        cache.set_limit(h, 2).unwrap();
        let stats = cache.stats(h).unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.limit, 2);
    }
}
