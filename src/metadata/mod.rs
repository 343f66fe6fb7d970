//! Cluster-address to location mapping
//!
//! The metadata store answers the one question the read path asks: where
//! does the newest version of a cluster live, and what should its contents
//! hash to. Entries are grouped into fixed-size pages held in an LRU cache
//! over a pluggable backend.
//!
//! Durability follows the corking discipline: the volume corks the store
//! with a TLog id before writing under that log, and uncorks once the log
//! is sealed and safely away. Writes made under a cork stay in memory until
//! the uncork, so the persistent metadata state never runs ahead of the
//! transaction logs that describe it.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::types::{ClusterAddress, ClusterLocationAndHash, TLogId};

pub mod backend;

pub use backend::{
    open_backend, LocalMetaDataBackend, MemoryMetaDataBackend, MetaDataBackend,
    MetaDataBackendConfig, ReplicatedMetaDataBackend, ReplicatedMetaDataExt,
};

/// Cluster entries per metadata page
pub const PAGE_ENTRIES: u64 = 256;

/// Default page-cache capacity in pages
pub const DEFAULT_PAGE_CACHE_CAPACITY: usize = 1024;

/// Metadata store error types
#[derive(Error, Debug)]
pub enum MetaDataError {
    /// A write arrived while no cork was active
    #[error("metadata store is not corked")]
    NotCorked,

    /// Uncork order must match cork order
    #[error("uncork token {0} does not match the oldest cork")]
    CorkMismatch(TLogId),

    /// The page backend failed
    #[error("metadata backend error: {0}")]
    Backend(String),

    /// A page blob would not decode
    #[error("metadata page decode error: {0}")]
    Decode(String),
}

/// Result type for metadata operations
pub type MetaDataResult<T> = Result<T, MetaDataError>;

/// One relocation produced by the scrubber
///
/// Remaps a cluster address from an old location to a new one; application
/// is a no-op when the address no longer points at the old location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relocation {
    /// The address being remapped
    pub ca: ClusterAddress,
    /// What the scrubber saw at that address
    pub old: ClusterLocationAndHash,
    /// Where the data lives after scrubbing
    pub new: ClusterLocationAndHash,
}

/// Counters exposed by [`MetaDataStore::stats`]
#[derive(Debug, Clone, Default)]
pub struct MetaDataStats {
    /// Page-cache hits
    pub cache_hits: u64,
    /// Page-cache misses
    pub cache_misses: u64,
    /// Pages currently held back by corks
    pub corked_pages: usize,
    /// Active corks
    pub corks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Page {
    entries: Vec<ClusterLocationAndHash>,
}

impl Page {
    fn zeroed() -> Self {
        Self {
            entries: vec![ClusterLocationAndHash::zeroed(); PAGE_ENTRIES as usize],
        }
    }

    fn decode(bytes: &[u8]) -> MetaDataResult<Self> {
        bincode::deserialize(bytes).map_err(|e| MetaDataError::Decode(e.to_string()))
    }

    fn encode(&self) -> MetaDataResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MetaDataError::Decode(e.to_string()))
    }
}

struct Cork {
    token: TLogId,
    pages: HashMap<u64, Page>,
}

/// The paged, corked metadata store
pub struct MetaDataStore {
    backend: Arc<dyn MetaDataBackend>,
    cache: Mutex<LruCache<u64, Page>>,
    corks: Mutex<VecDeque<Cork>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MetaDataStore {
    /// Create a store over a backend with the given page-cache capacity
    pub fn new(backend: Arc<dyn MetaDataBackend>, cache_capacity: usize) -> Self {
        Self {
            backend,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
            corks: Mutex::new(VecDeque::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn page_base(ca: ClusterAddress) -> u64 {
        ca.0 - (ca.0 % PAGE_ENTRIES)
    }

    fn page_slot(ca: ClusterAddress) -> usize {
        (ca.0 % PAGE_ENTRIES) as usize
    }

    /// Open a cork: writes from here on are held back until its uncork
    pub fn cork(&self, token: TLogId) {
        self.corks.lock().push_back(Cork {
            token,
            pages: HashMap::new(),
        });
    }

    /// Close the oldest cork, atomically persisting its writes
    ///
    /// Corks close in the order they were opened; passing any other token
    /// fails without touching state.
    pub fn uncork(&self, token: TLogId) -> MetaDataResult<()> {
        let cork = {
            let mut corks = self.corks.lock();
            match corks.front() {
                Some(front) if front.token == token => corks.pop_front().unwrap(),
                _ => return Err(MetaDataError::CorkMismatch(token)),
            }
        };
        let mut batch = Vec::with_capacity(cork.pages.len());
        for (base, page) in &cork.pages {
            batch.push((*base, page.encode()?));
        }
        batch.sort_by_key(|(base, _)| *base);
        self.backend
            .write_batch(&batch, Some(token.0.as_bytes()))?;

        let mut cache = self.cache.lock();
        for (base, page) in cork.pages {
            cache.put(base, page);
        }
        Ok(())
    }

    /// The token persisted by the most recent uncork
    pub fn last_uncorked(&self) -> MetaDataResult<Option<TLogId>> {
        let Some(bytes) = self.backend.read_cork()? else {
            return Ok(None);
        };
        let raw: [u8; 16] = bytes
            .try_into()
            .map_err(|_| MetaDataError::Decode("cork marker is not a uuid".to_string()))?;
        Ok(Some(TLogId(uuid::Uuid::from_bytes(raw))))
    }

    fn load_page(&self, base: u64) -> MetaDataResult<Page> {
        if let Some(page) = self.cache.lock().get(&base) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(page.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let page = match self.backend.read_page(base)? {
            Some(bytes) => Page::decode(&bytes)?,
            None => Page::zeroed(),
        };
        self.cache.lock().put(base, page.clone());
        Ok(page)
    }

    fn corked_page(&self, base: u64) -> Option<Page> {
        let corks = self.corks.lock();
        corks
            .iter()
            .rev()
            .find_map(|cork| cork.pages.get(&base).cloned())
    }

    /// Record the newest location of a cluster under the active cork
    pub fn write_cluster(
        &self,
        ca: ClusterAddress,
        clh: ClusterLocationAndHash,
    ) -> MetaDataResult<()> {
        let base = Self::page_base(ca);
        let mut page = match self.corked_page(base) {
            Some(page) => page,
            None => self.load_page(base)?,
        };
        page.entries[Self::page_slot(ca)] = clh;

        let mut corks = self.corks.lock();
        let cork = corks.back_mut().ok_or(MetaDataError::NotCorked)?;
        cork.pages.insert(base, page);
        Ok(())
    }

    /// Look up the newest location of a cluster
    ///
    /// Corked writes win over persisted state; unwritten clusters come back
    /// as the zero location.
    pub fn read_cluster(&self, ca: ClusterAddress) -> MetaDataResult<ClusterLocationAndHash> {
        let base = Self::page_base(ca);
        let page = match self.corked_page(base) {
            Some(page) => page,
            None => self.load_page(base)?,
        };
        Ok(page.entries[Self::page_slot(ca)])
    }

    /// Apply a scrubber relocation stream under the active cork
    ///
    /// Idempotent: a relocation whose old location no longer matches is
    /// skipped. Returns how many relocations were applied.
    pub fn apply_relocations(&self, relocations: &[Relocation]) -> MetaDataResult<usize> {
        let mut applied = 0;
        for relocation in relocations {
            let current = self.read_cluster(relocation.ca)?;
            if current.location == relocation.old.location {
                self.write_cluster(relocation.ca, relocation.new)?;
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Drop every entry, cork and cached page
    pub fn clear(&self) -> MetaDataResult<()> {
        self.corks.lock().clear();
        self.cache.lock().clear();
        self.backend.clear()
    }

    /// Flush the backend without touching corked state
    pub fn flush(&self) -> MetaDataResult<()> {
        self.backend.flush()
    }

    /// Cache and cork counters
    pub fn stats(&self) -> MetaDataStats {
        let corks = self.corks.lock();
        MetaDataStats {
            cache_hits: self.hits.load(Ordering::Relaxed),
            cache_misses: self.misses.load(Ordering::Relaxed),
            corked_pages: corks.iter().map(|c| c.pages.len()).sum(),
            corks: corks.len(),
        }
    }
}
