//! Metadata page backends
//!
//! The store persists fixed-size pages of cluster entries through one of
//! three backends: a local embedded KV, a client for a remote metadata
//! service, or a replicated fan-out over several of them. All three share
//! one contract; replication-only knobs live on an extension trait.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use super::{MetaDataError, MetaDataResult};

const PAGE_KEY_PREFIX: u8 = b'p';
const CORK_KEY: &[u8] = b"meta/last_cork";

/// Uniform contract of a metadata page backend
///
/// `write_batch` must apply the pages and the cork marker atomically with
/// respect to restart: a reader after a crash sees either none or all of
/// the batch.
pub trait MetaDataBackend: Send + Sync {
    /// Read a page blob by its base cluster address
    fn read_page(&self, base: u64) -> MetaDataResult<Option<Vec<u8>>>;

    /// Atomically persist a batch of pages and the cork marker
    fn write_batch(&self, pages: &[(u64, Vec<u8>)], cork: Option<&[u8]>) -> MetaDataResult<()>;

    /// Read the last persisted cork marker
    fn read_cork(&self) -> MetaDataResult<Option<Vec<u8>>>;

    /// Drop every page and the cork marker
    fn clear(&self) -> MetaDataResult<()>;

    /// Force outstanding writes to stable storage
    fn flush(&self) -> MetaDataResult<()>;
}

/// Backend selection, part of the volume configuration
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MetaDataBackendConfig {
    /// Embedded KV store in a local directory
    Local {
        /// Directory for the store's files
        path: PathBuf,
    },
    /// In-process client of the remote metadata service
    Remote,
    /// Master plus replicas, writes fanned out to all
    Replicated {
        /// Number of replicas behind the master
        replicas: usize,
    },
}

/// Open a backend from its configuration
pub fn open_backend(config: &MetaDataBackendConfig) -> MetaDataResult<Arc<dyn MetaDataBackend>> {
    match config {
        MetaDataBackendConfig::Local { path } => {
            Ok(Arc::new(LocalMetaDataBackend::open(path.clone())?))
        }
        MetaDataBackendConfig::Remote => Ok(Arc::new(MemoryMetaDataBackend::new())),
        MetaDataBackendConfig::Replicated { replicas } => {
            let master: Arc<dyn MetaDataBackend> = Arc::new(MemoryMetaDataBackend::new());
            let slaves: Vec<Arc<dyn MetaDataBackend>> = (0..*replicas)
                .map(|_| Arc::new(MemoryMetaDataBackend::new()) as Arc<dyn MetaDataBackend>)
                .collect();
            Ok(Arc::new(ReplicatedMetaDataBackend::new(master, slaves)))
        }
    }
}

/// Embedded local backend on `sled`
pub struct LocalMetaDataBackend {
    db: sled::Db,
}

impl LocalMetaDataBackend {
    /// Open or create the store under `path`
    pub fn open(path: PathBuf) -> MetaDataResult<Self> {
        let db = sled::open(path).map_err(|e| MetaDataError::Backend(e.to_string()))?;
        Ok(Self { db })
    }

    fn page_key(base: u64) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = PAGE_KEY_PREFIX;
        key[1..].copy_from_slice(&base.to_be_bytes());
        key
    }
}

impl MetaDataBackend for LocalMetaDataBackend {
    fn read_page(&self, base: u64) -> MetaDataResult<Option<Vec<u8>>> {
        self.db
            .get(Self::page_key(base))
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| MetaDataError::Backend(e.to_string()))
    }

    fn write_batch(&self, pages: &[(u64, Vec<u8>)], cork: Option<&[u8]>) -> MetaDataResult<()> {
        let mut batch = sled::Batch::default();
        for (base, bytes) in pages {
            batch.insert(&Self::page_key(*base)[..], bytes.as_slice());
        }
        if let Some(cork) = cork {
            batch.insert(CORK_KEY, cork);
        }
        self.db
            .apply_batch(batch)
            .map_err(|e| MetaDataError::Backend(e.to_string()))?;
        self.flush()
    }

    fn read_cork(&self) -> MetaDataResult<Option<Vec<u8>>> {
        self.db
            .get(CORK_KEY)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| MetaDataError::Backend(e.to_string()))
    }

    fn clear(&self) -> MetaDataResult<()> {
        self.db
            .clear()
            .map_err(|e| MetaDataError::Backend(e.to_string()))?;
        self.flush()
    }

    fn flush(&self) -> MetaDataResult<()> {
        self.db
            .flush()
            .map(|_| ())
            .map_err(|e| MetaDataError::Backend(e.to_string()))
    }
}

/// In-memory backend
///
/// Stands in for the remote metadata service client in single-node
/// deployments and backs the replicated variant's members in tests.
pub struct MemoryMetaDataBackend {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    pages: BTreeMap<u64, Vec<u8>>,
    cork: Option<Vec<u8>>,
}

impl MemoryMetaDataBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

impl Default for MemoryMetaDataBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaDataBackend for MemoryMetaDataBackend {
    fn read_page(&self, base: u64) -> MetaDataResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().pages.get(&base).cloned())
    }

    fn write_batch(&self, pages: &[(u64, Vec<u8>)], cork: Option<&[u8]>) -> MetaDataResult<()> {
        let mut inner = self.inner.lock();
        for (base, bytes) in pages {
            inner.pages.insert(*base, bytes.clone());
        }
        if let Some(cork) = cork {
            inner.cork = Some(cork.to_vec());
        }
        Ok(())
    }

    fn read_cork(&self) -> MetaDataResult<Option<Vec<u8>>> {
        Ok(self.inner.lock().cork.clone())
    }

    fn clear(&self) -> MetaDataResult<()> {
        let mut inner = self.inner.lock();
        inner.pages.clear();
        inner.cork = None;
        Ok(())
    }

    fn flush(&self) -> MetaDataResult<()> {
        Ok(())
    }
}

/// Replicated fan-out backend: one master, N slaves
///
/// Reads are served by the master; writes go to the master first and are
/// then mirrored to every slave.
pub struct ReplicatedMetaDataBackend {
    master: Arc<dyn MetaDataBackend>,
    slaves: Vec<Arc<dyn MetaDataBackend>>,
}

impl ReplicatedMetaDataBackend {
    /// Create a replicated backend
    pub fn new(master: Arc<dyn MetaDataBackend>, slaves: Vec<Arc<dyn MetaDataBackend>>) -> Self {
        Self { master, slaves }
    }
}

impl MetaDataBackend for ReplicatedMetaDataBackend {
    fn read_page(&self, base: u64) -> MetaDataResult<Option<Vec<u8>>> {
        self.master.read_page(base)
    }

    fn write_batch(&self, pages: &[(u64, Vec<u8>)], cork: Option<&[u8]>) -> MetaDataResult<()> {
        self.master.write_batch(pages, cork)?;
        for slave in &self.slaves {
            slave.write_batch(pages, cork)?;
        }
        Ok(())
    }

    fn read_cork(&self) -> MetaDataResult<Option<Vec<u8>>> {
        self.master.read_cork()
    }

    fn clear(&self) -> MetaDataResult<()> {
        self.master.clear()?;
        for slave in &self.slaves {
            slave.clear()?;
        }
        Ok(())
    }

    fn flush(&self) -> MetaDataResult<()> {
        self.master.flush()?;
        for slave in &self.slaves {
            slave.flush()?;
        }
        Ok(())
    }
}

/// Replication-only operations of the replicated backend
pub trait ReplicatedMetaDataExt {
    /// Verify every slave agrees with the master on a page
    fn slaves_consistent(&self, base: u64) -> MetaDataResult<bool>;
}

impl ReplicatedMetaDataExt for ReplicatedMetaDataBackend {
    fn slaves_consistent(&self, base: u64) -> MetaDataResult<bool> {
        let reference = self.master.read_page(base)?;
        for slave in &self.slaves {
            if slave.read_page(base)? != reference {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn local_backend_survives_reopen() {
        let dir = std::env::temp_dir().join(format!("berth-mdlocal-{}", Uuid::new_v4()));
        {
            let backend = LocalMetaDataBackend::open(dir.clone()).unwrap();
            backend
                .write_batch(&[(0, vec![1, 2, 3])], Some(b"cork-a"))
                .unwrap();
        }
        let backend = LocalMetaDataBackend::open(dir.clone()).unwrap();
        assert_eq!(backend.read_page(0).unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(backend.read_cork().unwrap(), Some(b"cork-a".to_vec()));
        drop(backend);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn replicated_backend_mirrors_writes() {
        let master: Arc<dyn MetaDataBackend> = Arc::new(MemoryMetaDataBackend::new());
        let slave: Arc<dyn MetaDataBackend> = Arc::new(MemoryMetaDataBackend::new());
        let replicated = ReplicatedMetaDataBackend::new(Arc::clone(&master), vec![Arc::clone(&slave)]);

        replicated.write_batch(&[(256, vec![9])], None).unwrap();
        assert_eq!(slave.read_page(256).unwrap(), Some(vec![9]));
        assert!(replicated.slaves_consistent(256).unwrap());
    }
}
