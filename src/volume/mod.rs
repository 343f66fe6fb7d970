//! Volume engine
//!
//! A volume ties the subsystems into the actual block device: the write
//! path appends cluster payloads to the current SCO, logs a Location record
//! per cluster, mirrors it to the DTL and updates the metadata store under
//! the current cork; the read path resolves addresses through the cluster
//! cache, the metadata store and the SCO cache, falling back to the backend
//! and, for clones, to ancestor namespaces.
//!
//! State machine: `Running`, `CreatingSnapshot`, `SnapshotPendingInBackend`,
//! `Restoring`, `Cloning` and the terminal `Halted`, which absorbs every
//! unrecoverable error and refuses all further I/O.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::clustercache::{ClusterCacheBehaviour, ClusterCacheMode};
use crate::metadata::MetaDataBackendConfig;
use crate::types::{
    CloneGeneration, Namespace, OwnerTag, SnapshotName, VolumeId, DEFAULT_CLUSTER_MULTIPLIER,
    DEFAULT_LBA_SIZE, DEFAULT_SCO_MULTIPLIER, DEFAULT_TLOG_MULTIPLIER,
};

pub(crate) mod engine;

pub use engine::Volume;

/// Hard ceiling on volume size
pub const MAX_VOLUME_SIZE: u64 = 64 << 40;

/// Lowest accepted SCO multiplier
pub const MIN_SCO_MULTIPLIER: u32 = 4;

/// Highest accepted SCO multiplier
pub const MAX_SCO_MULTIPLIER: u32 = 32768;

/// Volume error types
#[derive(Error, Debug)]
pub enum VolumeError {
    /// Offset or length not aligned to the cluster geometry
    #[error("unaligned access: {0}")]
    Unaligned(String),

    /// Operation invalid in the current state or configuration
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Access beyond the volume size
    #[error("out of bounds: lba {lba} beyond volume of {clusters} clusters")]
    OutOfBounds {
        /// Offending LBA
        lba: u64,
        /// Volume size in clusters
        clusters: u64,
    },

    /// The volume is halted and refuses I/O
    #[error("volume halted: {0}")]
    Halted(String),

    /// Cluster data failed hash verification
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A newer owner fenced this instance
    #[error("fenced by newer owner (tag {0})")]
    Fenced(crate::types::OwnerTag),

    /// Out of cache space or queue capacity
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// Snapshot subsystem error
    #[error(transparent)]
    Snapshot(#[from] crate::snapshot::SnapshotError),

    /// Metadata store error
    #[error("metadata error: {0}")]
    MetaData(#[from] crate::metadata::MetaDataError),

    /// TLog subsystem error
    #[error("tlog error: {0}")]
    TLog(#[from] crate::tlog::TLogError),

    /// SCO cache error
    #[error("sco cache error: {0}")]
    ScoCache(#[from] crate::scocache::ScoCacheError),

    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// DTL error
    #[error("dtl error: {0}")]
    Dtl(#[from] crate::dtl::DtlError),

    /// Underlying I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for volume operations
pub type VolumeResult<T> = Result<T, VolumeError>;

/// Role a volume plays in its backend namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeRole {
    /// Ordinary read-write volume
    Normal,
    /// Write-only target receiving a full backup stream
    Base,
    /// Write-only target receiving an incremental backup stream
    Incremental,
}

/// Volume lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeState {
    /// Serving reads and writes
    Running,
    /// Sealing the chain for a snapshot
    CreatingSnapshot,
    /// Snapshot taken, waiting for its TLogs to reach the backend
    SnapshotPendingInBackend,
    /// Rolling back to a snapshot
    Restoring,
    /// Building a clone from a parent snapshot
    Cloning,
    /// Terminal error state; only destroy or restart leave it
    Halted(String),
}

impl VolumeState {
    /// Whether I/O is accepted in this state
    pub fn accepts_io(&self) -> bool {
        matches!(
            self,
            VolumeState::Running | VolumeState::SnapshotPendingInBackend
        )
    }
}

/// Immutable-at-restart volume descriptor
///
/// Stored as the `volumeconfig` object in the volume's namespace, stamped
/// with the owner tag of the writer; a stale owner's conditional put of
/// this object is how fencing manifests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Volume id
    pub id: VolumeId,
    /// Backend namespace holding the volume's objects
    pub namespace: Namespace,
    /// Volume size in bytes, cluster aligned
    pub size: u64,
    /// Logical block size
    pub lba_size: u32,
    /// LBAs per cluster
    pub cluster_multiplier: u32,
    /// Clusters per SCO
    pub sco_multiplier: u32,
    /// SCOs per TLog
    pub tlog_multiplier: u32,
    /// Parent namespace and snapshot for clones
    pub parent: Option<(Namespace, SnapshotName)>,
    /// Role of the volume
    pub role: VolumeRole,
    /// Ownership generation stamped on backend writes
    pub owner_tag: OwnerTag,
    /// SCO clone generation of this volume's own writes
    pub clone_generation: CloneGeneration,
    /// Metadata backend selection
    pub metadata_backend: MetaDataBackendConfig,
    /// Metadata page-cache capacity, in pages
    pub metadata_cache_capacity: usize,
    /// Cluster-cache keying discipline
    pub cluster_cache_mode: ClusterCacheMode,
    /// Cluster-cache admission behaviour
    pub cluster_cache_behaviour: ClusterCacheBehaviour,
    /// Entry cap of the private handle in LocationBased mode
    pub cluster_cache_limit: usize,
}

impl VolumeConfig {
    /// Minimal config for a fresh volume
    pub fn new(id: VolumeId, namespace: Namespace, size: u64, work_dir: &Path) -> Self {
        Self {
            id,
            namespace: namespace.clone(),
            size,
            lba_size: DEFAULT_LBA_SIZE,
            cluster_multiplier: DEFAULT_CLUSTER_MULTIPLIER,
            sco_multiplier: DEFAULT_SCO_MULTIPLIER,
            tlog_multiplier: DEFAULT_TLOG_MULTIPLIER,
            parent: None,
            role: VolumeRole::Normal,
            owner_tag: OwnerTag(0),
            clone_generation: CloneGeneration::BASE,
            metadata_backend: MetaDataBackendConfig::Local {
                path: work_dir.join("meta").join(&namespace.0).join("md"),
            },
            metadata_cache_capacity: crate::metadata::DEFAULT_PAGE_CACHE_CAPACITY,
            cluster_cache_mode: ClusterCacheMode::ContentBased,
            cluster_cache_behaviour: ClusterCacheBehaviour::CacheOnRead,
            cluster_cache_limit: crate::clustercache::DEFAULT_LOCATION_LIMIT,
        }
    }

    /// Cluster size in bytes
    pub fn cluster_size(&self) -> u64 {
        self.lba_size as u64 * self.cluster_multiplier as u64
    }

    /// SCO size in bytes
    pub fn sco_size(&self) -> u64 {
        self.cluster_size() * self.sco_multiplier as u64
    }

    /// Location records per TLog before it rolls over
    pub fn max_tlog_entries(&self) -> u64 {
        self.tlog_multiplier as u64 * self.sco_multiplier as u64
    }

    /// Volume size in clusters
    pub fn clusters(&self) -> u64 {
        self.size / self.cluster_size()
    }

    /// Validate the geometry
    pub fn validate(&self) -> VolumeResult<()> {
        if !self.lba_size.is_power_of_two() {
            return Err(VolumeError::InvalidOperation(format!(
                "lba size {} is not a power of two",
                self.lba_size
            )));
        }
        if !self.cluster_multiplier.is_power_of_two() || self.cluster_multiplier == 0 {
            return Err(VolumeError::InvalidOperation(format!(
                "cluster multiplier {} is not a power of two",
                self.cluster_multiplier
            )));
        }
        if !(MIN_SCO_MULTIPLIER..=MAX_SCO_MULTIPLIER).contains(&self.sco_multiplier) {
            return Err(VolumeError::InvalidOperation(format!(
                "sco multiplier {} outside [{MIN_SCO_MULTIPLIER}, {MAX_SCO_MULTIPLIER}]",
                self.sco_multiplier
            )));
        }
        if self.tlog_multiplier == 0 {
            return Err(VolumeError::InvalidOperation(
                "tlog multiplier must be positive".to_string(),
            ));
        }
        if self.size == 0 || self.size % self.cluster_size() != 0 {
            return Err(VolumeError::InvalidOperation(format!(
                "size {} is not a positive multiple of the cluster size {}",
                self.size,
                self.cluster_size()
            )));
        }
        if self.size > MAX_VOLUME_SIZE {
            return Err(VolumeError::InvalidOperation(format!(
                "size {} exceeds the {MAX_VOLUME_SIZE} ceiling",
                self.size
            )));
        }
        Ok(())
    }
}

/// Node-local file layout of one volume
#[derive(Debug, Clone)]
pub struct VolumePaths {
    /// Directory holding the volume's TLog files
    pub tlog_dir: PathBuf,
    /// Local copy of the snapshot document
    pub persistor_path: PathBuf,
}

impl VolumePaths {
    /// Derive the layout from the node's working directory
    pub fn new(work_dir: &Path, namespace: &Namespace) -> Self {
        Self {
            tlog_dir: work_dir.join("tlogs").join(&namespace.0),
            persistor_path: work_dir
                .join("meta")
                .join(&namespace.0)
                .join("snapshots.xml"),
        }
    }
}

/// Point-in-time counters and status of a volume
#[derive(Debug, Clone)]
pub struct VolumeStats {
    /// Volume size in bytes
    pub size: u64,
    /// Whether the volume is halted
    pub halted: bool,
    /// Current DTL state
    pub dtl_state: crate::dtl::DtlState,
    /// Owner tag of this instance
    pub owner_tag: OwnerTag,
    /// Completed write operations
    pub write_ops: u64,
    /// Completed read operations
    pub read_ops: u64,
    /// Bytes written
    pub bytes_written: u64,
    /// Bytes read
    pub bytes_read: u64,
    /// Cluster-cache hits observed by reads
    pub cluster_cache_hits: u64,
    /// Whole-SCO fetches from the backend
    pub backend_fetches: u64,
}
