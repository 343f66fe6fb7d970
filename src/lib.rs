//! # BERTH - Clustered Block Storage Engine
//!
//! A clustered block-storage engine exposing virtual block volumes backed
//! by a log-structured write path onto an object store, with snapshots,
//! writable clones, a peer-hosted durability tier and transparent
//! ownership migration between nodes.
//!
//! ## Architecture
//!
//! - `types`: core addressing vocabulary (clusters, SCOs, locations, tags)
//! - `backend`: uniform object-store abstraction with conditional writes
//! - `scocache`: two-tier local store of SCOs with eviction and throttling
//! - `clustercache`: shared content- or location-keyed cluster read cache
//! - `tlog`: append-only typed record logs with per-record and per-log CRCs
//! - `metadata`: cluster-address to location index with cork barriers
//! - `snapshot`: the snapshot chain and its serialised history document
//! - `dtl`: the distributed transaction log client, server and checker
//! - `scheduling`: the backend worker pool
//! - `coordinator`: the linearizable KV holding ownership truth
//! - `router`: per-object routing, redirection and migration support
//! - `volume`: the per-volume read/write pipeline and state machine
//! - `recovery`: local and backend restart
//! - `engine`: the per-node composite wiring everything together
//! - `events`: the observable engine event bus

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core addressing types
pub mod types;

// Object-store backend
pub mod backend;

// Local caches
pub mod clustercache;
pub mod scocache;

// Log-structured write path
pub mod metadata;
pub mod snapshot;
pub mod tlog;

// Durability mirror
pub mod dtl;

// Backend worker pool
pub mod scheduling;

// Cluster control plane
pub mod coordinator;
pub mod router;

// The volume engine and its recovery paths
pub mod recovery;
pub mod volume;

// Node composite
pub mod engine;

// Event bus
pub mod events;

// Re-export commonly used types
pub use backend::{BackendConnector, BackendError, BackendHandle, LocalConnector, MemoryConnector};
pub use clustercache::{ClusterCache, ClusterCacheBehaviour, ClusterCacheMode};
pub use coordinator::{CoordinatorClient, CoordinatorKv, MemoryCoordinator, ObjectRegistration};
pub use dtl::{DtlClient, DtlClientConfig, DtlMode, DtlServer, DtlState};
pub use engine::{DestroyFlags, Engine, EngineConfig};
pub use events::{EngineEvent, EventBus};
pub use metadata::{MetaDataBackendConfig, MetaDataStore};
pub use router::{ObjectRouter, RouterError, RouterResult};
pub use scocache::{ScoCache, ScoCacheConfig};
pub use snapshot::{Snapshot, SnapshotPersistor};
pub use types::{
    ClusterAddress, ClusterHash, ClusterLocation, ClusterLocationAndHash, Lba, Namespace, NodeId,
    OwnerTag, SCOName, SCONumber, SnapshotName, TLogId, VolumeId,
};
pub use volume::{Volume, VolumeConfig, VolumeError, VolumeResult, VolumeState};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Initialise logging once, for embedding binaries and tests
///
/// Safe to call repeatedly; only the first call installs the logger.
pub fn init_logging() {
    static INIT: once_cell::sync::OnceCell<()> = once_cell::sync::OnceCell::new();
    INIT.get_or_init(|| {
        env_logger::Builder::from_default_env()
            .format_timestamp_millis()
            .init();
    });
}
