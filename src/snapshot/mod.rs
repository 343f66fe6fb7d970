//! Snapshot chain management
//!
//! A volume's history is a chain of transaction logs cut into snapshots.
//! The [`SnapshotPersistor`] is the single serialised document enumerating
//! the snapshots and the current (unsnapshotted) logs; it is persisted
//! locally and as `snapshots.xml` in the volume's backend namespace, and
//! the backend copy is the authoritative history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::backend::{BackendHandle, PutCondition, SNAPSHOTS_OBJECT};
use crate::types::{SnapshotName, TLogId};

pub mod persistor;

pub use persistor::SnapshotPersistor;

/// Snapshot subsystem error types
#[derive(Error, Debug)]
pub enum SnapshotError {
    /// No snapshot by that name
    #[error("snapshot not found: {0}")]
    NotFound(SnapshotName),

    /// A snapshot by that name already exists
    #[error("snapshot name already exists: {0}")]
    NameAlreadyExists(SnapshotName),

    /// The previous snapshot has not reached the backend yet
    #[error("previous snapshot {0} not on backend")]
    PreviousNotOnBackend(SnapshotName),

    /// The requested snapshot is not on the backend
    #[error("snapshot {0} not on backend")]
    NotOnBackend(SnapshotName),

    /// The document would not serialise or parse
    #[error("snapshot document error: {0}")]
    Document(String),

    /// Reading or writing the document failed
    #[error("snapshot I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The backend refused the document
    #[error("snapshot backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// One named cut in a volume's TLog chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Stable identity of the snapshot
    pub uuid: Uuid,
    /// User-visible name, unique within the volume
    pub name: SnapshotName,
    /// Creation time
    pub created: DateTime<Utc>,
    /// Opaque user metadata
    pub metadata: String,
    /// The TLogs this snapshot finalises, oldest first
    pub tlogs: Vec<TLogId>,
    /// Bytes of unique data referenced by the snapshot
    pub backend_size: u64,
    /// True once every TLog above is durably on the backend
    pub in_backend: bool,
    /// Deleted and awaiting scrubbing
    pub tombstoned: bool,
}

impl Snapshot {
    fn new(name: SnapshotName, metadata: String, tlogs: Vec<TLogId>, backend_size: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name,
            created: Utc::now(),
            metadata,
            tlogs,
            backend_size,
            in_backend: false,
            tombstoned: false,
        }
    }
}

/// Persist the snapshot document to and from the backend
pub struct SnapshotPersistorStore {
    backend: BackendHandle,
}

impl SnapshotPersistorStore {
    /// Create a store over a volume's backend handle
    pub fn new(backend: BackendHandle) -> Self {
        Self { backend }
    }

    /// Upload the document as `snapshots.xml`
    pub async fn push(
        &self,
        persistor: &SnapshotPersistor,
        condition: Option<&PutCondition>,
    ) -> SnapshotResult<()> {
        let xml = persistor.to_xml()?;
        self.backend
            .put(SNAPSHOTS_OBJECT, xml.into_bytes(), true, condition)
            .await?;
        Ok(())
    }

    /// Download and parse the authoritative document
    pub async fn pull(&self) -> SnapshotResult<SnapshotPersistor> {
        let bytes = self.backend.get(SNAPSHOTS_OBJECT).await?;
        let xml = String::from_utf8(bytes)
            .map_err(|e| SnapshotError::Document(format!("snapshots.xml is not UTF-8: {e}")))?;
        SnapshotPersistor::from_xml(&xml)
    }

    /// Whether the backend holds a document at all
    pub async fn exists(&self) -> SnapshotResult<bool> {
        Ok(self.backend.exists(SNAPSHOTS_OBJECT).await?)
    }
}
