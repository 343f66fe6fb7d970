//! Object-store backend abstraction
//!
//! Everything the engine persists durably goes through [`BackendConnector`]:
//! sealed SCOs, sealed transaction logs, the snapshot history document, the
//! volume configuration and the read-activity heatmap. Object names are flat
//! within a namespace; one namespace holds exactly one volume's objects.
//!
//! Conditional puts are the fencing primitive: a put may carry a predicate
//! over the existing object's bytes that is evaluated atomically with
//! respect to concurrent puts of the same name.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

use crate::types::Namespace;

pub mod local;
pub mod memory;

pub use local::LocalConnector;
pub use memory::MemoryConnector;

/// Fixed object name of the volume configuration, stamped with the owner tag
pub const VOLUME_CONFIG_OBJECT: &str = "volumeconfig";

/// Fixed object name of the snapshot history document
pub const SNAPSHOTS_OBJECT: &str = "snapshots.xml";

/// Fixed object name of the persisted read-activity heatmap
pub const ACCESS_DATA_OBJECT: &str = "sco_access_data";

/// Backend error types
#[derive(Error, Debug)]
pub enum BackendError {
    /// Object does not exist
    #[error("object not found: {0}")]
    ObjectNotFound(String),

    /// Namespace does not exist
    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// Object already exists and overwrite was not requested
    #[error("object already exists: {0}")]
    ObjectExists(String),

    /// The predicate of a conditional put rejected the write
    #[error("put condition failed for {0}")]
    ConditionFailed(String),

    /// Transient failure, safe to retry with backoff
    #[error("transient backend error: {0}")]
    Retryable(String),

    /// Permanent failure, retrying will not help
    #[error("permanent backend error: {0}")]
    Permanent(String),

    /// Local I/O error underneath a connector
    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// Whether the uploader may retry the operation
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retryable(_))
    }

    /// Whether the error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackendError::ObjectNotFound(_) | BackendError::NamespaceNotFound(_)
        )
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Predicate evaluated atomically against the current contents of an object
/// before a conditional put is applied
///
/// The predicate receives `None` when the object does not exist yet.
#[derive(Clone)]
pub struct PutCondition {
    label: String,
    check: Arc<dyn Fn(Option<&[u8]>) -> bool + Send + Sync>,
}

impl PutCondition {
    /// Create a condition from a label and a predicate
    pub fn new<F>(label: impl Into<String>, check: F) -> Self
    where
        F: Fn(Option<&[u8]>) -> bool + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            check: Arc::new(check),
        }
    }

    /// Human-readable description, used in error messages
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Evaluate the predicate
    pub fn eval(&self, existing: Option<&[u8]>) -> bool {
        (self.check)(existing)
    }
}

impl std::fmt::Debug for PutCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PutCondition({})", self.label)
    }
}

/// Uniform object-store contract
///
/// Implementations must make conditional puts atomic with respect to
/// concurrent puts of the same object name.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    /// Store an object
    async fn put(
        &self,
        ns: &Namespace,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        condition: Option<&PutCondition>,
    ) -> BackendResult<()>;

    /// Fetch an object's bytes
    async fn get(&self, ns: &Namespace, name: &str) -> BackendResult<Vec<u8>>;

    /// List object names with the given prefix, sorted
    async fn list(&self, ns: &Namespace, prefix: &str) -> BackendResult<Vec<String>>;

    /// Whether an object exists
    async fn exists(&self, ns: &Namespace, name: &str) -> BackendResult<bool>;

    /// Remove an object
    async fn remove(&self, ns: &Namespace, name: &str, may_not_exist: bool) -> BackendResult<()>;

    /// Create a namespace
    async fn create_namespace(&self, ns: &Namespace) -> BackendResult<()>;

    /// Delete a namespace and every object in it
    async fn delete_namespace(&self, ns: &Namespace) -> BackendResult<()>;

    /// Whether a namespace exists
    async fn namespace_exists(&self, ns: &Namespace) -> BackendResult<bool>;

    /// List all namespaces
    async fn list_namespaces(&self) -> BackendResult<Vec<Namespace>>;
}

/// A connector bound to one namespace
///
/// Volume-level code holds one of these instead of threading the namespace
/// through every call; clone reads reach the parent through a second handle.
#[derive(Clone)]
pub struct BackendHandle {
    connector: Arc<dyn BackendConnector>,
    namespace: Namespace,
}

impl BackendHandle {
    /// Bind a connector to a namespace
    pub fn new(connector: Arc<dyn BackendConnector>, namespace: Namespace) -> Self {
        Self {
            connector,
            namespace,
        }
    }

    /// The namespace this handle is bound to
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The underlying connector
    pub fn connector(&self) -> &Arc<dyn BackendConnector> {
        &self.connector
    }

    /// Rebind the same connector to a different namespace
    pub fn with_namespace(&self, namespace: Namespace) -> BackendHandle {
        BackendHandle {
            connector: Arc::clone(&self.connector),
            namespace,
        }
    }

    /// Store an object in the bound namespace
    pub async fn put(
        &self,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        condition: Option<&PutCondition>,
    ) -> BackendResult<()> {
        self.connector
            .put(&self.namespace, name, bytes, overwrite, condition)
            .await
    }

    /// Fetch an object from the bound namespace
    pub async fn get(&self, name: &str) -> BackendResult<Vec<u8>> {
        self.connector.get(&self.namespace, name).await
    }

    /// List objects in the bound namespace
    pub async fn list(&self, prefix: &str) -> BackendResult<Vec<String>> {
        self.connector.list(&self.namespace, prefix).await
    }

    /// Whether an object exists in the bound namespace
    pub async fn exists(&self, name: &str) -> BackendResult<bool> {
        self.connector.exists(&self.namespace, name).await
    }

    /// Remove an object from the bound namespace
    pub async fn remove(&self, name: &str, may_not_exist: bool) -> BackendResult<()> {
        self.connector
            .remove(&self.namespace, name, may_not_exist)
            .await
    }
}

impl std::fmt::Debug for BackendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BackendHandle({})", self.namespace)
    }
}
