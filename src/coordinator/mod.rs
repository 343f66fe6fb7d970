//! Cluster coordinator
//!
//! A small linearizable KV is the single authority on ownership: object
//! registrations, node liveness and the owner-tag counter live here, and
//! every owner-changing mutation is a compare-and-set on a versioned entry.
//! The service itself is external; this module defines the contract, typed
//! access on top of it, and an in-process implementation for single-node
//! deployments and tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::dtl::DtlClientConfig;
use crate::types::{Namespace, NodeId, OwnerTag, SnapshotName, VolumeId};

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// The coordinator cannot be reached; mutations must be refused
    #[error("coordinator unreachable: {0}")]
    Unreachable(String),

    /// A compare-and-set lost the race
    #[error("cas conflict on {key}")]
    CasConflict {
        /// Key the CAS targeted
        key: String,
    },

    /// No entry under the key
    #[error("coordinator key not found: {0}")]
    NotFound(String),

    /// An entry would not encode or decode
    #[error("coordinator codec error: {0}")]
    Codec(String),
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Type of a registered object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    /// A live, writable volume
    Volume,
    /// A read-only template other volumes clone from
    Template,
    /// A plain file object
    File,
}

/// How a volume's DTL peer is chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlPolicyMode {
    /// Operator supplies the peer address
    Manual,
    /// The cluster picks a peer
    Automatic,
    /// No DTL
    Disabled,
}

/// DTL policy carried in a registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlPolicy {
    /// Selection mode
    pub mode: DtlPolicyMode,
    /// Peer address for Manual mode
    pub address: Option<DtlClientConfig>,
}

impl DtlPolicy {
    /// Policy of a volume that runs without a DTL
    pub fn disabled() -> Self {
        Self {
            mode: DtlPolicyMode::Disabled,
            address: None,
        }
    }
}

/// Liveness of a cluster node as published to peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Serving requests; stealing its volumes is forbidden
    Online,
    /// Marked down; its volumes may be stolen
    Offline,
}

/// Authoritative record of who owns an object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRegistration {
    /// The object's id
    pub id: VolumeId,
    /// What kind of object this is
    pub object_type: ObjectType,
    /// Backend namespace of the object
    pub namespace: Namespace,
    /// Parent namespace and snapshot for clones
    pub parent: Option<(Namespace, SnapshotName)>,
    /// Node currently owning the object
    pub owner: NodeId,
    /// Ownership generation
    pub owner_tag: OwnerTag,
    /// DTL policy
    pub dtl_policy: DtlPolicy,
}

/// A value paired with its CAS version
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    /// The value
    pub value: T,
    /// Version for compare-and-set
    pub version: u64,
}

/// Contract of the linearizable KV
#[async_trait]
pub trait CoordinatorKv: Send + Sync {
    /// Read a key with its version
    async fn get(&self, key: &str) -> CoordinatorResult<Option<Versioned<Vec<u8>>>>;

    /// Compare-and-set: `expected` of `None` means create-if-absent
    ///
    /// Returns the new version on success.
    async fn put_cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> CoordinatorResult<u64>;

    /// Remove a key if the version still matches
    async fn remove_cas(&self, key: &str, expected: u64) -> CoordinatorResult<()>;

    /// List keys under a prefix
    async fn list(&self, prefix: &str) -> CoordinatorResult<Vec<String>>;
}

/// In-process linearizable KV
pub struct MemoryCoordinator {
    entries: Mutex<BTreeMap<String, (u64, Vec<u8>)>>,
    unreachable: std::sync::atomic::AtomicBool,
}

impl MemoryCoordinator {
    /// Create an empty coordinator
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            unreachable: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Simulate a coordinator outage
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_reachable(&self) -> CoordinatorResult<()> {
        if self.unreachable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CoordinatorError::Unreachable("injected outage".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinatorKv for MemoryCoordinator {
    async fn get(&self, key: &str) -> CoordinatorResult<Option<Versioned<Vec<u8>>>> {
        self.check_reachable()?;
        Ok(self.entries.lock().get(key).map(|(version, value)| Versioned {
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put_cas(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
    ) -> CoordinatorResult<u64> {
        self.check_reachable()?;
        let mut entries = self.entries.lock();
        let current = entries.get(key).map(|(version, _)| *version);
        if current != expected {
            return Err(CoordinatorError::CasConflict {
                key: key.to_string(),
            });
        }
        let next = current.unwrap_or(0) + 1;
        entries.insert(key.to_string(), (next, value));
        Ok(next)
    }

    async fn remove_cas(&self, key: &str, expected: u64) -> CoordinatorResult<()> {
        self.check_reachable()?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some((version, _)) if *version == expected => {
                entries.remove(key);
                Ok(())
            }
            Some(_) => Err(CoordinatorError::CasConflict {
                key: key.to_string(),
            }),
            None => Err(CoordinatorError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> CoordinatorResult<Vec<String>> {
        self.check_reachable()?;
        Ok(self
            .entries
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

const REGISTRATION_PREFIX: &str = "registration/";
const NODE_PREFIX: &str = "node/";
const OWNER_TAG_COUNTER: &str = "owner_tag_counter";

/// Typed access to the coordinator KV
#[derive(Clone)]
pub struct CoordinatorClient {
    kv: Arc<dyn CoordinatorKv>,
}

impl CoordinatorClient {
    /// Wrap a KV
    pub fn new(kv: Arc<dyn CoordinatorKv>) -> Self {
        Self { kv }
    }

    fn registration_key(id: &VolumeId) -> String {
        format!("{REGISTRATION_PREFIX}{id}")
    }

    fn node_key(node: &NodeId) -> String {
        format!("{NODE_PREFIX}{node}")
    }

    /// Create a registration; fails if the object is already registered
    pub async fn register_object(&self, registration: &ObjectRegistration) -> CoordinatorResult<u64> {
        let bytes = serde_json::to_vec(registration)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        self.kv
            .put_cas(&Self::registration_key(&registration.id), None, bytes)
            .await
    }

    /// Read a registration with its CAS version
    pub async fn get_registration(
        &self,
        id: &VolumeId,
    ) -> CoordinatorResult<Option<Versioned<ObjectRegistration>>> {
        let Some(raw) = self.kv.get(&Self::registration_key(id)).await? else {
            return Ok(None);
        };
        let value = serde_json::from_slice(&raw.value)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        Ok(Some(Versioned {
            value,
            version: raw.version,
        }))
    }

    /// Replace a registration if the version still matches
    pub async fn update_registration(
        &self,
        registration: &ObjectRegistration,
        expected_version: u64,
    ) -> CoordinatorResult<u64> {
        let bytes = serde_json::to_vec(registration)
            .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        self.kv
            .put_cas(
                &Self::registration_key(&registration.id),
                Some(expected_version),
                bytes,
            )
            .await
    }

    /// Remove a registration if the version still matches
    pub async fn remove_registration(
        &self,
        id: &VolumeId,
        expected_version: u64,
    ) -> CoordinatorResult<()> {
        self.kv
            .remove_cas(&Self::registration_key(id), expected_version)
            .await
    }

    /// List all registered object ids
    pub async fn list_registrations(&self) -> CoordinatorResult<Vec<VolumeId>> {
        let keys = self.kv.list(REGISTRATION_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(REGISTRATION_PREFIX).map(VolumeId::new))
            .collect())
    }

    /// Publish a node's liveness
    pub async fn set_node_state(&self, node: &NodeId, state: NodeState) -> CoordinatorResult<()> {
        let key = Self::node_key(node);
        let bytes =
            serde_json::to_vec(&state).map_err(|e| CoordinatorError::Codec(e.to_string()))?;
        // Liveness flips are not raced over, last writer wins.
        let current = self.kv.get(&key).await?.map(|v| v.version);
        self.kv.put_cas(&key, current, bytes).await?;
        Ok(())
    }

    /// Read a node's liveness; unknown nodes count as Offline
    pub async fn node_state(&self, node: &NodeId) -> CoordinatorResult<NodeState> {
        let Some(raw) = self.kv.get(&Self::node_key(node)).await? else {
            return Ok(NodeState::Offline);
        };
        serde_json::from_slice(&raw.value).map_err(|e| CoordinatorError::Codec(e.to_string()))
    }

    /// Allocate the next owner tag, atomically
    pub async fn allocate_owner_tag(&self) -> CoordinatorResult<OwnerTag> {
        loop {
            let current = self.kv.get(OWNER_TAG_COUNTER).await?;
            let (next, expected) = match &current {
                Some(v) => {
                    let n: u64 = serde_json::from_slice(&v.value)
                        .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
                    (n + 1, Some(v.version))
                }
                None => (1, None),
            };
            let bytes = serde_json::to_vec(&next)
                .map_err(|e| CoordinatorError::Codec(e.to_string()))?;
            match self.kv.put_cas(OWNER_TAG_COUNTER, expected, bytes).await {
                Ok(_) => return Ok(OwnerTag(next)),
                Err(CoordinatorError::CasConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
