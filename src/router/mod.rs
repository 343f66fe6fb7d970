//! Object router
//!
//! Per-object ownership and request redirection. Every request names an
//! object id; the router answers either "it runs here" or a redirect to the
//! owning node's address, consulting a per-node registration cache backed
//! by the coordinator. Ownership transfers are compare-and-set mutations on
//! the coordinator, with a freshly allocated owner tag fencing the loser.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::coordinator::{
    CoordinatorClient, CoordinatorError, NodeState, ObjectRegistration, Versioned,
};
use crate::types::{NodeId, OwnerTag, VolumeId};

/// Default number of redirect hops a client should follow
pub const DEFAULT_REDIRECT_RETRIES: u32 = 2;

/// Normalised cross-node error codes
///
/// Everything a front-end or a peer can observe from routed calls maps to
/// one of these; unknown conditions travel as `Internal` with the original
/// message.
#[derive(Error, Debug)]
pub enum RouterError {
    /// Object is not registered anywhere
    #[error("object not found: {0}")]
    ObjectNotFound(VolumeId),

    /// Operation invalid in the current state
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Snapshot does not exist
    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    /// Snapshot name is taken
    #[error("snapshot name already exists: {0}")]
    SnapshotNameAlreadyExists(String),

    /// Object name is taken
    #[error("file exists: {0}")]
    FileExists(String),

    /// Out of space or queue capacity
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// The previous snapshot has not reached the backend
    #[error("previous snapshot not on backend: {0}")]
    PreviousSnapshotNotOnBackend(String),

    /// The object still has clones depending on it
    #[error("object still has children: {0}")]
    ObjectStillHasChildren(VolumeId),

    /// The object runs on another node
    #[error("redirect to {host}:{port}")]
    Redirect {
        /// Owning node's host
        host: String,
        /// Owning node's management port
        port: u16,
    },

    /// The caller named a different cluster
    #[error("cluster id mismatch: expected {expected}, got {got}")]
    ClusterIdMismatch {
        /// This cluster's id
        expected: String,
        /// Id the caller supplied
        got: String,
    },

    /// A peer did not answer within the deadline
    #[error("request timeout: {0}")]
    RequestTimeout(String),

    /// A remote call expired; the callee may still complete it
    #[error("remote timeout: {0}")]
    RemoteTimeout(String),

    /// Coordinator failure
    #[error("coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    /// Anything else, with the original message preserved
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for router operations
pub type RouterResult<T> = Result<T, RouterError>;

/// Where a request for an object should go
#[derive(Debug, Clone, PartialEq)]
pub enum RouteTarget {
    /// The object runs on this node
    Local,
    /// The object runs on the given peer
    Remote {
        /// Owning node
        node: NodeId,
        /// Peer host
        host: String,
        /// Peer management port
        port: u16,
    },
}

/// A peer node's advertised address
#[derive(Debug, Clone, PartialEq)]
pub struct PeerAddress {
    /// Host
    pub host: String,
    /// Management port
    pub port: u16,
}

/// Thresholds that trigger automatic migration
#[derive(Debug, Clone, Copy)]
pub struct MigrationThresholds {
    /// Remote reads before the volume should move
    pub read_threshold: u64,
    /// Remote writes before the volume should move
    pub write_threshold: u64,
}

impl Default for MigrationThresholds {
    fn default() -> Self {
        Self {
            read_threshold: 4096,
            write_threshold: 1024,
        }
    }
}

#[derive(Default)]
struct RemoteTraffic {
    reads: AtomicU64,
    writes: AtomicU64,
}

/// Per-node request router
pub struct ObjectRouter {
    node_id: NodeId,
    coordinator: CoordinatorClient,
    cache: DashMap<VolumeId, ObjectRegistration>,
    peers: DashMap<NodeId, PeerAddress>,
    traffic: DashMap<VolumeId, Arc<RemoteTraffic>>,
    thresholds: MigrationThresholds,
}

impl ObjectRouter {
    /// Create a router for this node
    pub fn new(
        node_id: NodeId,
        coordinator: CoordinatorClient,
        thresholds: MigrationThresholds,
    ) -> Self {
        Self {
            node_id,
            coordinator,
            cache: DashMap::new(),
            peers: DashMap::new(),
            traffic: DashMap::new(),
            thresholds,
        }
    }

    /// This node's id
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Publish a peer's address for redirects
    pub fn set_peer_address(&self, node: NodeId, address: PeerAddress) {
        self.peers.insert(node, address);
    }

    /// Route a request for an object
    ///
    /// Serves the cached registration when the coordinator is unreachable;
    /// a cache miss during an outage fails with the coordinator error.
    pub async fn resolve(&self, id: &VolumeId) -> RouterResult<RouteTarget> {
        if let Some(cached) = self.cache.get(id) {
            if cached.owner == self.node_id {
                return Ok(RouteTarget::Local);
            }
            return Ok(self.remote_target(&cached));
        }
        let registration = self.refresh(id).await?;
        if registration.owner == self.node_id {
            return Ok(RouteTarget::Local);
        }
        Ok(self.remote_target(&registration))
    }

    fn remote_target(&self, registration: &ObjectRegistration) -> RouteTarget {
        let address = self
            .peers
            .get(&registration.owner)
            .map(|a| a.value().clone())
            .unwrap_or(PeerAddress {
                host: registration.owner.0.clone(),
                port: 0,
            });
        RouteTarget::Remote {
            node: registration.owner.clone(),
            host: address.host,
            port: address.port,
        }
    }

    /// Drop a cached registration, e.g. after ObjectNotRunningHere
    pub fn invalidate(&self, id: &VolumeId) {
        self.cache.remove(id);
    }

    /// Re-read the authoritative registration into the cache
    pub async fn refresh(&self, id: &VolumeId) -> RouterResult<ObjectRegistration> {
        let registration = self
            .coordinator
            .get_registration(id)
            .await?
            .ok_or_else(|| RouterError::ObjectNotFound(id.clone()))?;
        self.cache.insert(id.clone(), registration.value.clone());
        Ok(registration.value)
    }

    /// The authoritative registration with its CAS version
    pub async fn registration(
        &self,
        id: &VolumeId,
    ) -> RouterResult<Versioned<ObjectRegistration>> {
        self.coordinator
            .get_registration(id)
            .await?
            .ok_or_else(|| RouterError::ObjectNotFound(id.clone()))
    }

    /// Transfer ownership to `to` with a fresh owner tag
    ///
    /// The CAS fails if the registration moved underneath the caller; the
    /// new tag is returned for the receiving side's restart.
    pub async fn transfer_ownership(
        &self,
        id: &VolumeId,
        expected: &Versioned<ObjectRegistration>,
        to: NodeId,
    ) -> RouterResult<OwnerTag> {
        let new_tag = self.coordinator.allocate_owner_tag().await?;
        let mut updated = expected.value.clone();
        updated.owner = to;
        updated.owner_tag = new_tag;
        self.coordinator
            .update_registration(&updated, expected.version)
            .await?;
        self.cache.insert(id.clone(), updated);
        Ok(new_tag)
    }

    /// Whether stealing from the recorded owner is permitted
    ///
    /// Stealing is allowed only when the coordinator reports the owner as
    /// Offline.
    pub async fn may_steal(&self, registration: &ObjectRegistration) -> RouterResult<bool> {
        let state = self.coordinator.node_state(&registration.owner).await?;
        Ok(state == NodeState::Offline)
    }

    /// Count a read forwarded here from a remote front-end
    ///
    /// Returns true when the read threshold is crossed and the volume
    /// should migrate towards the traffic.
    pub fn note_remote_read(&self, id: &VolumeId) -> bool {
        let traffic = self.traffic.entry(id.clone()).or_default().clone();
        traffic.reads.fetch_add(1, Ordering::Relaxed) + 1 >= self.thresholds.read_threshold
    }

    /// Count a write forwarded here from a remote front-end
    pub fn note_remote_write(&self, id: &VolumeId) -> bool {
        let traffic = self.traffic.entry(id.clone()).or_default().clone();
        traffic.writes.fetch_add(1, Ordering::Relaxed) + 1 >= self.thresholds.write_threshold
    }

    /// Reset the forwarded-traffic counters, e.g. after a migration
    pub fn reset_remote_counters(&self, id: &VolumeId) {
        self.traffic.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{
        DtlPolicy, MemoryCoordinator, ObjectType,
    };
    use crate::types::Namespace;

    fn registration(owner: &str, tag: u64) -> ObjectRegistration {
        ObjectRegistration {
            id: VolumeId::new("vol"),
            object_type: ObjectType::Volume,
            namespace: Namespace::new("ns-vol"),
            parent: None,
            owner: NodeId::new(owner),
            owner_tag: OwnerTag(tag),
            dtl_policy: DtlPolicy::disabled(),
        }
    }

    async fn router(owner: &str) -> (Arc<MemoryCoordinator>, ObjectRouter) {
        let kv = Arc::new(MemoryCoordinator::new());
        let client = CoordinatorClient::new(Arc::clone(&kv) as Arc<dyn crate::coordinator::CoordinatorKv>);
        client.register_object(&registration(owner, 1)).await.unwrap();
        let router = ObjectRouter::new(
            NodeId::new("node-a"),
            client,
            MigrationThresholds::default(),
        );
        (kv, router)
    }

    #[tokio::test]
    async fn local_objects_resolve_local() {
        let (_kv, router) = router("node-a").await;
        assert_eq!(
            router.resolve(&VolumeId::new("vol")).await.unwrap(),
            RouteTarget::Local
        );
    }

    #[tokio::test]
    async fn remote_objects_redirect_to_peer_address() {
        let (_kv, router) = router("node-b").await;
        router.set_peer_address(
            NodeId::new("node-b"),
            PeerAddress {
                host: "10.0.0.2".to_string(),
                port: 7777,
            },
        );
        match router.resolve(&VolumeId::new("vol")).await.unwrap() {
            RouteTarget::Remote { node, host, port } => {
                assert_eq!(node, NodeId::new("node-b"));
                assert_eq!(host, "10.0.0.2");
                assert_eq!(port, 7777);
            }
            RouteTarget::Local => panic!("expected a redirect"),
        }
    }

    #[tokio::test]
    async fn outage_serves_cached_registrations() {
        let (kv, router) = router("node-a").await;
        router.resolve(&VolumeId::new("vol")).await.unwrap();

        kv.set_unreachable(true);
        // Cached entry still answers.
        assert_eq!(
            router.resolve(&VolumeId::new("vol")).await.unwrap(),
            RouteTarget::Local
        );
        // A miss cannot be served.
        assert!(router.resolve(&VolumeId::new("other")).await.is_err());
    }

    #[tokio::test]
    async fn transfer_bumps_tag_and_fences_stale_version() {
        let (_kv, router) = router("node-a").await;
        let current = router.registration(&VolumeId::new("vol")).await.unwrap();
        let new_tag = router
            .transfer_ownership(&VolumeId::new("vol"), &current, NodeId::new("node-b"))
            .await
            .unwrap();
        assert!(new_tag > current.value.owner_tag);

        // The loser retries with the stale version and fails.
        let err = router
            .transfer_ownership(&VolumeId::new("vol"), &current, NodeId::new("node-c"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RouterError::Coordinator(CoordinatorError::CasConflict { .. })
        ));
    }

    #[tokio::test]
    async fn stealing_requires_offline_owner() {
        let (_kv, router) = router("node-b").await;
        let registration = router.registration(&VolumeId::new("vol")).await.unwrap();
        // Unknown node state reads as Offline, so stealing is permitted.
        assert!(router.may_steal(&registration.value).await.unwrap());

        router
            .coordinator
            .set_node_state(&NodeId::new("node-b"), NodeState::Online)
            .await
            .unwrap();
        assert!(!router.may_steal(&registration.value).await.unwrap());
    }

    #[tokio::test]
    async fn thresholds_trigger_auto_migration() {
        let kv = Arc::new(MemoryCoordinator::new());
        let client = CoordinatorClient::new(kv as Arc<dyn crate::coordinator::CoordinatorKv>);
        let router = ObjectRouter::new(
            NodeId::new("node-a"),
            client,
            MigrationThresholds {
                read_threshold: 3,
                write_threshold: 2,
            },
        );
        let id = VolumeId::new("vol");
        assert!(!router.note_remote_write(&id));
        assert!(router.note_remote_write(&id));
        router.reset_remote_counters(&id);
        assert!(!router.note_remote_write(&id));
    }
}
