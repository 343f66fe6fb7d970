//! The node-wide engine composite
//!
//! One `Engine` per process owns every shared component: the backend
//! connector, the SCO and cluster caches, the backend worker pool, the
//! coordinator client, the router and the registry of running volumes. It
//! exposes the management verbs; RPC transports adapt them from outside
//! the core.
//!
//! Every verb names the cluster it expects to talk to and is answered with
//! either a result or a redirect to the owning node.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::{BackendConnector, BackendHandle, VOLUME_CONFIG_OBJECT};
use crate::clustercache::{ClusterCache, ClusterCacheBehaviour, ClusterCacheMode};
use crate::coordinator::{
    CoordinatorClient, CoordinatorError, CoordinatorKv, DtlPolicy, DtlPolicyMode, NodeState,
    ObjectRegistration, ObjectType,
};
use crate::dtl::{DtlChecker, DtlClient, DtlClientConfig, DtlProbe};
use crate::events::{EngineEvent, EventBus};
use crate::metadata::{open_backend, MetaDataStore};
use crate::recovery::{self, RestartContext};
use crate::router::{
    MigrationThresholds, ObjectRouter, PeerAddress, RouteTarget, RouterError, RouterResult,
};
use crate::scheduling::{BackendWorkerPool, BackendWorkerPoolConfig};
use crate::scocache::{NamespaceLimits, ScoAccessData, ScoCache, ScoCacheConfig};
use crate::snapshot::{SnapshotError, SnapshotPersistor, SnapshotPersistorStore};
use crate::tlog::{TLogSource, TLogWriter};
use crate::types::{
    Lba, Namespace, NodeId, SCONumber, SnapshotName, TLogId, VolumeId,
};
use crate::volume::engine::VolumeParts;
use crate::volume::{
    Volume, VolumeConfig, VolumeError, VolumePaths, VolumeStats,
};

/// Node-level configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// This node's id
    pub node_id: NodeId,
    /// Cluster identity every management call must name
    pub cluster_id: String,
    /// Node-local working directory (TLogs, metadata, documents)
    pub work_dir: PathBuf,
    /// Lower bound of the front-end worker pool
    pub frontend_workers_min: usize,
    /// Upper bound of the front-end worker pool
    pub frontend_workers_max: usize,
    /// How long a migration waits for in-flight backend uploads
    pub backend_sync_timeout: Duration,
    /// Interval of the DTL checker probe
    pub dtl_check_interval: Duration,
    /// Interval between heatmap decay-and-publish rounds
    pub heatmap_publish_interval: Duration,
    /// Remote-traffic thresholds for automatic migration
    pub migration_thresholds: MigrationThresholds,
}

impl EngineConfig {
    /// Sensible defaults for a single-node deployment
    pub fn new(node_id: NodeId, cluster_id: impl Into<String>, work_dir: PathBuf) -> Self {
        Self {
            node_id,
            cluster_id: cluster_id.into(),
            work_dir,
            frontend_workers_min: 2,
            frontend_workers_max: 16,
            backend_sync_timeout: Duration::from_secs(30),
            dtl_check_interval: Duration::from_secs(5),
            heatmap_publish_interval: Duration::from_secs(30),
            migration_thresholds: MigrationThresholds::default(),
        }
    }

    fn validate(&self) -> RouterResult<()> {
        if self.frontend_workers_min == 0
            || self.frontend_workers_min > self.frontend_workers_max
        {
            return Err(RouterError::InvalidOperation(format!(
                "front-end worker bounds [{}, {}] are invalid",
                self.frontend_workers_min, self.frontend_workers_max
            )));
        }
        if self.cluster_id.is_empty() {
            return Err(RouterError::InvalidOperation(
                "cluster id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Flags of the destroy verb
#[derive(Debug, Clone, Copy, Default)]
pub struct DestroyFlags {
    /// Drop the node-local state (SCO cache contents, metadata, TLogs)
    pub delete_local_data: bool,
    /// Also delete the backend namespace and the registration
    pub remove_completely: bool,
    /// Proceed even if the volume is halted
    pub force: bool,
}

/// The per-node engine
pub struct Engine {
    config: EngineConfig,
    connector: Arc<dyn BackendConnector>,
    sco_cache: Arc<ScoCache>,
    cluster_cache: Arc<ClusterCache>,
    pool: Arc<BackendWorkerPool>,
    coordinator: CoordinatorClient,
    router: Arc<ObjectRouter>,
    events: EventBus,
    volumes: Arc<DashMap<VolumeId, Arc<Volume>>>,
    checker: parking_lot::Mutex<Option<DtlChecker>>,
    background: parking_lot::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Engine {
    /// Bootstrap the engine: build caches and pools, join the cluster
    ///
    /// Refuses to start on invalid worker bounds or an unreachable
    /// coordinator.
    pub async fn start(
        config: EngineConfig,
        connector: Arc<dyn BackendConnector>,
        sco_cache_config: ScoCacheConfig,
        cluster_cache_capacity: usize,
        pool_config: BackendWorkerPoolConfig,
        coordinator_kv: Arc<dyn CoordinatorKv>,
    ) -> RouterResult<Arc<Engine>> {
        config.validate()?;
        let coordinator = CoordinatorClient::new(coordinator_kv);
        // An unreachable coordinator at startup is a refusal, not a retry.
        coordinator
            .set_node_state(&config.node_id, NodeState::Online)
            .await?;

        let sco_cache = Arc::new(
            ScoCache::new(sco_cache_config)
                .map_err(|e| RouterError::InvalidOperation(e.to_string()))?,
        );
        let cluster_cache = Arc::new(ClusterCache::new(cluster_cache_capacity));
        let pool = BackendWorkerPool::new(pool_config, Arc::clone(&connector), Arc::clone(&sco_cache));
        let router = Arc::new(ObjectRouter::new(
            config.node_id.clone(),
            coordinator.clone(),
            config.migration_thresholds,
        ));
        let volumes: Arc<DashMap<VolumeId, Arc<Volume>>> = Arc::new(DashMap::new());

        let engine = Arc::new(Engine {
            connector,
            sco_cache,
            cluster_cache,
            pool,
            coordinator,
            router,
            events: EventBus::new(),
            volumes: Arc::clone(&volumes),
            checker: parking_lot::Mutex::new(None),
            background: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        engine.background.lock().push(engine.sco_cache.spawn_sweeper());
        let checker_volumes = Arc::clone(&volumes);
        *engine.checker.lock() = Some(DtlChecker::spawn(
            engine.config.dtl_check_interval,
            move || {
                checker_volumes
                    .iter()
                    .map(|v| Arc::clone(v.value()) as Arc<dyn DtlProbe>)
                    .collect()
            },
        ));
        let heatmap_volumes = Arc::clone(&volumes);
        let heatmap_interval = engine.config.heatmap_publish_interval;
        engine.background.lock().push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heatmap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let volumes: Vec<Arc<Volume>> = heatmap_volumes
                    .iter()
                    .map(|v| Arc::clone(v.value()))
                    .collect();
                for volume in volumes {
                    if let Err(e) = volume.publish_access_data().await {
                        log::debug!("heatmap publish for {} skipped: {e}", volume.id());
                    }
                }
            }
        }));
        log::info!(
            "engine started on {} for cluster {}",
            engine.config.node_id,
            engine.config.cluster_id
        );
        Ok(engine)
    }

    /// The engine's event bus
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// This node's id
    pub fn node_id(&self) -> &NodeId {
        &self.config.node_id
    }

    /// The router, for front-end adapters
    pub fn router(&self) -> &Arc<ObjectRouter> {
        &self.router
    }

    fn check_cluster(&self, cluster_id: &str) -> RouterResult<()> {
        if cluster_id != self.config.cluster_id {
            return Err(RouterError::ClusterIdMismatch {
                expected: self.config.cluster_id.clone(),
                got: cluster_id.to_string(),
            });
        }
        Ok(())
    }

    fn restart_context(&self) -> RestartContext {
        RestartContext {
            connector: Arc::clone(&self.connector),
            sco_cache: Arc::clone(&self.sco_cache),
            cluster_cache: Arc::clone(&self.cluster_cache),
            pool: Arc::clone(&self.pool),
            events: self.events.clone(),
            work_dir: self.config.work_dir.clone(),
        }
    }

    async fn local_volume(&self, id: &VolumeId) -> RouterResult<Arc<Volume>> {
        if let Some(volume) = self.volumes.get(id) {
            return Ok(Arc::clone(volume.value()));
        }
        self.router.invalidate(id);
        match self.router.resolve(id).await? {
            RouteTarget::Local => Err(RouterError::InvalidOperation(format!(
                "volume {id} is registered here but not running"
            ))),
            RouteTarget::Remote { host, port, .. } => Err(RouterError::Redirect { host, port }),
        }
    }

    fn namespace_for(id: &VolumeId) -> Namespace {
        Namespace::new(format!("vol-{id}"))
    }

    // ------------------------------------------------------------------
    // Volume lifecycle
    // ------------------------------------------------------------------

    /// Create a fresh volume owned by this node
    pub async fn create_volume(
        &self,
        cluster_id: &str,
        id: VolumeId,
        size: u64,
        dtl_policy: DtlPolicy,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        if self.volumes.contains_key(&id) {
            return Err(RouterError::FileExists(id.0.clone()));
        }

        let namespace = Self::namespace_for(&id);
        let owner_tag = self.coordinator.allocate_owner_tag().await?;
        let mut config = VolumeConfig::new(id.clone(), namespace.clone(), size, &self.config.work_dir);
        config.owner_tag = owner_tag;
        config.validate().map_err(volume_error)?;

        let registration = ObjectRegistration {
            id: id.clone(),
            object_type: ObjectType::Volume,
            namespace: namespace.clone(),
            parent: None,
            owner: self.config.node_id.clone(),
            owner_tag,
            dtl_policy: dtl_policy.clone(),
        };
        match self.coordinator.register_object(&registration).await {
            Ok(_) => {}
            Err(CoordinatorError::CasConflict { .. }) => {
                return Err(RouterError::FileExists(id.0.clone()))
            }
            Err(e) => return Err(e.into()),
        }

        self.connector
            .create_namespace(&namespace)
            .await
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        let volume = self
            .build_fresh_volume(config, Vec::new())
            .await
            .map_err(volume_error)?;
        self.apply_dtl_policy(&volume, &dtl_policy).await;
        self.volumes.insert(id, volume);
        Ok(())
    }

    /// Create a writable clone from a parent's snapshot
    ///
    /// Defaults to the parent's most recent snapshot; the named snapshot
    /// must be on the backend. The clone reads through to the parent's
    /// namespace for everything it has not overwritten.
    pub async fn create_clone(
        &self,
        cluster_id: &str,
        id: VolumeId,
        parent_id: &VolumeId,
        parent_snapshot: Option<SnapshotName>,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        if self.volumes.contains_key(&id) {
            return Err(RouterError::FileExists(id.0.clone()));
        }
        let parent_registration = self
            .coordinator
            .get_registration(parent_id)
            .await?
            .ok_or_else(|| RouterError::ObjectNotFound(parent_id.clone()))?
            .value;
        let parent_ns = parent_registration.namespace.clone();
        let parent_handle = BackendHandle::new(Arc::clone(&self.connector), parent_ns.clone());
        let parent_config: VolumeConfig = serde_json::from_slice(
            &parent_handle
                .get(VOLUME_CONFIG_OBJECT)
                .await
                .map_err(|e| RouterError::Internal(e.to_string()))?,
        )
        .map_err(|e| RouterError::Internal(format!("parent volumeconfig: {e}")))?;

        let parent_persistor = SnapshotPersistorStore::new(parent_handle.clone())
            .pull()
            .await
            .map_err(|e| volume_error(e.into()))?;
        let snapshot = match parent_snapshot {
            Some(name) => parent_persistor
                .find(&name)
                .ok_or(RouterError::SnapshotNotFound(name.0.clone()))?
                .clone(),
            None => parent_persistor
                .snapshots()
                .iter()
                .rev()
                .find(|s| !s.tombstoned)
                .ok_or_else(|| {
                    RouterError::InvalidOperation(format!("{parent_id} has no snapshots"))
                })?
                .clone(),
        };
        if !snapshot.in_backend {
            return Err(RouterError::PreviousSnapshotNotOnBackend(snapshot.name.0.clone()));
        }

        let namespace = Self::namespace_for(&id);
        let owner_tag = self.coordinator.allocate_owner_tag().await?;
        let mut config = VolumeConfig::new(
            id.clone(),
            namespace.clone(),
            parent_config.size,
            &self.config.work_dir,
        );
        config.owner_tag = owner_tag;
        config.lba_size = parent_config.lba_size;
        config.cluster_multiplier = parent_config.cluster_multiplier;
        config.sco_multiplier = parent_config.sco_multiplier;
        config.tlog_multiplier = parent_config.tlog_multiplier;
        config.clone_generation = parent_config.clone_generation.child();
        config.parent = Some((parent_ns, snapshot.name.clone()));

        let registration = ObjectRegistration {
            id: id.clone(),
            object_type: ObjectType::Volume,
            namespace: namespace.clone(),
            parent: config.parent.clone(),
            owner: self.config.node_id.clone(),
            owner_tag,
            dtl_policy: DtlPolicy::disabled(),
        };
        match self.coordinator.register_object(&registration).await {
            Ok(_) => {}
            Err(CoordinatorError::CasConflict { .. }) => {
                return Err(RouterError::FileExists(id.0.clone()))
            }
            Err(e) => return Err(e.into()),
        }
        self.connector
            .create_namespace(&namespace)
            .await
            .map_err(|e| RouterError::Internal(e.to_string()))?;

        let lineage = recovery::resolve_lineage(&self.connector, &config)
            .await
            .map_err(volume_error)?;
        let volume = self
            .build_fresh_volume(config, lineage)
            .await
            .map_err(volume_error)?;
        self.volumes.insert(id, volume);
        Ok(())
    }

    async fn build_fresh_volume(
        &self,
        config: VolumeConfig,
        lineage: Vec<(BackendHandle, SnapshotName)>,
    ) -> Result<Arc<Volume>, VolumeError> {
        let namespace = config.namespace.clone();
        let backend = BackendHandle::new(Arc::clone(&self.connector), namespace.clone());
        let paths = VolumePaths::new(&self.config.work_dir, &namespace);
        if let Some(parent) = paths.persistor_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let metadata = MetaDataStore::new(
            open_backend(&config.metadata_backend)?,
            config.metadata_cache_capacity,
        );
        metadata.clear()?;

        // A clone starts from its parent's history.
        let (_, max_sco) = recovery::replay_chain(
            &metadata,
            &lineage,
            TLogSource::backend_only(backend.clone()),
            Vec::new(),
            config.clone_generation,
        )
        .await?;

        let access_data = Arc::new(ScoAccessData::new(namespace.clone()));
        self.sco_cache.register_namespace(
            namespace.clone(),
            NamespaceLimits::derive(config.sco_size(), config.tlog_multiplier, 1.5),
            Arc::clone(&access_data),
        );

        let initial_tlog = TLogId::new();
        let writer = TLogWriter::create(&paths.tlog_dir, initial_tlog)?;
        let persistor = SnapshotPersistor::new(initial_tlog);

        let config_bytes =
            serde_json::to_vec(&config).map_err(|e| VolumeError::InvalidOperation(e.to_string()))?;
        backend
            .put(
                VOLUME_CONFIG_OBJECT,
                config_bytes,
                true,
                Some(&crate::volume::engine::owner_tag_condition(config.owner_tag)),
            )
            .await?;
        persistor.save_local(&paths.persistor_path)?;
        SnapshotPersistorStore::new(backend.clone())
            .push(&persistor, None)
            .await?;

        let parts = VolumeParts {
            config,
            backend,
            lineage,
            sco_cache: Arc::clone(&self.sco_cache),
            cluster_cache: Arc::clone(&self.cluster_cache),
            pool: Arc::clone(&self.pool),
            events: self.events.clone(),
            metadata,
            persistor,
            paths,
            access_data,
            tlog_writer: writer,
            next_sco: max_sco.map_or(SCONumber::FIRST, |n| n.next()),
            durable_tlogs: Default::default(),
            pending_corks: Vec::new(),
            tlog_scos: Default::default(),
        };
        let volume = Volume::assemble(parts);
        volume.activate();
        Ok(volume)
    }

    async fn apply_dtl_policy(&self, volume: &Arc<Volume>, policy: &DtlPolicy) {
        let config = match policy.mode {
            DtlPolicyMode::Disabled => None,
            DtlPolicyMode::Manual | DtlPolicyMode::Automatic => policy.address.clone(),
        };
        if config.is_some() {
            if let Err(e) = volume.set_dtl_config(config).await {
                log::warn!("dtl attach for {} failed: {e}", volume.id());
            }
        }
    }

    /// Destroy a volume
    pub async fn destroy(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        flags: DestroyFlags,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let registration = self.router.registration(id).await?;
        if registration.value.owner != self.config.node_id {
            return match self.router.resolve(id).await? {
                RouteTarget::Remote { host, port, .. } => Err(RouterError::Redirect { host, port }),
                RouteTarget::Local => Err(RouterError::ObjectNotFound(id.clone())),
            };
        }

        // A volume with registered clones cannot go away underneath them.
        let others: Vec<_> = self
            .coordinator
            .list_registrations()
            .await?
            .into_iter()
            .filter(|other| other != id)
            .collect();
        let children = futures::future::join_all(
            others.iter().map(|other| self.coordinator.get_registration(other)),
        )
        .await;
        for child in children {
            if let Some(child) = child? {
                if child
                    .value
                    .parent
                    .as_ref()
                    .map(|(ns, _)| ns == &registration.value.namespace)
                    .unwrap_or(false)
                {
                    return Err(RouterError::ObjectStillHasChildren(id.clone()));
                }
            }
        }

        if let Some((_, volume)) = self.volumes.remove(id) {
            if !flags.force {
                if let crate::volume::VolumeState::Halted(reason) = volume.state() {
                    self.volumes.insert(id.clone(), volume);
                    return Err(RouterError::InvalidOperation(format!(
                        "volume is halted ({reason}); destroy with force"
                    )));
                }
            }
            volume.deactivate(flags.delete_local_data).await;
        }

        if flags.remove_completely {
            self.connector
                .delete_namespace(&registration.value.namespace)
                .await
                .map_err(|e| RouterError::Internal(e.to_string()))?;
            self.coordinator
                .remove_registration(id, registration.version)
                .await?;
        }
        self.router.invalidate(id);
        Ok(())
    }

    /// Stop a running volume, keeping its registration
    pub async fn stop(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        delete_local_data: bool,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let (_, volume) = self
            .volumes
            .remove(id)
            .ok_or_else(|| RouterError::ObjectNotFound(id.clone()))?;
        volume.quiesce(self.config.backend_sync_timeout).await.ok();
        volume.deactivate(delete_local_data).await;
        Ok(())
    }

    /// Restart a stopped or crashed volume on this node
    ///
    /// `force` permits falling back to a backend restart when the local
    /// state is damaged.
    pub async fn restart(&self, cluster_id: &str, id: &VolumeId, force: bool) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        if let Some(volume) = self.volumes.get(id) {
            if !matches!(volume.state(), crate::volume::VolumeState::Halted(_)) {
                return Err(RouterError::InvalidOperation(format!(
                    "volume {id} is already running"
                )));
            }
        }
        if let Some((_, volume)) = self.volumes.remove(id) {
            // Release the listener registration and the metadata store
            // before the restart reopens them.
            volume.deactivate(false).await;
        }
        let registration = self.router.registration(id).await?;
        if registration.value.owner != self.config.node_id {
            return match self.router.resolve(id).await? {
                RouteTarget::Remote { host, port, .. } => Err(RouterError::Redirect { host, port }),
                RouteTarget::Local => Err(RouterError::ObjectNotFound(id.clone())),
            };
        }

        // Pull what the DTL peer still holds before replaying.
        let dtl_records = match &registration.value.dtl_policy.address {
            Some(address) => {
                let client = DtlClient::new(id.clone(), registration.value.owner_tag);
                match client.configure(Some(address.clone())).await {
                    Ok(()) => client.recover(SCONumber(0)).await.unwrap_or_default(),
                    Err(_) => Vec::new(),
                }
            }
            None => Vec::new(),
        };

        let volume = recovery::local_restart(
            &self.restart_context(),
            id,
            &registration.value.namespace,
            registration.value.owner_tag,
            dtl_records,
            force,
        )
        .await
        .map_err(volume_error)?;
        self.apply_dtl_policy(&volume, &registration.value.dtl_policy)
            .await;
        self.volumes.insert(id.clone(), volume);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Migration
    // ------------------------------------------------------------------

    /// Move ownership of a volume to another node
    ///
    /// From the owning node this is a voluntary migration: quiesce, CAS
    /// the registration with a fresh tag, tear down. From the target node
    /// with the recorded owner Offline it is a steal: same protocol minus
    /// the quiesce, recovering from DTL and backend state.
    pub async fn migrate(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        to: NodeId,
        force: bool,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let registration = self.router.registration(id).await?;
        let from = registration.value.owner.clone();

        if from == to {
            return Ok(());
        }

        if from == self.config.node_id {
            // Voluntary hand-off.
            let volume = self
                .volumes
                .get(id)
                .map(|v| Arc::clone(v.value()))
                .ok_or_else(|| RouterError::ObjectNotFound(id.clone()))?;
            match volume.quiesce(self.config.backend_sync_timeout).await {
                Ok(()) => {}
                Err(e) if force => log::warn!("forced migration of {id} without quiesce: {e}"),
                Err(VolumeError::InvalidOperation(msg)) if msg.contains("timeout") => {
                    return Err(RouterError::RemoteTimeout(msg));
                }
                Err(e) => return Err(volume_error(e)),
            }
            let new_tag = self.router.transfer_ownership(id, &registration, to.clone()).await?;
            self.volumes.remove(id);
            volume.deactivate(true).await;
            self.router.reset_remote_counters(id);
            self.events.publish(EngineEvent::OwnerChanged {
                id: id.clone(),
                from,
                to,
                tag: new_tag,
            });
            return Ok(());
        }

        if to == self.config.node_id {
            // Stealing; only from an owner the coordinator says is gone.
            if !self.router.may_steal(&registration.value).await? {
                return Err(RouterError::InvalidOperation(format!(
                    "owner {from} of {id} is online; stealing is forbidden"
                )));
            }
            let new_tag = self
                .router
                .transfer_ownership(id, &registration, to.clone())
                .await?;
            let volume = recovery::backend_restart(
                &self.restart_context(),
                id,
                &registration.value.namespace,
                new_tag,
                true,
            )
            .await
            .map_err(volume_error)?;
            self.apply_dtl_policy(&volume, &registration.value.dtl_policy)
                .await;
            self.volumes.insert(id.clone(), volume);
            self.events.publish(EngineEvent::OwnerChanged {
                id: id.clone(),
                from,
                to,
                tag: new_tag,
            });
            return Ok(());
        }

        match self.router.resolve(id).await? {
            RouteTarget::Remote { host, port, .. } => Err(RouterError::Redirect { host, port }),
            RouteTarget::Local => Err(RouterError::ObjectNotFound(id.clone())),
        }
    }

    /// Count a forwarded read and trigger automatic migration on threshold
    pub async fn note_forwarded_read(&self, id: &VolumeId, from: NodeId) {
        if self.router.note_remote_read(id) {
            log::info!("read traffic from {from} crossed the threshold, migrating {id}");
            if let Err(e) = self.migrate(&self.config.cluster_id.clone(), id, from, false).await {
                log::warn!("automatic migration of {id} failed: {e}");
            }
        }
    }

    /// Count a forwarded write and trigger automatic migration on threshold
    pub async fn note_forwarded_write(&self, id: &VolumeId, from: NodeId) {
        if self.router.note_remote_write(id) {
            log::info!("write traffic from {from} crossed the threshold, migrating {id}");
            if let Err(e) = self.migrate(&self.config.cluster_id.clone(), id, from, false).await {
                log::warn!("automatic migration of {id} failed: {e}");
            }
        }
    }

    /// Publish a node as online
    pub async fn mark_node_online(&self, cluster_id: &str, node: &NodeId) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        self.coordinator.set_node_state(node, NodeState::Online).await?;
        Ok(())
    }

    /// Publish a node as offline, allowing its volumes to be stolen
    pub async fn mark_node_offline(&self, cluster_id: &str, node: &NodeId) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        self.coordinator.set_node_state(node, NodeState::Offline).await?;
        Ok(())
    }

    /// Advertise a peer's management address for redirects
    pub fn set_peer_address(&self, node: NodeId, host: impl Into<String>, port: u16) {
        self.router.set_peer_address(
            node,
            PeerAddress {
                host: host.into(),
                port,
            },
        );
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Create a snapshot; a name is generated when none is given
    pub async fn create_snapshot(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        name: Option<SnapshotName>,
        metadata: String,
    ) -> RouterResult<SnapshotName> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        let name =
            name.unwrap_or_else(|| SnapshotName::new(format!("snapshot-{}", uuid::Uuid::new_v4())));
        volume
            .create_snapshot(name.clone(), metadata)
            .await
            .map_err(volume_error)?;
        Ok(name)
    }

    /// List a volume's snapshots
    pub async fn list_snapshots(
        &self,
        cluster_id: &str,
        id: &VolumeId,
    ) -> RouterResult<Vec<SnapshotName>> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        Ok(volume.list_snapshots())
    }

    /// Roll a volume back to a snapshot
    pub async fn restore_snapshot(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        name: &SnapshotName,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.restore_snapshot(name).await.map_err(volume_error)
    }

    /// Delete (tombstone) a snapshot
    pub async fn delete_snapshot(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        name: &SnapshotName,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.delete_snapshot(name).await.map_err(volume_error)
    }

    // ------------------------------------------------------------------
    // Tuning
    // ------------------------------------------------------------------

    /// Reconfigure a volume's DTL peer and record the policy
    pub async fn set_failover_cache_config(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        config: Option<DtlClientConfig>,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume
            .set_dtl_config(config.clone())
            .await
            .map_err(volume_error)?;

        let registration = self.router.registration(id).await?;
        let mut updated = registration.value.clone();
        updated.dtl_policy = DtlPolicy {
            mode: if config.is_some() {
                DtlPolicyMode::Manual
            } else {
                DtlPolicyMode::Disabled
            },
            address: config,
        };
        self.coordinator
            .update_registration(&updated, registration.version)
            .await?;
        Ok(())
    }

    /// Change the cluster-cache keying discipline
    pub async fn set_cluster_cache_mode(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        mode: ClusterCacheMode,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.set_cluster_cache_mode(mode).map_err(volume_error)
    }

    /// Change the cluster-cache admission behaviour
    pub async fn set_cluster_cache_behaviour(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        behaviour: ClusterCacheBehaviour,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.set_cluster_cache_behaviour(behaviour);
        Ok(())
    }

    /// Change the location-based cluster-cache entry cap
    pub async fn set_cluster_cache_limit(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        limit: usize,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.set_cluster_cache_limit(limit).map_err(volume_error)
    }

    /// Change the SCO multiplier within its bounds
    pub async fn set_sco_multiplier(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        multiplier: u32,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.set_sco_multiplier(multiplier).await.map_err(volume_error)
    }

    /// Change the TLog multiplier
    pub async fn set_tlog_multiplier(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        multiplier: u32,
    ) -> RouterResult<()> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.set_tlog_multiplier(multiplier).await.map_err(volume_error)
    }

    /// Seal and enqueue the current TLog; pair with [`Engine::is_synced_up_to`]
    pub async fn schedule_backend_sync(
        &self,
        cluster_id: &str,
        id: &VolumeId,
    ) -> RouterResult<TLogId> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        volume.schedule_backend_sync().await.map_err(volume_error)
    }

    /// Whether a volume's chain is durable up to the given TLog
    pub async fn is_synced_up_to(
        &self,
        cluster_id: &str,
        id: &VolumeId,
        tlog: TLogId,
    ) -> RouterResult<bool> {
        self.check_cluster(cluster_id)?;
        let volume = self.local_volume(id).await?;
        Ok(volume.is_synced_up_to(tlog))
    }

    // ------------------------------------------------------------------
    // Front-end surface
    // ------------------------------------------------------------------

    /// Open a volume for I/O
    pub async fn open(&self, id: &VolumeId) -> RouterResult<Arc<Volume>> {
        self.local_volume(id).await
    }

    /// Write through a volume by id
    pub async fn write(&self, id: &VolumeId, lba: Lba, buf: &[u8]) -> RouterResult<()> {
        let volume = self.local_volume(id).await?;
        volume.write(lba, buf).await.map_err(volume_error)
    }

    /// Read through a volume by id
    pub async fn read(&self, id: &VolumeId, lba: Lba, len: usize) -> RouterResult<Vec<u8>> {
        let volume = self.local_volume(id).await?;
        volume.read(lba, len).await.map_err(volume_error)
    }

    /// Flush a volume's buffered state
    pub async fn flush(&self, id: &VolumeId) -> RouterResult<()> {
        let volume = self.local_volume(id).await?;
        volume.flush().await.map_err(volume_error)
    }

    /// Grow a volume
    pub async fn truncate(&self, id: &VolumeId, new_size: u64) -> RouterResult<()> {
        let volume = self.local_volume(id).await?;
        volume.truncate(new_size).await.map_err(volume_error)
    }

    /// Status and counters of a volume
    pub async fn stat(&self, id: &VolumeId) -> RouterResult<VolumeStats> {
        let volume = self.local_volume(id).await?;
        Ok(volume.stats())
    }

    /// Stop background tasks; volumes stay as they are
    pub fn shutdown_background_tasks(&self) {
        if let Some(checker) = self.checker.lock().take() {
            checker.stop();
        }
        for task in self.background.lock().drain(..) {
            task.abort();
        }
        self.pool.shutdown();
    }
}

/// Map volume-level failures onto the normalised router codes
fn volume_error(e: VolumeError) -> RouterError {
    match e {
        VolumeError::Snapshot(SnapshotError::NameAlreadyExists(name)) => {
            RouterError::SnapshotNameAlreadyExists(name.0)
        }
        VolumeError::Snapshot(SnapshotError::NotFound(name)) => {
            RouterError::SnapshotNotFound(name.0)
        }
        VolumeError::Snapshot(SnapshotError::PreviousNotOnBackend(name)) => {
            RouterError::PreviousSnapshotNotOnBackend(name.0)
        }
        VolumeError::Snapshot(SnapshotError::NotOnBackend(name)) => {
            RouterError::PreviousSnapshotNotOnBackend(name.0)
        }
        VolumeError::InsufficientResources(msg) => RouterError::InsufficientResources(msg),
        VolumeError::Unaligned(msg) => RouterError::InvalidOperation(msg),
        VolumeError::OutOfBounds { lba, clusters } => RouterError::InvalidOperation(format!(
            "lba {lba} beyond volume of {clusters} clusters"
        )),
        VolumeError::InvalidOperation(msg) => RouterError::InvalidOperation(msg),
        other => RouterError::Internal(other.to_string()),
    }
}
