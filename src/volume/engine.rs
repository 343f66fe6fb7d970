//! The per-volume read/write pipeline and state machine

use async_trait::async_trait;
use parking_lot::{Mutex as PlMutex, RwLock as PlRwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;

use super::{VolumeConfig, VolumeError, VolumePaths, VolumeResult, VolumeState, VolumeStats};
use crate::backend::{BackendHandle, PutCondition, VOLUME_CONFIG_OBJECT};
use crate::clustercache::{CacheKey, ClusterCache, ClusterCacheBehaviour, ClusterCacheMode};
use crate::dtl::{DtlClient, DtlClientConfig, DtlEntry, DtlError, DtlMode, DtlProbe, DtlState};
use crate::events::{EngineEvent, EventBus};
use crate::metadata::MetaDataStore;
use crate::scheduling::{BackendJob, BackendJobKind, BackendWorkerPool, UploadListener};
use crate::scocache::{OpenSco, ScoAccessData, ScoCache, WriteAdmission};
use crate::snapshot::{SnapshotPersistor, SnapshotPersistorStore};
use crate::tlog::{
    CombinedTLogReader, TLogProcessor, TLogResult, TLogSource, TLogWriter,
};
use crate::types::{
    CacheHandle, CloneGeneration, ClusterAddress, ClusterHash, ClusterLocation,
    ClusterLocationAndHash, Lba, OwnerTag, SCOName, SCONumber, SnapshotName, TLogId, VolumeId,
};

/// Mutable write-path state, guarded by the per-volume write serialiser
struct WriteState {
    tlog: Option<TLogWriter>,
    open_sco: Option<(OpenSco, u32)>,
    next_sco: SCONumber,
    bytes_since_snapshot: u64,
}

/// Durability bookkeeping shared with the upload listener
#[derive(Default)]
struct Durability {
    durable_tlogs: HashSet<TLogId>,
    uploaded_scos: HashSet<SCOName>,
    tlog_scos: HashMap<TLogId, Vec<SCOName>>,
    cork_queue: VecDeque<TLogId>,
}

#[derive(Default)]
struct Counters {
    write_ops: AtomicU64,
    read_ops: AtomicU64,
    bytes_written: AtomicU64,
    bytes_read: AtomicU64,
    cluster_cache_hits: AtomicU64,
    backend_fetches: AtomicU64,
}

/// A virtual block volume
///
/// All I/O enters through [`Volume::write`] and [`Volume::read`]; the write
/// serialiser guarantees the TLog order equals the acknowledgement order.
pub struct Volume {
    id: VolumeId,
    config: PlRwLock<VolumeConfig>,
    state: PlMutex<VolumeState>,
    paths: VolumePaths,
    backend: BackendHandle,
    /// Ancestor chain for clones, nearest parent first
    lineage: Vec<(BackendHandle, SnapshotName)>,
    sco_cache: Arc<ScoCache>,
    cluster_cache: Arc<ClusterCache>,
    cache_handle: PlMutex<Option<CacheHandle>>,
    access_data: Arc<ScoAccessData>,
    metadata: MetaDataStore,
    persistor: PlMutex<SnapshotPersistor>,
    dtl: DtlClient,
    pool: Arc<BackendWorkerPool>,
    events: EventBus,
    writer: AsyncMutex<WriteState>,
    durability: PlMutex<Durability>,
    counters: Counters,
    observed_data: AtomicBool,
}

/// Everything needed to assemble a volume instance
///
/// Fresh creation, local restart and backend restart all converge here with
/// differently prepared parts.
pub(crate) struct VolumeParts {
    pub config: VolumeConfig,
    pub backend: BackendHandle,
    pub lineage: Vec<(BackendHandle, SnapshotName)>,
    pub sco_cache: Arc<ScoCache>,
    pub cluster_cache: Arc<ClusterCache>,
    pub pool: Arc<BackendWorkerPool>,
    pub events: EventBus,
    pub metadata: MetaDataStore,
    pub persistor: SnapshotPersistor,
    pub paths: VolumePaths,
    pub access_data: Arc<ScoAccessData>,
    pub tlog_writer: TLogWriter,
    pub next_sco: SCONumber,
    pub durable_tlogs: HashSet<TLogId>,
    /// Corks already opened (oldest first) for replayed, not-yet-durable logs
    pub pending_corks: Vec<TLogId>,
    /// SCO references per TLog rebuilt by a restart
    pub tlog_scos: HashMap<TLogId, Vec<SCOName>>,
}

impl Volume {
    pub(crate) fn assemble(parts: VolumeParts) -> Arc<Volume> {
        let cache_handle = match parts.config.cluster_cache_mode {
            ClusterCacheMode::LocationBased => Some(
                parts
                    .cluster_cache
                    .register_handle(parts.config.cluster_cache_limit),
            ),
            ClusterCacheMode::ContentBased => None,
        };
        let current_tlog = parts.tlog_writer.id();
        // The cork for the open log itself; restart-replayed logs carry
        // their corks in before it.
        parts.metadata.cork(current_tlog);
        let mut cork_queue: VecDeque<TLogId> = parts.pending_corks.iter().copied().collect();
        cork_queue.push_back(current_tlog);
        let durability = Durability {
            durable_tlogs: parts.durable_tlogs,
            tlog_scos: parts.tlog_scos,
            cork_queue,
            ..Default::default()
        };
        Arc::new(Volume {
            id: parts.config.id.clone(),
            backend: parts.backend,
            lineage: parts.lineage,
            sco_cache: parts.sco_cache,
            cluster_cache: parts.cluster_cache,
            cache_handle: PlMutex::new(cache_handle),
            access_data: parts.access_data,
            metadata: parts.metadata,
            persistor: PlMutex::new(parts.persistor),
            dtl: DtlClient::new(parts.config.id.clone(), parts.config.owner_tag),
            pool: parts.pool,
            events: parts.events,
            writer: AsyncMutex::new(WriteState {
                tlog: Some(parts.tlog_writer),
                open_sco: None,
                next_sco: parts.next_sco,
                bytes_since_snapshot: 0,
            }),
            durability: PlMutex::new(durability),
            counters: Counters::default(),
            observed_data: AtomicBool::new(false),
            state: PlMutex::new(VolumeState::Running),
            config: PlRwLock::new(parts.config),
            paths: parts.paths,
        })
    }

    /// Register the upload listener and announce the volume
    pub(crate) fn activate(self: &Arc<Self>) {
        self.pool
            .register_listener(self.namespace(), Arc::clone(self) as Arc<dyn UploadListener>);
        self.events.publish(EngineEvent::VolumeUpAndRunning {
            id: self.id.clone(),
        });
    }

    /// The volume's id
    pub fn id(&self) -> &VolumeId {
        &self.id
    }

    /// The volume's backend namespace
    pub fn namespace(&self) -> crate::types::Namespace {
        self.backend.namespace().clone()
    }

    /// A copy of the current configuration
    pub fn config(&self) -> VolumeConfig {
        self.config.read().clone()
    }

    /// Current owner tag
    pub fn owner_tag(&self) -> OwnerTag {
        self.config.read().owner_tag
    }

    /// Current lifecycle state
    pub fn state(&self) -> VolumeState {
        self.state.lock().clone()
    }

    /// The DTL client, for engine-level configuration
    pub fn dtl(&self) -> &DtlClient {
        &self.dtl
    }

    /// The volume's read-activity heatmap
    pub fn access_data(&self) -> &Arc<ScoAccessData> {
        &self.access_data
    }

    /// The metadata store, for restart code finishing a replay
    pub(crate) fn metadata(&self) -> &MetaDataStore {
        &self.metadata
    }

    fn check_io(&self) -> VolumeResult<()> {
        if self.dtl.is_fenced() {
            let tag = self.owner_tag();
            self.halt(&format!("fenced: peer saw a newer owner than {tag}"));
            return Err(VolumeError::Fenced(tag));
        }
        match &*self.state.lock() {
            state if state.accepts_io() => Ok(()),
            VolumeState::Halted(reason) => Err(VolumeError::Halted(reason.clone())),
            other => Err(VolumeError::InvalidOperation(format!(
                "volume is {other:?}"
            ))),
        }
    }

    /// Enter the terminal halted state
    pub fn halt(&self, reason: &str) {
        let mut state = self.state.lock();
        if matches!(&*state, VolumeState::Halted(_)) {
            return;
        }
        log::error!("volume {} halted: {reason}", self.id);
        *state = VolumeState::Halted(reason.to_string());
        drop(state);
        self.events.publish(EngineEvent::VolumeHalted {
            id: self.id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Fencing guard for backend writes that identify this volume
    ///
    /// Performs a conditional put of the volume config stamped with the
    /// current tag; the condition fails when a newer owner already stamped
    /// the object, in which case the volume halts.
    pub async fn assert_ownership(&self) -> VolumeResult<()> {
        let config = self.config();
        let tag = config.owner_tag;
        let bytes = serde_json::to_vec(&config)
            .map_err(|e| VolumeError::InvalidOperation(e.to_string()))?;
        let condition = owner_tag_condition(tag);
        match self
            .backend
            .put(VOLUME_CONFIG_OBJECT, bytes, true, Some(&condition))
            .await
        {
            Ok(()) => Ok(()),
            Err(crate::backend::BackendError::ConditionFailed(_)) => {
                self.halt(&format!("fenced: backend holds a newer owner than {tag}"));
                Err(VolumeError::Fenced(tag))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cluster_geometry(&self) -> (u64, u32, u64) {
        let config = self.config.read();
        (
            config.cluster_size(),
            config.cluster_multiplier,
            config.clusters(),
        )
    }

    fn validate_range(&self, lba: Lba, len: usize) -> VolumeResult<(u64, ClusterAddress)> {
        let (cluster_size, cluster_multiplier, clusters) = self.cluster_geometry();
        if !lba.is_cluster_aligned(cluster_multiplier) {
            return Err(VolumeError::Unaligned(format!(
                "{lba} not on a {cluster_multiplier}-lba cluster boundary"
            )));
        }
        if len == 0 || len as u64 % cluster_size != 0 {
            return Err(VolumeError::Unaligned(format!(
                "length {len} not a positive multiple of the cluster size {cluster_size}"
            )));
        }
        let ca = lba.to_cluster_address(cluster_multiplier);
        let span = len as u64 / cluster_size;
        if ca.0 + span > clusters {
            return Err(VolumeError::OutOfBounds { lba: lba.0, clusters });
        }
        Ok((span, ca))
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Write cluster-aligned data at a cluster-aligned LBA
    pub async fn write(&self, lba: Lba, buf: &[u8]) -> VolumeResult<()> {
        self.check_io()?;
        let (span, start_ca) = self.validate_range(lba, buf.len())?;
        let (cluster_size, ..) = self.cluster_geometry();

        match self.sco_cache.admission(span, cluster_size) {
            Ok(WriteAdmission::Proceed) => {}
            Ok(WriteAdmission::Throttle(delay)) => tokio::time::sleep(delay).await,
            Err(e) => return Err(VolumeError::InsufficientResources(e.to_string())),
        }

        let mut w = self.writer.lock().await;
        self.check_io()?;

        let (sco_multiplier, max_entries, behaviour, mode) = {
            let config = self.config.read();
            (
                config.sco_multiplier,
                config.max_tlog_entries(),
                config.cluster_cache_behaviour,
                config.cluster_cache_mode,
            )
        };

        let mut mirror: Vec<(SCONumber, Vec<DtlEntry>)> = Vec::new();
        for i in 0..span as usize {
            let ca = ClusterAddress(start_ca.0 + i as u64);
            let chunk = &buf[i * cluster_size as usize..(i + 1) * cluster_size as usize];

            if w
                .open_sco
                .as_ref()
                .map_or(true, |(_, clusters)| *clusters >= sco_multiplier)
            {
                if w.open_sco.is_some() {
                    self.roll_sco(&mut w).await?;
                }
                self.new_sco(&mut w)?;
            }
            let (open, clusters) = w.open_sco.as_mut().unwrap();
            let sco_name = open.name();
            let offset = *clusters;
            if let Err(e) = self.sco_cache.write(open, chunk) {
                self.halt(&format!("sco write failed: {e}"));
                return Err(e.into());
            }
            *clusters += 1;

            let clh = ClusterLocationAndHash::new(
                ClusterLocation::new(sco_name, offset),
                ClusterHash::of(chunk),
            );
            w.tlog
                .as_mut()
                .expect("writer present while running")
                .append_location(ca, clh)?;
            self.metadata.write_cluster(ca, clh)?;

            let entry = DtlEntry {
                ca,
                clh,
                data: chunk.to_vec(),
            };
            if mirror.last().map(|(sco, _)| *sco) == Some(sco_name.number) {
                mirror.last_mut().unwrap().1.push(entry);
            } else {
                mirror.push((sco_name.number, vec![entry]));
            }

            if behaviour == ClusterCacheBehaviour::CacheOnWrite {
                self.cache_insert(mode, ca, clh, chunk);
            }
        }

        if w.tlog.as_ref().map_or(0, |t| t.entries()) >= max_entries {
            self.roll_tlog(&mut w).await?;
        }

        for (sco, entries) in mirror {
            match self.dtl.append(sco, entries).await {
                Ok(()) => {}
                Err(DtlError::Fenced { highest }) => {
                    self.halt(&format!("fenced by dtl peer at {highest}"));
                    return Err(VolumeError::Fenced(self.owner_tag()));
                }
                Err(e) => {
                    // Degraded: the volume carries on without the mirror.
                    log::warn!("dtl mirror for {} failed: {e}", self.id);
                }
            }
        }

        let tlog = w.tlog.as_mut().expect("writer present while running");
        if matches!(self.dtl.state(), DtlState::Ok(DtlMode::Synchronous)) {
            tlog.flush()?;
        } else {
            tlog.sync()?;
        }

        w.bytes_since_snapshot += buf.len() as u64;
        drop(w);

        self.observed_data.store(true, Ordering::SeqCst);
        self.counters.write_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_written
            .fetch_add(buf.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn new_sco(&self, w: &mut WriteState) -> VolumeResult<()> {
        let generation = self.config.read().clone_generation;
        let name = SCOName::new(w.next_sco, generation);
        w.next_sco = w.next_sco.next();
        let open = self.sco_cache.create_sco(&self.namespace(), name)?;
        w.open_sco = Some((open, 0));

        let tlog_id = w.tlog.as_ref().expect("writer present").id();
        let mut durability = self.durability.lock();
        durability.tlog_scos.entry(tlog_id).or_default().push(name);
        Ok(())
    }

    async fn roll_sco(&self, w: &mut WriteState) -> VolumeResult<()> {
        let Some((open, _)) = w.open_sco.take() else {
            return Ok(());
        };
        let name = open.name();
        w.tlog
            .as_mut()
            .expect("writer present")
            .append_sco_crc()?;
        self.sco_cache.seal(open)?;
        self.pool
            .enqueue(BackendJob {
                ns: self.namespace(),
                kind: BackendJobKind::UploadSco { sco: name },
            })
            .await;
        Ok(())
    }

    async fn roll_tlog(&self, w: &mut WriteState) -> VolumeResult<()> {
        let writer = w.tlog.take().expect("writer present");
        let old_id = writer.id();
        let path = writer.path().to_path_buf();
        writer.seal()?;
        self.pool
            .enqueue(BackendJob {
                ns: self.namespace(),
                kind: BackendJobKind::UploadTLog { id: old_id, path },
            })
            .await;

        let new_id = TLogId::new();
        {
            let mut persistor = self.persistor.lock();
            persistor.add_current_tlog(new_id);
        }
        self.metadata.cork(new_id);
        {
            let mut durability = self.durability.lock();
            durability.cork_queue.push_back(new_id);
            // An SCO open across the boundary is referenced by both logs.
            if let Some((open, _)) = &w.open_sco {
                durability
                    .tlog_scos
                    .entry(new_id)
                    .or_default()
                    .push(open.name());
            }
        }
        w.tlog = Some(TLogWriter::create(&self.paths.tlog_dir, new_id)?);
        self.persist_snapshot_document().await?;
        Ok(())
    }

    async fn persist_snapshot_document(&self) -> VolumeResult<()> {
        let snapshot_copy = self.persistor.lock().clone();
        snapshot_copy.save_local(&self.paths.persistor_path)?;
        // The ownership assertion is the fencing guard; the document put
        // itself carries no condition.
        self.assert_ownership().await?;
        SnapshotPersistorStore::new(self.backend.clone())
            .push(&snapshot_copy, None)
            .await?;
        Ok(())
    }

    fn cache_insert(
        &self,
        mode: ClusterCacheMode,
        ca: ClusterAddress,
        clh: ClusterLocationAndHash,
        data: &[u8],
    ) {
        let data = Arc::new(data.to_vec());
        match mode {
            ClusterCacheMode::ContentBased => {
                self.cluster_cache.insert(CacheKey::Content(clh.hash), data);
            }
            ClusterCacheMode::LocationBased => {
                if let Some(handle) = *self.cache_handle.lock() {
                    self.cluster_cache.insert(CacheKey::Location(handle, ca), data);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Read cluster-aligned data at a cluster-aligned LBA
    pub async fn read(&self, lba: Lba, len: usize) -> VolumeResult<Vec<u8>> {
        self.check_io()?;
        let (span, start_ca) = self.validate_range(lba, len)?;
        let mut out = Vec::with_capacity(len);
        for i in 0..span {
            let ca = ClusterAddress(start_ca.0 + i);
            out.extend_from_slice(&self.read_cluster_at(ca).await?);
        }
        self.counters.read_ops.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(len as u64, Ordering::Relaxed);
        Ok(out)
    }

    async fn read_cluster_at(&self, ca: ClusterAddress) -> VolumeResult<Vec<u8>> {
        let (cluster_size, ..) = self.cluster_geometry();
        let (mode, behaviour) = {
            let config = self.config.read();
            (config.cluster_cache_mode, config.cluster_cache_behaviour)
        };
        let caching = behaviour != ClusterCacheBehaviour::NoCache;

        if caching && mode == ClusterCacheMode::LocationBased {
            if let Some(handle) = *self.cache_handle.lock() {
                if let Some(hit) = self.cluster_cache.lookup(&CacheKey::Location(handle, ca)) {
                    self.counters.cluster_cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(hit.as_ref().clone());
                }
            }
        }

        let clh = self.metadata.read_cluster(ca)?;
        if clh.is_zero() {
            return Ok(vec![0u8; cluster_size as usize]);
        }

        if caching && mode == ClusterCacheMode::ContentBased {
            if let Some(hit) = self.cluster_cache.lookup(&CacheKey::Content(clh.hash)) {
                if clh.hash.matches(&hit) {
                    self.counters.cluster_cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(hit.as_ref().clone());
                }
                log::warn!("cluster cache entry failed verification at {ca}, refetching");
            }
        }

        let data = self.fetch_cluster(&clh, cluster_size).await?;
        if !clh.hash.matches(&data) {
            self.halt(&format!("content hash mismatch at {ca}"));
            return Err(VolumeError::Corruption(format!(
                "cluster at {ca} does not match its recorded hash"
            )));
        }

        if caching {
            self.cache_insert(mode, ca, clh, &data);
        }
        if clh.location.sco.generation == self.config.read().clone_generation {
            self.access_data.register_read(clh.location.sco.number);
        }
        Ok(data)
    }

    fn handle_for_generation(&self, generation: CloneGeneration) -> VolumeResult<BackendHandle> {
        let own = self.config.read().clone_generation;
        if generation == own {
            return Ok(self.backend.clone());
        }
        // Nearest parent has generation own-1, and so on up the chain.
        let steps = own.0.checked_sub(generation.0).ok_or_else(|| {
            VolumeError::Corruption(format!(
                "location references generation {} above own {}",
                generation.0, own.0
            ))
        })?;
        self.lineage
            .get(steps as usize - 1)
            .map(|(handle, _)| handle.clone())
            .ok_or_else(|| {
                VolumeError::Corruption(format!(
                    "no ancestor for clone generation {}",
                    generation.0
                ))
            })
    }

    async fn fetch_cluster(
        &self,
        clh: &ClusterLocationAndHash,
        cluster_size: u64,
    ) -> VolumeResult<Vec<u8>> {
        let sco = clh.location.sco;
        let handle = self.handle_for_generation(sco.generation)?;
        let ns = handle.namespace().clone();

        match self
            .sco_cache
            .read_cluster(&ns, sco, clh.location.offset, cluster_size)
        {
            Ok(data) => return Ok(data),
            Err(crate::scocache::ScoCacheError::ScoNotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        let bytes = handle.get(&sco.object_name()).await?;
        self.counters.backend_fetches.fetch_add(1, Ordering::Relaxed);
        // Fresh from the backend, so evictable straight away.
        self.sco_cache.insert_sco(&ns, sco, &bytes, true)?;
        let start = clh.location.offset as usize * cluster_size as usize;
        if start + cluster_size as usize > bytes.len() {
            return Err(VolumeError::Corruption(format!(
                "sco {sco} shorter than location offset {}",
                clh.location.offset
            )));
        }
        Ok(bytes[start..start + cluster_size as usize].to_vec())
    }

    // ------------------------------------------------------------------
    // Snapshots, restore, clones
    // ------------------------------------------------------------------

    /// Cut a snapshot; returns once the chain is sealed
    ///
    /// The `in_backend` flag flips asynchronously when the uploader finishes
    /// and a [`EngineEvent::SnapshotOnBackend`] event fires.
    pub async fn create_snapshot(&self, name: SnapshotName, metadata: String) -> VolumeResult<()> {
        let previous = {
            let mut state = self.state.lock();
            match &*state {
                // A pending snapshot still lets the attempt in; the
                // previous-not-on-backend precondition rejects it below.
                VolumeState::Running | VolumeState::SnapshotPendingInBackend => {
                    let previous = state.clone();
                    *state = VolumeState::CreatingSnapshot;
                    previous
                }
                VolumeState::Halted(reason) => {
                    return Err(VolumeError::Halted(reason.clone()))
                }
                other => {
                    return Err(VolumeError::InvalidOperation(format!(
                        "cannot snapshot while {other:?}"
                    )))
                }
            }
        };

        let result = self.create_snapshot_inner(name.clone(), metadata).await;
        // The pending predecessor may have reached the backend while this
        // attempt ran; recompute instead of blindly restoring.
        let still_pending = self
            .persistor
            .lock()
            .snapshots()
            .iter()
            .any(|s| !s.in_backend);
        let mut state = self.state.lock();
        if matches!(&*state, VolumeState::CreatingSnapshot) {
            *state = match &result {
                Ok(()) => VolumeState::SnapshotPendingInBackend,
                Err(_) if matches!(previous, VolumeState::SnapshotPendingInBackend)
                    && still_pending =>
                {
                    previous
                }
                Err(_) => VolumeState::Running,
            };
        }
        result
    }

    async fn create_snapshot_inner(
        &self,
        name: SnapshotName,
        metadata: String,
    ) -> VolumeResult<()> {
        let mut w = self.writer.lock().await;

        // Preconditions fail without any state change.
        {
            let persistor = self.persistor.lock();
            if persistor.find(&name).is_some() {
                return Err(crate::snapshot::SnapshotError::NameAlreadyExists(name).into());
            }
            if let Some(last) = persistor.last_snapshot() {
                if !last.in_backend {
                    return Err(crate::snapshot::SnapshotError::PreviousNotOnBackend(
                        last.name.clone(),
                    )
                    .into());
                }
            }
        }

        self.roll_sco(&mut w).await?;
        let writer = w.tlog.take().expect("writer present");
        let old_id = writer.id();
        let path = writer.path().to_path_buf();
        writer.seal()?;
        self.pool
            .enqueue(BackendJob {
                ns: self.namespace(),
                kind: BackendJobKind::UploadTLog { id: old_id, path },
            })
            .await;

        let new_id = TLogId::new();
        {
            let mut persistor = self.persistor.lock();
            persistor.create_snapshot(name, metadata, w.bytes_since_snapshot, new_id)?;
        }
        self.metadata.cork(new_id);
        self.durability.lock().cork_queue.push_back(new_id);
        w.tlog = Some(TLogWriter::create(&self.paths.tlog_dir, new_id)?);
        w.bytes_since_snapshot = 0;
        drop(w);

        self.persist_snapshot_document().await?;
        Ok(())
    }

    /// Non-tombstoned snapshot names, oldest first
    pub fn list_snapshots(&self) -> Vec<SnapshotName> {
        self.persistor.lock().list_names()
    }

    /// Tombstone a snapshot
    pub async fn delete_snapshot(&self, name: &SnapshotName) -> VolumeResult<()> {
        self.persistor.lock().delete_snapshot(name)?;
        self.persist_snapshot_document().await?;
        Ok(())
    }

    /// Roll the volume back to a snapshot
    ///
    /// Requires the snapshot to be on the backend. Every later TLog and the
    /// SCOs only they reference are dropped locally and from the backend;
    /// the metadata store is rebuilt to the snapshot point and writing
    /// resumes in fresh TLog id-space.
    pub async fn restore_snapshot(&self, name: &SnapshotName) -> VolumeResult<()> {
        {
            let mut state = self.state.lock();
            match &*state {
                VolumeState::Running => *state = VolumeState::Restoring,
                VolumeState::Halted(reason) => {
                    return Err(VolumeError::Halted(reason.clone()))
                }
                other => {
                    return Err(VolumeError::InvalidOperation(format!(
                        "cannot restore while {other:?}"
                    )))
                }
            }
        }
        let result = self.restore_snapshot_inner(name).await;
        let mut state = self.state.lock();
        if matches!(&*state, VolumeState::Restoring) {
            *state = match &result {
                Ok(()) => VolumeState::Running,
                // A half-done restore cannot simply resume serving.
                Err(e) => VolumeState::Halted(format!("restore failed: {e}")),
            };
        }
        result
    }

    async fn restore_snapshot_inner(&self, name: &SnapshotName) -> VolumeResult<()> {
        let mut w = self.writer.lock().await;
        {
            let persistor = self.persistor.lock();
            let snapshot = persistor
                .find(name)
                .ok_or_else(|| crate::snapshot::SnapshotError::NotFound(name.clone()))?;
            if !snapshot.in_backend {
                return Err(crate::snapshot::SnapshotError::NotOnBackend(name.clone()).into());
            }
        }

        // Abandon the open write state.
        if let Some((open, _)) = w.open_sco.take() {
            let sco = open.name();
            drop(open);
            self.sco_cache.remove_sco(&self.namespace(), sco).ok();
        }
        if let Some(writer) = w.tlog.take() {
            let path = writer.path().to_path_buf();
            drop(writer);
            std::fs::remove_file(path).ok();
        }

        let fresh = TLogId::new();
        let cut = {
            let mut persistor = self.persistor.lock();
            persistor.cut_after(name, fresh)?
        };

        // Drop the cut TLogs and the SCOs only they referenced.
        let kept: HashSet<SCOName> = {
            let durability = self.durability.lock();
            durability
                .tlog_scos
                .iter()
                .filter(|(id, _)| !cut.dropped_tlogs.contains(id))
                .flat_map(|(_, scos)| scos.iter().copied())
                .collect()
        };
        for id in &cut.dropped_tlogs {
            std::fs::remove_file(self.paths.tlog_dir.join(id.object_name())).ok();
            self.pool
                .enqueue(BackendJob {
                    ns: self.namespace(),
                    kind: BackendJobKind::DeleteObject {
                        name: id.object_name(),
                    },
                })
                .await;
        }
        let doomed_scos: Vec<SCOName> = {
            let mut durability = self.durability.lock();
            let mut doomed = Vec::new();
            for id in &cut.dropped_tlogs {
                if let Some(scos) = durability.tlog_scos.remove(id) {
                    doomed.extend(scos.into_iter().filter(|s| !kept.contains(s)));
                }
                durability.durable_tlogs.remove(id);
            }
            durability.cork_queue.clear();
            doomed
        };
        for sco in doomed_scos {
            self.sco_cache.remove_sco(&self.namespace(), sco).ok();
            self.access_data.forget(sco.number);
            self.pool
                .enqueue(BackendJob {
                    ns: self.namespace(),
                    kind: BackendJobKind::DeleteObject {
                        name: sco.object_name(),
                    },
                })
                .await;
        }

        // Rebuild the metadata store to the snapshot point.
        self.metadata.clear()?;
        self.rebuild_metadata_through(Some(name)).await?;

        self.metadata.cork(fresh);
        self.durability.lock().cork_queue.push_back(fresh);
        w.tlog = Some(TLogWriter::create(&self.paths.tlog_dir, fresh)?);
        w.bytes_since_snapshot = 0;
        // SCO numbering stays monotonic: numbers of the dropped SCOs are
        // never reused, their backend deletions may still be in flight.
        drop(w);

        let stale_handle = self.cache_handle.lock().take();
        if let Some(handle) = stale_handle {
            self.cluster_cache.evict_handle(handle);
            let limit = self.config.read().cluster_cache_limit;
            *self.cache_handle.lock() = Some(self.cluster_cache.register_handle(limit));
        }

        self.persist_snapshot_document().await?;
        Ok(())
    }

    /// Replay history into the metadata store
    ///
    /// Ancestor chains replay first (outermost ancestor to nearest parent,
    /// each through its clone snapshot), then this volume's own chain up to
    /// `through` (or entirely when `None`). Used by restore, clone creation
    /// and backend restart.
    pub(crate) async fn rebuild_metadata_through(
        &self,
        through: Option<&SnapshotName>,
    ) -> VolumeResult<()> {
        // Outermost ancestor first.
        for (handle, snap) in self.lineage.iter().rev() {
            let persistor = SnapshotPersistorStore::new(handle.clone()).pull().await?;
            let ids = persistor.tlogs_through(snap)?;
            self.replay_tlogs(TLogSource::backend_only(handle.clone()), ids)
                .await?;
        }

        let own_ids = {
            let persistor = self.persistor.lock();
            match through {
                Some(name) => persistor.tlogs_through(name)?,
                None => persistor.all_tlogs(),
            }
        };
        self.replay_tlogs(
            TLogSource::new(Some(self.paths.tlog_dir.clone()), Some(self.backend.clone())),
            own_ids,
        )
        .await?;
        Ok(())
    }

    async fn replay_tlogs(&self, source: TLogSource, ids: Vec<TLogId>) -> VolumeResult<()> {
        let Some(last) = ids.last().copied() else {
            return Ok(());
        };
        self.metadata.cork(last);
        let mut replayer = MetaDataReplayer {
            metadata: &self.metadata,
        };
        let reader = CombinedTLogReader::new(source, ids);
        let replayed = reader.process(&mut replayer, true).await?;
        self.metadata.uncork(last)?;
        if !replayed.is_empty() {
            self.observed_data.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Tuning and management
    // ------------------------------------------------------------------

    /// Grow the volume; shrinking is forbidden
    pub async fn truncate(&self, new_size: u64) -> VolumeResult<()> {
        self.check_io()?;
        {
            let mut config = self.config.write();
            if new_size < config.size {
                return Err(VolumeError::InvalidOperation(
                    "shrinking a volume is not supported".to_string(),
                ));
            }
            if new_size > super::MAX_VOLUME_SIZE {
                return Err(VolumeError::InvalidOperation(format!(
                    "size {new_size} exceeds the {} ceiling",
                    super::MAX_VOLUME_SIZE
                )));
            }
            if new_size % config.cluster_size() != 0 {
                return Err(VolumeError::Unaligned(format!(
                    "size {new_size} not cluster aligned"
                )));
            }
            config.size = new_size;
        }
        self.assert_ownership().await
    }

    /// Change the SCO multiplier, effective from the next SCO
    pub async fn set_sco_multiplier(&self, multiplier: u32) -> VolumeResult<()> {
        if !(super::MIN_SCO_MULTIPLIER..=super::MAX_SCO_MULTIPLIER).contains(&multiplier) {
            return Err(VolumeError::InvalidOperation(format!(
                "sco multiplier {multiplier} outside [{}, {}]",
                super::MIN_SCO_MULTIPLIER,
                super::MAX_SCO_MULTIPLIER
            )));
        }
        self.config.write().sco_multiplier = multiplier;
        self.assert_ownership().await
    }

    /// Change the TLog multiplier, effective from the next TLog
    pub async fn set_tlog_multiplier(&self, multiplier: u32) -> VolumeResult<()> {
        if multiplier == 0 {
            return Err(VolumeError::InvalidOperation(
                "tlog multiplier must be positive".to_string(),
            ));
        }
        self.config.write().tlog_multiplier = multiplier;
        self.assert_ownership().await
    }

    /// Change the cluster-cache keying discipline
    ///
    /// Content-based to location-based is forbidden once the volume has
    /// observed data: existing entries' semantics would be wrong.
    pub fn set_cluster_cache_mode(&self, mode: ClusterCacheMode) -> VolumeResult<()> {
        let current = self.config.read().cluster_cache_mode;
        if current == mode {
            return Ok(());
        }
        match mode {
            ClusterCacheMode::LocationBased => {
                if self.observed_data.load(Ordering::SeqCst) {
                    return Err(VolumeError::InvalidOperation(
                        "cannot switch to location-based caching after data was observed"
                            .to_string(),
                    ));
                }
                let limit = self.config.read().cluster_cache_limit;
                *self.cache_handle.lock() = Some(self.cluster_cache.register_handle(limit));
            }
            ClusterCacheMode::ContentBased => {
                if let Some(handle) = self.cache_handle.lock().take() {
                    self.cluster_cache.evict_handle(handle);
                }
            }
        }
        self.config.write().cluster_cache_mode = mode;
        Ok(())
    }

    /// Change the cluster-cache admission behaviour
    pub fn set_cluster_cache_behaviour(&self, behaviour: ClusterCacheBehaviour) {
        self.config.write().cluster_cache_behaviour = behaviour;
    }

    /// Change the location-based entry cap
    pub fn set_cluster_cache_limit(&self, limit: usize) -> VolumeResult<()> {
        self.config.write().cluster_cache_limit = limit;
        if let Some(handle) = *self.cache_handle.lock() {
            self.cluster_cache
                .set_limit(handle, limit)
                .map_err(|e| VolumeError::InvalidOperation(e.to_string()))?;
        }
        Ok(())
    }

    /// Reconfigure the DTL peer
    pub async fn set_dtl_config(&self, config: Option<DtlClientConfig>) -> VolumeResult<()> {
        let result = self.dtl.configure(config).await;
        self.events.publish(EngineEvent::DtlStateChanged {
            id: self.id.clone(),
            state: self.dtl.state(),
        });
        result.map_err(Into::into)
    }

    /// Seal and enqueue the current TLog, returning its id
    ///
    /// Pair with [`Volume::is_synced_up_to`] to wait for durability.
    pub async fn schedule_backend_sync(&self) -> VolumeResult<TLogId> {
        self.check_io()?;
        let mut w = self.writer.lock().await;
        self.roll_sco(&mut w).await?;
        let writer = w.tlog.take().expect("writer present");
        let old_id = writer.id();
        let path = writer.path().to_path_buf();
        writer.seal()?;
        self.pool
            .enqueue(BackendJob {
                ns: self.namespace(),
                kind: BackendJobKind::UploadTLog { id: old_id, path },
            })
            .await;

        let new_id = TLogId::new();
        self.persistor.lock().add_current_tlog(new_id);
        self.metadata.cork(new_id);
        self.durability.lock().cork_queue.push_back(new_id);
        w.tlog = Some(TLogWriter::create(&self.paths.tlog_dir, new_id)?);
        drop(w);
        self.persist_snapshot_document().await?;
        Ok(old_id)
    }

    /// Whether every TLog up to and including `id` is on the backend
    pub fn is_synced_up_to(&self, id: TLogId) -> bool {
        let chain = self.persistor.lock().all_tlogs();
        let durability = self.durability.lock();
        for tlog in chain {
            if !durability.durable_tlogs.contains(&tlog) {
                return false;
            }
            if tlog == id {
                return true;
            }
        }
        false
    }

    /// Flush: seal nothing, but push buffered TLog frames to disk
    pub async fn flush(&self) -> VolumeResult<()> {
        self.check_io()?;
        let mut w = self.writer.lock().await;
        if let Some(tlog) = w.tlog.as_mut() {
            tlog.sync()?;
        }
        self.dtl.flush().await?;
        Ok(())
    }

    /// Quiesce for migration: stop accepting writes, drain uploads
    ///
    /// Returns with the write lock released but the state no longer
    /// accepting I/O; the caller tears the volume down afterwards.
    pub async fn quiesce(&self, backend_sync_timeout: std::time::Duration) -> VolumeResult<()> {
        // Seal everything so the chain is fully uploadable.
        self.schedule_backend_sync().await?;
        self.dtl.flush().await?;
        if !self.pool.wait_idle(backend_sync_timeout).await {
            return Err(VolumeError::InvalidOperation(
                "backend sync timeout while quiescing".to_string(),
            ));
        }
        self.persist_snapshot_document().await?;
        self.metadata.flush()?;
        Ok(())
    }

    /// Fold pending read hits into the heatmap and publish it
    ///
    /// The ownership assertion keeps a fenced instance from clobbering the
    /// new owner's heatmap.
    pub async fn publish_access_data(&self) -> VolumeResult<()> {
        self.check_io()?;
        self.access_data.decay();
        self.assert_ownership().await?;
        crate::scocache::AccessDataPersistor::new(self.backend.clone())
            .push(&self.access_data, None)
            .await?;
        Ok(())
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> VolumeStats {
        let config = self.config.read();
        VolumeStats {
            size: config.size,
            halted: matches!(&*self.state.lock(), VolumeState::Halted(_)),
            dtl_state: self.dtl.state(),
            owner_tag: config.owner_tag,
            write_ops: self.counters.write_ops.load(Ordering::Relaxed),
            read_ops: self.counters.read_ops.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            cluster_cache_hits: self.counters.cluster_cache_hits.load(Ordering::Relaxed),
            backend_fetches: self.counters.backend_fetches.load(Ordering::Relaxed),
        }
    }

    /// Detach from shared components before teardown
    pub(crate) async fn deactivate(&self, delete_local_data: bool) {
        self.pool.deregister_listener(&self.namespace());
        if let Some(handle) = self.cache_handle.lock().take() {
            self.cluster_cache.evict_handle(handle);
        }
        self.dtl.configure(None).await.ok();
        self.sco_cache
            .deregister_namespace(&self.namespace(), delete_local_data)
            .ok();
        if delete_local_data {
            std::fs::remove_dir_all(&self.paths.tlog_dir).ok();
            if let Some(parent) = self.paths.persistor_path.parent() {
                std::fs::remove_dir_all(parent).ok();
            }
        }
    }

    /// A clone of the persistor for recovery and engine use
    pub fn snapshot_persistor(&self) -> SnapshotPersistor {
        self.persistor.lock().clone()
    }

    fn advance_disposability(&self) -> Option<SCONumber> {
        let ns = self.namespace();
        let mut durability = self.durability.lock();
        let durable = durability.durable_tlogs.clone();
        let mut disposable: Vec<SCOName> = Vec::new();
        for sco in durability.uploaded_scos.iter() {
            let referencing: Vec<&TLogId> = durability
                .tlog_scos
                .iter()
                .filter(|(_, scos)| scos.contains(sco))
                .map(|(id, _)| id)
                .collect();
            if !referencing.is_empty() && referencing.iter().all(|id| durable.contains(id)) {
                disposable.push(*sco);
            }
        }
        for sco in &disposable {
            self.sco_cache.set_disposable(&ns, *sco);
        }

        // Uncork metadata in TLog order as logs become durable.
        while let Some(front) = durability.cork_queue.front().copied() {
            if !durable.contains(&front) {
                break;
            }
            durability.cork_queue.pop_front();
            drop(durability);
            if let Err(e) = self.metadata.uncork(front) {
                log::error!("uncork of {front} failed: {e}");
            }
            durability = self.durability.lock();
        }

        // The DTL can drop everything at or below the highest SCO number
        // for which every lower-numbered own SCO is disposable-eligible.
        let own_generation = self.config.read().clone_generation;
        let mut eligible: Vec<u32> = disposable
            .iter()
            .filter(|s| s.generation == own_generation)
            .map(|s| s.number.0)
            .collect();
        eligible.sort_unstable();
        let mut watermark = None;
        let mut expected = 1;
        for n in eligible {
            if n == expected {
                watermark = Some(SCONumber(n));
                expected += 1;
            } else if n > expected {
                break;
            }
        }
        watermark
    }

    fn check_pending_snapshot(&self) -> Option<SnapshotName> {
        let mut persistor = self.persistor.lock();
        let durability = self.durability.lock();
        let pending: Option<SnapshotName> = persistor
            .snapshots()
            .iter()
            .find(|s| !s.in_backend)
            .filter(|s| s.tlogs.iter().all(|t| durability.durable_tlogs.contains(t)))
            .map(|s| s.name.clone());
        drop(durability);
        if let Some(name) = &pending {
            persistor.mark_in_backend(name).ok();
        }
        pending
    }
}

#[async_trait]
impl UploadListener for Volume {
    async fn sco_uploaded(&self, sco: SCOName) {
        self.durability.lock().uploaded_scos.insert(sco);
        if let Some(watermark) = self.advance_disposability() {
            self.dtl.clear_up_to(watermark).await.ok();
        }
    }

    async fn tlog_uploaded(&self, id: TLogId) {
        log::debug!("tlog {id} of {} is on the backend", self.id);
        self.durability.lock().durable_tlogs.insert(id);
        if let Some(watermark) = self.advance_disposability() {
            self.dtl.clear_up_to(watermark).await.ok();
        }

        if let Some(name) = self.check_pending_snapshot() {
            if self.persist_snapshot_document().await.is_ok() {
                {
                    let mut state = self.state.lock();
                    if matches!(&*state, VolumeState::SnapshotPendingInBackend) {
                        *state = VolumeState::Running;
                    }
                }
                self.events.publish(EngineEvent::SnapshotOnBackend {
                    id: self.id.clone(),
                    name,
                });
            }
        }
    }

    async fn upload_failed(&self, job: &BackendJob, error: String) {
        self.halt(&format!("backend upload failed permanently: {error} ({job:?})"));
    }
}

#[async_trait]
impl DtlProbe for Volume {
    fn dtl_state(&self) -> DtlState {
        self.dtl.state()
    }

    async fn reattach_dtl(&self) {
        let Some(config) = self.dtl.config() else {
            return;
        };
        log::info!("probing dtl peer for {}", self.id);
        if self.dtl.configure(Some(config)).await.is_ok() {
            self.dtl.begin_catchup();
            if self.dtl.flush().await.is_ok() {
                self.dtl.finish_catchup();
                self.events.publish(EngineEvent::DtlStateChanged {
                    id: self.id.clone(),
                    state: self.dtl.state(),
                });
            }
        }
    }
}

/// Condition: the existing volume config must not carry a newer owner tag
pub(crate) fn owner_tag_condition(tag: OwnerTag) -> PutCondition {
    PutCondition::new(format!("owner tag <= {tag}"), move |existing| {
        let Some(bytes) = existing else {
            return true;
        };
        match serde_json::from_slice::<VolumeConfig>(bytes) {
            Ok(config) => config.owner_tag <= tag,
            // Unparseable guard objects fail closed.
            Err(_) => false,
        }
    })
}

struct MetaDataReplayer<'a> {
    metadata: &'a MetaDataStore,
}

impl TLogProcessor for MetaDataReplayer<'_> {
    fn process_loc(&mut self, ca: ClusterAddress, clh: ClusterLocationAndHash) -> TLogResult<()> {
        self.metadata
            .write_cluster(ca, clh)
            .map_err(|e| crate::tlog::TLogError::Decode(format!("metadata replay: {e}")))
    }
}
