//! Restart and recovery
//!
//! Two ways back up: a *local restart* reuses the node's on-disk state
//! (SCO cache, TLog files, metadata store, local snapshot document) and
//! replays only what the backend does not cover yet; a *backend restart*
//! starts from nothing but the backend, used by fresh nodes, stolen
//! ownership and as the operator-requested fallback when local state is
//! beyond repair.
//!
//! The tail-loss policy on local restart: sealed logs must verify, the open
//! log is truncated to its last SCO-CRC boundary, and everything past the
//! boundary is refilled from the DTL when one is attached or accepted as
//! lost when not.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::{BackendConnector, BackendHandle, VOLUME_CONFIG_OBJECT};
use crate::clustercache::ClusterCache;
use crate::dtl::DtlEntry;
use crate::events::EventBus;
use crate::metadata::{open_backend, MetaDataStore};
use crate::scheduling::{BackendJob, BackendJobKind, BackendWorkerPool};
use crate::scocache::{AccessDataPersistor, NamespaceLimits, ScoAccessData, ScoCache};
use crate::snapshot::{SnapshotPersistor, SnapshotPersistorStore};
use crate::tlog::{
    CombinedTLogReader, TLogError, TLogProcessor, TLogReader, TLogRecord, TLogResult, TLogSource,
    TLogWriter,
};
use crate::types::{
    ClusterAddress, ClusterLocationAndHash, Namespace, OwnerTag, SCOName, SCONumber, TLogId,
    VolumeId,
};
use crate::volume::engine::{owner_tag_condition, VolumeParts};
use crate::volume::{Volume, VolumeConfig, VolumeError, VolumePaths, VolumeResult};

/// Shared components a restart wires a volume back into
pub struct RestartContext {
    /// Backend connector of the node
    pub connector: Arc<dyn BackendConnector>,
    /// Shared SCO cache
    pub sco_cache: Arc<ScoCache>,
    /// Shared cluster cache
    pub cluster_cache: Arc<ClusterCache>,
    /// Backend worker pool
    pub pool: Arc<BackendWorkerPool>,
    /// Event bus
    pub events: EventBus,
    /// Node-local working directory
    pub work_dir: PathBuf,
}

/// Verify the snapshot document against the backend
///
/// Every TLog at or before a snapshot that is `in_backend` must exist on
/// the backend; a violation is fatal. Missing TLogs after the last such
/// snapshot are the tail lost in a crash and are tolerated.
pub async fn sanity_check(
    persistor: &SnapshotPersistor,
    backend: &BackendHandle,
) -> VolumeResult<()> {
    for id in persistor.tlogs_on_backend() {
        if !backend.exists(&id.object_name()).await? {
            return Err(VolumeError::Corruption(format!(
                "{} is covered by a backend snapshot but missing from the backend",
                id
            )));
        }
    }
    Ok(())
}

/// Walk a clone's ancestry, nearest parent first
pub(crate) async fn resolve_lineage(
    connector: &Arc<dyn BackendConnector>,
    config: &VolumeConfig,
) -> VolumeResult<Vec<(BackendHandle, crate::types::SnapshotName)>> {
    let mut lineage = Vec::new();
    let mut parent = config.parent.clone();
    while let Some((ns, snap)) = parent {
        let handle = BackendHandle::new(Arc::clone(connector), ns);
        let parent_config: VolumeConfig =
            serde_json::from_slice(&handle.get(VOLUME_CONFIG_OBJECT).await?)
                .map_err(|e| VolumeError::Corruption(format!("parent volumeconfig: {e}")))?;
        lineage.push((handle, snap));
        parent = parent_config.parent;
    }
    Ok(lineage)
}

struct ChainReplayer<'a> {
    metadata: &'a MetaDataStore,
    own_generation: crate::types::CloneGeneration,
    max_own_sco: Option<SCONumber>,
}

impl TLogProcessor for ChainReplayer<'_> {
    fn process_loc(&mut self, ca: ClusterAddress, clh: ClusterLocationAndHash) -> TLogResult<()> {
        if clh.location.sco.generation == self.own_generation {
            let number = clh.location.sco.number;
            self.max_own_sco = Some(self.max_own_sco.map_or(number, |m| m.max(number)));
        }
        self.metadata
            .write_cluster(ca, clh)
            .map_err(|e| TLogError::Decode(format!("metadata replay: {e}")))
    }
}

/// Replay a full history into a metadata store
///
/// Ancestors replay first, outermost ancestor to nearest parent, each
/// through its clone snapshot; then the volume's own chain, stopping
/// cleanly before any log missing from its source. Returns the own TLogs
/// actually replayed and the highest own-generation SCO number seen.
pub(crate) async fn replay_chain(
    metadata: &MetaDataStore,
    lineage: &[(BackendHandle, crate::types::SnapshotName)],
    own_source: TLogSource,
    own_ids: Vec<TLogId>,
    own_generation: crate::types::CloneGeneration,
) -> VolumeResult<(Vec<TLogId>, Option<SCONumber>)> {
    let mut replayer = ChainReplayer {
        metadata,
        own_generation,
        max_own_sco: None,
    };

    for (handle, snap) in lineage.iter().rev() {
        let persistor = SnapshotPersistorStore::new(handle.clone()).pull().await?;
        let ids = persistor.tlogs_through(snap)?;
        let Some(last) = ids.last().copied() else {
            continue;
        };
        metadata.cork(last);
        CombinedTLogReader::new(TLogSource::backend_only(handle.clone()), ids)
            .process(&mut replayer, false)
            .await?;
        metadata.uncork(last)?;
    }

    let Some(last) = own_ids.last().copied() else {
        return Ok((Vec::new(), replayer.max_own_sco));
    };
    metadata.cork(last);
    let replayed = CombinedTLogReader::new(own_source, own_ids)
        .process(&mut replayer, true)
        .await?;
    metadata.uncork(last)?;
    Ok((replayed, replayer.max_own_sco))
}

fn collect_records(bytes: Vec<u8>) -> TLogResult<Vec<(ClusterAddress, ClusterLocationAndHash)>> {
    let mut reader = TLogReader::new(bytes);
    let mut records = Vec::new();
    while let Some(record) = reader.next_record()? {
        if let TLogRecord::Location { ca, clh } = record {
            records.push((ca, clh));
        }
    }
    Ok(records)
}

/// Restart a volume from the node's local state
///
/// `owner_tag` is the registration's current tag; local state belonging to
/// an older generation is rejected. `dtl_records` is the recovery stream
/// pulled from the volume's DTL peer (empty when none is configured).
/// `fallback_to_backend` turns conditions that are fatal for a plain local
/// restart into a backend restart under the registration's tag.
pub async fn local_restart(
    ctx: &RestartContext,
    id: &VolumeId,
    namespace: &Namespace,
    owner_tag: OwnerTag,
    dtl_records: Vec<(SCONumber, DtlEntry)>,
    fallback_to_backend: bool,
) -> VolumeResult<Arc<Volume>> {
    match try_local_restart(ctx, id, namespace, owner_tag, dtl_records).await {
        Ok(volume) => Ok(volume),
        Err(e) if fallback_to_backend => {
            log::warn!("local restart of {id} failed ({e}), falling back to backend restart");
            backend_restart(ctx, id, namespace, owner_tag, false).await
        }
        Err(e) => Err(e),
    }
}

async fn try_local_restart(
    ctx: &RestartContext,
    id: &VolumeId,
    namespace: &Namespace,
    owner_tag: OwnerTag,
    dtl_records: Vec<(SCONumber, DtlEntry)>,
) -> VolumeResult<Arc<Volume>> {
    let paths = VolumePaths::new(&ctx.work_dir, namespace);
    let backend = BackendHandle::new(Arc::clone(&ctx.connector), namespace.clone());

    let mut persistor = SnapshotPersistor::load_local(&paths.persistor_path)?;
    let config: VolumeConfig =
        serde_json::from_slice(&backend.get(VOLUME_CONFIG_OBJECT).await?)
            .map_err(|e| VolumeError::Corruption(format!("volumeconfig: {e}")))?;
    config.validate()?;
    if &config.id != id {
        return Err(VolumeError::InvalidOperation(format!(
            "namespace {namespace} holds volume {}, not {id}",
            config.id
        )));
    }
    if config.owner_tag != owner_tag {
        return Err(VolumeError::InvalidOperation(format!(
            "local state carries generation {}, registration says {owner_tag}",
            config.owner_tag
        )));
    }

    sanity_check(&persistor, &backend).await?;

    let metadata = MetaDataStore::new(
        open_backend(&config.metadata_backend)?,
        config.metadata_cache_capacity,
    );

    let access_data = Arc::new(
        AccessDataPersistor::new(backend.clone())
            .pull(false)
            .await
            .unwrap_or_else(|_| ScoAccessData::new(namespace.clone())),
    );
    ctx.sco_cache.register_namespace(
        namespace.clone(),
        NamespaceLimits::derive(config.sco_size(), config.tlog_multiplier, 1.5),
        Arc::clone(&access_data),
    );
    ctx.sco_cache.pin_for_recovery(namespace);
    let cached_scos: HashSet<SCOName> =
        ctx.sco_cache.reopen_namespace(namespace)?.into_iter().collect();

    let reopened = persistor.current_tlog();
    let backend_tlogs: HashSet<String> = backend.list("tlog_").await?.into_iter().collect();

    // Reopen the current log at its last SCO boundary; everything past it
    // is lost unless the DTL still has it.
    let (mut writer, scan) = TLogWriter::reopen(&paths.tlog_dir, reopened)?;
    if !scan.tail.is_empty() {
        log::warn!(
            "{}: {} records past the last SCO boundary were cut",
            reopened,
            scan.tail.len()
        );
    }
    // A crash between seal and rollover leaves the "current" log already
    // sealed; it must not be appended to, so writing continues in a fresh
    // one and the sealed log joins the ordinary non-durable set.
    if scan.sealed {
        let fresh = TLogId::new();
        persistor.add_current_tlog(fresh);
        writer = TLogWriter::create(&paths.tlog_dir, fresh)?;
    }
    let current = persistor.current_tlog();

    let chain = persistor.all_tlogs();
    let on_backend: HashSet<TLogId> = chain
        .iter()
        .copied()
        .filter(|t| backend_tlogs.contains(&t.object_name()))
        .collect();
    // Uploads complete out of order, so a log can be on the backend while
    // an earlier one is not. Durability bookkeeping (corks, disposability)
    // only ever advances along the chain, so it works on the durable
    // *prefix*; logs behind a gap are re-uploaded like any other.
    let mut durable_tlogs: HashSet<TLogId> = HashSet::new();
    for tlog in &chain {
        if on_backend.contains(tlog) {
            durable_tlogs.insert(*tlog);
        } else {
            break;
        }
    }

    // Collect the records of every log the backend does not cover, and of
    // durable logs newer than the metadata cork marker.
    let last_cork = metadata.last_uncorked()?;
    let replay_from = last_cork
        .and_then(|cork| chain.iter().position(|t| *t == cork).map(|p| p + 1))
        .unwrap_or(0);

    // Records past the boundary are not automatically lost: as long as the
    // referenced cluster survived in the SCO cache and still matches its
    // hash, the record is re-appended. The cut stops at the first record
    // that cannot be validated; the DTL covers the rest.
    let cluster_size = config.cluster_size();
    let mut revalidated: Vec<(ClusterAddress, ClusterLocationAndHash)> = Vec::new();
    for (ca, clh) in &scan.tail {
        let ok = ctx
            .sco_cache
            .read_cluster(
                namespace,
                clh.location.sco,
                clh.location.offset,
                cluster_size,
            )
            .map(|data| clh.hash.matches(&data))
            .unwrap_or(false);
        if !ok {
            break;
        }
        writer.append_location(*ca, *clh)?;
        revalidated.push((*ca, *clh));
    }
    if !revalidated.is_empty() {
        writer.append_sco_crc()?;
        log::info!(
            "revalidated {} of {} tail records against cached scos",
            revalidated.len(),
            scan.tail.len()
        );
    }

    let mut records_per_tlog: HashMap<TLogId, Vec<(ClusterAddress, ClusterLocationAndHash)>> =
        HashMap::new();
    let mut reopened_records = scan.stable.clone();
    reopened_records.extend(revalidated.iter().copied());
    records_per_tlog.insert(reopened, reopened_records);
    for (index, tlog) in chain.iter().enumerate() {
        if *tlog == current || *tlog == reopened {
            continue;
        }
        let needed = !durable_tlogs.contains(tlog) || index >= replay_from;
        if !needed {
            continue;
        }
        let local_path = paths.tlog_dir.join(tlog.object_name());
        let bytes = if local_path.is_file() {
            let bytes = std::fs::read(&local_path)?;
            // Sealed logs must verify end to end; a bad or missing final
            // CRC on a non-current log is fatal.
            TLogReader::verify_sealed(bytes.clone())?;
            bytes
        } else if on_backend.contains(tlog) {
            let bytes = backend.get(&tlog.object_name()).await?;
            if !durable_tlogs.contains(tlog) {
                // A behind-a-gap log gets re-uploaded below, which needs
                // its local file back.
                std::fs::write(&local_path, &bytes)?;
            }
            bytes
        } else {
            return Err(VolumeError::TLog(TLogError::WithoutFinalCrc));
        };
        records_per_tlog.insert(*tlog, collect_records(bytes)?);
    }

    // Refill the tail from the DTL: anything the peer acknowledged that
    // the truncated log no longer carries is re-appended.
    let surviving: HashSet<(ClusterAddress, ClusterLocationAndHash)> = records_per_tlog
        .iter()
        .filter(|(id, _)| !durable_tlogs.contains(id))
        .flat_map(|(_, records)| records.iter().copied())
        .collect();
    let mut refilled: Vec<(ClusterAddress, ClusterLocationAndHash)> = Vec::new();
    let mut dtl_clusters: HashMap<SCOName, Vec<(u32, Vec<u8>)>> = HashMap::new();
    let mut refill_sco: Option<SCOName> = None;
    for (_, entry) in &dtl_records {
        dtl_clusters
            .entry(entry.clh.location.sco)
            .or_default()
            .push((entry.clh.location.offset, entry.data.clone()));
        if !surviving.contains(&(entry.ca, entry.clh)) {
            // Keep the one-SCO-per-boundary invariant while re-appending.
            if let Some(sco) = refill_sco {
                if sco != entry.clh.location.sco {
                    writer.append_sco_crc()?;
                }
            }
            refill_sco = Some(entry.clh.location.sco);
            writer.append_location(entry.ca, entry.clh)?;
            refilled.push((entry.ca, entry.clh));
        }
    }
    if !refilled.is_empty() {
        writer.append_sco_crc()?;
        log::info!("refilled {} records from the dtl", refilled.len());
        records_per_tlog
            .entry(current)
            .or_default()
            .extend(refilled.iter().copied());
    }

    // Reconcile SCOs: every SCO whose content the backend does not hold
    // yet must be present locally with all its referenced clusters,
    // rebuilt from the DTL when the cache lost it.
    let backend_scos: HashSet<SCOName> = backend
        .list("")
        .await?
        .iter()
        .filter_map(|name| SCOName::parse_object_name(name))
        .collect();
    let mut tlog_scos: HashMap<TLogId, Vec<SCOName>> = HashMap::new();
    let mut non_durable_scos: HashMap<SCOName, u32> = HashMap::new();
    for (tlog, records) in &records_per_tlog {
        let scos = tlog_scos.entry(*tlog).or_default();
        for (_, clh) in records {
            let sco = clh.location.sco;
            if !scos.contains(&sco) {
                scos.push(sco);
            }
            if !durable_tlogs.contains(tlog) {
                let clusters = non_durable_scos.entry(sco).or_insert(0);
                *clusters = (*clusters).max(clh.location.offset + 1);
            }
        }
    }
    for (sco, clusters) in &non_durable_scos {
        if backend_scos.contains(sco) {
            // Content is safe on the backend; the local copy is optional.
            continue;
        }
        let expected = *clusters as u64 * cluster_size;
        let present = cached_scos.contains(sco);
        let current_bytes = if present {
            ctx.sco_cache.read_sco(namespace, *sco).ok()
        } else {
            None
        };
        let have = current_bytes.as_ref().map_or(0, |b| b.len() as u64);
        if have == expected {
            continue;
        }
        let mut rebuilt = current_bytes.unwrap_or_default();
        rebuilt.resize(expected as usize, 0);
        let mut missing = false;
        let filled: HashSet<u32> = dtl_clusters
            .get(sco)
            .map(|entries| {
                entries
                    .iter()
                    .map(|(offset, data)| {
                        let start = *offset as usize * cluster_size as usize;
                        rebuilt[start..start + data.len()].copy_from_slice(data);
                        *offset
                    })
                    .collect()
            })
            .unwrap_or_default();
        if have < expected {
            // Clusters beyond what the file held must all come from the DTL.
            let first_missing = (have / cluster_size) as u32;
            for offset in first_missing..*clusters {
                if !filled.contains(&offset) {
                    missing = true;
                }
            }
        }
        if missing {
            return Err(VolumeError::Corruption(format!(
                "non-disposable sco {sco} is incomplete and the dtl cannot refill it"
            )));
        }
        ctx.sco_cache.remove_sco(namespace, *sco).ok();
        ctx.sco_cache.insert_sco(namespace, *sco, &rebuilt, false)?;
    }
    // SCOs the backend already covers may simply be gone from the cache.

    // Replay metadata from the last corked point, in chain order. Durable
    // logs flush immediately; the others stay corked until they upload.
    let mut pending_corks: Vec<TLogId> = Vec::new();
    for (index, tlog) in chain.iter().enumerate() {
        if *tlog == current {
            continue;
        }
        let replay = index >= replay_from;
        let durable = durable_tlogs.contains(tlog);
        if !replay && durable {
            continue;
        }
        let records = records_per_tlog.get(tlog).cloned().unwrap_or_default();
        metadata.cork(*tlog);
        for (ca, clh) in records {
            metadata.write_cluster(ca, clh)?;
        }
        if durable {
            metadata.uncork(*tlog)?;
        } else {
            pending_corks.push(*tlog);
        }
    }
    // The current log's records go in under its own cork, opened by
    // assembly below.
    let current_records = records_per_tlog.get(&current).cloned().unwrap_or_default();

    // Re-enqueue uploads the crash interrupted: sealed non-durable logs
    // and every SCO a non-durable log references.
    for tlog in &chain {
        if *tlog == current || durable_tlogs.contains(tlog) {
            continue;
        }
        ctx.pool
            .enqueue(BackendJob {
                ns: namespace.clone(),
                kind: BackendJobKind::UploadTLog {
                    id: *tlog,
                    path: paths.tlog_dir.join(tlog.object_name()),
                },
            })
            .await;
    }
    // Any local SCO the backend does not hold yet gets (re)offered; this
    // also catches SCOs whose log uploaded before they did.
    let unbacked: HashSet<SCOName> = cached_scos
        .iter()
        .chain(non_durable_scos.keys())
        .filter(|sco| !backend_scos.contains(sco))
        .copied()
        .collect();
    for sco in unbacked {
        ctx.pool
            .enqueue(BackendJob {
                ns: namespace.clone(),
                kind: BackendJobKind::UploadSco { sco },
            })
            .await;
    }

    let next_sco = non_durable_scos
        .keys()
        .map(|s| s.number)
        .chain(cached_scos.iter().map(|s| s.number))
        .max()
        .map_or(SCONumber::FIRST, |n| n.next());

    let lineage = resolve_lineage(&ctx.connector, &config).await?;
    let parts = VolumeParts {
        backend,
        lineage,
        sco_cache: Arc::clone(&ctx.sco_cache),
        cluster_cache: Arc::clone(&ctx.cluster_cache),
        pool: Arc::clone(&ctx.pool),
        events: ctx.events.clone(),
        metadata,
        persistor,
        paths,
        access_data,
        tlog_writer: writer,
        next_sco,
        durable_tlogs,
        pending_corks,
        tlog_scos,
        config,
    };
    let volume = Volume::assemble(parts);
    for (ca, clh) in current_records {
        volume.metadata().write_cluster(ca, clh)?;
    }
    ctx.sco_cache.unpin(namespace);
    volume.activate();
    Ok(volume)
}

/// Restart a volume from the backend alone
///
/// Reads the volume config and snapshot document from the backend, builds
/// an empty metadata store and replays the chain from the start through
/// whatever TLogs the backend holds. `owner_tag` is the tag of the new
/// ownership generation; writing the config under it fences the previous
/// owner.
pub async fn backend_restart(
    ctx: &RestartContext,
    id: &VolumeId,
    namespace: &Namespace,
    owner_tag: OwnerTag,
    prefetch: bool,
) -> VolumeResult<Arc<Volume>> {
    let backend = BackendHandle::new(Arc::clone(&ctx.connector), namespace.clone());
    let mut config: VolumeConfig =
        serde_json::from_slice(&backend.get(VOLUME_CONFIG_OBJECT).await?)
            .map_err(|e| VolumeError::Corruption(format!("volumeconfig: {e}")))?;
    if &config.id != id {
        return Err(VolumeError::InvalidOperation(format!(
            "namespace {namespace} holds volume {}, not {id}",
            config.id
        )));
    }
    if owner_tag < config.owner_tag {
        return Err(VolumeError::Fenced(config.owner_tag));
    }
    config.owner_tag = owner_tag;

    let mut persistor = SnapshotPersistorStore::new(backend.clone()).pull().await?;
    sanity_check(&persistor, &backend).await?;

    let paths = VolumePaths::new(&ctx.work_dir, namespace);
    std::fs::remove_dir_all(&paths.tlog_dir).ok();
    if let Some(parent) = paths.persistor_path.parent() {
        std::fs::remove_dir_all(parent).ok();
        std::fs::create_dir_all(parent)?;
    }
    std::fs::create_dir_all(&paths.tlog_dir)?;

    let metadata = MetaDataStore::new(
        open_backend(&config.metadata_backend)?,
        config.metadata_cache_capacity,
    );
    metadata.clear()?;

    let access_data = Arc::new(
        AccessDataPersistor::new(backend.clone())
            .pull(false)
            .await
            .unwrap_or_else(|_| ScoAccessData::new(namespace.clone())),
    );
    ctx.sco_cache.register_namespace(
        namespace.clone(),
        NamespaceLimits::derive(config.sco_size(), config.tlog_multiplier, 1.5),
        Arc::clone(&access_data),
    );

    let lineage = resolve_lineage(&ctx.connector, &config).await?;
    let own_ids = persistor.all_tlogs();
    let (replayed, max_sco) = replay_chain(
        &metadata,
        &lineage,
        TLogSource::backend_only(backend.clone()),
        own_ids,
        config.clone_generation,
    )
    .await?;

    // Current logs the backend never received are the crash-lost tail.
    let kept_current: Vec<TLogId> = persistor
        .current_tlogs()
        .iter()
        .copied()
        .filter(|t| replayed.contains(t))
        .collect();
    let fresh = TLogId::new();
    persistor.reset_current(kept_current, fresh);

    // Stamp the config with the new generation; this is the fence.
    let bytes = serde_json::to_vec(&config)
        .map_err(|e| VolumeError::InvalidOperation(e.to_string()))?;
    match backend
        .put(
            VOLUME_CONFIG_OBJECT,
            bytes,
            true,
            Some(&owner_tag_condition(owner_tag)),
        )
        .await
    {
        Ok(()) => {}
        Err(crate::backend::BackendError::ConditionFailed(_)) => {
            return Err(VolumeError::Fenced(owner_tag));
        }
        Err(e) => return Err(e.into()),
    }
    persistor.save_local(&paths.persistor_path)?;
    SnapshotPersistorStore::new(backend.clone())
        .push(&persistor, None)
        .await?;

    let writer = TLogWriter::create(&paths.tlog_dir, fresh)?;
    let durable_tlogs: HashSet<TLogId> = replayed.iter().copied().collect();
    let parts = VolumeParts {
        backend: backend.clone(),
        lineage,
        sco_cache: Arc::clone(&ctx.sco_cache),
        cluster_cache: Arc::clone(&ctx.cluster_cache),
        pool: Arc::clone(&ctx.pool),
        events: ctx.events.clone(),
        metadata,
        persistor,
        paths,
        access_data: Arc::clone(&access_data),
        tlog_writer: writer,
        next_sco: max_sco.map_or(SCONumber::FIRST, |n| n.next()),
        durable_tlogs,
        pending_corks: Vec::new(),
        tlog_scos: HashMap::new(),
        config: config.clone(),
    };
    let volume = Volume::assemble(parts);
    volume.activate();

    if prefetch {
        let order: VecDeque<SCONumber> = access_data.prefetch_order().into();
        let sco_cache = Arc::clone(&ctx.sco_cache);
        let ns = namespace.clone();
        let generation = config.clone_generation;
        let handle = backend.clone();
        tokio::spawn(async move {
            for number in order {
                let sco = SCOName::new(number, generation);
                if sco_cache.lookup(&ns, sco) {
                    continue;
                }
                match handle.get(&sco.object_name()).await {
                    Ok(bytes) => {
                        sco_cache.insert_sco(&ns, sco, &bytes, true).ok();
                    }
                    Err(e) => {
                        log::debug!("prefetch of {sco} skipped: {e}");
                    }
                }
            }
        });
    }
    Ok(volume)
}
