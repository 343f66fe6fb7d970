//! Two-tier local store of SCOs
//!
//! SCOs live as plain files on a set of mount points, each with a capacity
//! and a pair of free-space watermarks. An SCO is *non-disposable* while it
//! is the current write target or while a transaction log referencing it has
//! not reached the backend; once its log is durable it becomes *disposable*
//! and the background sweeper may evict it, coldest-first by read-activity
//! score. Writes are throttled between the trigger and backoff watermarks
//! and refused outright when space is exhausted.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::types::{Namespace, SCOName};

pub mod access_data;

pub use access_data::{AccessDataPersistor, ScoAccessData};

/// SCO cache error types
#[derive(Error, Debug)]
pub enum ScoCacheError {
    /// No space left and nothing evictable
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// SCO is not present in the cache
    #[error("sco {sco} not cached for {ns}")]
    ScoNotFound {
        /// Namespace looked up
        ns: Namespace,
        /// SCO looked up
        sco: SCOName,
    },

    /// Namespace was never registered with the cache
    #[error("namespace not registered: {0}")]
    NamespaceNotRegistered(Namespace),

    /// All mount points are offline
    #[error("no online mount point")]
    NoOnlineMountPoint,

    /// Read or write failed against the underlying filesystem
    #[error("sco cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for SCO cache operations
pub type ScoCacheResult<T> = Result<T, ScoCacheError>;

/// Configuration of one mount point
#[derive(Debug, Clone)]
pub struct MountPointConfig {
    /// Directory backing this mount point
    pub path: PathBuf,
    /// Capacity budget in bytes
    pub capacity: u64,
    /// Free-space low watermark; the sweeper runs below it
    pub trigger_gap: u64,
    /// Free-space high watermark; eviction stops once reached
    pub backoff_gap: u64,
}

impl MountPointConfig {
    /// Create a mount point config with watermarks at 10% and 20% of capacity
    pub fn new(path: impl Into<PathBuf>, capacity: u64) -> Self {
        Self {
            path: path.into(),
            capacity,
            trigger_gap: capacity / 10,
            backoff_gap: capacity / 5,
        }
    }
}

/// SCO cache configuration
#[derive(Debug, Clone)]
pub struct ScoCacheConfig {
    /// Mount points, tried most-free-first for new SCOs
    pub mount_points: Vec<MountPointConfig>,
    /// Interval between background sweeps
    pub cleanup_interval: Duration,
    /// Microseconds of delay per cluster while between the watermarks
    pub throttle_usecs_per_cluster: u64,
    /// Scales the per-namespace non-disposable footprint bound
    pub non_disposable_scos_factor: f64,
}

impl Default for ScoCacheConfig {
    fn default() -> Self {
        Self {
            mount_points: Vec::new(),
            cleanup_interval: Duration::from_secs(30),
            throttle_usecs_per_cluster: 4000,
            non_disposable_scos_factor: 1.5,
        }
    }
}

/// Per-namespace footprint bounds
#[derive(Debug, Clone, Copy)]
pub struct NamespaceLimits {
    /// Soft floor of the namespace's non-disposable footprint
    pub min_size: u64,
    /// Upper bound of the namespace's non-disposable footprint
    pub max_non_disposable_size: u64,
}

impl NamespaceLimits {
    /// Derive limits from the volume geometry
    pub fn derive(sco_size: u64, scos_per_tlog: u32, factor: f64) -> Self {
        let base = sco_size * scos_per_tlog as u64;
        Self {
            min_size: base,
            max_non_disposable_size: (base as f64 * factor.max(1.0)) as u64,
        }
    }
}

/// Admission verdict for a batch of cluster writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAdmission {
    /// Plenty of space, write at full speed
    Proceed,
    /// Between the watermarks, delay by this much before writing
    Throttle(Duration),
}

struct MountPoint {
    path: PathBuf,
    capacity: u64,
    trigger_gap: u64,
    backoff_gap: u64,
    used: AtomicU64,
    offline: AtomicBool,
}

impl MountPoint {
    fn free(&self) -> u64 {
        self.capacity.saturating_sub(self.used.load(Ordering::SeqCst))
    }

    fn is_online(&self) -> bool {
        !self.offline.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct ScoEntry {
    mount: usize,
    size: u64,
    disposable: bool,
    sealed: bool,
}

struct NamespaceState {
    limits: NamespaceLimits,
    access: Arc<ScoAccessData>,
    pinned: bool,
}

/// Statistics of one mount point
#[derive(Debug, Clone)]
pub struct MountPointStats {
    /// Directory of the mount point
    pub path: PathBuf,
    /// Capacity in bytes
    pub capacity: u64,
    /// Bytes currently used
    pub used: u64,
    /// Whether the mount point is offline
    pub offline: bool,
}

/// An SCO open for appending
///
/// Holds the file handle for the volume's current write target; sealing
/// consumes it. Dropping without sealing leaves a partial SCO that local
/// restart truncates against the running SCO-CRC.
pub struct OpenSco {
    ns: Namespace,
    name: SCOName,
    file: File,
    written: u64,
}

impl OpenSco {
    /// The SCO's name
    pub fn name(&self) -> SCOName {
        self.name
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }
}

/// The two-tier SCO store
pub struct ScoCache {
    mounts: Vec<MountPoint>,
    entries: Mutex<HashMap<(Namespace, SCOName), ScoEntry>>,
    namespaces: Mutex<HashMap<Namespace, NamespaceState>>,
    throttle_usecs_per_cluster: u64,
    cleanup_interval: Duration,
    sweep_wakeup: tokio::sync::Notify,
}

impl ScoCache {
    /// Open the cache, creating mount point directories as needed
    ///
    /// Fails if no mount point is configured or a directory cannot be
    /// created and written.
    pub fn new(config: ScoCacheConfig) -> ScoCacheResult<Self> {
        if config.mount_points.is_empty() {
            return Err(ScoCacheError::InsufficientResources(
                "no mount points configured".to_string(),
            ));
        }
        let mut mounts = Vec::with_capacity(config.mount_points.len());
        for mp in &config.mount_points {
            std::fs::create_dir_all(&mp.path)?;
            let probe = mp.path.join(".write-probe");
            std::fs::write(&probe, b"")?;
            std::fs::remove_file(&probe)?;
            mounts.push(MountPoint {
                path: mp.path.clone(),
                capacity: mp.capacity,
                trigger_gap: mp.trigger_gap,
                backoff_gap: mp.backoff_gap,
                used: AtomicU64::new(0),
                offline: AtomicBool::new(false),
            });
        }
        Ok(Self {
            mounts,
            entries: Mutex::new(HashMap::new()),
            namespaces: Mutex::new(HashMap::new()),
            throttle_usecs_per_cluster: config.throttle_usecs_per_cluster,
            cleanup_interval: config.cleanup_interval,
            sweep_wakeup: tokio::sync::Notify::new(),
        })
    }

    /// Register a namespace before any SCO of it is cached
    pub fn register_namespace(
        &self,
        ns: Namespace,
        limits: NamespaceLimits,
        access: Arc<ScoAccessData>,
    ) {
        let mut namespaces = self.namespaces.lock();
        namespaces.insert(
            ns,
            NamespaceState {
                limits,
                access,
                pinned: false,
            },
        );
    }

    /// Drop a namespace, optionally deleting its cached SCO files
    pub fn deregister_namespace(&self, ns: &Namespace, delete_files: bool) -> ScoCacheResult<()> {
        let mut entries = self.entries.lock();
        let doomed: Vec<(Namespace, SCOName)> = entries
            .keys()
            .filter(|(n, _)| n == ns)
            .cloned()
            .collect();
        for key in doomed {
            if let Some(entry) = entries.remove(&key) {
                let mount = &self.mounts[entry.mount];
                mount.used.fetch_sub(entry.size, Ordering::SeqCst);
                if delete_files {
                    std::fs::remove_file(self.sco_path(entry.mount, &key.0, key.1)).ok();
                }
            }
        }
        self.namespaces.lock().remove(ns);
        if delete_files {
            for mount in &self.mounts {
                std::fs::remove_dir_all(mount.path.join(&ns.0)).ok();
            }
        }
        Ok(())
    }

    /// Pin a namespace so the sweeper leaves it alone during recovery
    pub fn pin_for_recovery(&self, ns: &Namespace) {
        if let Some(state) = self.namespaces.lock().get_mut(ns) {
            state.pinned = true;
        }
    }

    /// Release a recovery pin
    pub fn unpin(&self, ns: &Namespace) {
        if let Some(state) = self.namespaces.lock().get_mut(ns) {
            state.pinned = false;
        }
    }

    fn sco_path(&self, mount: usize, ns: &Namespace, sco: SCOName) -> PathBuf {
        self.mounts[mount].path.join(&ns.0).join(sco.object_name())
    }

    fn pick_mount(&self, exclude: Option<usize>) -> ScoCacheResult<usize> {
        self.mounts
            .iter()
            .enumerate()
            .filter(|(i, m)| m.is_online() && Some(*i) != exclude)
            .max_by_key(|(_, m)| m.free())
            .map(|(i, _)| i)
            .ok_or(ScoCacheError::NoOnlineMountPoint)
    }

    /// Check write admission for a batch of clusters
    ///
    /// Returns the throttle delay while free space sits between the
    /// watermarks and fails with insufficient resources when the batch
    /// cannot fit even after an inline sweep.
    pub fn admission(&self, clusters: u64, cluster_size: u64) -> ScoCacheResult<WriteAdmission> {
        let mount = self.pick_mount(None)?;
        let mp = &self.mounts[mount];
        let needed = clusters * cluster_size;

        if mp.free() < mp.trigger_gap {
            self.sweep();
            self.sweep_wakeup.notify_one();
        }
        let free = self.mounts[self.pick_mount(None)?].free();
        if free < needed {
            return Err(ScoCacheError::InsufficientResources(format!(
                "{needed} bytes requested, {free} free after sweep"
            )));
        }
        if free < self.mounts[mount].backoff_gap {
            let usecs = self.throttle_usecs_per_cluster * clusters;
            return Ok(WriteAdmission::Throttle(Duration::from_micros(usecs)));
        }
        Ok(WriteAdmission::Proceed)
    }

    /// Create a fresh SCO open for appending; it starts non-disposable
    pub fn create_sco(&self, ns: &Namespace, name: SCOName) -> ScoCacheResult<OpenSco> {
        {
            let namespaces = self.namespaces.lock();
            let state = namespaces
                .get(ns)
                .ok_or_else(|| ScoCacheError::NamespaceNotRegistered(ns.clone()))?;
            let non_disposable = self.non_disposable_footprint(ns);
            if non_disposable >= state.limits.max_non_disposable_size {
                return Err(ScoCacheError::InsufficientResources(format!(
                    "non-disposable footprint {} at limit {}",
                    non_disposable, state.limits.max_non_disposable_size
                )));
            }
        }

        let mut mount = self.pick_mount(None)?;
        let file = match self.open_sco_file(mount, ns, name) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("offlining mount point {:?} after {e}", self.mounts[mount].path);
                self.offline_mount_point(mount);
                mount = self.pick_mount(Some(mount))?;
                self.open_sco_file(mount, ns, name)?
            }
        };

        self.entries.lock().insert(
            (ns.clone(), name),
            ScoEntry {
                mount,
                size: 0,
                disposable: false,
                sealed: false,
            },
        );
        Ok(OpenSco {
            ns: ns.clone(),
            name,
            file,
            written: 0,
        })
    }

    fn open_sco_file(&self, mount: usize, ns: &Namespace, name: SCOName) -> ScoCacheResult<File> {
        let dir = self.mounts[mount].path.join(&ns.0);
        std::fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(dir.join(name.object_name()))?;
        Ok(file)
    }

    /// Append cluster payloads to an open SCO
    pub fn write(&self, open: &mut OpenSco, bytes: &[u8]) -> ScoCacheResult<()> {
        if let Err(e) = open.file.write_all(bytes) {
            let entries = self.entries.lock();
            if let Some(entry) = entries.get(&(open.ns.clone(), open.name)) {
                let mount = entry.mount;
                drop(entries);
                log::error!(
                    "write to {} on {:?} failed: {e}, offlining mount point",
                    open.name,
                    self.mounts[mount].path
                );
                self.offline_mount_point(mount);
            }
            return Err(e.into());
        }
        open.written += bytes.len() as u64;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&(open.ns.clone(), open.name)) {
            self.mounts[entry.mount]
                .used
                .fetch_add(bytes.len() as u64, Ordering::SeqCst);
            entry.size += bytes.len() as u64;
        }
        Ok(())
    }

    /// Seal an open SCO: flush, sync, and mark it immutable
    pub fn seal(&self, open: OpenSco) -> ScoCacheResult<()> {
        open.file.sync_all()?;
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&(open.ns, open.name)) {
            entry.sealed = true;
        }
        Ok(())
    }

    /// Whether the cache holds this SCO
    pub fn lookup(&self, ns: &Namespace, sco: SCOName) -> bool {
        self.entries.lock().contains_key(&(ns.clone(), sco))
    }

    /// Read one cluster out of a cached SCO
    pub fn read_cluster(
        &self,
        ns: &Namespace,
        sco: SCOName,
        offset: u32,
        cluster_size: u64,
    ) -> ScoCacheResult<Vec<u8>> {
        let mount = {
            let entries = self.entries.lock();
            let entry = entries.get(&(ns.clone(), sco)).ok_or_else(|| {
                ScoCacheError::ScoNotFound {
                    ns: ns.clone(),
                    sco,
                }
            })?;
            if !self.mounts[entry.mount].is_online() {
                return Err(ScoCacheError::ScoNotFound {
                    ns: ns.clone(),
                    sco,
                });
            }
            entry.mount
        };
        let path = self.sco_path(mount, ns, sco);
        let mut file = File::open(&path).map_err(|_| ScoCacheError::ScoNotFound {
            ns: ns.clone(),
            sco,
        })?;
        file.seek(SeekFrom::Start(offset as u64 * cluster_size))?;
        let mut buf = vec![0u8; cluster_size as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Read a whole cached SCO, for DTL refill checks and uploads
    pub fn read_sco(&self, ns: &Namespace, sco: SCOName) -> ScoCacheResult<Vec<u8>> {
        let mount = {
            let entries = self.entries.lock();
            entries
                .get(&(ns.clone(), sco))
                .filter(|e| self.mounts[e.mount].is_online())
                .map(|e| e.mount)
                .ok_or_else(|| ScoCacheError::ScoNotFound {
                    ns: ns.clone(),
                    sco,
                })?
        };
        let mut buf = Vec::new();
        File::open(self.sco_path(mount, ns, sco))?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Insert a complete SCO fetched from elsewhere
    ///
    /// SCOs arriving from the backend are disposable from the start; SCOs
    /// refilled from the DTL are not, their log is not durable yet.
    pub fn insert_sco(
        &self,
        ns: &Namespace,
        name: SCOName,
        bytes: &[u8],
        disposable: bool,
    ) -> ScoCacheResult<()> {
        let mount = self.pick_mount(None)?;
        let dir = self.mounts[mount].path.join(&ns.0);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join(name.object_name()), bytes)?;
        self.mounts[mount]
            .used
            .fetch_add(bytes.len() as u64, Ordering::SeqCst);
        self.entries.lock().insert(
            (ns.clone(), name),
            ScoEntry {
                mount,
                size: bytes.len() as u64,
                disposable,
                sealed: true,
            },
        );
        Ok(())
    }

    /// Mark an SCO disposable once every log referencing it is durable
    pub fn set_disposable(&self, ns: &Namespace, sco: SCOName) {
        if let Some(entry) = self.entries.lock().get_mut(&(ns.clone(), sco)) {
            entry.disposable = true;
        }
    }

    /// Drop an SCO from the cache
    pub fn remove_sco(&self, ns: &Namespace, sco: SCOName) -> ScoCacheResult<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(&(ns.clone(), sco)) {
            self.mounts[entry.mount]
                .used
                .fetch_sub(entry.size, Ordering::SeqCst);
            std::fs::remove_file(self.sco_path(entry.mount, ns, sco)).ok();
        }
        Ok(())
    }

    /// List cached SCOs of a namespace, optionally filtered by disposability
    pub fn list(&self, ns: &Namespace, disposable: Option<bool>) -> Vec<SCOName> {
        let entries = self.entries.lock();
        let mut scos: Vec<SCOName> = entries
            .iter()
            .filter(|((n, _), e)| n == ns && disposable.map_or(true, |d| e.disposable == d))
            .map(|((_, sco), _)| *sco)
            .collect();
        scos.sort();
        scos
    }

    fn non_disposable_footprint(&self, ns: &Namespace) -> u64 {
        self.entries
            .lock()
            .iter()
            .filter(|((n, _), e)| n == ns && !e.disposable)
            .map(|(_, e)| e.size)
            .sum()
    }

    /// Current non-disposable footprint of a namespace
    pub fn non_disposable_size(&self, ns: &Namespace) -> u64 {
        self.non_disposable_footprint(ns)
    }

    /// Footprint bounds registered for a namespace
    pub fn namespace_limits(&self, ns: &Namespace) -> Option<NamespaceLimits> {
        self.namespaces.lock().get(ns).map(|s| s.limits)
    }

    /// Administratively offline a mount point; its SCOs count as missing
    pub fn offline_mount_point(&self, index: usize) {
        if let Some(mount) = self.mounts.get(index) {
            mount.offline.store(true, Ordering::SeqCst);
        }
    }

    /// Bring a mount point back online
    pub fn online_mount_point(&self, index: usize) {
        if let Some(mount) = self.mounts.get(index) {
            mount.offline.store(false, Ordering::SeqCst);
        }
    }

    /// Per-mount-point statistics
    pub fn stats(&self) -> Vec<MountPointStats> {
        self.mounts
            .iter()
            .map(|m| MountPointStats {
                path: m.path.clone(),
                capacity: m.capacity,
                used: m.used.load(Ordering::SeqCst),
                offline: !m.is_online(),
            })
            .collect()
    }

    /// Rediscover a namespace's SCO files after a process restart
    ///
    /// Every rediscovered SCO is registered sealed and non-disposable;
    /// recovery downgrades the ones whose logs are already durable.
    pub fn reopen_namespace(&self, ns: &Namespace) -> ScoCacheResult<Vec<SCOName>> {
        let mut found = Vec::new();
        for (i, mount) in self.mounts.iter().enumerate() {
            if !mount.is_online() {
                continue;
            }
            let dir = mount.path.join(&ns.0);
            if !dir.is_dir() {
                continue;
            }
            for dirent in std::fs::read_dir(&dir)? {
                let dirent = dirent?;
                let file_name = dirent.file_name().to_string_lossy().into_owned();
                if let Some(sco) = SCOName::parse_object_name(&file_name) {
                    let size = dirent.metadata()?.len();
                    mount.used.fetch_add(size, Ordering::SeqCst);
                    self.entries.lock().insert(
                        (ns.clone(), sco),
                        ScoEntry {
                            mount: i,
                            size,
                            disposable: false,
                            sealed: true,
                        },
                    );
                    found.push(sco);
                }
            }
        }
        found.sort();
        Ok(found)
    }

    /// Evict disposable SCOs, coldest first, until every mount point that
    /// fell below its trigger gap is back above its backoff gap
    pub fn sweep(&self) {
        let targets: Vec<usize> = self
            .mounts
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_online() && m.free() < m.trigger_gap)
            .map(|(i, _)| i)
            .collect();
        if targets.is_empty() {
            return;
        }

        let namespaces = self.namespaces.lock();
        let mut candidates: Vec<((Namespace, SCOName), u64, usize, f32)> = {
            let entries = self.entries.lock();
            entries
                .iter()
                .filter(|((ns, _), e)| {
                    e.disposable
                        && e.sealed
                        && targets.contains(&e.mount)
                        && namespaces.get(ns).map_or(true, |s| !s.pinned)
                })
                .map(|((ns, sco), e)| {
                    let score = namespaces
                        .get(ns)
                        .map(|s| s.access.score(sco.number))
                        .unwrap_or(0.0);
                    ((ns.clone(), *sco), e.size, e.mount, score)
                })
                .collect()
        };
        drop(namespaces);
        candidates.sort_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal));

        for ((ns, sco), _, mount, _) in candidates {
            if self.mounts[mount].free() >= self.mounts[mount].backoff_gap {
                continue;
            }
            log::debug!("sweeping {} from {}", sco, ns);
            self.remove_sco(&ns, sco).ok();
        }
    }

    /// Spawn the periodic sweeper task
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cache.sweep_wakeup.notified() => {}
                }
                cache.sweep();
            }
        })
    }
}
