//! Backend worker pool
//!
//! One fixed pool per node executes everything that moves data to the
//! backend asynchronously: sealed SCO uploads, sealed TLog uploads and
//! object deletions. Jobs retry transient failures with jittered backoff;
//! outcomes are reported to the per-namespace listener so the owning volume
//! can advance its durability bookkeeping.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};

use crate::backend::{BackendConnector, BackendError, BackendResult};
use crate::scocache::ScoCache;
use crate::types::{Namespace, SCOName, TLogId};

/// What a backend job does
#[derive(Debug, Clone)]
pub enum BackendJobKind {
    /// Upload a sealed SCO out of the SCO cache
    UploadSco {
        /// The SCO to upload
        sco: SCOName,
    },
    /// Upload a sealed TLog from its local file
    UploadTLog {
        /// The log's id
        id: TLogId,
        /// Path of the sealed log file
        path: PathBuf,
    },
    /// Delete an object, tolerating absence
    DeleteObject {
        /// Object name to delete
        name: String,
    },
}

/// A unit of backend work
#[derive(Debug, Clone)]
pub struct BackendJob {
    /// Namespace the job operates in
    pub ns: Namespace,
    /// The operation
    pub kind: BackendJobKind,
}

/// Outcome callbacks, implemented by the owning volume
#[async_trait]
pub trait UploadListener: Send + Sync {
    /// A sealed SCO reached the backend
    async fn sco_uploaded(&self, sco: SCOName);

    /// A sealed TLog reached the backend
    async fn tlog_uploaded(&self, id: TLogId);

    /// A job exhausted its retries
    async fn upload_failed(&self, job: &BackendJob, error: String);
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct BackendWorkerPoolConfig {
    /// Number of worker tasks
    pub workers: usize,
    /// Attempts per job before giving up
    pub max_attempts: u32,
    /// Base backoff between attempts, jittered and scaled per attempt
    pub retry_backoff: Duration,
}

impl Default for BackendWorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

struct QueuedJob {
    job: BackendJob,
    ack: Option<oneshot::Sender<BackendResult<()>>>,
}

/// The per-node backend worker pool
pub struct BackendWorkerPool {
    tx: mpsc::Sender<QueuedJob>,
    inflight: Arc<AtomicU64>,
    idle: Arc<Notify>,
    listeners: Arc<DashMap<Namespace, Arc<dyn UploadListener>>>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackendWorkerPool {
    /// Spawn the pool
    pub fn new(
        config: BackendWorkerPoolConfig,
        connector: Arc<dyn BackendConnector>,
        sco_cache: Arc<ScoCache>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel::<QueuedJob>(1024);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let inflight = Arc::new(AtomicU64::new(0));
        let idle = Arc::new(Notify::new());
        let listeners: Arc<DashMap<Namespace, Arc<dyn UploadListener>>> = Arc::new(DashMap::new());

        let mut handles = Vec::with_capacity(config.workers.max(1));
        for worker in 0..config.workers.max(1) {
            let rx = Arc::clone(&rx);
            let connector = Arc::clone(&connector);
            let sco_cache = Arc::clone(&sco_cache);
            let inflight = Arc::clone(&inflight);
            let idle = Arc::clone(&idle);
            let listeners = Arc::clone(&listeners);
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                log::debug!("backend worker {worker} started");
                loop {
                    let queued = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(queued) = queued else {
                        break;
                    };
                    let result =
                        execute_with_retry(&config, connector.as_ref(), &sco_cache, &queued.job)
                            .await;

                    match &result {
                        Ok(()) => notify_success(&listeners, &queued.job).await,
                        Err(e) => {
                            log::error!(
                                "backend job in {} failed permanently: {e}",
                                queued.job.ns
                            );
                            if let Some(listener) =
                                listeners.get(&queued.job.ns).map(|l| Arc::clone(l.value()))
                            {
                                listener.upload_failed(&queued.job, e.to_string()).await;
                            }
                        }
                    }
                    if let Some(ack) = queued.ack {
                        ack.send(result).ok();
                    }
                    if inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
                        idle.notify_waiters();
                    }
                }
            }));
        }

        Arc::new(Self {
            tx,
            inflight,
            idle,
            listeners,
            handles: Mutex::new(handles),
        })
    }

    /// Attach the outcome listener for a namespace
    pub fn register_listener(&self, ns: Namespace, listener: Arc<dyn UploadListener>) {
        self.listeners.insert(ns, listener);
    }

    /// Detach a namespace's listener
    pub fn deregister_listener(&self, ns: &Namespace) {
        self.listeners.remove(ns);
    }

    /// Queue a job
    pub async fn enqueue(&self, job: BackendJob) {
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(QueuedJob { job, ack: None }).await.is_err() {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
            log::error!("backend worker pool is shut down, job dropped");
        }
    }

    /// Queue a job and receive its outcome
    pub async fn enqueue_with_ack(&self, job: BackendJob) -> oneshot::Receiver<BackendResult<()>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.inflight.fetch_add(1, Ordering::SeqCst);
        if self
            .tx
            .send(QueuedJob {
                job,
                ack: Some(ack_tx),
            })
            .await
            .is_err()
        {
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        ack_rx
    }

    /// Jobs queued or executing right now
    pub fn inflight(&self) -> u64 {
        self.inflight.load(Ordering::SeqCst)
    }

    /// Wait until the queue drains, bounded by a deadline
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inflight() == 0 {
                return true;
            }
            let notified = self.idle.notified();
            if self.inflight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.inflight() == 0;
            }
        }
    }

    /// Abort the workers
    pub fn shutdown(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn notify_success(listeners: &DashMap<Namespace, Arc<dyn UploadListener>>, job: &BackendJob) {
    let Some(listener) = listeners.get(&job.ns).map(|l| Arc::clone(l.value())) else {
        return;
    };
    match &job.kind {
        BackendJobKind::UploadSco { sco } => listener.sco_uploaded(*sco).await,
        BackendJobKind::UploadTLog { id, .. } => listener.tlog_uploaded(*id).await,
        BackendJobKind::DeleteObject { .. } => {}
    }
}

async fn execute_with_retry(
    config: &BackendWorkerPoolConfig,
    connector: &dyn BackendConnector,
    sco_cache: &ScoCache,
    job: &BackendJob,
) -> BackendResult<()> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match execute(connector, sco_cache, job).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let base = config.retry_backoff.as_millis() as u64 * attempt as u64;
                let jitter = rand::thread_rng().gen_range(0..=base.max(1));
                log::warn!(
                    "backend job in {} attempt {attempt} failed: {e}, retrying",
                    job.ns
                );
                tokio::time::sleep(Duration::from_millis(base + jitter)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn execute(
    connector: &dyn BackendConnector,
    sco_cache: &ScoCache,
    job: &BackendJob,
) -> BackendResult<()> {
    match &job.kind {
        BackendJobKind::UploadSco { sco } => {
            let bytes = sco_cache
                .read_sco(&job.ns, *sco)
                .map_err(|e| BackendError::Permanent(format!("sco vanished from cache: {e}")))?;
            connector
                .put(&job.ns, &sco.object_name(), bytes, true, None)
                .await
        }
        BackendJobKind::UploadTLog { id, path } => {
            let bytes = std::fs::read(path)
                .map_err(|e| BackendError::Permanent(format!("tlog file unreadable: {e}")))?;
            connector
                .put(&job.ns, &id.object_name(), bytes, true, None)
                .await
        }
        BackendJobKind::DeleteObject { name } => connector.remove(&job.ns, name, true).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryConnector;
    use crate::scocache::{MountPointConfig, NamespaceLimits, ScoAccessData, ScoCacheConfig};
    use crate::types::{CloneGeneration, SCONumber};
    use parking_lot::Mutex as PlMutex;

    struct RecordingListener {
        scos: PlMutex<Vec<SCOName>>,
        tlogs: PlMutex<Vec<TLogId>>,
        failures: PlMutex<Vec<String>>,
    }

    impl RecordingListener {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                scos: PlMutex::new(Vec::new()),
                tlogs: PlMutex::new(Vec::new()),
                failures: PlMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UploadListener for RecordingListener {
        async fn sco_uploaded(&self, sco: SCOName) {
            self.scos.lock().push(sco);
        }
        async fn tlog_uploaded(&self, id: TLogId) {
            self.tlogs.lock().push(id);
        }
        async fn upload_failed(&self, _job: &BackendJob, error: String) {
            self.failures.lock().push(error);
        }
    }

    fn sco_cache() -> (Arc<ScoCache>, std::path::PathBuf) {
        let dir = std::env::temp_dir().join(format!("berth-pool-{}", uuid::Uuid::new_v4()));
        let cache = ScoCache::new(ScoCacheConfig {
            mount_points: vec![MountPointConfig::new(&dir, 1 << 20)],
            ..Default::default()
        })
        .unwrap();
        (Arc::new(cache), dir)
    }

    #[tokio::test]
    async fn sco_upload_reaches_backend_and_listener() {
        let connector = Arc::new(MemoryConnector::new());
        let ns = Namespace::new("vol");
        connector.create_namespace(&ns).await.unwrap();
        let (cache, dir) = sco_cache();
        cache.register_namespace(
            ns.clone(),
            NamespaceLimits::derive(4096, 4, 1.5),
            Arc::new(ScoAccessData::new(ns.clone())),
        );

        let sco = SCOName::new(SCONumber(1), CloneGeneration::BASE);
        let mut open = cache.create_sco(&ns, sco).unwrap();
        cache.write(&mut open, &vec![0xabu8; 4096]).unwrap();
        cache.seal(open).unwrap();

        let pool = BackendWorkerPool::new(
            BackendWorkerPoolConfig::default(),
            connector.clone() as Arc<dyn BackendConnector>,
            Arc::clone(&cache),
        );
        let listener = RecordingListener::new();
        pool.register_listener(ns.clone(), listener.clone());

        let ack = pool
            .enqueue_with_ack(BackendJob {
                ns: ns.clone(),
                kind: BackendJobKind::UploadSco { sco },
            })
            .await;
        ack.await.unwrap().unwrap();

        assert_eq!(
            connector.get(&ns, &sco.object_name()).await.unwrap(),
            vec![0xabu8; 4096]
        );
        assert_eq!(listener.scos.lock().as_slice(), &[sco]);
        assert!(pool.wait_idle(Duration::from_secs(1)).await);

        pool.shutdown();
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let connector = Arc::new(MemoryConnector::new());
        let ns = Namespace::new("vol");
        connector.create_namespace(&ns).await.unwrap();
        connector.fail_next_puts(2);
        let (cache, dir) = sco_cache();

        let pool = BackendWorkerPool::new(
            BackendWorkerPoolConfig {
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            connector.clone() as Arc<dyn BackendConnector>,
            Arc::clone(&cache),
        );

        let tlog_dir = dir.join("tlogs");
        std::fs::create_dir_all(&tlog_dir).unwrap();
        let id = TLogId::new();
        let path = tlog_dir.join(id.object_name());
        std::fs::write(&path, b"log-bytes").unwrap();

        let ack = pool
            .enqueue_with_ack(BackendJob {
                ns: ns.clone(),
                kind: BackendJobKind::UploadTLog { id, path },
            })
            .await;
        ack.await.unwrap().unwrap();
        assert_eq!(
            connector.get(&ns, &id.object_name()).await.unwrap(),
            b"log-bytes"
        );

        pool.shutdown();
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure() {
        let connector = Arc::new(MemoryConnector::new());
        let ns = Namespace::new("vol");
        connector.create_namespace(&ns).await.unwrap();
        connector.fail_next_puts(100);
        let (cache, dir) = sco_cache();

        let pool = BackendWorkerPool::new(
            BackendWorkerPoolConfig {
                max_attempts: 2,
                retry_backoff: Duration::from_millis(1),
                ..Default::default()
            },
            connector.clone() as Arc<dyn BackendConnector>,
            Arc::clone(&cache),
        );
        let listener = RecordingListener::new();
        pool.register_listener(ns.clone(), listener.clone());

        let tlog_dir = dir.join("tlogs");
        std::fs::create_dir_all(&tlog_dir).unwrap();
        let id = TLogId::new();
        let path = tlog_dir.join(id.object_name());
        std::fs::write(&path, b"x").unwrap();

        let ack = pool
            .enqueue_with_ack(BackendJob {
                ns: ns.clone(),
                kind: BackendJobKind::UploadTLog { id, path },
            })
            .await;
        assert!(ack.await.unwrap().is_err());
        assert_eq!(listener.failures.lock().len(), 1);

        pool.shutdown();
        std::fs::remove_dir_all(dir).ok();
    }
}
