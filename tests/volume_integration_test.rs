// Integration tests for the volume engine: write/read, snapshots, clones

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth::coordinator::DtlPolicy;
use berth::scheduling::BackendWorkerPoolConfig;
use berth::scocache::{MountPointConfig, ScoCacheConfig};
use berth::{
    ClusterCacheBehaviour, ClusterCacheMode, CoordinatorKv, Engine, EngineConfig, Lba,
    MemoryConnector, MemoryCoordinator, NodeId, RouterError, SnapshotName, VolumeId, VolumeState,
};

const CLUSTER: &str = "cluster-1";
const CLUSTER_SIZE: usize = 4096;

fn scratch() -> PathBuf {
    std::env::temp_dir().join(format!("berth-it-{}", uuid::Uuid::new_v4()))
}

async fn start_engine(
    dir: &Path,
    node: &str,
    connector: Arc<dyn berth::BackendConnector>,
    kv: Arc<MemoryCoordinator>,
) -> Arc<Engine> {
    berth::init_logging();
    let config = EngineConfig::new(
        NodeId::new(node),
        CLUSTER,
        dir.join(node).join("work"),
    );
    let sco_config = ScoCacheConfig {
        mount_points: vec![MountPointConfig::new(dir.join(node).join("scos"), 256 << 20)],
        ..Default::default()
    };
    Engine::start(
        config,
        connector,
        sco_config,
        4096,
        BackendWorkerPoolConfig::default(),
        kv as Arc<dyn CoordinatorKv>,
    )
    .await
    .unwrap()
}

/// Connector that holds back TLog uploads while passing everything else
/// through, so tests can keep a snapshot off the backend deterministically.
struct TlogDelayConnector {
    inner: MemoryConnector,
    delay_ms: std::sync::atomic::AtomicU64,
}

impl TlogDelayConnector {
    fn new() -> Self {
        Self {
            inner: MemoryConnector::new(),
            delay_ms: std::sync::atomic::AtomicU64::new(0),
        }
    }

    fn set_tlog_delay(&self, delay: Duration) {
        self.delay_ms.store(
            delay.as_millis() as u64,
            std::sync::atomic::Ordering::SeqCst,
        );
    }
}

#[async_trait::async_trait]
impl berth::BackendConnector for TlogDelayConnector {
    async fn put(
        &self,
        ns: &berth::Namespace,
        name: &str,
        bytes: Vec<u8>,
        overwrite: bool,
        condition: Option<&berth::backend::PutCondition>,
    ) -> berth::backend::BackendResult<()> {
        if name.starts_with("tlog_") {
            let delay = self.delay_ms.load(std::sync::atomic::Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
        }
        self.inner.put(ns, name, bytes, overwrite, condition).await
    }

    async fn get(&self, ns: &berth::Namespace, name: &str) -> berth::backend::BackendResult<Vec<u8>> {
        self.inner.get(ns, name).await
    }

    async fn list(
        &self,
        ns: &berth::Namespace,
        prefix: &str,
    ) -> berth::backend::BackendResult<Vec<String>> {
        self.inner.list(ns, prefix).await
    }

    async fn exists(&self, ns: &berth::Namespace, name: &str) -> berth::backend::BackendResult<bool> {
        self.inner.exists(ns, name).await
    }

    async fn remove(
        &self,
        ns: &berth::Namespace,
        name: &str,
        may_not_exist: bool,
    ) -> berth::backend::BackendResult<()> {
        self.inner.remove(ns, name, may_not_exist).await
    }

    async fn create_namespace(&self, ns: &berth::Namespace) -> berth::backend::BackendResult<()> {
        self.inner.create_namespace(ns).await
    }

    async fn delete_namespace(&self, ns: &berth::Namespace) -> berth::backend::BackendResult<()> {
        self.inner.delete_namespace(ns).await
    }

    async fn namespace_exists(&self, ns: &berth::Namespace) -> berth::backend::BackendResult<bool> {
        self.inner.namespace_exists(ns).await
    }

    async fn list_namespaces(&self) -> berth::backend::BackendResult<Vec<berth::Namespace>> {
        self.inner.list_namespaces().await
    }
}

fn cluster_of(text: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; CLUSTER_SIZE];
    buf[..text.len()].copy_from_slice(text);
    buf
}

async fn wait_running(engine: &Engine, id: &VolumeId) {
    let volume = engine.open(id).await.unwrap();
    for _ in 0..250 {
        if volume.state() == VolumeState::Running {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("volume {id} did not return to Running, state {:?}", volume.state());
}

#[tokio::test]
async fn test_basic_volume_workflow() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");

    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    // Write one cluster and read it straight back.
    let data = cluster_of(b"abcd");
    engine.write(&id, Lba(0), &data).await.unwrap();
    assert_eq!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), data);

    // Unwritten addresses read as zeroes.
    assert_eq!(
        engine.read(&id, Lba(8), CLUSTER_SIZE).await.unwrap(),
        vec![0u8; CLUSTER_SIZE]
    );

    // Snapshot and wait for it to land on the backend.
    let snap = engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s1")), String::new())
        .await
        .unwrap();
    assert_eq!(snap, SnapshotName::new("s1"));
    wait_running(&engine, &id).await;

    // Stop and restart the volume on the same node.
    engine.stop(CLUSTER, &id, false).await.unwrap();
    assert!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.is_err());
    engine.restart(CLUSTER, &id, false).await.unwrap();

    assert_eq!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), data);
    assert_eq!(
        engine.list_snapshots(CLUSTER, &id).await.unwrap(),
        vec![SnapshotName::new("s1")]
    );

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_unaligned_access_is_rejected() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    // Off-cluster LBA.
    let err = engine
        .write(&id, Lba(3), &cluster_of(b"x"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    // Sub-cluster length.
    let err = engine.write(&id, Lba(0), &[1, 2, 3]).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    // Past the end of the volume.
    let err = engine
        .read(&id, Lba(1 << 20), CLUSTER_SIZE)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_multi_sco_write_and_readback() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    // Small SCOs so a few clusters cross several rollovers.
    engine.set_sco_multiplier(CLUSTER, &id, 4).await.unwrap();

    let mut big = Vec::new();
    for i in 0..12u8 {
        big.extend_from_slice(&cluster_of(&[i; 16]));
    }
    engine.write(&id, Lba(0), &big).await.unwrap();
    assert_eq!(
        engine.read(&id, Lba(0), big.len()).await.unwrap(),
        big
    );

    // Overwrite a middle cluster; the latest write wins.
    let patch = cluster_of(b"patched");
    engine.write(&id, Lba(5 * 8), &patch).await.unwrap();
    assert_eq!(
        engine.read(&id, Lba(5 * 8), CLUSTER_SIZE).await.unwrap(),
        patch
    );

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_clone_isolation() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let parent = VolumeId::new("parent");
    let clone = VolumeId::new("clone");

    engine
        .create_volume(CLUSTER, parent.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    let data = cluster_of(b"abcd");
    engine.write(&parent, Lba(0), &data).await.unwrap();
    engine
        .create_snapshot(CLUSTER, &parent, Some(SnapshotName::new("s1")), String::new())
        .await
        .unwrap();
    wait_running(&engine, &parent).await;

    engine
        .create_clone(CLUSTER, clone.clone(), &parent, Some(SnapshotName::new("s1")))
        .await
        .unwrap();

    // The clone sees the parent's data at the snapshot.
    assert_eq!(
        engine.read(&clone, Lba(0), CLUSTER_SIZE).await.unwrap(),
        data
    );

    // Writing the clone never touches the parent.
    let clone_data = cluster_of(b"zzzz");
    engine.write(&clone, Lba(0), &clone_data).await.unwrap();
    assert_eq!(
        engine.read(&parent, Lba(0), CLUSTER_SIZE).await.unwrap(),
        data
    );
    assert_eq!(
        engine.read(&clone, Lba(0), CLUSTER_SIZE).await.unwrap(),
        clone_data
    );

    // A parent with children refuses to go away.
    let err = engine
        .destroy(
            CLUSTER,
            &parent,
            berth::DestroyFlags {
                delete_local_data: true,
                remove_completely: true,
                force: false,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ObjectStillHasChildren(_)));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_snapshot_ordering() {
    let dir = scratch();
    let connector = Arc::new(TlogDelayConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let delaying: Arc<dyn berth::BackendConnector> = connector.clone() as Arc<dyn berth::BackendConnector>;
    let engine = start_engine(&dir, "node-a", delaying, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    engine
        .write(&id, Lba(0), &cluster_of(b"before-s1"))
        .await
        .unwrap();

    // Hold back TLog uploads so s1 stays off the backend for a while.
    connector.set_tlog_delay(Duration::from_secs(2));
    engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s1")), String::new())
        .await
        .unwrap();

    let err = engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s2")), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::PreviousSnapshotNotOnBackend(_)));

    // Once the uploader catches up, the retry goes through.
    connector.set_tlog_delay(Duration::ZERO);
    wait_running(&engine, &id).await;
    engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s2")), String::new())
        .await
        .unwrap();
    wait_running(&engine, &id).await;

    // Duplicate names are their own error.
    let err = engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s1")), String::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::SnapshotNameAlreadyExists(_)));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_snapshot_restore() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    let original = cluster_of(b"original");
    engine.write(&id, Lba(0), &original).await.unwrap();
    engine
        .create_snapshot(CLUSTER, &id, Some(SnapshotName::new("s1")), String::new())
        .await
        .unwrap();
    wait_running(&engine, &id).await;

    // Overwrite after the snapshot, then roll back.
    engine
        .write(&id, Lba(0), &cluster_of(b"overwritten"))
        .await
        .unwrap();
    engine
        .write(&id, Lba(8), &cluster_of(b"extra"))
        .await
        .unwrap();
    engine
        .restore_snapshot(CLUSTER, &id, &SnapshotName::new("s1"))
        .await
        .unwrap();

    assert_eq!(
        engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(),
        original
    );
    assert_eq!(
        engine.read(&id, Lba(8), CLUSTER_SIZE).await.unwrap(),
        vec![0u8; CLUSTER_SIZE]
    );

    // Restoring to an unknown snapshot is a named error.
    let err = engine
        .restore_snapshot(CLUSTER, &id, &SnapshotName::new("nope"))
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::SnapshotNotFound(_)));

    // The volume keeps serving writes after the rollback.
    engine
        .write(&id, Lba(0), &cluster_of(b"after-restore"))
        .await
        .unwrap();

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_cache_coherence_across_modes() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;

    for (name, mode, behaviour) in [
        ("content-write", ClusterCacheMode::ContentBased, ClusterCacheBehaviour::CacheOnWrite),
        ("location-write", ClusterCacheMode::LocationBased, ClusterCacheBehaviour::CacheOnWrite),
        ("content-read", ClusterCacheMode::ContentBased, ClusterCacheBehaviour::CacheOnRead),
        ("no-cache", ClusterCacheMode::ContentBased, ClusterCacheBehaviour::NoCache),
    ] {
        let id = VolumeId::new(name);
        engine
            .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
            .await
            .unwrap();
        engine
            .set_cluster_cache_mode(CLUSTER, &id, mode)
            .await
            .unwrap();
        engine
            .set_cluster_cache_behaviour(CLUSTER, &id, behaviour)
            .await
            .unwrap();

        // A read after an acknowledged write sees that write, then again
        // after an overwrite of the same address.
        let first = cluster_of(format!("{name}-one").as_bytes());
        engine.write(&id, Lba(0), &first).await.unwrap();
        assert_eq!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), first);

        let second = cluster_of(format!("{name}-two").as_bytes());
        engine.write(&id, Lba(0), &second).await.unwrap();
        assert_eq!(
            engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(),
            second,
            "stale read in {name}"
        );
    }

    // Content-based -> location-based is forbidden once data was observed.
    let id = VolumeId::new("content-write");
    let err = engine
        .set_cluster_cache_mode(CLUSTER, &id, ClusterCacheMode::LocationBased)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_halted_volume_refuses_io() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    engine
        .write(&id, Lba(0), &cluster_of(b"data"))
        .await
        .unwrap();

    let volume = engine.open(&id).await.unwrap();
    volume.halt("operator-injected fault");

    assert!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.is_err());
    assert!(engine.write(&id, Lba(0), &cluster_of(b"x")).await.is_err());
    assert!(engine.flush(&id).await.is_err());
    assert!(engine.stat(&id).await.unwrap().halted);
    drop(volume);

    // Administrative restart clears the halt.
    engine.restart(CLUSTER, &id, false).await.unwrap();
    assert_eq!(
        engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(),
        cluster_of(b"data")
    );

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_truncate_grows_only() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    // Growth opens up new addresses.
    engine.truncate(&id, 2 << 20).await.unwrap();
    assert_eq!(engine.stat(&id).await.unwrap().size, 2 << 20);
    engine
        .write(&id, Lba((1 << 20) / 512), &cluster_of(b"tail"))
        .await
        .unwrap();

    // Shrinking is forbidden.
    let err = engine.truncate(&id, 1 << 20).await.unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_backend_sync_barrier() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    engine
        .write(&id, Lba(0), &cluster_of(b"synced"))
        .await
        .unwrap();

    let tlog = engine.schedule_backend_sync(CLUSTER, &id).await.unwrap();
    for _ in 0..250 {
        if engine.is_synced_up_to(CLUSTER, &id, tlog).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(engine.is_synced_up_to(CLUSTER, &id, tlog).await.unwrap());

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_cluster_id_is_checked() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;

    let err = engine
        .create_volume(
            "other-cluster",
            VolumeId::new("vol1"),
            1 << 20,
            DtlPolicy::disabled(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::ClusterIdMismatch { .. }));

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}
