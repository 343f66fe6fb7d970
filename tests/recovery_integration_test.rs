// Integration tests for unclean restart: TLog corruption, DTL refill

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth::coordinator::{DtlPolicy, DtlPolicyMode};
use berth::scheduling::BackendWorkerPoolConfig;
use berth::scocache::{MountPointConfig, ScoCacheConfig};
use berth::{
    BackendConnector, CoordinatorKv, DtlClientConfig, DtlMode, DtlServer, DtlState, Engine,
    EngineConfig, Lba, MemoryConnector, MemoryCoordinator, NodeId, VolumeId,
};

const CLUSTER: &str = "cluster-1";
const CLUSTER_SIZE: usize = 4096;

fn scratch() -> PathBuf {
    std::env::temp_dir().join(format!("berth-rec-{}", uuid::Uuid::new_v4()))
}

async fn start_engine(
    dir: &Path,
    node: &str,
    connector: Arc<MemoryConnector>,
    kv: Arc<MemoryCoordinator>,
) -> Arc<Engine> {
    berth::init_logging();
    let config = EngineConfig::new(NodeId::new(node), CLUSTER, dir.join(node).join("work"));
    let sco_config = ScoCacheConfig {
        mount_points: vec![MountPointConfig::new(dir.join(node).join("scos"), 256 << 20)],
        ..Default::default()
    };
    Engine::start(
        config,
        connector as Arc<dyn BackendConnector>,
        sco_config,
        4096,
        BackendWorkerPoolConfig::default(),
        kv as Arc<dyn CoordinatorKv>,
    )
    .await
    .unwrap()
}

fn cluster_of(text: &[u8]) -> Vec<u8> {
    let mut buf = vec![0u8; CLUSTER_SIZE];
    buf[..text.len()].copy_from_slice(text);
    buf
}

/// The volume's TLog directory under a node's working directory
fn tlog_dir(dir: &Path, node: &str, volume: &str) -> PathBuf {
    dir.join(node)
        .join("work")
        .join("tlogs")
        .join(format!("vol-{volume}"))
}

#[tokio::test]
async fn test_fsynced_writes_survive_unclean_restart() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    // Standalone writes are fdatasynced before the ack.
    let data = cluster_of(b"fsynced");
    engine.write(&id, Lba(0), &data).await.unwrap();

    // Simulate a crash: the volume never quiesces, never uploads.
    let volume = engine.open(&id).await.unwrap();
    volume.halt("simulated crash");
    drop(volume);

    engine.restart(CLUSTER, &id, false).await.unwrap();
    assert_eq!(engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), data);

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_corrupt_sealed_tlog_falls_back_to_backend() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", Arc::clone(&connector), kv).await;
    let id = VolumeId::new("vol1");
    engine
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();

    // Data that does reach the backend.
    let durable = cluster_of(b"on-backend");
    engine.write(&id, Lba(0), &durable).await.unwrap();
    let synced = engine.schedule_backend_sync(CLUSTER, &id).await.unwrap();
    for _ in 0..250 {
        if engine.is_synced_up_to(CLUSTER, &id, synced).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Data that never makes it: block uploads, seal a second log.
    connector.fail_next_puts(u32::MAX);
    let lost = cluster_of(b"never-uploaded");
    engine.write(&id, Lba(8), &lost).await.unwrap();
    // Sealing enqueues an upload that will fail permanently and halt the
    // volume, which stands in for the crash.
    engine.schedule_backend_sync(CLUSTER, &id).await.ok();
    for _ in 0..250 {
        if engine.stat(&id).await.map(|s| s.halted).unwrap_or(true) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    connector.fail_next_puts(0);

    // Corrupt the sealed-but-not-uploaded log on disk.
    let tlogs = tlog_dir(&dir, "node-a", "vol1");
    let mut corrupted = false;
    for entry in std::fs::read_dir(&tlogs).unwrap() {
        let path = entry.unwrap().path();
        let mut bytes = std::fs::read(&path).unwrap();
        if bytes.is_empty() {
            continue;
        }
        // The logs holding the never-uploaded write are the non-empty ones
        // missing from the backend; clip the final byte of each.
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        let on_backend = connector
            .exists(&berth::Namespace::new("vol-vol1"), &name)
            .await
            .unwrap();
        if !on_backend {
            bytes.truncate(bytes.len() - 1);
            std::fs::write(&path, &bytes).unwrap();
            corrupted = true;
        }
    }
    assert!(corrupted, "no sealed non-durable tlog found to corrupt");

    // Plain local restart refuses the damaged log.
    let err = engine.restart(CLUSTER, &id, false).await.unwrap_err();
    assert!(err.to_string().contains("tlog"), "unexpected error: {err}");

    // Forced restart falls back to the backend and serves what it has.
    engine.restart(CLUSTER, &id, true).await.unwrap();
    assert_eq!(
        engine.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(),
        durable
    );
    // The never-uploaded write is gone, as it must be.
    assert_eq!(
        engine.read(&id, Lba(8), CLUSTER_SIZE).await.unwrap(),
        vec![0u8; CLUSTER_SIZE]
    );

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_dtl_refills_lost_scos() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let engine = start_engine(&dir, "node-a", connector, kv).await;

    let server = DtlServer::new(Some(dir.join("dtl-spill"))).unwrap();
    let (addr, _handle) = server.bind("127.0.0.1:0").await.unwrap();

    let id = VolumeId::new("vol1");
    engine
        .create_volume(
            CLUSTER,
            id.clone(),
            1 << 20,
            DtlPolicy {
                mode: DtlPolicyMode::Manual,
                address: Some(DtlClientConfig {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                    mode: DtlMode::Synchronous,
                }),
            },
        )
        .await
        .unwrap();
    engine
        .set_failover_cache_config(
            CLUSTER,
            &id,
            Some(DtlClientConfig {
                host: addr.ip().to_string(),
                port: addr.port(),
                mode: DtlMode::Synchronous,
            }),
        )
        .await
        .unwrap();
    assert_eq!(
        engine.stat(&id).await.unwrap().dtl_state,
        DtlState::Ok(DtlMode::Synchronous)
    );

    // Acknowledged synchronous writes, nothing uploaded to the backend.
    let mut written = Vec::new();
    for i in 0..8u8 {
        let data = cluster_of(&[i + 1; 32]);
        engine
            .write(&id, Lba(i as u64 * 8), &data)
            .await
            .unwrap();
        written.push(data);
    }
    assert_eq!(server.entry_count(&id), 8);

    // Crash, then lose the local SCO files entirely.
    let volume = engine.open(&id).await.unwrap();
    volume.halt("simulated crash");
    drop(volume);
    let sco_dir = dir.join("node-a").join("scos").join("vol-vol1");
    std::fs::remove_dir_all(&sco_dir).unwrap();

    engine.restart(CLUSTER, &id, false).await.unwrap();
    for (i, data) in written.iter().enumerate() {
        assert_eq!(
            engine
                .read(&id, Lba(i as u64 * 8), CLUSTER_SIZE)
                .await
                .unwrap(),
            *data,
            "cluster {i} lost"
        );
    }

    engine.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}
