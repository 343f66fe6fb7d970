// Integration tests for ownership migration, stealing and fencing

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use berth::backend::{PutCondition, VOLUME_CONFIG_OBJECT};
use berth::coordinator::DtlPolicy;
use berth::scheduling::BackendWorkerPoolConfig;
use berth::scocache::{MountPointConfig, ScoCacheConfig};
use berth::{
    BackendConnector, BackendError, CoordinatorKv, Engine, EngineConfig, EngineEvent, Lba,
    MemoryConnector, MemoryCoordinator, Namespace, NodeId, OwnerTag, RouterError, VolumeConfig,
    VolumeId, VolumeState,
};

const CLUSTER: &str = "cluster-1";
const CLUSTER_SIZE: usize = 4096;

fn scratch() -> PathBuf {
    std::env::temp_dir().join(format!("berth-mig-{}", uuid::Uuid::new_v4()))
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

/// The condition a stale owner would use: existing config tag at most ours
fn stale_owner_condition(tag: OwnerTag) -> PutCondition {
    PutCondition::new(format!("owner tag <= {}", tag.0), move |existing| {
        let Some(bytes) = existing else {
            return true;
        };
        match serde_json::from_slice::<VolumeConfig>(bytes) {
            Ok(config) => config.owner_tag <= tag,
            Err(_) => false,
        }
    })
}

#[tokio::test]
async fn test_voluntary_migration_and_fencing() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let node_a = start_engine(&dir, "node-a", Arc::clone(&connector), Arc::clone(&kv)).await;
    let node_b = start_engine(&dir, "node-b", Arc::clone(&connector), Arc::clone(&kv)).await;
    node_a.set_peer_address(NodeId::new("node-b"), "10.0.0.2", 7777);
    node_b.set_peer_address(NodeId::new("node-a"), "10.0.0.1", 7777);

    let id = VolumeId::new("vol1");
    node_a
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    let data = cluster_of(b"migrated");
    node_a.write(&id, Lba(0), &data).await.unwrap();

    let old_tag = node_a.stat(&id).await.unwrap().owner_tag;
    let mut events = node_a.events().subscribe();

    // Keep a handle on A's instance so the fencing can be observed on it.
    let stale_volume = node_a.open(&id).await.unwrap();

    node_a
        .migrate(CLUSTER, &id, NodeId::new("node-b"), false)
        .await
        .unwrap();

    // The owner-changed event carries the new generation.
    let event = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let EngineEvent::OwnerChanged { tag, .. } = events.recv().await.unwrap() {
                return tag;
            }
        }
    })
    .await
    .unwrap();
    assert!(event > old_tag);

    // Requests on A now answer with a redirect to B.
    let err = node_a.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap_err();
    match err {
        RouterError::Redirect { host, port } => {
            assert_eq!(host, "10.0.0.2");
            assert_eq!(port, 7777);
        }
        other => panic!("expected a redirect, got {other}"),
    }

    // B adopts the volume from the backend under the new generation.
    node_b.restart(CLUSTER, &id, true).await.unwrap();
    assert_eq!(node_b.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), data);
    assert!(node_b.stat(&id).await.unwrap().owner_tag > old_tag);

    // A crafted backend write under A's previous generation loses.
    let namespace = Namespace::new("vol-vol1");
    let err = connector
        .put(
            &namespace,
            VOLUME_CONFIG_OBJECT,
            b"stale".to_vec(),
            true,
            Some(&stale_owner_condition(old_tag)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BackendError::ConditionFailed(_)));

    // The stale instance halts itself the moment it tries.
    let err = stale_volume.assert_ownership().await.unwrap_err();
    assert!(matches!(err, berth::VolumeError::Fenced(_)));
    assert!(matches!(stale_volume.state(), VolumeState::Halted(_)));

    node_a.shutdown_background_tasks();
    node_b.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_stealing_requires_offline_owner() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let node_a = start_engine(&dir, "node-a", Arc::clone(&connector), Arc::clone(&kv)).await;
    let node_b = start_engine(&dir, "node-b", Arc::clone(&connector), Arc::clone(&kv)).await;

    let id = VolumeId::new("vol1");
    node_a
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    let data = cluster_of(b"stolen");
    node_a.write(&id, Lba(0), &data).await.unwrap();
    // Push everything to the backend so the thief has something to read.
    let tlog = node_a.schedule_backend_sync(CLUSTER, &id).await.unwrap();
    for _ in 0..250 {
        if node_a.is_synced_up_to(CLUSTER, &id, tlog).await.unwrap() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    // Let the SCO upload that rides alongside the TLog settle too.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Stealing from an online owner is refused.
    let err = node_b
        .migrate(CLUSTER, &id, NodeId::new("node-b"), false)
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::InvalidOperation(_)));

    // Once the owner is marked offline, the steal goes through.
    node_b
        .mark_node_offline(CLUSTER, &NodeId::new("node-a"))
        .await
        .unwrap();
    node_b
        .migrate(CLUSTER, &id, NodeId::new("node-b"), false)
        .await
        .unwrap();
    assert_eq!(node_b.read(&id, Lba(0), CLUSTER_SIZE).await.unwrap(), data);

    node_a.shutdown_background_tasks();
    node_b.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}

#[tokio::test]
async fn test_migration_to_current_owner_is_a_noop() {
    let dir = scratch();
    let connector = Arc::new(MemoryConnector::new());
    let kv = Arc::new(MemoryCoordinator::new());
    let node_a = start_engine(&dir, "node-a", connector, kv).await;

    let id = VolumeId::new("vol1");
    node_a
        .create_volume(CLUSTER, id.clone(), 1 << 20, DtlPolicy::disabled())
        .await
        .unwrap();
    let tag = node_a.stat(&id).await.unwrap().owner_tag;

    node_a
        .migrate(CLUSTER, &id, NodeId::new("node-a"), false)
        .await
        .unwrap();
    // Still here, same generation.
    assert_eq!(node_a.stat(&id).await.unwrap().owner_tag, tag);

    node_a.shutdown_background_tasks();
    std::fs::remove_dir_all(dir).ok();
}
