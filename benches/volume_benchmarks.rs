// Benchmarks for the hot paths a cluster write touches: content hashing,
// TLog frame codec, metadata updates and the cluster read cache.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use berth::clustercache::{CacheKey, ClusterCache};
use berth::metadata::{MemoryMetaDataBackend, MetaDataStore};
use berth::tlog::TLogRecord;
use berth::types::{
    CloneGeneration, ClusterAddress, ClusterHash, ClusterLocation, ClusterLocationAndHash,
    SCOName, SCONumber, TLogId,
};

const CLUSTER_SIZE: usize = 4096;

fn sample_clh(offset: u32) -> ClusterLocationAndHash {
    ClusterLocationAndHash::new(
        ClusterLocation::new(SCOName::new(SCONumber(1), CloneGeneration::BASE), offset),
        ClusterHash::of(&offset.to_le_bytes()),
    )
}

fn bench_cluster_hash(c: &mut Criterion) {
    let payload = vec![0xa5u8; CLUSTER_SIZE];
    c.bench_function("cluster_hash_4k", |b| {
        b.iter(|| ClusterHash::of(black_box(&payload)))
    });
}

fn bench_tlog_frame_roundtrip(c: &mut Criterion) {
    let record = TLogRecord::Location {
        ca: ClusterAddress(42),
        clh: sample_clh(7),
    };
    c.bench_function("tlog_frame_encode", |b| {
        b.iter(|| record.encode().unwrap())
    });

    let frame = record.encode().unwrap();
    c.bench_function("tlog_frame_decode", |b| {
        b.iter(|| TLogRecord::decode(black_box(&frame), 0).unwrap())
    });
}

fn bench_metadata_store(c: &mut Criterion) {
    let store = MetaDataStore::new(Arc::new(MemoryMetaDataBackend::new()), 64);
    store.cork(TLogId::new());
    // Stay within a few pages so the bench measures the cache, not growth.
    let span = 1024u64;

    let mut next = 0u64;
    c.bench_function("metadata_write_cluster", |b| {
        b.iter(|| {
            let ca = ClusterAddress(next % span);
            next += 1;
            store.write_cluster(ca, sample_clh(ca.0 as u32)).unwrap();
        })
    });

    let mut probe = 0u64;
    c.bench_function("metadata_read_cluster", |b| {
        b.iter(|| {
            let ca = ClusterAddress(probe % span);
            probe += 1;
            black_box(store.read_cluster(ca).unwrap());
        })
    });
}

fn bench_cluster_cache(c: &mut Criterion) {
    let cache = ClusterCache::new(4096);
    let payload = Arc::new(vec![0x5au8; CLUSTER_SIZE]);
    let hash = ClusterHash::of(&payload);
    cache.insert(CacheKey::Content(hash), Arc::clone(&payload));

    c.bench_function("cluster_cache_content_hit", |b| {
        b.iter(|| cache.lookup(black_box(&CacheKey::Content(hash))))
    });

    let mut salt = 0u32;
    c.bench_function("cluster_cache_content_insert", |b| {
        b.iter(|| {
            salt = salt.wrapping_add(1);
            let key = CacheKey::Content(ClusterHash::of(&salt.to_le_bytes()));
            cache.insert(key, Arc::clone(&payload));
        })
    });
}

criterion_group!(
    benches,
    bench_cluster_hash,
    bench_tlog_frame_roundtrip,
    bench_metadata_store,
    bench_cluster_cache,
);
criterion_main!(benches);
