/// Chunk Store Benchmarks
///
/// Store and retrieve throughput through the full chunking, digesting and
/// erasure-coding pipeline.
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use tempfile::TempDir;
use tokio::runtime::Runtime;

use chunkmesh::chunk_store::ChunkStore;

const FILE_LEN: usize = 1_048_576;
const CHUNK_SIZE: usize = 65_536;

fn file_bytes() -> Vec<u8> {
    (0..FILE_LEN).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

fn benchmark_store(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("chunk_store");
    group.throughput(Throughput::Bytes(FILE_LEN as u64));

    group.bench_function("store_1mib_k4_m1", |b| {
        let bytes = file_bytes();
        b.iter_with_setup(
            || TempDir::new().unwrap(),
            |dir| {
                rt.block_on(async {
                    let store = ChunkStore::open(dir.path().join("storage"), CHUNK_SIZE)
                        .await
                        .unwrap();
                    let digest = store
                        .store_bytes(black_box(&bytes), None, 4, 1)
                        .await
                        .unwrap();
                    black_box(digest);
                });
            },
        );
    });

    group.bench_function("retrieve_1mib", |b| {
        let dir = TempDir::new().unwrap();
        let bytes = file_bytes();
        let (store, digest) = rt.block_on(async {
            let store = ChunkStore::open(dir.path().join("storage"), CHUNK_SIZE)
                .await
                .unwrap();
            let digest = store.store_bytes(&bytes, None, 4, 1).await.unwrap();
            (store, digest)
        });
        let out = dir.path().join("bench.out");
        b.iter(|| {
            rt.block_on(async {
                store.retrieve(black_box(&digest), &out).await.unwrap();
            });
        });
    });

    group.finish();
}

criterion_group!(benches, benchmark_store);
criterion_main!(benches);
