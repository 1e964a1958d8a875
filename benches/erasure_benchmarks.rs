/// Erasure Codec Benchmarks
///
/// Encoding and reconstruction throughput over 64 KiB shards at the default
/// (4, 1) and the more redundant (4, 2) parameter pairs.
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use chunkmesh::erasure::ErasureCodec;

const SHARD_LEN: usize = 65_536;

fn stripe(k: usize) -> Vec<Vec<u8>> {
    (0..k)
        .map(|i| (0..SHARD_LEN).map(|j| ((i * 31 + j * 7) % 251) as u8).collect())
        .collect()
}

fn benchmark_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("erasure_encode");
    group.throughput(Throughput::Bytes((4 * SHARD_LEN) as u64));

    for (k, m) in [(4usize, 1usize), (4, 2)] {
        let codec = ErasureCodec::new(k, m).unwrap();
        let data = stripe(k);
        group.bench_function(format!("k{}_m{}", k, m), |b| {
            b.iter(|| {
                let parity = codec.encode(black_box(&data)).unwrap();
                black_box(parity);
            });
        });
    }
    group.finish();
}

fn benchmark_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("erasure_decode");
    group.throughput(Throughput::Bytes((4 * SHARD_LEN) as u64));

    let codec = ErasureCodec::new(4, 2).unwrap();
    let data = stripe(4);
    let parity = codec.encode(&data).unwrap();

    group.bench_function("two_data_shards_lost", |b| {
        b.iter(|| {
            let mut shards: Vec<Option<Vec<u8>>> =
                data.iter().cloned().map(Some).collect();
            shards.extend(parity.iter().cloned().map(Some));
            shards[0] = None;
            shards[1] = None;
            let decoded = codec.decode(black_box(shards)).unwrap();
            black_box(decoded);
        });
    });
    group.finish();
}

criterion_group!(benches, benchmark_encode, benchmark_decode);
criterion_main!(benches);
