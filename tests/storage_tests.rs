/// Chunk Store Tests
///
/// Round-trip laws, idempotence, padding boundaries, deletion with reference
/// counting, crash-residue cleanup and the on-disk format header.
use std::collections::HashSet;
use std::path::PathBuf;

use chunkmesh::chunk_store::{digest_of, ChunkStore, INDEX_FILE};
use chunkmesh::error::MeshError;
use tempfile::TempDir;

const CHUNK_SIZE: usize = 1024;

async fn open_store(dir: &TempDir) -> ChunkStore {
    ChunkStore::open(dir.path().join("storage"), CHUNK_SIZE)
        .await
        .unwrap()
}

fn patterned_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

async fn write_input(dir: &TempDir, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    tokio::fs::write(&path, bytes).await.unwrap();
    path
}

#[tokio::test]
async fn store_then_retrieve_round_trips() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let bytes = patterned_bytes(10_000);
    let input = write_input(&dir, "input.bin", &bytes).await;
    let digest = store.store(&input, 4, 1).await.unwrap();
    assert_eq!(digest, digest_of(&bytes));

    let out = dir.path().join("output.bin");
    store.retrieve(&digest, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), bytes);
}

#[tokio::test]
async fn store_pads_data_chunks_to_a_stripe_boundary() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    // 10,000 bytes at chunk_size 1024 is 10 raw chunks, rounded up to 12 for
    // k = 4; parity is m per stripe.
    let bytes = patterned_bytes(10_000);
    let input = write_input(&dir, "input.bin", &bytes).await;
    let digest = store.store(&input, 4, 2).await.unwrap();

    let record = store.get_record(&digest).unwrap();
    assert_eq!(record.data_chunks.len(), 12);
    assert_eq!(record.parity_chunks.len(), 6);
    assert_eq!(record.size, 10_000);
    assert_eq!(record.chunk_size, CHUNK_SIZE);

    // Every chunk blob hashes to its file name and is exactly chunk_size.
    for chunk_digest in record.all_chunks() {
        let blob = store.read_chunk(chunk_digest).await.unwrap();
        assert_eq!(blob.len(), CHUNK_SIZE);
        assert_eq!(&digest_of(&blob), chunk_digest);
    }
}

#[tokio::test]
async fn empty_file_yields_empty_chunk_lists() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let input = write_input(&dir, "empty.bin", &[]).await;
    let digest = store.store(&input, 4, 1).await.unwrap();

    let record = store.get_record(&digest).unwrap();
    assert!(record.data_chunks.is_empty());
    assert!(record.parity_chunks.is_empty());
    assert_eq!(record.size, 0);

    let out = dir.path().join("empty.out");
    store.retrieve(&digest, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap().len(), 0);
}

#[tokio::test]
async fn exact_stripe_sized_file_has_no_padding_chunks() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let k = 4;

    let bytes = patterned_bytes(k * CHUNK_SIZE);
    let input = write_input(&dir, "exact.bin", &bytes).await;
    let digest = store.store(&input, k, 0).await.unwrap();

    let record = store.get_record(&digest).unwrap();
    assert_eq!(record.data_chunks.len(), k);

    let out = dir.path().join("exact.out");
    store.retrieve(&digest, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), bytes);
}

#[tokio::test]
async fn one_byte_over_a_stripe_truncates_correctly() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;
    let k = 4;

    let bytes = patterned_bytes(k * CHUNK_SIZE + 1);
    let input = write_input(&dir, "over.bin", &bytes).await;
    let digest = store.store(&input, k, 1).await.unwrap();

    let record = store.get_record(&digest).unwrap();
    // A second full stripe of data chunks, mostly zero padding.
    assert_eq!(record.data_chunks.len(), 2 * k);

    let out = dir.path().join("over.out");
    store.retrieve(&digest, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), bytes);
}

#[tokio::test]
async fn storing_the_same_bytes_twice_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let bytes = patterned_bytes(5_000);
    let input = write_input(&dir, "input.bin", &bytes).await;

    let first = store.store(&input, 4, 1).await.unwrap();
    let created = store.get_record(&first).unwrap().created_at;
    let chunks_before: HashSet<String> =
        store.list_local_chunks().await.unwrap().into_iter().collect();

    let second = store.store(&input, 4, 1).await.unwrap();
    assert_eq!(first, second);

    let record = store.get_record(&first).unwrap();
    assert_eq!(record.created_at, created);
    assert!(record.accessed_at >= record.created_at);

    let chunks_after: HashSet<String> =
        store.list_local_chunks().await.unwrap().into_iter().collect();
    assert_eq!(chunks_before, chunks_after);
    assert_eq!(store.list_files().len(), 1);
}

#[tokio::test]
async fn delete_removes_unreferenced_chunks_only() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    // Two distinct files plus one whose tail padding chunk collides with
    // nothing; all-zero padding chunks are shared between files of the same
    // shape, which is exactly what reference counting must handle.
    let bytes_a = patterned_bytes(3_000);
    let bytes_b = {
        let mut b = patterned_bytes(3_000);
        b[0] ^= 0xff;
        b
    };
    let input_a = write_input(&dir, "a.bin", &bytes_a).await;
    let input_b = write_input(&dir, "b.bin", &bytes_b).await;
    let digest_a = store.store(&input_a, 4, 1).await.unwrap();
    let digest_b = store.store(&input_b, 4, 1).await.unwrap();

    store.delete(&digest_a).await.unwrap();
    assert!(store.get_record(&digest_a).is_none());

    // B must still be fully retrievable after A's chunks were collected.
    let out = dir.path().join("b.out");
    store.retrieve(&digest_b, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), bytes_b);

    match store.retrieve(&digest_a, &dir.path().join("a.out")).await {
        Err(MeshError::FileNotFound(_)) => {}
        other => panic!("expected FileNotFound, got {:?}", other),
    }
}

#[tokio::test]
async fn retrieve_reports_the_missing_chunk() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let bytes = patterned_bytes(4_000);
    let input = write_input(&dir, "input.bin", &bytes).await;
    let digest = store.store(&input, 4, 0).await.unwrap();

    let record = store.get_record(&digest).unwrap();
    let victim = record.data_chunks[1].clone();
    tokio::fs::remove_file(store.chunk_path(&victim))
        .await
        .unwrap();

    match store.retrieve(&digest, &dir.path().join("out.bin")).await {
        Err(MeshError::MissingChunk(missing)) => assert_eq!(missing, victim),
        other => panic!("expected MissingChunk, got {:?}", other),
    }
}

#[tokio::test]
async fn write_chunk_rejects_digest_mismatch() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let bytes = b"chunk payload".to_vec();
    let good = digest_of(&bytes);
    store.write_chunk(&good, &bytes).await.unwrap();
    assert_eq!(store.read_chunk(&good).await.unwrap(), bytes);

    let wrong = digest_of(b"something else");
    match store.write_chunk(&wrong, &bytes).await {
        Err(MeshError::DigestMismatch { expected, actual }) => {
            assert_eq!(expected, wrong);
            assert_eq!(actual, good);
        }
        other => panic!("expected DigestMismatch, got {:?}", other),
    }
    assert!(!store.has_chunk(&wrong).await);
}

#[tokio::test]
async fn index_survives_reopen_and_stale_temps_are_cleaned() {
    let dir = TempDir::new().unwrap();
    let root = dir.path().join("storage");
    let digest;
    let bytes = patterned_bytes(2_500);
    {
        let store = ChunkStore::open(root.clone(), CHUNK_SIZE).await.unwrap();
        let input = write_input(&dir, "input.bin", &bytes).await;
        digest = store.store(&input, 2, 1).await.unwrap();
    }

    // Simulate a crashed writer.
    tokio::fs::write(root.join("deadbeef.tmp"), b"partial")
        .await
        .unwrap();

    let store = ChunkStore::open(root.clone(), CHUNK_SIZE).await.unwrap();
    assert!(!root.join("deadbeef.tmp").exists());

    let out = dir.path().join("out.bin");
    store.retrieve(&digest, &out).await.unwrap();
    assert_eq!(tokio::fs::read(&out).await.unwrap(), bytes);
}

#[tokio::test]
async fn index_file_is_valid_json_with_format_header() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let input = write_input(&dir, "input.bin", &patterned_bytes(100)).await;
    store.store(&input, 2, 1).await.unwrap();

    let raw = tokio::fs::read(store.root().join(INDEX_FILE)).await.unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(parsed["format"]["digest_algorithm"], "blake3");
    assert!(parsed["format"]["version"].is_u64());
    assert!(parsed["files"].is_object());
}

#[tokio::test]
async fn list_local_chunks_matches_record_contents() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let input = write_input(&dir, "input.bin", &patterned_bytes(6_000)).await;
    let digest = store.store(&input, 4, 2).await.unwrap();
    let record = store.get_record(&digest).unwrap();

    let on_disk: HashSet<String> =
        store.list_local_chunks().await.unwrap().into_iter().collect();
    let referenced: HashSet<String> = record.all_chunks().cloned().collect();
    assert_eq!(on_disk, referenced);
}
