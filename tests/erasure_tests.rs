/// Erasure Codec Tests
///
/// Laws the codec must satisfy: determinism of encoding, recovery from any k
/// of k+m shards, refusal below k shards, and the degenerate m = 0
/// configuration completing without redundancy.
use chunkmesh::erasure::ErasureCodec;
use chunkmesh::error::MeshError;

fn stripe(k: usize, shard_len: usize, seed: u8) -> Vec<Vec<u8>> {
    (0..k)
        .map(|i| {
            (0..shard_len)
                .map(|j| (seed as usize + i * 31 + j * 7) as u8)
                .collect()
        })
        .collect()
}

#[test]
fn encode_produces_parity_shards() {
    let codec = ErasureCodec::new(4, 2).unwrap();
    let data = stripe(4, 64, 1);
    let parity = codec.encode(&data).unwrap();
    assert_eq!(parity.len(), 2);
    for shard in &parity {
        assert_eq!(shard.len(), 64);
    }
}

#[test]
fn encode_is_deterministic() {
    let codec = ErasureCodec::new(4, 2).unwrap();
    let data = stripe(4, 128, 9);
    let first = codec.encode(&data).unwrap();
    let second = codec.encode(&data).unwrap();
    assert_eq!(first, second);

    let other_codec = ErasureCodec::new(4, 2).unwrap();
    assert_eq!(first, other_codec.encode(&data).unwrap());
}

#[test]
fn encode_does_not_modify_inputs() {
    let codec = ErasureCodec::new(3, 1).unwrap();
    let data = stripe(3, 32, 5);
    let copy = data.clone();
    codec.encode(&data).unwrap();
    assert_eq!(data, copy);
}

#[test]
fn decode_recovers_from_any_k_shards() {
    let k = 4;
    let m = 2;
    let codec = ErasureCodec::new(k, m).unwrap();
    let data = stripe(k, 96, 3);
    let parity = codec.encode(&data).unwrap();

    let mut all: Vec<Vec<u8>> = data.clone();
    all.extend(parity);

    // Drop every pair of positions in turn; k = 4 of 6 always survive.
    for lost_a in 0..k + m {
        for lost_b in lost_a + 1..k + m {
            let shards: Vec<Option<Vec<u8>>> = all
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    if i == lost_a || i == lost_b {
                        None
                    } else {
                        Some(s.clone())
                    }
                })
                .collect();
            let decoded = codec.decode(shards).unwrap();
            assert_eq!(decoded, data, "lost positions {} and {}", lost_a, lost_b);
        }
    }
}

#[test]
fn decode_fails_below_k_shards() {
    let codec = ErasureCodec::new(4, 2).unwrap();
    let data = stripe(4, 48, 7);
    let parity = codec.encode(&data).unwrap();

    let mut shards: Vec<Option<Vec<u8>>> = data.into_iter().map(Some).collect();
    shards.extend(parity.into_iter().map(Some));
    // Only 3 of 6 left.
    shards[0] = None;
    shards[2] = None;
    shards[4] = None;

    match codec.decode(shards) {
        Err(MeshError::Unrecoverable(_)) => {}
        other => panic!("expected Unrecoverable, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn zero_parity_encodes_nothing_and_decodes_complete_stripes() {
    let codec = ErasureCodec::new(4, 0).unwrap();
    let data = stripe(4, 16, 2);

    let parity = codec.encode(&data).unwrap();
    assert!(parity.is_empty());

    let shards: Vec<Option<Vec<u8>>> = data.iter().cloned().map(Some).collect();
    let decoded = codec.decode(shards).unwrap();
    assert_eq!(decoded, data);
}

#[test]
fn zero_parity_cannot_recover_a_lost_shard() {
    let codec = ErasureCodec::new(4, 0).unwrap();
    let data = stripe(4, 16, 2);
    let mut shards: Vec<Option<Vec<u8>>> = data.into_iter().map(Some).collect();
    shards[1] = None;

    assert!(matches!(
        codec.decode(shards),
        Err(MeshError::Unrecoverable(_))
    ));
}

#[test]
fn can_reconstruct_counts_distinct_valid_positions() {
    let codec = ErasureCodec::new(4, 2).unwrap();
    assert!(codec.can_reconstruct(&[0, 1, 2, 3]));
    assert!(codec.can_reconstruct(&[0, 1, 4, 5]));
    assert!(codec.can_reconstruct(&[2, 3, 4, 5]));
    assert!(!codec.can_reconstruct(&[0, 1, 2]));
    // Duplicates and out-of-range positions do not count.
    assert!(!codec.can_reconstruct(&[0, 0, 0, 0]));
    assert!(!codec.can_reconstruct(&[0, 1, 2, 99]));
}

#[test]
fn rejects_impossible_parameters() {
    assert!(ErasureCodec::new(0, 2).is_err());
    assert!(ErasureCodec::new(200, 100).is_err());
    assert!(ErasureCodec::new(1, 254).is_ok());
}

#[test]
fn mismatched_shard_lengths_are_rejected() {
    let codec = ErasureCodec::new(2, 1).unwrap();
    let data = vec![vec![0u8; 16], vec![0u8; 17]];
    assert!(codec.encode(&data).is_err());
}
