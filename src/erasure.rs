/// Erasure Coding Module
///
/// Reed-Solomon `(k, m)` encoding over GF(2^8): `k` data shards produce `m`
/// parity shards, and any `k` of the `k + m` shards reconstruct the originals.
/// Encoding is deterministic, the codec holds no shared state, and it performs
/// no I/O, so one instance can be used from any number of tasks.
///
/// The underlying `reed-solomon-erasure` coder rejects a zero parity count, so
/// the degenerate `m = 0` configuration (no redundancy) is handled here without
/// constructing it: encoding yields no parity and decoding succeeds only when
/// every data shard is present.
use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{MeshError, MeshResult};

/// Reed-Solomon codec for one `(k, m)` parameter pair
#[derive(Debug)]
pub struct ErasureCodec {
    data_shards: usize,
    parity_shards: usize,
    coder: Option<ReedSolomon>,
}

impl ErasureCodec {
    /// Build a codec for `k` data and `m` parity shards per stripe.
    ///
    /// Requires `k >= 1`, `m >= 0` and `k + m <= 255` (the GF(2^8) limit).
    pub fn new(data_shards: usize, parity_shards: usize) -> MeshResult<Self> {
        if data_shards < 1 {
            return Err(MeshError::Storage(
                "at least one data shard is required".to_string(),
            ));
        }
        if data_shards + parity_shards > 255 {
            return Err(MeshError::Storage(format!(
                "shard count {} exceeds the GF(2^8) limit of 255",
                data_shards + parity_shards
            )));
        }

        let coder = if parity_shards > 0 {
            Some(ReedSolomon::new(data_shards, parity_shards)?)
        } else {
            None
        };

        Ok(Self {
            data_shards,
            parity_shards,
            coder,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Encode one stripe: `k` equal-length data shards in, `m` parity shards out.
    /// The input shards are not modified.
    pub fn encode(&self, data: &[Vec<u8>]) -> MeshResult<Vec<Vec<u8>>> {
        if data.len() != self.data_shards {
            return Err(MeshError::Storage(format!(
                "expected {} data shards, got {}",
                self.data_shards,
                data.len()
            )));
        }
        let shard_len = data.first().map(|s| s.len()).unwrap_or(0);
        if data.iter().any(|s| s.len() != shard_len) {
            return Err(MeshError::Storage(
                "data shards must all have the same length".to_string(),
            ));
        }

        let coder = match &self.coder {
            Some(coder) => coder,
            None => return Ok(Vec::new()),
        };

        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());
        shards.extend(data.iter().cloned());
        shards.resize(self.total_shards(), vec![0u8; shard_len]);

        coder.encode(&mut shards)?;

        Ok(shards.split_off(self.data_shards))
    }

    /// Decode one stripe from any `k` of its `k + m` shards.
    ///
    /// `shards[i]` is the shard at stripe position `i` (data positions first,
    /// then parity) or `None` when that shard is unavailable. Returns the `k`
    /// data shards, reconstructing the missing ones. Fewer than `k` available
    /// shards is `Unrecoverable`.
    pub fn decode(&self, mut shards: Vec<Option<Vec<u8>>>) -> MeshResult<Vec<Vec<u8>>> {
        if shards.len() != self.total_shards() {
            return Err(MeshError::Storage(format!(
                "expected {} shard positions, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(MeshError::Unrecoverable(format!(
                "only {} of {} shards available, need {}",
                available,
                self.total_shards(),
                self.data_shards
            )));
        }

        match &self.coder {
            Some(coder) => {
                coder.reconstruct(&mut shards)?;
            }
            None => {
                // m = 0 and every position is filled; nothing to reconstruct.
            }
        }

        shards
            .into_iter()
            .take(self.data_shards)
            .map(|s| {
                s.ok_or_else(|| {
                    MeshError::Storage("reconstruction left a data shard empty".to_string())
                })
            })
            .collect()
    }

    /// Cheap predicate for fetch planning: can a stripe with shards present at
    /// `available` positions be reconstructed?
    pub fn can_reconstruct(&self, available: &[usize]) -> bool {
        let mut seen = vec![false; self.total_shards()];
        let mut count = 0;
        for &pos in available {
            if pos < self.total_shards() && !seen[pos] {
                seen[pos] = true;
                count += 1;
            }
        }
        count >= self.data_shards
    }
}
