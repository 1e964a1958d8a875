// ===================================================================================================
// Peer Engine - Discovery-Driven Distribution
// ===================================================================================================
//
// Composes the chunk store, erasure codec, wire transport and DHT into the product
// behaviour:
// - advertises local chunks and file records into the DHT (`chunk:<digest>` provider
//   lists, `file:<digest>` records), retrying announcements with capped backoff
// - locates and fetches chunks from holders in parallel, bounded by `max_inflight`,
//   with per-chunk failover across candidate peers
// - reconstructs incomplete stripes through the erasure codec and commits the
//   reassembled file back into the chunk store, re-verifying every digest on the way
//
// A publish is successful once the chunk store commit succeeds; DHT announcements
// proceed asynchronously. Fetches form a cancellation tree: cancelling the engine
// cancels every fetch, and a satisfied stripe cancels its own no-longer-needed
// shard requests.
//
// ===================================================================================================

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::chunk_store::{digest_of, ChunkStore, FileRecord};
use crate::config::Config;
use crate::dht::{Dht, PeerHandle, CHUNK_KEY_PREFIX, FILE_KEY_PREFIX};
use crate::erasure::ErasureCodec;
use crate::error::{MeshError, MeshResult};
use crate::resilience::{retry_async, RetryConfig};
use crate::transport::TransportClient;

/// Parallel holder lookups per fetch
const HOLDER_LOOKUP_CONCURRENCY: usize = 8;

/// Life of a single chunk fetch, for tracing and failure accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Planned,
    Dialing,
    Receiving,
    Verifying,
    Done,
    Retry,
    Failed,
}

/// Progress of one stripe during a fetch; shards arrive in any order
struct StripeProgress {
    // Position within the stripe (0..k data, then parity) to verified bytes.
    have: HashMap<usize, Vec<u8>>,
    satisfied: CancellationToken,
}

pub struct PeerEngine {
    store: Arc<ChunkStore>,
    dht: Arc<Dht>,
    client: TransportClient,
    serve_handle: PeerHandle,
    max_inflight: usize,
    cancel: CancellationToken,
}

impl PeerEngine {
    pub fn new(
        store: Arc<ChunkStore>,
        dht: Arc<Dht>,
        serve_addr: SocketAddr,
        config: &Config,
        cancel: CancellationToken,
    ) -> Self {
        let dht_handle = dht.local_handle();
        let serve_handle = PeerHandle::new(
            dht_handle.node_id,
            dht_handle.address.clone(),
            serve_addr.port(),
        );
        Self {
            store,
            dht,
            client: TransportClient::new(config.transport_timeout()),
            serve_handle,
            max_inflight: config.network.max_inflight,
            cancel,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Handle other peers should use to fetch chunks from us
    pub fn serve_handle(&self) -> PeerHandle {
        self.serve_handle.clone()
    }

    // -----------------------------------------------------------------------------------------------
    // Advertisement
    // -----------------------------------------------------------------------------------------------

    /// Announce one chunk digest as held by this node
    pub async fn announce_chunk(&self, digest: &str) -> MeshResult<()> {
        let key = format!("{}{}", CHUNK_KEY_PREFIX, digest);
        let value = json!([self.serve_handle]);
        self.dht.set(&key, value).await?;
        Ok(())
    }

    /// Announce one file record
    pub async fn announce_file(&self, record: &FileRecord) -> MeshResult<()> {
        let key = format!("{}{}", FILE_KEY_PREFIX, record.file_digest);
        let value = serde_json::to_value(record)?;
        self.dht.set(&key, value).await?;
        Ok(())
    }

    /// Advertise everything held locally. Runs in the background and tolerates
    /// DHT lookups already in flight.
    pub fn spawn_startup_announcements(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let records = engine.store.list_files();
            for record in &records {
                if engine.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = engine.announce_file(record).await {
                    warn!("Startup announce of file {} failed: {}", record.file_digest, e);
                }
            }
            let chunks = match engine.store.list_local_chunks().await {
                Ok(chunks) => chunks,
                Err(e) => {
                    warn!("Could not enumerate local chunks: {}", e);
                    return;
                }
            };
            info!("Advertising {} local chunks", chunks.len());
            for digest in chunks {
                if engine.cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = engine.announce_chunk(&digest).await {
                    warn!("Startup announce of chunk {} failed: {}", digest, e);
                }
            }
        });
    }

    /// Announce a freshly committed record and its chunks, retrying with
    /// backoff capped at 60 seconds
    fn spawn_record_announcements(self: &Arc<Self>, record: FileRecord) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let config = RetryConfig::announcement();
            let file_digest = record.file_digest.clone();
            let announce = retry_async(
                || async { engine.announce_file(&record).await },
                config.clone(),
                "file announcement",
            )
            .await;
            if let Err(e) = announce {
                warn!("Giving up announcing file {}: {}", file_digest, e);
            }

            let digests: Vec<String> = record.all_chunks().cloned().collect();
            for digest in digests {
                if engine.cancel.is_cancelled() {
                    return;
                }
                if !engine.store.has_chunk(&digest).await {
                    continue;
                }
                let announce = retry_async(
                    || async { engine.announce_chunk(&digest).await },
                    config.clone(),
                    "chunk announcement",
                )
                .await;
                if let Err(e) = announce {
                    warn!("Giving up announcing chunk {}: {}", digest, e);
                }
            }
        });
    }

    // -----------------------------------------------------------------------------------------------
    // Publish
    // -----------------------------------------------------------------------------------------------

    /// Store a file locally and advertise it. Successful once the chunk store
    /// commit lands; announcements continue asynchronously.
    pub async fn publish(self: &Arc<Self>, path: &Path, k: usize, m: usize) -> MeshResult<String> {
        let file_digest = self.store.store(path, k, m).await?;
        let record = self
            .store
            .get_record(&file_digest)
            .ok_or_else(|| MeshError::Storage("record vanished after store".to_string()))?;
        self.spawn_record_announcements(record);
        Ok(file_digest)
    }

    // -----------------------------------------------------------------------------------------------
    // Fetch
    // -----------------------------------------------------------------------------------------------

    /// Locate, fetch and reassemble a file into `out_path`.
    pub async fn fetch_file(self: &Arc<Self>, file_digest: &str, out_path: &Path) -> MeshResult<()> {
        let token = self.cancel.child_token();
        let result = tokio::select! {
            _ = token.cancelled() => Err(MeshError::Cancelled),
            result = self.fetch_file_inner(file_digest, out_path, &token) => result,
        };
        // Make sure every child fetch task winds down with us.
        token.cancel();
        result
    }

    async fn fetch_file_inner(
        self: &Arc<Self>,
        file_digest: &str,
        out_path: &Path,
        token: &CancellationToken,
    ) -> MeshResult<()> {
        // Already held locally: plain reassembly.
        if self.store.get_record(file_digest).is_some() {
            match self.store.retrieve(file_digest, out_path).await {
                Ok(()) => return Ok(()),
                Err(MeshError::MissingChunk(digest)) => {
                    debug!("Local copy of {} is missing chunk {}; fetching", file_digest, digest);
                }
                Err(e) => return Err(e),
            }
        }

        let record = self.lookup_record(file_digest).await?;
        let codec = ErasureCodec::new(record.k, record.m)?;

        // Holder discovery for every chunk across all stripes, in parallel.
        let all_digests: Vec<String> = record.all_chunks().cloned().collect();
        let holder_map = self.discover_holders(&all_digests, token).await?;

        let stripes = self.fetch_stripes(&record, &codec, holder_map, token).await?;

        // Reassemble the original bytes and re-verify end to end.
        let mut assembled: Vec<u8> = Vec::with_capacity(record.size as usize);
        for stripe in &stripes {
            for shard in stripe {
                assembled.extend_from_slice(shard);
            }
        }
        assembled.truncate(record.size as usize);
        let actual = digest_of(&assembled);
        if actual != file_digest {
            return Err(MeshError::DigestMismatch {
                expected: file_digest.to_string(),
                actual,
            });
        }

        // Write every data shard back into the store (hash-verified, and a
        // no-op for blobs already on disk). This also repairs a local record
        // whose chunk files were lost.
        for (stripe_index, stripe) in stripes.iter().enumerate() {
            for (pos, shard) in stripe.iter().enumerate() {
                let digest = &record.data_chunks[stripe_index * record.k + pos];
                self.store.write_chunk(digest, shard).await?;
            }
        }

        // Commit the record locally (regenerating parity where absent) and
        // advertise the new copy, then assemble the output file.
        self.store
            .store_bytes(&assembled, record.original_name.clone(), record.k, record.m)
            .await?;
        if let Some(committed) = self.store.get_record(file_digest) {
            self.spawn_record_announcements(committed);
        }
        self.store.retrieve(file_digest, out_path).await
    }

    /// File record from the local index or the DHT
    async fn lookup_record(&self, file_digest: &str) -> MeshResult<FileRecord> {
        if let Some(record) = self.store.get_record(file_digest) {
            return Ok(record);
        }
        let key = format!("{}{}", FILE_KEY_PREFIX, file_digest);
        let value = self
            .dht
            .get(&key)
            .await?
            .ok_or_else(|| MeshError::FileNotFound(file_digest.to_string()))?;
        let record: FileRecord = serde_json::from_value(value)
            .map_err(|e| MeshError::Serialization(format!("bad file record in DHT: {}", e)))?;
        if record.file_digest != file_digest {
            return Err(MeshError::FileNotFound(file_digest.to_string()));
        }
        // The record came from the network; reject shapes the stripe math
        // cannot hold.
        if record.k == 0
            || record.data_chunks.len() % record.k != 0
            || record.parity_chunks.len() != record.m * (record.data_chunks.len() / record.k)
        {
            return Err(MeshError::Serialization(format!(
                "inconsistent file record for {} in DHT",
                file_digest
            )));
        }
        Ok(record)
    }

    /// Query the DHT for the holder list of every chunk
    async fn discover_holders(
        &self,
        digests: &[String],
        token: &CancellationToken,
    ) -> MeshResult<HashMap<String, Vec<PeerHandle>>> {
        let self_id = self.serve_handle.node_id;
        let lookups = stream::iter(digests.iter().cloned())
            .map(|digest| async move {
                let key = format!("{}{}", CHUNK_KEY_PREFIX, digest);
                let holders = match self.dht.get(&key).await {
                    Ok(Some(value)) => serde_json::from_value::<Vec<PeerHandle>>(value)
                        .unwrap_or_default()
                        .into_iter()
                        .filter(|h| h.node_id != self_id)
                        .collect(),
                    Ok(None) => Vec::new(),
                    Err(e) => {
                        debug!("Holder lookup for {} failed: {}", digest, e);
                        Vec::new()
                    }
                };
                (digest, holders)
            })
            .buffer_unordered(HOLDER_LOOKUP_CONCURRENCY);

        let mut holder_map = HashMap::new();
        tokio::pin!(lookups);
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return Err(MeshError::Cancelled),
                next = lookups.next() => next,
            };
            match next {
                Some((digest, holders)) => {
                    holder_map.insert(digest, holders);
                }
                None => break,
            }
        }
        Ok(holder_map)
    }

    /// Fetch enough shards of every stripe, reconstructing what the network
    /// could not provide. Returns each stripe's data shards in order.
    async fn fetch_stripes(
        self: &Arc<Self>,
        record: &FileRecord,
        codec: &ErasureCodec,
        holder_map: HashMap<String, Vec<PeerHandle>>,
        token: &CancellationToken,
    ) -> MeshResult<Vec<Vec<Vec<u8>>>> {
        let k = record.k;
        let m = record.m;
        let stripe_count = record.stripe_count();
        let inflight = Arc::new(Semaphore::new(self.max_inflight));
        let holder_map = Arc::new(holder_map);

        let mut drivers = Vec::with_capacity(stripe_count);
        for stripe_index in 0..stripe_count {
            // Stripe positions: k data digests then m parity digests.
            let mut shard_digests: Vec<String> = Vec::with_capacity(k + m);
            shard_digests.extend_from_slice(&record.data_chunks[stripe_index * k..(stripe_index + 1) * k]);
            shard_digests.extend_from_slice(&record.parity_chunks[stripe_index * m..(stripe_index + 1) * m]);

            drivers.push(self.drive_stripe(
                stripe_index,
                shard_digests,
                k,
                Arc::clone(&holder_map),
                Arc::clone(&inflight),
                token.child_token(),
            ));
        }

        let stripe_results = futures::future::join_all(drivers).await;

        if token.is_cancelled() {
            return Err(MeshError::Cancelled);
        }

        let mut stripes = Vec::with_capacity(stripe_count);
        for (stripe_index, result) in stripe_results.into_iter().enumerate() {
            let have = result?;
            let available: Vec<usize> = have.keys().copied().collect();
            if !codec.can_reconstruct(&available) {
                return Err(MeshError::Unrecoverable(format!(
                    "stripe {} has only {} of {} shards",
                    stripe_index,
                    available.len(),
                    k + m
                )));
            }

            let needs_decode = (0..k).any(|pos| !have.contains_key(&pos));
            let data_shards = if needs_decode {
                let mut shards: Vec<Option<Vec<u8>>> = vec![None; k + m];
                for (pos, bytes) in have {
                    shards[pos] = Some(bytes);
                }
                let decoded = codec.decode(shards)?;
                // Reconstructed shards must still hash to the digests the
                // record promised.
                for (pos, shard) in decoded.iter().enumerate() {
                    let expected = &record.data_chunks[stripe_index * k + pos];
                    let actual = digest_of(shard);
                    if actual != *expected {
                        return Err(MeshError::DigestMismatch {
                            expected: expected.clone(),
                            actual,
                        });
                    }
                }
                decoded
            } else {
                let mut have = have;
                let mut data = Vec::with_capacity(k);
                for pos in 0..k {
                    match have.remove(&pos) {
                        Some(bytes) => data.push(bytes),
                        None => {
                            return Err(MeshError::Storage(
                                "data shard disappeared during assembly".to_string(),
                            ))
                        }
                    }
                }
                data
            };
            stripes.push(data_shards);
        }
        Ok(stripes)
    }

    /// Drive one stripe to `k` shards in hand: start with local shards, prefer
    /// data shards over parity, fail over across holders per chunk, and cancel
    /// leftover requests the moment the stripe is satisfied.
    async fn drive_stripe(
        self: &Arc<Self>,
        stripe_index: usize,
        shard_digests: Vec<String>,
        k: usize,
        holder_map: Arc<HashMap<String, Vec<PeerHandle>>>,
        inflight: Arc<Semaphore>,
        token: CancellationToken,
    ) -> MeshResult<HashMap<usize, Vec<u8>>> {
        let progress = Arc::new(Mutex::new(StripeProgress {
            have: HashMap::new(),
            satisfied: token.child_token(),
        }));

        // Local shards first; no network work for what we already hold.
        for (pos, digest) in shard_digests.iter().enumerate() {
            if let Ok(bytes) = self.store.read_chunk(digest).await {
                progress.lock().unwrap().have.insert(pos, bytes);
            }
        }

        // Fetch queue: missing data positions first, then parity.
        let mut queue: Vec<usize> = (0..shard_digests.len())
            .filter(|pos| {
                !progress.lock().unwrap().have.contains_key(pos)
                    && !holder_map
                        .get(&shard_digests[*pos])
                        .map(|h| h.is_empty())
                        .unwrap_or(true)
            })
            .collect();
        queue.reverse(); // pop() takes data positions first

        let mut tasks: JoinSet<(usize, FetchState)> = JoinSet::new();
        loop {
            let (have_count, satisfied_token) = {
                let progress = progress.lock().unwrap();
                (progress.have.len(), progress.satisfied.clone())
            };
            if have_count >= k {
                // Stripe satisfied: anything still in flight is no longer
                // needed.
                satisfied_token.cancel();
                tasks.abort_all();
                break;
            }
            if token.is_cancelled() {
                tasks.abort_all();
                return Err(MeshError::Cancelled);
            }

            // Keep exactly enough requests in flight to close the gap.
            while tasks.len() < k - have_count {
                let pos = match queue.pop() {
                    Some(pos) => pos,
                    None => break,
                };
                let digest = shard_digests[pos].clone();
                let holders = holder_map.get(&digest).cloned().unwrap_or_default();
                let engine = Arc::clone(self);
                let progress = Arc::clone(&progress);
                let inflight = Arc::clone(&inflight);
                let chunk_token = satisfied_token.clone();
                tasks.spawn(async move {
                    let state = engine
                        .fetch_chunk(&digest, &holders, inflight, chunk_token)
                        .await;
                    if let FetchOutcome::Fetched(bytes) = state {
                        progress.lock().unwrap().have.insert(pos, bytes);
                        return (pos, FetchState::Done);
                    }
                    (pos, FetchState::Failed)
                });
            }

            if tasks.is_empty() {
                // Nothing in flight and nothing left to try.
                break;
            }

            match tasks.join_next().await {
                Some(Ok((pos, FetchState::Failed))) => {
                    trace!("Stripe {} shard {} unavailable", stripe_index, pos);
                }
                Some(Ok(_)) | Some(Err(_)) | None => {}
            }
        }

        let have = std::mem::take(&mut progress.lock().unwrap().have);
        Ok(have)
    }

    /// Fetch one chunk, walking the candidate holders in order. Every
    /// transport failure or digest mismatch moves on to the next peer;
    /// `Failed` is reported only once the whole list is exhausted.
    async fn fetch_chunk(
        &self,
        digest: &str,
        holders: &[PeerHandle],
        inflight: Arc<Semaphore>,
        token: CancellationToken,
    ) -> FetchOutcome {
        let _permit = tokio::select! {
            _ = token.cancelled() => return FetchOutcome::Cancelled,
            permit = inflight.acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return FetchOutcome::Cancelled,
            },
        };

        let mut state = FetchState::Planned;
        trace!(
            "Chunk {}: {:?} with {} candidate holders",
            digest,
            state,
            holders.len()
        );
        for holder in holders {
            let addr = match holder.socket_addr() {
                Ok(addr) => addr,
                Err(_) => continue,
            };

            state = FetchState::Dialing;
            trace!("Chunk {}: {:?} via {}", digest, state, holder);
            let request = self.client.get_chunk(addr, digest);
            state = FetchState::Receiving;
            trace!("Chunk {}: {:?}", digest, state);
            let attempt = tokio::select! {
                _ = token.cancelled() => return FetchOutcome::Cancelled,
                attempt = request => attempt,
            };
            state = FetchState::Verifying;
            trace!("Chunk {}: {:?}", digest, state);

            match attempt {
                Ok(bytes) => {
                    state = FetchState::Done;
                    trace!("Chunk {}: {:?} ({} bytes)", digest, state, bytes.len());
                    return FetchOutcome::Fetched(bytes);
                }
                Err(e) => {
                    state = FetchState::Retry;
                    debug!("Chunk {} from {} failed ({}); trying next holder", digest, holder, e);
                }
            }
        }

        state = FetchState::Failed;
        trace!(
            "Chunk {}: {:?} after exhausting {} holders",
            digest,
            state,
            holders.len()
        );
        FetchOutcome::Unavailable
    }
}

enum FetchOutcome {
    Fetched(Vec<u8>),
    Unavailable,
    Cancelled,
}
