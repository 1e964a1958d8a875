/// Kademlia Routing Table
///
/// 160 k-buckets indexed by the position of the highest set bit of the XOR
/// distance between the local node id and a peer's id. Each bucket keeps up to
/// `k` peers in least-recently-seen order (front = oldest). Buckets lock
/// independently; no operation takes more than one bucket lock at a time.
///
/// Insertion follows the classic rule: a known peer moves to most-recently-seen,
/// a new peer joins a non-full bucket, and a full bucket defers to a liveness
/// check of the least-recently-seen entry — the caller pings it and either keeps
/// it (discarding the newcomer) or replaces it.
use std::collections::VecDeque;
use std::sync::Mutex;

use super::node_id::{NodeId, PeerHandle, NODE_ID_BITS};

/// Consecutive RPC failures after which a peer is dropped from its bucket
pub const MAX_PEER_FAILURES: u32 = 3;

#[derive(Debug, Clone)]
struct BucketEntry {
    handle: PeerHandle,
    failures: u32,
}

#[derive(Debug, Default)]
struct Bucket {
    // Front is least recently seen.
    entries: VecDeque<BucketEntry>,
}

/// Outcome of observing a peer in RPC traffic
#[derive(Debug)]
pub enum ObserveOutcome {
    /// Peer was already present and moved to most-recently-seen
    Refreshed,
    /// Peer was appended to a non-full bucket
    Inserted,
    /// Bucket is full; the caller should liveness-check the returned
    /// least-recently-seen peer before deciding between it and the newcomer
    BucketFull {
        least_recently_seen: PeerHandle,
        newcomer: PeerHandle,
    },
    /// The peer is ourselves; ignored
    SelfObservation,
}

pub struct RoutingTable {
    local_id: NodeId,
    bucket_size: usize,
    buckets: Vec<Mutex<Bucket>>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, bucket_size: usize) -> Self {
        let buckets = (0..NODE_ID_BITS).map(|_| Mutex::new(Bucket::default())).collect();
        Self {
            local_id,
            bucket_size,
            buckets,
        }
    }

    pub fn local_id(&self) -> &NodeId {
        &self.local_id
    }

    /// Record that `peer` was seen in RPC traffic
    pub fn observe(&self, peer: PeerHandle) -> ObserveOutcome {
        let bucket_index = match self.local_id.bucket_index(&peer.node_id) {
            Some(index) => index,
            None => return ObserveOutcome::SelfObservation,
        };
        let mut bucket = self.buckets[bucket_index].lock().unwrap();

        if let Some(pos) = bucket
            .entries
            .iter()
            .position(|e| e.handle.node_id == peer.node_id)
        {
            let mut entry = bucket.entries.remove(pos).unwrap();
            entry.handle = peer;
            entry.failures = 0;
            bucket.entries.push_back(entry);
            return ObserveOutcome::Refreshed;
        }

        if bucket.entries.len() < self.bucket_size {
            bucket.entries.push_back(BucketEntry {
                handle: peer,
                failures: 0,
            });
            return ObserveOutcome::Inserted;
        }

        ObserveOutcome::BucketFull {
            least_recently_seen: bucket.entries.front().unwrap().handle.clone(),
            newcomer: peer,
        }
    }

    /// Replace `old` with `newcomer` after the old entry failed its liveness
    /// check. A no-op when `old` has disappeared in the meantime.
    pub fn replace(&self, old: &NodeId, newcomer: PeerHandle) {
        let bucket_index = match self.local_id.bucket_index(old) {
            Some(index) => index,
            None => return,
        };
        let mut bucket = self.buckets[bucket_index].lock().unwrap();
        if let Some(pos) = bucket.entries.iter().position(|e| e.handle.node_id == *old) {
            bucket.entries.remove(pos);
            if bucket.entries.len() < self.bucket_size {
                bucket.entries.push_back(BucketEntry {
                    handle: newcomer,
                    failures: 0,
                });
            }
        }
    }

    /// Note a failed RPC against `peer`; evicts after `MAX_PEER_FAILURES`
    /// consecutive failures
    pub fn note_failure(&self, peer: &NodeId) {
        let bucket_index = match self.local_id.bucket_index(peer) {
            Some(index) => index,
            None => return,
        };
        let mut bucket = self.buckets[bucket_index].lock().unwrap();
        if let Some(pos) = bucket.entries.iter().position(|e| e.handle.node_id == *peer) {
            bucket.entries[pos].failures += 1;
            if bucket.entries[pos].failures >= MAX_PEER_FAILURES {
                bucket.entries.remove(pos);
            }
        }
    }

    /// Remove a peer outright
    pub fn remove(&self, peer: &NodeId) {
        if let Some(bucket_index) = self.local_id.bucket_index(peer) {
            let mut bucket = self.buckets[bucket_index].lock().unwrap();
            bucket.entries.retain(|e| e.handle.node_id != *peer);
        }
    }

    /// Up to `count` known peers closest to `target` by XOR distance
    pub fn closest(&self, target: &NodeId, count: usize) -> Vec<PeerHandle> {
        let mut peers: Vec<PeerHandle> = Vec::new();
        for bucket in &self.buckets {
            let bucket = bucket.lock().unwrap();
            peers.extend(bucket.entries.iter().map(|e| e.handle.clone()));
        }
        peers.sort_by_key(|p| p.node_id.distance(target));
        peers.truncate(count);
        peers
    }

    /// Indices of buckets currently holding at least one peer
    pub fn non_empty_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.lock().unwrap().entries.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Total number of peers across all buckets
    pub fn len(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.lock().unwrap().entries.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
