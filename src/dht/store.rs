/// Local DHT Key/Value Store
///
/// TTL-bounded storage for the keys this node is responsible for. The map is
/// sharded with one mutex per shard; a periodic sweep drops expired entries,
/// and capacity pressure evicts the entry closest to expiry.
///
/// `chunk:` keys carry provider lists (JSON arrays of peer handles). A STORE
/// for a key whose stored and incoming values are both such arrays merges them
/// instead of overwriting, so holders announcing the same chunk cannot erase
/// each other; the TTL is refreshed on every merge.
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::node_id::PeerHandle;

const SHARD_COUNT: usize = 16;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Value,
    expires_at: Instant,
}

pub struct DhtStore {
    shards: Vec<Mutex<HashMap<String, StoredValue>>>,
    capacity: usize,
}

impl DhtStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            capacity: capacity.max(SHARD_COUNT) / SHARD_COUNT,
        }
    }

    fn shard_for(&self, key: &str) -> &Mutex<HashMap<String, StoredValue>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// Insert a key, merging provider lists where both sides are peer handle
    /// arrays and evicting the entry closest to expiry under capacity pressure
    pub fn insert(&self, key: &str, value: Value, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        let mut shard = self.shard_for(key).lock().unwrap();

        let merged = match shard.get(key) {
            Some(existing) if existing.expires_at > Instant::now() => {
                merge_provider_lists(&existing.value, &value).unwrap_or(value)
            }
            _ => value,
        };

        if !shard.contains_key(key) && shard.len() >= self.capacity {
            if let Some(oldest) = shard
                .iter()
                .min_by_key(|(_, v)| v.expires_at)
                .map(|(k, _)| k.clone())
            {
                debug!("DHT store at capacity, evicting {}", oldest);
                shard.remove(&oldest);
            }
        }

        shard.insert(
            key.to_string(),
            StoredValue {
                value: merged,
                expires_at,
            },
        );
    }

    /// Look up an unexpired value
    pub fn get(&self, key: &str) -> Option<Value> {
        let shard = self.shard_for(key).lock().unwrap();
        shard
            .get(key)
            .filter(|v| v.expires_at > Instant::now())
            .map(|v| v.value.clone())
    }

    /// Drop every expired entry; returns how many were removed
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap();
            let before = shard.len();
            shard.retain(|_, v| v.expires_at > now);
            removed += before - shard.len();
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Union of two peer handle arrays, deduplicated by node id. `None` when
/// either side is not such an array (caller falls back to last-writer-wins).
fn merge_provider_lists(existing: &Value, incoming: &Value) -> Option<Value> {
    let parse = |v: &Value| -> Option<Vec<PeerHandle>> {
        serde_json::from_value(v.clone()).ok()
    };
    let mut merged = parse(existing)?;
    let incoming = parse(incoming)?;
    for handle in incoming {
        if let Some(pos) = merged.iter().position(|h| h.node_id == handle.node_id) {
            merged[pos] = handle;
        } else {
            merged.push(handle);
        }
    }
    serde_json::to_value(merged).ok()
}
