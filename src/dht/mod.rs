// ===================================================================================================
// DHT Overlay - Kademlia Peer and Content Discovery
// ===================================================================================================
//
// Kademlia-style overlay answering two questions: which peers hold chunk X, and what is
// the file record for file Y. Keys (`chunk:<digest>`, `file:<digest>`) are hashed into the
// 160-bit node id space; each key lives at the K closest live nodes.
//
// The overlay runs four background tasks next to the inbound datagram loop:
// - expiry sweep of the local key/value store
// - republisher re-issuing every locally published key at ttl/2
// - bucket refresh (a lookup for a random id per non-empty bucket) per refresh interval
// - on-demand liveness checks when a full bucket weighs an old entry against a newcomer
//
// RPCs are fully asynchronous and matched by transaction id; an unanswered RPC is a
// negative observation, and three consecutive failures evict the peer.
//
// ===================================================================================================

pub mod node_id;
pub mod routing_table;
pub mod rpc;
pub mod store;

mod lookup;

pub use lookup::LookupOutcome;
pub use node_id::{NodeId, PeerHandle};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{MeshError, MeshResult};
use crate::logging::log_network_event;
use routing_table::{ObserveOutcome, RoutingTable};
use rpc::{DhtMessage, RpcEndpoint, RpcReply};
use store::DhtStore;

/// Key prefix mapping a chunk digest to the peers holding it
pub const CHUNK_KEY_PREFIX: &str = "chunk:";
/// Key prefix mapping a file digest to its file record
pub const FILE_KEY_PREFIX: &str = "file:";

/// One running DHT node
pub struct Dht {
    local: PeerHandle,
    endpoint: Arc<RpcEndpoint>,
    routing: Arc<RoutingTable>,
    store: Arc<DhtStore>,
    alpha: usize,
    k: usize,
    rpc_timeout: Duration,
    lookup_timeout: Duration,
    ttl: Duration,
    bootstrap_peers: Vec<String>,
    // Keys this node originally published, re-issued at ttl/2.
    published: Mutex<HashMap<String, Value>>,
    cancel: CancellationToken,
}

impl Dht {
    /// Bind the overlay socket and spawn the inbound loop plus maintenance
    /// tasks. The node is passive until `bootstrap` is called.
    pub async fn start(
        node_id: NodeId,
        bind_addr: SocketAddr,
        config: &Config,
        cancel: CancellationToken,
    ) -> MeshResult<Arc<Self>> {
        let endpoint = RpcEndpoint::bind(bind_addr).await?;
        let local_addr = endpoint.local_addr();
        let advertise = config
            .network
            .advertise_address
            .clone()
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let local = PeerHandle::new(node_id, advertise, local_addr.port());

        let dht = Arc::new(Self {
            local,
            endpoint,
            routing: Arc::new(RoutingTable::new(node_id, config.dht.replication_factor)),
            store: Arc::new(DhtStore::new(config.dht.store_capacity)),
            alpha: config.dht.alpha,
            k: config.dht.replication_factor,
            rpc_timeout: config.rpc_timeout(),
            lookup_timeout: config.lookup_timeout(),
            ttl: config.ttl(),
            bootstrap_peers: config.dht.bootstrap_peers.clone(),
            published: Mutex::new(HashMap::new()),
            cancel,
        });

        info!("DHT node {} listening on {}", dht.local.node_id, local_addr);

        dht.spawn_inbound_loop();
        dht.spawn_sweeper(config.sweep_interval());
        dht.spawn_republisher();
        dht.spawn_bucket_refresher(config.refresh_interval());

        Ok(dht)
    }

    pub fn local_handle(&self) -> PeerHandle {
        self.local.clone()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    pub fn replication_factor(&self) -> usize {
        self.k
    }

    pub(crate) fn alpha(&self) -> usize {
        self.alpha
    }

    pub(crate) fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    pub(crate) fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    pub(crate) fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub(crate) fn endpoint(&self) -> &RpcEndpoint {
        &self.endpoint
    }

    /// Ping a peer by raw `host:port` endpoint; on success the peer joins the
    /// routing table
    pub async fn ping(&self, endpoint_addr: &str) -> MeshResult<PeerHandle> {
        let reply = self
            .endpoint
            .request(
                endpoint_addr,
                DhtMessage::Ping {
                    sender: self.local.clone(),
                },
                self.rpc_timeout,
            )
            .await?;
        match reply {
            RpcReply::Pong(handle) => {
                self.observe_peer(handle.clone());
                Ok(handle)
            }
            _ => Err(MeshError::Network(format!(
                "unexpected reply to PING from {}",
                endpoint_addr
            ))),
        }
    }

    /// Join the network: contact the configured bootstrap peers, locate the
    /// neighbourhood of our own id, then refresh every populated bucket
    pub async fn bootstrap(&self) -> MeshResult<()> {
        for addr in self.bootstrap_peers.clone() {
            match self.ping(&addr).await {
                Ok(handle) => {
                    log_network_event("bootstrap", &format!("reached {}", handle));
                    if let Err(e) = self.iterative_find(self.local.node_id, None).await {
                        warn!("Bootstrap self-lookup via {} failed: {}", addr, e);
                    }
                }
                Err(e) => warn!("Bootstrap peer {} unreachable: {}", addr, e),
            }
        }
        self.refresh_buckets().await;
        Ok(())
    }

    /// Look up a key: local store first, then an iterative FIND_VALUE.
    /// A value found remotely is republished to the closest seen node that
    /// lacked it.
    pub async fn get(&self, key: &str) -> MeshResult<Option<Value>> {
        if let Some(value) = self.store.get(key) {
            return Ok(Some(value));
        }

        let target = NodeId::from_key(key);
        match self.iterative_find(target, Some(key)).await? {
            LookupOutcome::Value {
                value,
                nearest_lacking,
            } => {
                if let Some(peer) = nearest_lacking {
                    let _ = self.store_at(&peer, key, &value).await;
                }
                Ok(Some(value))
            }
            LookupOutcome::Nodes(_) => Ok(None),
        }
    }

    /// Publish a key to the K closest nodes and remember it for periodic
    /// republication. Returns the number of peers that acknowledged.
    pub async fn set(&self, key: &str, value: Value) -> MeshResult<usize> {
        self.published
            .lock()
            .unwrap()
            .insert(key.to_string(), value.clone());
        self.publish_value(key, &value).await
    }

    async fn publish_value(&self, key: &str, value: &Value) -> MeshResult<usize> {
        // The publisher also holds the key; in a small (or single-node)
        // network it may itself be among the K closest.
        self.store.insert(key, value.clone(), self.ttl);

        let target = NodeId::from_key(key);
        let closest = match self.iterative_find(target, None).await? {
            LookupOutcome::Nodes(nodes) => nodes,
            LookupOutcome::Value { .. } => Vec::new(),
        };

        let mut acked = 0;
        for peer in closest.iter().take(self.k) {
            match self.store_at(peer, key, value).await {
                Ok(()) => acked += 1,
                Err(e) => {
                    debug!("STORE of {} at {} failed: {}", key, peer, e);
                    self.routing.note_failure(&peer.node_id);
                }
            }
        }
        debug!("Published {} to {} peers", key, acked);
        Ok(acked)
    }

    async fn store_at(&self, peer: &PeerHandle, key: &str, value: &Value) -> MeshResult<()> {
        let reply = self
            .endpoint
            .request(
                &peer.endpoint(),
                DhtMessage::Store {
                    sender: self.local.clone(),
                    key: key.to_string(),
                    value: value.clone(),
                    ttl_secs: self.ttl.as_secs(),
                },
                self.rpc_timeout,
            )
            .await?;
        match reply {
            RpcReply::Ack(handle) => {
                self.observe_peer(handle);
                Ok(())
            }
            _ => Err(MeshError::Network(format!(
                "unexpected reply to STORE from {}",
                peer
            ))),
        }
    }

    /// Record a peer seen in RPC traffic, deferring full-bucket decisions to a
    /// background liveness check of the least-recently-seen entry
    pub(crate) fn observe_peer(&self, peer: PeerHandle) {
        if let ObserveOutcome::BucketFull {
            least_recently_seen,
            newcomer,
        } = self.routing.observe(peer)
        {
            let routing = Arc::clone(&self.routing);
            let endpoint = Arc::clone(&self.endpoint);
            let sender = self.local.clone();
            let rpc_timeout = self.rpc_timeout;
            tokio::spawn(async move {
                let reply = endpoint
                    .request(
                        &least_recently_seen.endpoint(),
                        DhtMessage::Ping { sender },
                        rpc_timeout,
                    )
                    .await;
                match reply {
                    Ok(RpcReply::Pong(alive)) => {
                        // Old entry is alive: refresh it to most-recently-seen
                        // and drop the newcomer.
                        routing.observe(alive);
                        debug!("Kept {} over newcomer {}", least_recently_seen, newcomer);
                    }
                    _ => {
                        routing.replace(&least_recently_seen.node_id, newcomer);
                    }
                }
            });
        }
    }

    fn spawn_inbound_loop(self: &Arc<Self>) {
        let dht = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let (datagram, from) = tokio::select! {
                    _ = dht.cancel.cancelled() => break,
                    next = dht.endpoint.next_request() => match next {
                        Ok(next) => next,
                        Err(e) => {
                            warn!("DHT socket receive failed: {}", e);
                            break;
                        }
                    },
                };
                dht.handle_request(datagram, from).await;
            }
            debug!("DHT inbound loop stopped");
        });
    }

    async fn handle_request(&self, datagram: rpc::Datagram, from: SocketAddr) {
        // Trust the datagram's source address over the claimed one: we reply
        // (and later route) to where the traffic actually came from.
        let claimed = datagram.message.sender().clone();
        let observed = PeerHandle::new(claimed.node_id, from.ip().to_string(), from.port());
        self.observe_peer(observed);

        let txn = datagram.txn;
        let reply = match datagram.message {
            DhtMessage::Ping { .. } => DhtMessage::Pong {
                sender: self.local.clone(),
            },
            DhtMessage::FindNode { target, .. } => DhtMessage::Nodes {
                sender: self.local.clone(),
                nodes: self.routing.closest(&target, self.k),
            },
            DhtMessage::FindValue { key, .. } => match self.store.get(&key) {
                Some(value) => DhtMessage::Value {
                    sender: self.local.clone(),
                    key,
                    value,
                },
                None => DhtMessage::Nodes {
                    sender: self.local.clone(),
                    nodes: self.routing.closest(&NodeId::from_key(&key), self.k),
                },
            },
            DhtMessage::Store {
                key,
                value,
                ttl_secs,
                ..
            } => {
                self.store.insert(&key, value, Duration::from_secs(ttl_secs));
                DhtMessage::Ack {
                    sender: self.local.clone(),
                }
            }
            // Responses are consumed by the endpoint; nothing else reaches here.
            _ => return,
        };

        if let Err(e) = self.endpoint.respond(from, txn, reply).await {
            debug!("Failed to respond to {}: {}", from, e);
        }
    }

    fn spawn_sweeper(self: &Arc<Self>, interval: Duration) {
        let dht = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = dht.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = dht.store.sweep();
                        if removed > 0 {
                            debug!("Swept {} expired DHT entries", removed);
                        }
                    }
                }
            }
        });
    }

    fn spawn_republisher(self: &Arc<Self>) {
        let dht = Arc::clone(self);
        let interval = self.ttl / 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so freshly published
            // keys are not instantly re-sent.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let entries: Vec<(String, Value)> = {
                            let published = dht.published.lock().unwrap();
                            published.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                        };
                        for (key, value) in entries {
                            if dht.cancel.is_cancelled() {
                                break;
                            }
                            if let Err(e) = dht.publish_value(&key, &value).await {
                                warn!("Republish of {} failed: {}", key, e);
                            }
                        }
                    }
                }
            }
        });
    }

    fn spawn_bucket_refresher(self: &Arc<Self>, interval: Duration) {
        let dht = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = dht.cancel.cancelled() => break,
                    _ = ticker.tick() => dht.refresh_buckets().await,
                }
            }
        });
    }

    /// Refresh every populated bucket by looking up a random id in its range
    pub(crate) async fn refresh_buckets(&self) {
        for bucket in self.routing.non_empty_buckets() {
            if self.cancel.is_cancelled() {
                break;
            }
            let target = self.local.node_id.random_in_bucket(bucket);
            if let Err(e) = self.iterative_find(target, None).await {
                debug!("Refresh of bucket {} failed: {}", bucket, e);
            }
        }
    }

    /// One final synchronous republication pass, used during shutdown
    pub async fn final_announce(&self) {
        let entries: Vec<(String, Value)> = {
            let published = self.published.lock().unwrap();
            published.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
        };
        for (key, value) in entries {
            if let Err(e) = self.publish_value(&key, &value).await {
                debug!("Final announce of {} failed: {}", key, e);
            }
        }
    }
}
