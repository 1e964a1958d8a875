/// DHT RPC Endpoint
///
/// Datagram protocol of the overlay: every message is one JSON object
/// `{ txn, type, payload }` over UDP. Requests carry a fresh random 64-bit
/// transaction id; responses echo it. Matching is purely by transaction id, so
/// responses may arrive in any order and duplicates for an already-satisfied
/// transaction are ignored.
///
/// Node lists that would exceed the datagram budget are fragmented at the
/// application layer: the sender splits the list across several NODES
/// datagrams sharing one transaction id, and the requester merges fragments
/// that arrive within a short linger window after the first.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use super::node_id::{NodeId, PeerHandle};
use crate::error::{MeshError, MeshResult};
use crate::resilience::with_timeout;

/// Conservative per-datagram payload budget (path MTU minus headers)
pub const MAX_DATAGRAM_BYTES: usize = 1400;

/// How long the requester keeps collecting NODES fragments after the first
const NODES_LINGER: Duration = Duration::from_millis(50);

/// Receive buffer; larger than the send budget so oversized foreign datagrams
/// are still parsed rather than truncated
const RECV_BUFFER_BYTES: usize = 65_536;

/// One overlay message. Every payload carries the sender's handle so any
/// observed datagram can feed the routing table; receivers ignore fields they
/// do not know.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DhtMessage {
    #[serde(rename = "PING")]
    Ping { sender: PeerHandle },
    #[serde(rename = "PONG")]
    Pong { sender: PeerHandle },
    #[serde(rename = "FIND_NODE")]
    FindNode { sender: PeerHandle, target: NodeId },
    #[serde(rename = "NODES")]
    Nodes {
        sender: PeerHandle,
        nodes: Vec<PeerHandle>,
    },
    #[serde(rename = "FIND_VALUE")]
    FindValue { sender: PeerHandle, key: String },
    #[serde(rename = "VALUE")]
    Value {
        sender: PeerHandle,
        key: String,
        value: Value,
    },
    #[serde(rename = "STORE")]
    Store {
        sender: PeerHandle,
        key: String,
        value: Value,
        ttl_secs: u64,
    },
    #[serde(rename = "ACK")]
    Ack { sender: PeerHandle },
}

impl DhtMessage {
    pub fn sender(&self) -> &PeerHandle {
        match self {
            DhtMessage::Ping { sender }
            | DhtMessage::Pong { sender }
            | DhtMessage::FindNode { sender, .. }
            | DhtMessage::Nodes { sender, .. }
            | DhtMessage::FindValue { sender, .. }
            | DhtMessage::Value { sender, .. }
            | DhtMessage::Store { sender, .. }
            | DhtMessage::Ack { sender } => sender,
        }
    }

    /// Whether this message answers an outstanding transaction
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            DhtMessage::Pong { .. }
                | DhtMessage::Nodes { .. }
                | DhtMessage::Value { .. }
                | DhtMessage::Ack { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Datagram {
    pub txn: u64,
    #[serde(flatten)]
    pub message: DhtMessage,
}

/// Resolved outcome of one RPC
#[derive(Debug, Clone)]
pub enum RpcReply {
    Pong(PeerHandle),
    Nodes(Vec<PeerHandle>),
    Value { key: String, value: Value },
    Ack(PeerHandle),
}

struct Pending {
    tx: Option<oneshot::Sender<RpcReply>>,
    // NODES fragments accumulated during the linger window.
    nodes: Vec<PeerHandle>,
    lingering: bool,
}

/// UDP endpoint with transaction-id matching
pub struct RpcEndpoint {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    pending: Arc<Mutex<HashMap<u64, Pending>>>,
}

impl RpcEndpoint {
    /// Bind the overlay socket; port 0 picks an ephemeral port
    pub async fn bind(bind_addr: SocketAddr) -> MeshResult<Arc<Self>> {
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| MeshError::Network(format!("bind {}: {}", bind_addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| MeshError::Network(format!("local_addr: {}", e)))?;
        Ok(Arc::new(Self {
            socket: Arc::new(socket),
            local_addr,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Issue one RPC and await its reply. An unanswered request after
    /// `deadline` is a negative observation reported as `RpcTimeout`.
    pub async fn request(
        &self,
        to: &str,
        message: DhtMessage,
        deadline: Duration,
    ) -> MeshResult<RpcReply> {
        let txn = rand::random::<u64>();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            txn,
            Pending {
                tx: Some(tx),
                nodes: Vec::new(),
                lingering: false,
            },
        );

        let result = async {
            self.send(to, txn, &message).await?;
            with_timeout(deadline, MeshError::RpcTimeout(to.to_string()), async {
                rx.await.map_err(|_| MeshError::RpcTimeout(to.to_string()))
            })
            .await
        }
        .await;

        if result.is_err() {
            self.pending.lock().unwrap().remove(&txn);
        }
        result
    }

    /// Send a response, fragmenting NODES payloads that exceed the datagram
    /// budget by splitting the node list
    pub async fn respond(&self, to: SocketAddr, txn: u64, message: DhtMessage) -> MeshResult<()> {
        if let DhtMessage::Nodes { sender, nodes } = &message {
            for part in fragment_node_list(txn, sender, nodes)? {
                self.socket.send_to(&part, to).await?;
            }
            return Ok(());
        }
        self.send(&to.to_string(), txn, &message).await
    }

    async fn send(&self, to: &str, txn: u64, message: &DhtMessage) -> MeshResult<()> {
        let datagram = Datagram {
            txn,
            message: message.clone(),
        };
        let raw = serde_json::to_vec(&datagram)?;
        if raw.len() > MAX_DATAGRAM_BYTES {
            warn!(
                "Oversized {}-byte datagram to {}; sending anyway",
                raw.len(),
                to
            );
        }
        self.socket.send_to(&raw, to).await?;
        Ok(())
    }

    /// Receive the next inbound request, consuming responses internally.
    /// Malformed datagrams are dropped.
    pub async fn next_request(&self) -> MeshResult<(Datagram, SocketAddr)> {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            let datagram: Datagram = match serde_json::from_slice(&buf[..len]) {
                Ok(datagram) => datagram,
                Err(e) => {
                    debug!("Dropping malformed datagram from {}: {}", from, e);
                    continue;
                }
            };
            trace!("Datagram from {}: txn {}", from, datagram.txn);

            if datagram.message.is_response() {
                self.handle_response(datagram);
                continue;
            }
            return Ok((datagram, from));
        }
    }

    fn handle_response(&self, datagram: Datagram) {
        let txn = datagram.txn;
        let mut pending = self.pending.lock().unwrap();
        // Transaction already satisfied (or never ours): duplicate or stray
        // response, ignored.
        if !pending.contains_key(&txn) {
            return;
        }

        match datagram.message {
            DhtMessage::Nodes { nodes, .. } => {
                let entry = match pending.get_mut(&txn) {
                    Some(entry) => entry,
                    None => return,
                };
                entry.nodes.extend(nodes);
                if !entry.lingering {
                    entry.lingering = true;
                    let pending_map = Arc::clone(&self.pending);
                    tokio::spawn(async move {
                        tokio::time::sleep(NODES_LINGER).await;
                        let mut pending = pending_map.lock().unwrap();
                        if let Some(mut entry) = pending.remove(&txn) {
                            if let Some(tx) = entry.tx.take() {
                                let _ = tx.send(RpcReply::Nodes(std::mem::take(
                                    &mut entry.nodes,
                                )));
                            }
                        }
                    });
                }
            }
            DhtMessage::Pong { sender } => {
                if let Some(mut entry) = pending.remove(&txn) {
                    if let Some(tx) = entry.tx.take() {
                        let _ = tx.send(RpcReply::Pong(sender));
                    }
                }
            }
            DhtMessage::Ack { sender } => {
                if let Some(mut entry) = pending.remove(&txn) {
                    if let Some(tx) = entry.tx.take() {
                        let _ = tx.send(RpcReply::Ack(sender));
                    }
                }
            }
            DhtMessage::Value { key, value, .. } => {
                if let Some(mut entry) = pending.remove(&txn) {
                    if let Some(tx) = entry.tx.take() {
                        let _ = tx.send(RpcReply::Value { key, value });
                    }
                }
            }
            _ => {}
        }
    }
}

/// Encode a NODES response into one or more datagrams, each within the budget
fn fragment_node_list(
    txn: u64,
    sender: &PeerHandle,
    nodes: &[PeerHandle],
) -> MeshResult<Vec<Vec<u8>>> {
    let encode = |part: &[PeerHandle]| -> MeshResult<Vec<u8>> {
        let datagram = Datagram {
            txn,
            message: DhtMessage::Nodes {
                sender: sender.clone(),
                nodes: part.to_vec(),
            },
        };
        Ok(serde_json::to_vec(&datagram)?)
    };

    let mut fragments = Vec::new();
    let mut queue: Vec<&[PeerHandle]> = vec![nodes];
    while let Some(part) = queue.pop() {
        let raw = encode(part)?;
        if raw.len() <= MAX_DATAGRAM_BYTES || part.len() <= 1 {
            fragments.push(raw);
        } else {
            let mid = part.len() / 2;
            queue.push(&part[..mid]);
            queue.push(&part[mid..]);
        }
    }
    Ok(fragments)
}
