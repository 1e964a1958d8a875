/// Node Identity Module
///
/// 160-bit identifiers for nodes and keys, XOR distance between them, and the
/// peer handle `(node_id, address, port)`. A node id is chosen uniformly at
/// random at first start and persisted; key ids are derived by hashing the
/// textual key form down to 160 bits, placing keys and nodes in one keyspace.
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;

use rand::RngCore;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tokio::fs;
use tracing::info;

use crate::error::{MeshError, MeshResult};

/// Width of a node or key identifier in bytes
pub const NODE_ID_BYTES: usize = 20;
/// Width of a node or key identifier in bits; also the routing table height
pub const NODE_ID_BITS: usize = 160;

/// A 160-bit identifier in the DHT keyspace
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_BYTES]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; NODE_ID_BYTES]) -> Self {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_BYTES] {
        &self.0
    }

    /// Uniformly random identifier
    pub fn random() -> Self {
        let mut bytes = [0u8; NODE_ID_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    /// Identifier of a textual DHT key (e.g. `chunk:<digest>`): the first 160
    /// bits of its BLAKE3 hash
    pub fn from_key(key: &str) -> Self {
        let hash = blake3::hash(key.as_bytes());
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&hash.as_bytes()[..NODE_ID_BYTES]);
        NodeId(bytes)
    }

    pub fn from_hex(hex_str: &str) -> MeshResult<Self> {
        let raw = hex::decode(hex_str.trim())?;
        if raw.len() != NODE_ID_BYTES {
            return Err(MeshError::Serialization(format!(
                "node id must be {} bytes, got {}",
                NODE_ID_BYTES,
                raw.len()
            )));
        }
        let mut bytes = [0u8; NODE_ID_BYTES];
        bytes.copy_from_slice(&raw);
        Ok(NodeId(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// XOR distance to another identifier
    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut bytes = [0u8; NODE_ID_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        Distance(bytes)
    }

    /// Index of the routing bucket `other` belongs to relative to `self`: the
    /// position of the highest set bit of the XOR distance (0..160), counted
    /// from the least significant bit. `None` when the ids are equal.
    pub fn bucket_index(&self, other: &NodeId) -> Option<usize> {
        for (i, byte) in self.0.iter().enumerate() {
            let diff = byte ^ other.0[i];
            if diff != 0 {
                let msb_in_byte = 7 - diff.leading_zeros() as usize;
                return Some((NODE_ID_BYTES - 1 - i) * 8 + msb_in_byte);
            }
        }
        None
    }

    /// A random identifier whose distance from `self` falls in bucket
    /// `bucket`; used for bucket refresh lookups
    pub fn random_in_bucket(&self, bucket: usize) -> NodeId {
        let mut target = *self;
        let byte_index = NODE_ID_BYTES - 1 - bucket / 8;
        let bit_index = bucket % 8;
        // Flip the bucket's defining bit, randomize everything below it.
        target.0[byte_index] ^= 1 << bit_index;
        let mut rng = rand::thread_rng();
        for bit in 0..bit_index {
            if rng.next_u32() & 1 == 1 {
                target.0[byte_index] ^= 1 << bit;
            }
        }
        for byte in target.0.iter_mut().skip(NODE_ID_BYTES - bucket / 8) {
            *byte = (rng.next_u32() & 0xff) as u8;
        }
        target
    }

    /// Load the persisted node id from `path`, creating and persisting a fresh
    /// random one on first start
    pub async fn load_or_create(path: &Path) -> MeshResult<Self> {
        match fs::read_to_string(path).await {
            Ok(raw) => NodeId::from_hex(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let id = NodeId::random();
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, id.to_hex()).await?;
                info!("Generated node id {} and persisted to {:?}", id, path);
                Ok(id)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NodeId::from_hex(&raw).map_err(|e| D::Error::custom(e.to_string()))
    }
}

/// XOR distance between two identifiers, compared as a big-endian unsigned
/// integer
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; NODE_ID_BYTES]);

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({})", hex::encode(self.0))
    }
}

/// Identity and reachability of a remote peer.
///
/// The port is context-dependent: routing table entries carry the peer's DHT
/// endpoint, while `chunk:` provider lists carry the peer's chunk transport
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerHandle {
    pub node_id: NodeId,
    pub address: String,
    pub port: u16,
}

impl PeerHandle {
    pub fn new(node_id: NodeId, address: String, port: u16) -> Self {
        Self {
            node_id,
            address,
            port,
        }
    }

    /// `host:port` form accepted by the socket APIs
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Parse the endpoint into a socket address (numeric addresses only)
    pub fn socket_addr(&self) -> MeshResult<SocketAddr> {
        self.endpoint()
            .parse()
            .map_err(|e| MeshError::Network(format!("bad peer endpoint {}: {}", self.endpoint(), e)))
    }
}

impl fmt::Display for PeerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.node_id, self.endpoint())
    }
}
