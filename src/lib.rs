// ===================================================================================================
// chunkmesh Library - Content-Addressable Distribution Engine
// ===================================================================================================
//
// Library surface of the chunkmesh peer-to-peer file distribution engine. The crate is
// both a standalone node binary and an embeddable library; every component takes its
// dependencies explicitly and nothing lives in global state.
//
// Component layering (leaves first):
// - chunk_store / erasure: content-addressable storage and Reed-Solomon coding
// - transport: framed TCP protocol for chunk and metadata transfer between peers
// - dht: Kademlia overlay over UDP JSON datagrams for peer and content discovery
// - peer_engine: advertisement, discovery-driven parallel fetch, reconstruction
// - supervisor: lifecycle, cancellation tree, public operations
//
// ===================================================================================================

// ===== CORE STORAGE =====
pub mod chunk_store;   // Digest-addressed chunk storage and the persisted file index
pub mod erasure;       // Reed-Solomon (k, m) erasure codec over GF(2^8)

// ===== NETWORK =====
pub mod dht;           // Kademlia overlay: routing, RPCs, iterative lookup, replication
pub mod transport;     // Framed point-to-point chunk transfer protocol

// ===== ENGINE =====
pub mod peer_engine;   // Advertisement, parallel fetch and reconstruction
pub mod supervisor;    // Node lifecycle and public operations

// ===== SYSTEM =====
pub mod cli;           // Command line parsing
pub mod config;        // TOML configuration and protocol defaults
pub mod error;         // Core error types
pub mod logging;       // Structured logging setup
pub mod resilience;    // Retry with exponential backoff, timeout wrapper

// ===== CONVENIENCE RE-EXPORTS =====

/// Content-addressable storage
pub use chunk_store::{ChunkStore, FileRecord};

/// Core error and result types
pub use error::{MeshError, MeshResult};

/// Erasure codec
pub use erasure::ErasureCodec;

/// DHT overlay node and peer identity
pub use dht::{Dht, NodeId, PeerHandle};

/// Node lifecycle handle
pub use supervisor::NodeSupervisor;
