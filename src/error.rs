// ===================================================================================================
// Error Handling System - Core Error Types
// ===================================================================================================
//
// This module defines the error types used across the chunkmesh engine. Every component
// returns structured `MeshError` values; retryable failures (peer timeouts, digest
// mismatches from a single holder) are handled by the peer engine, and only terminal,
// user-visible errors cross the supervisor boundary.
//
// Error categories:
// - System-level: Io, Config, Serialization
// - Store-level: NotFound, FileNotFound, MissingChunk, DigestMismatch, Storage
// - Network-level: Transport (framed TCP), RpcTimeout (DHT), Network
// - Engine-level: Unrecoverable, Cancelled, BadRequest
//
// ===================================================================================================

use std::error::Error as StdError;
use std::fmt;

use crate::transport::TransportError;

/// Error type for all chunkmesh operations.
///
/// Each variant represents a category of failure with enough payload for callers
/// to branch on. The peer engine recovers from per-peer failures (`Transport`,
/// `DigestMismatch`, `RpcTimeout`) by trying the next candidate; everything else
/// is surfaced to the caller.
#[derive(Debug)]
pub enum MeshError {
    /// File system I/O failure (read/write/rename/permissions).
    Io(String),

    /// Invalid or unusable configuration. Fatal at node startup.
    Config(String),

    /// JSON or hex encoding/decoding failure.
    Serialization(String),

    /// A DHT key or generic resource could not be found.
    NotFound(String),

    /// The requested file digest is not known locally or in the network.
    FileNotFound(String),

    /// A data chunk referenced by a file record is absent from the local store.
    /// Carries the hex digest of the first missing chunk.
    MissingChunk(String),

    /// Received bytes do not hash to the requested digest. Never cached.
    DigestMismatch { expected: String, actual: String },

    /// Point-to-point transport failure (timeout, short read, overflow, connect).
    Transport(TransportError),

    /// A DHT RPC went unanswered within its deadline.
    RpcTimeout(String),

    /// A stripe ended up with fewer than `k` valid shards; the file cannot be
    /// reconstructed from what the network still holds.
    Unrecoverable(String),

    /// The surrounding operation was cancelled.
    Cancelled,

    /// Chunk store or erasure coding failure.
    Storage(String),

    /// Network-level failure that is not a single transport request.
    Network(String),

    /// Malformed request or invalid caller input.
    BadRequest(String),
}

impl MeshError {
    /// Exit code for the CLI wrapper: 0 success, 1 usage, 2 not found,
    /// 3 integrity failure, 4 network/unrecoverable.
    pub fn exit_code(&self) -> i32 {
        match self {
            MeshError::BadRequest(_) | MeshError::Config(_) => 1,
            MeshError::NotFound(_) | MeshError::FileNotFound(_) | MeshError::MissingChunk(_) => 2,
            MeshError::DigestMismatch { .. } => 3,
            MeshError::Transport(_)
            | MeshError::RpcTimeout(_)
            | MeshError::Network(_)
            | MeshError::Unrecoverable(_) => 4,
            _ => 4,
        }
    }
}

impl fmt::Display for MeshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshError::Io(e) => write!(f, "IO error: {}", e),
            MeshError::Config(e) => write!(f, "Configuration error: {}", e),
            MeshError::Serialization(e) => write!(f, "Serialization error: {}", e),
            MeshError::NotFound(e) => write!(f, "Not found: {}", e),
            MeshError::FileNotFound(e) => write!(f, "File not found: {}", e),
            MeshError::MissingChunk(d) => write!(f, "Missing chunk: {}", d),
            MeshError::DigestMismatch { expected, actual } => {
                write!(f, "Digest mismatch: expected {}, got {}", expected, actual)
            }
            MeshError::Transport(e) => write!(f, "Transport error: {}", e),
            MeshError::RpcTimeout(e) => write!(f, "RPC timeout: {}", e),
            MeshError::Unrecoverable(e) => write!(f, "Unrecoverable: {}", e),
            MeshError::Cancelled => write!(f, "Operation cancelled"),
            MeshError::Storage(e) => write!(f, "Storage error: {}", e),
            MeshError::Network(e) => write!(f, "Network error: {}", e),
            MeshError::BadRequest(e) => write!(f, "Bad request: {}", e),
        }
    }
}

impl StdError for MeshError {}

impl From<std::io::Error> for MeshError {
    fn from(error: std::io::Error) -> Self {
        MeshError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(error: serde_json::Error) -> Self {
        MeshError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for MeshError {
    fn from(error: hex::FromHexError) -> Self {
        MeshError::Serialization(format!("Hex decode error: {}", error))
    }
}

impl From<reed_solomon_erasure::Error> for MeshError {
    fn from(error: reed_solomon_erasure::Error) -> Self {
        MeshError::Storage(format!("Reed-Solomon error: {:?}", error))
    }
}

impl From<TransportError> for MeshError {
    fn from(error: TransportError) -> Self {
        MeshError::Transport(error)
    }
}

impl From<toml::de::Error> for MeshError {
    fn from(error: toml::de::Error) -> Self {
        MeshError::Config(format!("Config parse error: {}", error))
    }
}

/// Result type alias for chunkmesh operations
pub type MeshResult<T> = Result<T, MeshError>;
