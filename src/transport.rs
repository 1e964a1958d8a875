// ===================================================================================================
// Wire Transport - Point-to-Point Chunk Protocol
// ===================================================================================================
//
// Framed request/response protocol between peers for chunk and metadata transfer, over a
// reliable ordered byte stream (TCP). Every message is a 4-byte big-endian length prefix
// followed by a UTF-8 JSON object. Chunk payloads are raw: the server sends a CHUNK_START
// header frame announcing the size, then exactly that many payload bytes on the same
// connection.
//
// The server accepts up to `max_serve_concurrency` connections (further accepts wait on
// the semaphore), answers one request per connection, and closes. It reads chunk bytes
// through a read-only `ChunkProvider` capability rather than holding a reference to the
// peer engine. The client enforces a per-request deadline, reads exactly the announced
// payload length, and verifies the digest of received bytes before reporting success; a
// mismatch is surfaced and never cached.
//
// ===================================================================================================

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chunk_store::{digest_of, FileRecord};
use crate::error::{MeshError, MeshResult};
use crate::resilience::with_timeout;

/// Upper bound on a JSON control frame
const MAX_FRAME_BYTES: u32 = 1 << 20;
/// Upper bound on a raw chunk payload a client will accept
pub const MAX_CHUNK_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Error code sent when the requested object is absent
pub const ERR_NOT_FOUND: &str = "NOT_FOUND";
/// Error code sent for unknown or malformed messages
pub const ERR_BAD_REQUEST: &str = "BAD_REQUEST";

/// Transport-level failures, nested into `MeshError::Transport`
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request deadline exceeded")]
    Timeout,
    #[error("connection closed before the announced payload arrived")]
    ShortRead,
    #[error("peer sent more payload bytes than announced")]
    Overflow,
    #[error("malformed frame: {0}")]
    BadFrame(String),
    #[error("peer replied {code}: {message}")]
    Remote { code: String, message: String },
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Wire messages. Unknown JSON fields are ignored on receipt so the protocol
/// can grow without breaking old peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    #[serde(rename = "GET_CHUNK")]
    GetChunk { chunk_hash: String },
    #[serde(rename = "CHUNK_START")]
    ChunkStart { size: u64 },
    #[serde(rename = "GET_FILE_METADATA")]
    GetFileMetadata { file_hash: String },
    #[serde(rename = "FILE_METADATA")]
    FileMetadata {
        #[serde(flatten)]
        record: FileRecord,
    },
    #[serde(rename = "ERROR")]
    Error { code: String, message: String },
}

impl fmt::Display for WireMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireMessage::GetChunk { chunk_hash } => write!(f, "GET_CHUNK {}", chunk_hash),
            WireMessage::ChunkStart { size } => write!(f, "CHUNK_START {} bytes", size),
            WireMessage::GetFileMetadata { file_hash } => {
                write!(f, "GET_FILE_METADATA {}", file_hash)
            }
            WireMessage::FileMetadata { record } => {
                write!(f, "FILE_METADATA {}", record.file_digest)
            }
            WireMessage::Error { code, message } => write!(f, "ERROR {}: {}", code, message),
        }
    }
}

/// Read-only capability handed to the serve loop: digest to bytes, digest to
/// record. Deliberately not the whole engine. `Bytes` keeps the payload
/// reference-counted between the store and the socket writer.
#[async_trait]
pub trait ChunkProvider: Send + Sync {
    async fn chunk_bytes(&self, digest: &str) -> Option<Bytes>;
    async fn file_record(&self, digest: &str) -> Option<FileRecord>;
}

/// Write one length-prefixed JSON frame
pub async fn write_frame<W>(writer: &mut W, msg: &WireMessage) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(msg)
        .map_err(|e| TransportError::BadFrame(format!("encode: {}", e)))?;
    if body.len() > MAX_FRAME_BYTES as usize {
        return Err(TransportError::BadFrame(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame
pub async fn read_frame<R>(reader: &mut R) -> Result<WireMessage, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(map_eof)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::BadFrame(format!(
            "announced frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(map_eof)?;
    serde_json::from_slice(&body).map_err(|e| TransportError::BadFrame(format!("decode: {}", e)))
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ShortRead
    } else {
        TransportError::Io(e)
    }
}

// ---------------------------------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------------------------------

/// Requesting side of the chunk protocol
#[derive(Debug, Clone)]
pub struct TransportClient {
    request_timeout: Duration,
}

impl TransportClient {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }

    /// Fetch a chunk from `addr` and verify its digest.
    ///
    /// Returns the verified bytes. Transport failures (`Timeout`, `ShortRead`,
    /// `Overflow`, connection errors) and `DigestMismatch` are all retryable
    /// against another holder by the caller.
    pub async fn get_chunk(&self, addr: SocketAddr, chunk_hash: &str) -> MeshResult<Vec<u8>> {
        let bytes = with_timeout(
            self.request_timeout,
            TransportError::Timeout,
            self.get_chunk_inner(addr, chunk_hash),
        )
        .await?;

        let actual = digest_of(&bytes);
        if actual != chunk_hash {
            return Err(MeshError::DigestMismatch {
                expected: chunk_hash.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    async fn get_chunk_inner(
        &self,
        addr: SocketAddr,
        chunk_hash: &str,
    ) -> Result<Vec<u8>, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(
            &mut stream,
            &WireMessage::GetChunk {
                chunk_hash: chunk_hash.to_string(),
            },
        )
        .await?;

        match read_frame(&mut stream).await? {
            WireMessage::ChunkStart { size } => {
                if size > MAX_CHUNK_PAYLOAD {
                    return Err(TransportError::Overflow);
                }
                let mut payload = vec![0u8; size as usize];
                stream.read_exact(&mut payload).await.map_err(map_eof)?;

                // The server closes after one reply; any trailing byte means it
                // sent more than it announced.
                let mut probe = [0u8; 1];
                match stream.read(&mut probe).await {
                    Ok(0) => {}
                    Ok(_) => return Err(TransportError::Overflow),
                    Err(_) => {}
                }
                Ok(payload)
            }
            WireMessage::Error { code, message } => Err(TransportError::Remote { code, message }),
            other => Err(TransportError::BadFrame(format!(
                "unexpected reply to GET_CHUNK: {}",
                other
            ))),
        }
    }

    /// Fetch a file record from `addr`
    pub async fn get_file_metadata(
        &self,
        addr: SocketAddr,
        file_hash: &str,
    ) -> MeshResult<FileRecord> {
        let record = with_timeout(
            self.request_timeout,
            TransportError::Timeout,
            self.get_file_metadata_inner(addr, file_hash),
        )
        .await?;
        Ok(record)
    }

    async fn get_file_metadata_inner(
        &self,
        addr: SocketAddr,
        file_hash: &str,
    ) -> Result<FileRecord, TransportError> {
        let mut stream = TcpStream::connect(addr).await?;
        write_frame(
            &mut stream,
            &WireMessage::GetFileMetadata {
                file_hash: file_hash.to_string(),
            },
        )
        .await?;

        match read_frame(&mut stream).await? {
            WireMessage::FileMetadata { record } => Ok(record),
            WireMessage::Error { code, message } => Err(TransportError::Remote { code, message }),
            other => Err(TransportError::BadFrame(format!(
                "unexpected reply to GET_FILE_METADATA: {}",
                other
            ))),
        }
    }
}

// ---------------------------------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------------------------------

/// Serving side of the chunk protocol
pub struct TransportServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    provider: Arc<dyn ChunkProvider>,
    limit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl TransportServer {
    /// Bind the serve socket. Port 0 picks an ephemeral port; the bound
    /// address is available through `local_addr`.
    pub async fn bind(
        addr: SocketAddr,
        provider: Arc<dyn ChunkProvider>,
        max_serve_concurrency: usize,
        cancel: CancellationToken,
    ) -> MeshResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeshError::Network(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| MeshError::Network(format!("local_addr: {}", e)))?;
        info!("Chunk transport listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
            provider,
            limit: Arc::new(Semaphore::new(max_serve_concurrency)),
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop. Returns once cancelled and every in-flight serve task has
    /// finished; the supervisor bounds that drain with its grace period.
    pub async fn run(self) {
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            // Acquire a serve slot before accepting; at the cap, further
            // accepts wait here instead of queueing connections unboundedly.
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let (stream, peer_addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            debug!("Serving connection from {}", peer_addr);
            let provider = self.provider.clone();
            tasks.spawn(async move {
                let _permit = permit;
                if let Err(e) = handle_connection(stream, provider).await {
                    debug!("Serve connection from {} ended: {}", peer_addr, e);
                }
            });

            // Reap finished tasks so the set does not grow with every request.
            while tasks.try_join_next().is_some() {}
        }

        drop(self.listener);
        while tasks.join_next().await.is_some() {}
        info!("Chunk transport on {} drained", self.local_addr);
    }
}

/// Parse one request, act on it, reply, close
async fn handle_connection(
    mut stream: TcpStream,
    provider: Arc<dyn ChunkProvider>,
) -> Result<(), TransportError> {
    let request = match read_frame(&mut stream).await {
        Ok(request) => request,
        Err(TransportError::BadFrame(_)) => {
            let reply = WireMessage::Error {
                code: ERR_BAD_REQUEST.to_string(),
                message: "malformed request".to_string(),
            };
            write_frame(&mut stream, &reply).await?;
            return Ok(());
        }
        Err(e) => return Err(e),
    };

    match request {
        WireMessage::GetChunk { chunk_hash } => match provider.chunk_bytes(&chunk_hash).await {
            Some(bytes) => {
                write_frame(
                    &mut stream,
                    &WireMessage::ChunkStart {
                        size: bytes.len() as u64,
                    },
                )
                .await?;
                stream.write_all(&bytes).await?;
                stream.flush().await?;
            }
            None => {
                write_frame(
                    &mut stream,
                    &WireMessage::Error {
                        code: ERR_NOT_FOUND.to_string(),
                        message: format!("chunk {} not held here", chunk_hash),
                    },
                )
                .await?;
            }
        },
        WireMessage::GetFileMetadata { file_hash } => {
            match provider.file_record(&file_hash).await {
                Some(record) => {
                    write_frame(&mut stream, &WireMessage::FileMetadata { record }).await?;
                }
                None => {
                    write_frame(
                        &mut stream,
                        &WireMessage::Error {
                            code: ERR_NOT_FOUND.to_string(),
                            message: format!("file {} not held here", file_hash),
                        },
                    )
                    .await?;
                }
            }
        }
        other => {
            write_frame(
                &mut stream,
                &WireMessage::Error {
                    code: ERR_BAD_REQUEST.to_string(),
                    message: format!("unexpected request: {}", other),
                },
            )
            .await?;
        }
    }

    Ok(())
}
