// ===================================================================================================
// Chunk Store - Content-Addressable File Storage
// ===================================================================================================
//
// This module turns files into digest-addressed chunks and back:
// - Splits file bytes into fixed-size data shards, zero-padded to a stripe boundary
// - Produces parity shards per stripe through the erasure codec
// - Writes every shard to `<storage_dir>/<hex-digest>` via temp-file-then-rename
// - Maintains the file index (`index.json`), atomically replaced on every commit so a
//   concurrent reader never observes a torn record
//
// Store is all-or-nothing: the index commit happens last, and chunk files written for a
// failed store are removed again. Stale `*.tmp` files from a crashed writer are deleted
// when the store is opened. Chunk file names are content digests, so concurrent writes
// of the same digest are idempotent and the last completed rename wins.
//
// ===================================================================================================

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::erasure::ErasureCodec;
use crate::error::{MeshError, MeshResult};
use crate::logging::log_file_operation;
use crate::transport::ChunkProvider;

/// File name of the persisted index inside the storage directory
pub const INDEX_FILE: &str = "index.json";
const INDEX_TMP: &str = "index.json.tmp";
const TMP_SUFFIX: &str = ".tmp";

/// Digest algorithm stamped into the on-disk format header
pub const DIGEST_ALGORITHM: &str = "blake3";
/// Current on-disk format version
pub const FORMAT_VERSION: u32 = 1;

/// Hex length of a 256-bit digest
pub const DIGEST_HEX_LEN: usize = 64;

/// Lowercase hex digest of a byte sequence
pub fn digest_of(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

/// Whether a file name looks like a chunk digest
pub fn is_digest_name(name: &str) -> bool {
    name.len() == DIGEST_HEX_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Metadata for one complete stored file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// Digest of the concatenated original bytes; primary key
    pub file_digest: String,
    /// Optional display name, informational only
    #[serde(default)]
    pub original_name: Option<String>,
    /// Exact byte length of the original file
    pub size: u64,
    /// Data shards per stripe
    pub k: usize,
    /// Parity shards per stripe
    pub m: usize,
    /// Chunking unit used at store time
    pub chunk_size: usize,
    /// Ordered data chunk digests; length is a multiple of `k`
    pub data_chunks: Vec<String>,
    /// Ordered parity chunk digests; `m` per stripe
    pub parity_chunks: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
}

impl FileRecord {
    /// Number of `k + m` stripes in this file
    pub fn stripe_count(&self) -> usize {
        if self.k == 0 {
            0
        } else {
            self.data_chunks.len() / self.k
        }
    }

    /// Every chunk digest this record references, data first
    pub fn all_chunks(&self) -> impl Iterator<Item = &String> {
        self.data_chunks.iter().chain(self.parity_chunks.iter())
    }
}

/// On-disk format header; the digest algorithm is pinned so a future change
/// cannot silently corrupt an old store
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FormatHeader {
    version: u32,
    digest_algorithm: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct IndexFile {
    format: FormatHeader,
    files: HashMap<String, FileRecord>,
}

/// Content-addressable chunk store with a persisted file index.
///
/// Readers take lock-free snapshots of the index; writers are serialised by a
/// mutex held around the in-memory update and the atomic file replace.
pub struct ChunkStore {
    root: PathBuf,
    chunk_size: usize,
    index: RwLock<Arc<HashMap<String, FileRecord>>>,
    writer: Mutex<()>,
}

impl ChunkStore {
    /// Open (or create) a chunk store rooted at `root`.
    ///
    /// Deletes partial `*.tmp` files left behind by a crashed writer, then
    /// loads the index if one exists.
    pub async fn open(root: PathBuf, chunk_size: usize) -> MeshResult<Self> {
        if chunk_size == 0 {
            return Err(MeshError::Config("chunk_size must be positive".into()));
        }
        fs::create_dir_all(&root).await?;

        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                warn!("Removing stale temp file {}", name);
                let _ = fs::remove_file(entry.path()).await;
            }
        }

        let index_path = root.join(INDEX_FILE);
        let files = if index_path.exists() {
            let raw = fs::read(&index_path).await?;
            let index: IndexFile = serde_json::from_slice(&raw)?;
            if index.format.digest_algorithm != DIGEST_ALGORITHM {
                return Err(MeshError::Storage(format!(
                    "store was written with digest algorithm '{}', this build uses '{}'",
                    index.format.digest_algorithm, DIGEST_ALGORITHM
                )));
            }
            if index.format.version > FORMAT_VERSION {
                return Err(MeshError::Storage(format!(
                    "store format version {} is newer than supported version {}",
                    index.format.version, FORMAT_VERSION
                )));
            }
            index.files
        } else {
            HashMap::new()
        };

        info!(
            "Opened chunk store at {:?} with {} file records",
            root,
            files.len()
        );

        Ok(Self {
            root,
            chunk_size,
            index: RwLock::new(Arc::new(files)),
            writer: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Path of a chunk blob inside the storage directory
    pub fn chunk_path(&self, digest: &str) -> PathBuf {
        self.root.join(digest)
    }

    fn snapshot(&self) -> Arc<HashMap<String, FileRecord>> {
        self.index.read().unwrap().clone()
    }

    /// Split `path` into erasure-coded chunks and commit a file record.
    ///
    /// Returns the file digest. Storing bytes that are already present is an
    /// idempotent success: only `accessed_at` is bumped, no chunk is rewritten.
    pub async fn store(&self, path: &Path, k: usize, m: usize) -> MeshResult<String> {
        let bytes = fs::read(path).await?;
        let original_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned());
        self.store_bytes(&bytes, original_name, k, m).await
    }

    /// `store` over in-memory bytes; also the write path used when a fetched
    /// file is committed locally.
    pub async fn store_bytes(
        &self,
        bytes: &[u8],
        original_name: Option<String>,
        k: usize,
        m: usize,
    ) -> MeshResult<String> {
        let codec = ErasureCodec::new(k, m)?;
        let file_digest = digest_of(bytes);

        if self.snapshot().contains_key(&file_digest) {
            debug!("File {} already stored, bumping access time", file_digest);
            self.touch(&file_digest).await?;
            return Ok(file_digest);
        }

        let chunk_size = self.chunk_size;
        let raw_chunks = (bytes.len() + chunk_size - 1) / chunk_size;
        let data_count = if raw_chunks == 0 {
            0
        } else {
            ((raw_chunks + k - 1) / k) * k
        };

        let mut data_shards: Vec<Vec<u8>> = Vec::with_capacity(data_count);
        for i in 0..data_count {
            let mut shard = vec![0u8; chunk_size];
            let start = i * chunk_size;
            if start < bytes.len() {
                let end = std::cmp::min(start + chunk_size, bytes.len());
                shard[..end - start].copy_from_slice(&bytes[start..end]);
            }
            data_shards.push(shard);
        }

        let mut parity_shards: Vec<Vec<u8>> = Vec::with_capacity(m * (data_count / k.max(1)));
        for stripe in data_shards.chunks(k) {
            parity_shards.extend(codec.encode(stripe)?);
        }

        let data_chunks: Vec<String> = data_shards.iter().map(|s| digest_of(s)).collect();
        let parity_chunks: Vec<String> = parity_shards.iter().map(|s| digest_of(s)).collect();

        // Write shards first; the index commit below is the success point.
        let mut newly_written: Vec<String> = Vec::new();
        let write_result = async {
            for (digest, blob) in data_chunks
                .iter()
                .zip(data_shards.iter())
                .chain(parity_chunks.iter().zip(parity_shards.iter()))
            {
                if self.write_chunk_file(digest, blob).await? {
                    newly_written.push(digest.clone());
                }
            }
            MeshResult::Ok(())
        }
        .await;

        if let Err(e) = write_result {
            for digest in &newly_written {
                let _ = fs::remove_file(self.chunk_path(digest)).await;
            }
            return Err(e);
        }

        let now = Utc::now();
        let record = FileRecord {
            file_digest: file_digest.clone(),
            original_name,
            size: bytes.len() as u64,
            k,
            m,
            chunk_size,
            data_chunks,
            parity_chunks,
            created_at: now,
            accessed_at: now,
        };

        let commit = self
            .commit(|files| {
                files.insert(file_digest.clone(), record);
            })
            .await;
        if let Err(e) = commit {
            for digest in &newly_written {
                let _ = fs::remove_file(self.chunk_path(digest)).await;
            }
            return Err(e);
        }

        log_file_operation("store", &file_digest, &format!("{} bytes", bytes.len()));
        Ok(file_digest)
    }

    /// Reassemble a stored file into `out_path` (written atomically).
    ///
    /// Fails with `MissingChunk` on the first required data chunk that is
    /// absent locally; the peer engine may then fetch and reconstruct.
    pub async fn retrieve(&self, file_digest: &str, out_path: &Path) -> MeshResult<()> {
        let record = self
            .get_record(file_digest)
            .ok_or_else(|| MeshError::FileNotFound(file_digest.to_string()))?;

        let mut assembled: Vec<u8> = Vec::with_capacity(record.size as usize);
        for digest in &record.data_chunks {
            if assembled.len() >= record.size as usize {
                break;
            }
            let chunk = match self.read_chunk(digest).await {
                Ok(chunk) => chunk,
                Err(MeshError::NotFound(_)) => {
                    return Err(MeshError::MissingChunk(digest.clone()))
                }
                Err(e) => return Err(e),
            };
            assembled.extend_from_slice(&chunk);
        }
        assembled.truncate(record.size as usize);

        let file_name = out_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MeshError::BadRequest("output path has no file name".into()))?;
        let tmp_path = out_path.with_file_name(format!("{}{}", file_name, TMP_SUFFIX));
        fs::write(&tmp_path, &assembled).await?;
        fs::rename(&tmp_path, out_path).await?;

        self.touch(file_digest).await?;
        log_file_operation(
            "retrieve",
            file_digest,
            &format!("{} bytes -> {:?}", assembled.len(), out_path),
        );
        Ok(())
    }

    /// Read a chunk blob by digest
    pub async fn read_chunk(&self, digest: &str) -> MeshResult<Vec<u8>> {
        match fs::read(self.chunk_path(digest)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MeshError::NotFound(format!("chunk {}", digest)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write a chunk blob iff its bytes hash to `digest`
    pub async fn write_chunk(&self, digest: &str, bytes: &[u8]) -> MeshResult<()> {
        let actual = digest_of(bytes);
        if actual != digest {
            return Err(MeshError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        self.write_chunk_file(digest, bytes).await?;
        Ok(())
    }

    /// Whether a chunk blob is present locally
    pub async fn has_chunk(&self, digest: &str) -> bool {
        fs::try_exists(self.chunk_path(digest)).await.unwrap_or(false)
    }

    /// Enumerate chunk digests present in the storage directory without
    /// loading their contents
    pub async fn list_local_chunks(&self) -> MeshResult<Vec<String>> {
        let mut chunks = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_digest_name(&name) {
                chunks.push(name);
            }
        }
        Ok(chunks)
    }

    /// Snapshot of every file record
    pub fn list_files(&self) -> Vec<FileRecord> {
        self.snapshot().values().cloned().collect()
    }

    /// Look up one file record
    pub fn get_record(&self, file_digest: &str) -> Option<FileRecord> {
        self.snapshot().get(file_digest).cloned()
    }

    /// Remove a file record; chunk blobs are deleted once no remaining record
    /// references them
    pub async fn delete(&self, file_digest: &str) -> MeshResult<()> {
        let _guard = self.writer.lock().await;
        let mut files = (*self.snapshot()).clone();
        let record = files
            .remove(file_digest)
            .ok_or_else(|| MeshError::FileNotFound(file_digest.to_string()))?;

        let still_referenced: HashSet<&String> =
            files.values().flat_map(|r| r.all_chunks()).collect();
        let doomed: Vec<String> = record
            .all_chunks()
            .filter(|d| !still_referenced.contains(*d))
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        self.persist(&files).await?;
        *self.index.write().unwrap() = Arc::new(files);

        for digest in &doomed {
            if let Err(e) = fs::remove_file(self.chunk_path(digest)).await {
                warn!("Failed to remove chunk {}: {}", digest, e);
            }
        }

        log_file_operation(
            "delete",
            file_digest,
            &format!("{} chunks removed", doomed.len()),
        );
        Ok(())
    }

    /// Bump `accessed_at` on a record
    async fn touch(&self, file_digest: &str) -> MeshResult<()> {
        let digest = file_digest.to_string();
        self.commit(move |files| {
            if let Some(record) = files.get_mut(&digest) {
                record.accessed_at = Utc::now();
            }
        })
        .await
    }

    /// Apply a mutation to the index and atomically persist it. The new state
    /// becomes visible to readers only after the on-disk replace succeeded.
    async fn commit<F>(&self, mutate: F) -> MeshResult<()>
    where
        F: FnOnce(&mut HashMap<String, FileRecord>),
    {
        let _guard = self.writer.lock().await;
        let mut files = (*self.snapshot()).clone();
        mutate(&mut files);
        self.persist(&files).await?;
        *self.index.write().unwrap() = Arc::new(files);
        Ok(())
    }

    async fn persist(&self, files: &HashMap<String, FileRecord>) -> MeshResult<()> {
        let index = IndexFile {
            format: FormatHeader {
                version: FORMAT_VERSION,
                digest_algorithm: DIGEST_ALGORITHM.to_string(),
            },
            files: files.clone(),
        };
        let raw = serde_json::to_vec_pretty(&index)?;
        let tmp_path = self.root.join(INDEX_TMP);
        fs::write(&tmp_path, &raw).await?;
        fs::rename(&tmp_path, self.root.join(INDEX_FILE)).await?;
        Ok(())
    }

    /// Write one chunk blob via temp-then-rename. Returns whether the blob was
    /// newly written (false when a blob with this digest already existed).
    async fn write_chunk_file(&self, digest: &str, bytes: &[u8]) -> MeshResult<bool> {
        let final_path = self.chunk_path(digest);
        if fs::try_exists(&final_path).await.unwrap_or(false) {
            return Ok(false);
        }
        let tmp_path = self.root.join(format!("{}{}", digest, TMP_SUFFIX));
        fs::write(&tmp_path, bytes).await?;
        fs::rename(&tmp_path, &final_path).await?;
        Ok(true)
    }
}

#[async_trait]
impl ChunkProvider for ChunkStore {
    async fn chunk_bytes(&self, digest: &str) -> Option<bytes::Bytes> {
        self.read_chunk(digest).await.ok().map(bytes::Bytes::from)
    }

    async fn file_record(&self, digest: &str) -> Option<FileRecord> {
        self.get_record(digest)
    }
}
