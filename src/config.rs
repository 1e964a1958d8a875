use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MeshError, MeshResult};

/// Configuration for a chunkmesh node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// DHT overlay configuration
    pub dht: DhtConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// TCP port the chunk transport server listens on (0 for ephemeral)
    pub serve_port: u16,
    /// UDP port the DHT overlay binds (0 for ephemeral)
    pub dht_port: u16,
    /// Address other peers should dial us at; defaults to 127.0.0.1
    pub advertise_address: Option<String>,
    /// Per-request transport deadline in seconds
    pub transport_timeout_secs: u64,
    /// Maximum concurrent serve connections; further accepts wait
    pub max_serve_concurrency: usize,
    /// Maximum parallel chunk fetches per file retrieval
    pub max_inflight: usize,
    /// Grace period for draining serve tasks on shutdown
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk and index directory; resolved to a platform default when unset
    pub storage_dir: Option<PathBuf>,
    /// File holding the persistent 160-bit node id; defaults inside storage_dir
    pub node_id_file: Option<PathBuf>,
    /// Chunking unit in bytes
    pub chunk_size: usize,
    /// Default number of data shards per stripe
    pub data_shards: usize,
    /// Default number of parity shards per stripe
    pub parity_shards: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhtConfig {
    /// Bootstrap peer addresses (host:port of their DHT endpoints)
    pub bootstrap_peers: Vec<String>,
    /// Replication factor K: bucket width and publication fan-out
    pub replication_factor: usize,
    /// Lookup parallelism α
    pub alpha: usize,
    /// Time-to-live for published keys in seconds
    pub ttl_secs: u64,
    /// Single RPC deadline in seconds
    pub rpc_timeout_secs: u64,
    /// End-to-end iterative lookup deadline in seconds
    pub lookup_timeout_secs: u64,
    /// Bucket refresh cadence in seconds
    pub refresh_interval_secs: u64,
    /// Expiry sweep cadence in seconds
    pub sweep_interval_secs: u64,
    /// Maximum entries in the local key/value store
    pub store_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log to file
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                serve_port: 9000,
                dht_port: 8468,
                advertise_address: None,
                transport_timeout_secs: 30,
                max_serve_concurrency: 64,
                max_inflight: 5,
                shutdown_grace_secs: 10,
            },
            storage: StorageConfig {
                storage_dir: None,
                node_id_file: None,
                chunk_size: 65_536,
                data_shards: 4,
                parity_shards: 1,
            },
            dht: DhtConfig {
                bootstrap_peers: vec![],
                replication_factor: 20,
                alpha: 3,
                ttl_secs: 3_600,
                rpc_timeout_secs: 5,
                lookup_timeout_secs: 20,
                refresh_interval_secs: 3_600,
                sweep_interval_secs: 60,
                store_capacity: 65_536,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load_or_default(config_path: Option<PathBuf>) -> MeshResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str)?;
                config.validate()?;
                tracing::info!("Loaded configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("Using default configuration");
        Ok(Config::default())
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &PathBuf) -> MeshResult<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| MeshError::Serialization(format!("Config serialize error: {}", e)))?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    /// Reject parameter combinations no component can run with
    pub fn validate(&self) -> MeshResult<()> {
        let k = self.storage.data_shards;
        let m = self.storage.parity_shards;
        if k < 1 {
            return Err(MeshError::Config("data_shards must be at least 1".into()));
        }
        if k + m > 255 {
            return Err(MeshError::Config(
                "data_shards + parity_shards must not exceed 255".into(),
            ));
        }
        if self.storage.chunk_size == 0 {
            return Err(MeshError::Config("chunk_size must be positive".into()));
        }
        if self.dht.replication_factor == 0 || self.dht.alpha == 0 {
            return Err(MeshError::Config(
                "replication_factor and alpha must be positive".into(),
            ));
        }
        if self.network.max_inflight == 0 || self.network.max_serve_concurrency == 0 {
            return Err(MeshError::Config(
                "max_inflight and max_serve_concurrency must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the chunk storage directory, applying the platform default
    pub fn storage_dir(&self) -> PathBuf {
        self.storage.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("chunkmesh")
                .join("storage")
        })
    }

    /// Resolve the node id file, defaulting next to the chunk storage
    pub fn node_id_file(&self) -> PathBuf {
        self.storage
            .node_id_file
            .clone()
            .unwrap_or_else(|| self.storage_dir().join("node_id"))
    }

    pub fn transport_timeout(&self) -> Duration {
        Duration::from_secs(self.network.transport_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.network.shutdown_grace_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.dht.rpc_timeout_secs)
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.dht.lookup_timeout_secs)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.dht.ttl_secs)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.dht.refresh_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.dht.sweep_interval_secs)
    }
}
