/// Command Line Interface Module
///
/// Thin front-end over the node supervisor. Commands map onto the public node
/// operations; every network and storage default can be overridden from the
/// command line or a TOML configuration file.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;
use crate::error::MeshResult;

/// Main CLI structure for the chunkmesh node
#[derive(Parser, Debug, Clone)]
#[command(name = "chunkmesh", about = "Peer-to-peer content-addressable file distribution")]
pub struct Cli {
    /// Path to a TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Chunk and index directory
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,
    /// TCP port for serving chunks (0 for ephemeral)
    #[arg(long)]
    pub serve_port: Option<u16>,
    /// UDP port for the DHT overlay (0 for ephemeral)
    #[arg(long)]
    pub dht_port: Option<u16>,
    /// Bootstrap peer address (host:port of its DHT endpoint); repeatable
    #[arg(long = "bootstrap-peer")]
    pub bootstrap_peers: Vec<String>,
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands of the chunkmesh node
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Store a file locally and advertise it to the network
    Publish {
        /// Path to the file to store
        #[arg(value_name = "FILE")]
        path: PathBuf,
        /// Data shards per stripe (defaults from configuration)
        #[arg(long)]
        data_shards: Option<usize>,
        /// Parity shards per stripe (defaults from configuration)
        #[arg(long)]
        parity_shards: Option<usize>,
    },
    /// Fetch a file from the network by digest
    Get {
        /// 64-character hex file digest
        #[arg(value_name = "DIGEST")]
        file_digest: String,
        /// Path where the fetched file will be saved
        #[arg(value_name = "OUTPUT_PATH")]
        output_path: PathBuf,
    },
    /// List locally stored files
    List,
    /// Show details of one locally stored file
    Info {
        /// 64-character hex file digest
        #[arg(value_name = "DIGEST")]
        file_digest: String,
    },
    /// Remove a locally stored file and its unreferenced chunks
    Delete {
        /// 64-character hex file digest
        #[arg(value_name = "DIGEST")]
        file_digest: String,
    },
    /// Run a serving node until interrupted
    Serve,
    /// Write a default configuration file
    Config {
        /// Where to write the configuration
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
}

impl Cli {
    /// Effective configuration: file (or defaults) with command-line overrides
    /// applied on top
    pub fn resolved_config(&self) -> MeshResult<Config> {
        let mut config = Config::load_or_default(self.config.clone())?;
        if let Some(dir) = &self.storage_dir {
            config.storage.storage_dir = Some(dir.clone());
        }
        if let Some(port) = self.serve_port {
            config.network.serve_port = port;
        }
        if let Some(port) = self.dht_port {
            config.network.dht_port = port;
        }
        if !self.bootstrap_peers.is_empty() {
            config.dht.bootstrap_peers = self.bootstrap_peers.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
