// ===================================================================================================
// Node Supervisor - Lifecycle and Public Operations
// ===================================================================================================
//
// Starts the leaves in dependency order (chunk store and index, DHT overlay with
// bootstrap, background advertisement, chunk transport server), owns the root of the
// cancellation tree, and exposes the user-facing operations: publish, fetch, list,
// shutdown.
//
// Shutdown drains the transport accept loop and waits for in-flight serve tasks up to a
// grace period, performs one final announcement pass, then stops the DHT and the rest of
// the tree. Internal errors never terminate the process; only structured errors cross
// this boundary.
//
// ===================================================================================================

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::chunk_store::{ChunkStore, FileRecord};
use crate::config::Config;
use crate::dht::{Dht, NodeId};
use crate::error::{MeshError, MeshResult};
use crate::peer_engine::PeerEngine;
use crate::resilience::with_timeout;
use crate::transport::TransportServer;

pub struct NodeSupervisor {
    config: Config,
    store: Arc<ChunkStore>,
    dht: Arc<Dht>,
    engine: Arc<PeerEngine>,
    serve_addr: SocketAddr,
    root: CancellationToken,
    transport_cancel: CancellationToken,
    server_task: JoinHandle<()>,
}

impl NodeSupervisor {
    /// Bring up a node: open the store, join the overlay, advertise local
    /// content, start serving chunks. Configuration problems are fatal here.
    pub async fn start(config: Config) -> MeshResult<Self> {
        config.validate()?;

        let store = Arc::new(
            ChunkStore::open(config.storage_dir(), config.storage.chunk_size).await?,
        );
        let node_id = NodeId::load_or_create(&config.node_id_file()).await?;

        let root = CancellationToken::new();
        let dht_cancel = root.child_token();
        let transport_cancel = root.child_token();
        let engine_cancel = root.child_token();

        let dht_bind = SocketAddr::from(([0, 0, 0, 0], config.network.dht_port));
        let dht = Dht::start(node_id, dht_bind, &config, dht_cancel).await?;
        dht.bootstrap().await?;

        let serve_bind = SocketAddr::from(([0, 0, 0, 0], config.network.serve_port));
        let server = TransportServer::bind(
            serve_bind,
            store.clone(),
            config.network.max_serve_concurrency,
            transport_cancel.clone(),
        )
        .await?;
        let serve_addr = server.local_addr();

        let engine = Arc::new(PeerEngine::new(
            store.clone(),
            dht.clone(),
            serve_addr,
            &config,
            engine_cancel,
        ));
        engine.spawn_startup_announcements();

        let server_task = tokio::spawn(server.run());

        info!(
            "Node {} up: serving on {}, DHT on {}",
            node_id,
            serve_addr,
            dht.local_addr()
        );

        Ok(Self {
            config,
            store,
            dht,
            engine,
            serve_addr,
            root,
            transport_cancel,
            server_task,
        })
    }

    /// Store a file locally and advertise it to the network
    pub async fn publish(&self, path: &Path, k: usize, m: usize) -> MeshResult<String> {
        self.engine.publish(path, k, m).await
    }

    /// Locate, fetch and reassemble a file into `out_path`
    pub async fn fetch_file(&self, file_digest: &str, out_path: &Path) -> MeshResult<()> {
        self.engine.fetch_file(file_digest, out_path).await
    }

    /// Records of every locally stored file
    pub fn list_local(&self) -> Vec<FileRecord> {
        self.store.list_files()
    }

    /// Remove a locally stored file; unreferenced chunks are deleted
    pub async fn delete(&self, file_digest: &str) -> MeshResult<()> {
        self.store.delete(file_digest).await
    }

    pub fn serve_addr(&self) -> SocketAddr {
        self.serve_addr
    }

    /// Address remote peers should bootstrap against (the advertised DHT
    /// endpoint, not the local bind address)
    pub fn dht_addr(&self) -> SocketAddr {
        self.dht
            .local_handle()
            .socket_addr()
            .unwrap_or_else(|_| self.dht.local_addr())
    }

    pub fn node_id(&self) -> NodeId {
        self.dht.local_handle().node_id
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Graceful shutdown: drain the serve loop, one last announcement pass,
    /// then tear down the cancellation tree
    pub async fn shutdown(self) -> MeshResult<()> {
        info!("Shutting down node");

        self.transport_cancel.cancel();
        let mut server_task = self.server_task;
        let grace = self.config.shutdown_grace();
        let drained = with_timeout(
            grace,
            MeshError::Network("serve drain exceeded grace period".to_string()),
            async {
                let _ = (&mut server_task).await;
                Ok(())
            },
        )
        .await;
        if drained.is_err() {
            warn!("Serve tasks exceeded the {:?} grace period; aborting", grace);
            server_task.abort();
        }

        self.dht.final_announce().await;

        self.root.cancel();
        // Give the DHT loops a moment to observe cancellation before the
        // sockets drop with us.
        tokio::time::sleep(Duration::from_millis(50)).await;
        info!("Node stopped");
        Ok(())
    }
}

impl NodeSupervisor {
    /// Convenience used by error paths that still want a digest validated
    /// before any network work happens
    pub fn validate_digest(digest: &str) -> MeshResult<()> {
        if digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(())
        } else {
            Err(MeshError::BadRequest(format!(
                "'{}' is not a 64-character hex digest",
                digest
            )))
        }
    }
}
