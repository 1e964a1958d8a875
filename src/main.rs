// ===================================================================================================
// chunkmesh - Peer-to-Peer Content-Addressable File Distribution
// ===================================================================================================
//
// Files are split into fixed-size chunks identified by their BLAKE3 digest, protected by
// Reed-Solomon erasure coding, advertised in a Kademlia DHT, and fetched in parallel
// directly from the peers that hold them.
//
// The binary is a thin front-end over the node supervisor: it resolves configuration,
// runs one operation (or a long-lived serving node), and maps errors onto stable exit
// codes: 0 success, 1 usage error, 2 not found, 3 integrity failure, 4 network or
// unrecoverable failure.
//
// ===================================================================================================

use clap::Parser;
use colored::Colorize;

use chunkmesh::cli::{Cli, Commands};
use chunkmesh::config::Config;
use chunkmesh::error::{MeshError, MeshResult};
use chunkmesh::logging;
use chunkmesh::supervisor::NodeSupervisor;

#[tokio::main]
async fn main() {
    logging::init_logging_safe();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> MeshResult<()> {
    // Writing a config file needs no running node.
    if let Commands::Config { path } = &cli.command {
        let config = Config::default();
        config.save(path)?;
        println!("{} wrote default configuration to {:?}", "ok:".green().bold(), path);
        return Ok(());
    }

    let config = cli.resolved_config()?;
    let supervisor = NodeSupervisor::start(config.clone()).await?;

    let result = match &cli.command {
        Commands::Publish {
            path,
            data_shards,
            parity_shards,
        } => {
            let k = data_shards.unwrap_or(config.storage.data_shards);
            let m = parity_shards.unwrap_or(config.storage.parity_shards);
            match supervisor.publish(path, k, m).await {
                Ok(digest) => {
                    println!("{} published {:?}", "ok:".green().bold(), path);
                    println!("  digest: {}", digest);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Commands::Get {
            file_digest,
            output_path,
        } => {
            NodeSupervisor::validate_digest(file_digest)?;
            match supervisor.fetch_file(file_digest, output_path).await {
                Ok(()) => {
                    println!("{} fetched {} to {:?}", "ok:".green().bold(), file_digest, output_path);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Commands::List => {
            let mut records = supervisor.list_local();
            records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
            if records.is_empty() {
                println!("no files stored locally");
            }
            for record in records {
                let name = record.original_name.as_deref().unwrap_or("-");
                println!(
                    "{}  {:>10} bytes  k={} m={}  {}",
                    record.file_digest, record.size, record.k, record.m, name
                );
            }
            Ok(())
        }
        Commands::Info { file_digest } => {
            NodeSupervisor::validate_digest(file_digest)?;
            let record = supervisor
                .list_local()
                .into_iter()
                .find(|r| r.file_digest == *file_digest)
                .ok_or_else(|| MeshError::FileNotFound(file_digest.clone()))?;
            println!("digest:       {}", record.file_digest);
            println!("name:         {}", record.original_name.as_deref().unwrap_or("-"));
            println!("size:         {} bytes", record.size);
            println!("shards:       k={} m={} chunk_size={}", record.k, record.m, record.chunk_size);
            println!("data chunks:  {}", record.data_chunks.len());
            println!("parity chunks: {}", record.parity_chunks.len());
            println!("created:      {}", record.created_at.format("%Y-%m-%d %H:%M:%S"));
            println!("accessed:     {}", record.accessed_at.format("%Y-%m-%d %H:%M:%S"));
            Ok(())
        }
        Commands::Delete { file_digest } => {
            NodeSupervisor::validate_digest(file_digest)?;
            match supervisor.delete(file_digest).await {
                Ok(()) => {
                    println!("{} deleted {}", "ok:".green().bold(), file_digest);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Commands::Serve => {
            println!(
                "{} node {} serving on {}, DHT on {} (ctrl-c to stop)",
                "ok:".green().bold(),
                supervisor.node_id(),
                supervisor.serve_addr(),
                supervisor.dht_addr()
            );
            tokio::signal::ctrl_c()
                .await
                .map_err(|e| MeshError::Io(e.to_string()))?;
            Ok(())
        }
        Commands::Config { .. } => unreachable!("handled above"),
    };

    // Always attempt a clean shutdown so the final announcement pass runs.
    let shutdown = supervisor.shutdown().await;
    result?;
    shutdown
}
