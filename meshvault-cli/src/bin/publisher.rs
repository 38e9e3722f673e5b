use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use meshvault::clearinghouse::ClearingHouse;
use meshvault::delay_queue::PathDelayQueue;
use meshvault::deleter::FileDeleter;
use meshvault::filter::Filter;
use meshvault::server::Server;
use meshvault::{Archive, NodeConfig};
use tracing_subscriber::EnvFilter;

/// Serves the contents of an archive directory to any peer that asks.
#[derive(Parser, Debug)]
struct Args {
    /// Directory whose contents are published.
    #[arg(short, long)]
    archive: PathBuf,

    /// Address to listen for peer connections on.
    #[arg(short, long, default_value = "0.0.0.0:5881")]
    listen: SocketAddr,

    /// Piece size in bytes, applied to every file in the archive.
    #[arg(long, default_value_t = meshvault::piece::DEFAULT_PIECE_SIZE)]
    piece_size: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    let config = NodeConfig {
        archive_root: args.archive,
        listen_address: args.listen,
        piece_size: args.piece_size,
        ..NodeConfig::default()
    };

    tokio::select! {
        result = run(config) => match result {
            Ok(()) => ExitCode::from(0),
            Err(e) => {
                tracing::error!(error = %e, "publisher exited");
                e.code()
            }
        },
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted");
            ExitCode::from(3)
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum RunError {
    #[error("archive error: {0}")]
    Archive(#[from] meshvault::archive::ArchiveError),

    #[error("delay queue error: {0}")]
    DelayQueue(#[from] meshvault::delay_queue::DelayQueueError),

    #[error("listen error: {0}")]
    Listen(std::io::Error),

    #[error("server error: {0}")]
    Server(#[from] meshvault::server::ServerError),

    #[error("clearing house error: {0}")]
    ClearingHouse(#[from] meshvault::clearinghouse::ClearingHouseError),
}

impl RunError {
    /// Every runtime failure here maps to the same code; 1 (bad args)
    /// is handled by `try_parse` before `run` is called, and 3
    /// (interrupted) is handled by the `ctrl_c` race above.
    fn code(&self) -> ExitCode {
        ExitCode::from(2)
    }
}

async fn run(config: NodeConfig) -> Result<(), RunError> {
    let archive = Arc::new(Archive::open(&config.archive_root, config.piece_size).await?);
    let deletions = Arc::new(PathDelayQueue::open(
        config.archive_root.join(".sruth-deletions.heap"),
    )?);
    let _deleter = FileDeleter::spawn(deletions.clone(), config.archive_root.clone());

    let house = Arc::new(ClearingHouse::new(archive, deletions, Filter::everything()));
    let _watcher = house.spawn_watcher()?;

    let listener = tokio::net::TcpListener::bind(config.listen_address)
        .await
        .map_err(RunError::Listen)?;
    let port = listener.local_addr().map_err(RunError::Listen)?.port();
    println!("{port}");
    tracing::info!(address = %config.listen_address, "publisher listening");

    Server::new(house)
        .run(listener)
        .await
        .map_err(RunError::Server)
}
