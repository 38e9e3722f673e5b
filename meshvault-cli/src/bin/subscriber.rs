use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use meshvault::clearinghouse::ClearingHouse;
use meshvault::connection::Connection;
use meshvault::delay_queue::PathDelayQueue;
use meshvault::deleter::FileDeleter;
use meshvault::filter::{Filter, Predicate};
use meshvault::peer::Peer;
use meshvault::server::{Server, HANDSHAKE_TIMEOUT};
use meshvault::tracker::{StaticTracker, Tracker};
use meshvault::wire::{FilterHandshake, HandshakeCodec, WireError};
use meshvault::Archive;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

/// Subscribes to a slice of a remote archive, described by a
/// subscription file of glob patterns, and pulls matching content in
/// while serving it onward to its own peers.
#[derive(Parser, Debug)]
struct Args {
    /// Directory this node's archive is materialized into.
    #[arg(short, long)]
    archive: PathBuf,

    /// Address to listen for peer connections on.
    #[arg(short, long, default_value = "0.0.0.0:5882")]
    listen: SocketAddr,

    /// Line-oriented file of glob patterns describing what to fetch.
    /// Omitting this flag entirely subscribes to the whole archive. A
    /// file that is present but blank (or contains only comments)
    /// subscribes to nothing.
    #[arg(short, long)]
    subscription: Option<PathBuf>,

    /// Peers to connect to directly, bypassing tracker discovery.
    #[arg(short, long, num_args = 1..)]
    peer: Vec<SocketAddr>,

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

    match run(args).await {
        Ok(()) => ExitCode::from(0),
        Err(e) => {
            tracing::error!(error = %e, "subscriber exited");
            e.code()
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

    #[error("subscription file error: {0}")]
    Subscription(#[from] meshvault::filter::FilterError),

    #[error("subscription file io error: {0}")]
    SubscriptionIo(std::io::Error),

    #[error("no peer addresses given")]
    NoPeers,

    #[error("tracker error: {0}")]
    Tracker(#[from] meshvault::tracker::TrackerError),

    #[error("handshake error: {0}")]
    Handshake(#[from] WireError),

    #[error("clearing house error: {0}")]
    ClearingHouse(#[from] meshvault::clearinghouse::ClearingHouseError),
}

impl RunError {
    /// 2 bad archive root, 3 bad subscription file, 4 no peer
    /// addresses, 5 everything else that can go wrong at runtime.
    fn code(&self) -> ExitCode {
        match self {
            RunError::Archive(_) => ExitCode::from(2),
            RunError::Subscription(_) | RunError::SubscriptionIo(_) => ExitCode::from(3),
            RunError::NoPeers => ExitCode::from(4),
            RunError::DelayQueue(_)
            | RunError::Listen(_)
            | RunError::Server(_)
            | RunError::Tracker(_)
            | RunError::Handshake(_)
            | RunError::ClearingHouse(_) => ExitCode::from(5),
        }
    }
}

/// Parses a line-oriented glob subscription file: one pattern per
/// line, blank lines and lines starting with `#` ignored. A file with
/// no patterns left after that parses to `Filter::Nothing`.
fn parse_subscription(contents: &str) -> Result<Filter, RunError> {
    let mut predicates = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        predicates.push(Predicate::new(line)?);
    }
    Ok(Filter::of(predicates))
}

async fn load_filter(path: Option<&PathBuf>) -> Result<Filter, RunError> {
    let Some(path) = path else {
        return Ok(Filter::everything());
    };
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(RunError::SubscriptionIo)?;
    parse_subscription(&contents)
}

async fn run(args: Args) -> Result<(), RunError> {
    if args.peer.is_empty() {
        return Err(RunError::NoPeers);
    }

    let archive = Arc::new(Archive::open(&args.archive, args.piece_size).await?);
    let deletions = Arc::new(PathDelayQueue::open(
        args.archive.join(".sruth-deletions.heap"),
    )?);
    let _deleter = FileDeleter::spawn(deletions.clone(), args.archive.clone());

    let filter = load_filter(args.subscription.as_ref()).await?;
    let house = Arc::new(ClearingHouse::new(archive, deletions, filter.clone()));
    let _watcher = house.spawn_watcher()?;

    let tracker = StaticTracker::new(args.peer.clone());
    let peers = tracker.announce(&filter).await?;
    for peer_addr in peers {
        let house = house.clone();
        let filter = filter.clone();
        tokio::spawn(async move {
            if let Err(e) = connect_out(peer_addr, filter, house).await {
                tracing::warn!(peer = %peer_addr, error = %e, "outbound connection failed");
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .map_err(RunError::Listen)?;
    tracing::info!(address = %args.listen, "subscriber listening");

    let server = Server::new(house.clone());
    tokio::select! {
        result = server.run(listener) => result.map_err(RunError::Server),
        _ = house.wait_until_satisfied() => {
            tracing::info!("subscription satisfied, shutting down");
            Ok(())
        }
    }
}

/// Connects out to a peer, exchanges filter handshakes, and spawns the
/// peer's cooperative tasks using the handshake *reply* as its filter:
/// what the remote told us it holds, not what we asked it for.
#[tracing::instrument(skip(house))]
async fn connect_out(
    addr: SocketAddr,
    filter: Filter,
    house: Arc<ClearingHouse>,
) -> Result<(), RunError> {
    let stream = tokio::net::TcpStream::connect(addr)
        .await
        .map_err(RunError::SubscriptionIo)?;
    let mut framed = Framed::new(stream, HandshakeCodec);
    futures::SinkExt::send(&mut framed, FilterHandshake::new(filter)).await?;

    let remote_filter = match tokio::time::timeout(HANDSHAKE_TIMEOUT, futures::StreamExt::next(&mut framed)).await {
        Ok(Some(Ok(handshake))) => handshake.filter,
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(None) => {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed during handshake",
            ))
            .into())
        }
        Err(_) => {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "handshake reply timed out",
            ))
            .into())
        }
    };

    let std_stream = framed.into_inner().into_std().map_err(RunError::SubscriptionIo)?;
    let notices = tokio::net::TcpStream::from_std(std_stream.try_clone().map_err(RunError::SubscriptionIo)?)
        .map_err(RunError::SubscriptionIo)?;
    let requests = tokio::net::TcpStream::from_std(std_stream.try_clone().map_err(RunError::SubscriptionIo)?)
        .map_err(RunError::SubscriptionIo)?;
    let data = tokio::net::TcpStream::from_std(std_stream).map_err(RunError::SubscriptionIo)?;

    let connection = Connection::new(notices, requests, data);
    let id = house.allocate_peer_id();
    Peer::spawn(id, connection, remote_filter, house).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_globs_and_skips_comments() {
        let filter = parse_subscription("# comment\n\ndocs/**/*.pdf\nimages/*.png\n").unwrap();
        assert!(filter.includes(&meshvault::ArchivePath::new("docs/a/b.pdf").unwrap()));
        assert!(filter.includes(&meshvault::ArchivePath::new("images/x.png").unwrap()));
        assert!(!filter.includes(&meshvault::ArchivePath::new("other.txt").unwrap()));
    }

    #[test]
    fn empty_file_subscribes_to_nothing() {
        let filter = parse_subscription("").unwrap();
        assert!(filter.satisfies_nothing());
    }
}
