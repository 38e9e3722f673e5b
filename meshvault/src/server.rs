use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::timeout;
use tokio_util::codec::Framed;

use crate::clearinghouse::{ClearingHouse, PeerId};
use crate::connection::Connection;
use crate::filter::Filter;
use crate::peer::{Peer, PeerHandle};
use crate::wire::{FilterHandshake, HandshakeCodec};

/// Active peers this node serves at once.
pub const MAX_ACTIVE_SERVLETS: usize = 8;
/// Connections being negotiated (handshaking, not yet admitted) at once.
pub const MAX_OUTSTANDING_SERVLETS: usize = 4;
/// How long a fresh connection has to complete the filter handshake
/// before it's dropped. Bounds how long a stalled or malicious
/// connection can hold one of the outstanding-negotiation permits.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

struct ActiveServlet {
    filter: Filter,
    handle: PeerHandle,
}

/// Accepts incoming connections and admits them as active peers,
/// subject to a capacity limit and a preemption policy: once at
/// capacity, a new connection is admitted only if its filter strictly
/// includes some already-active servlet's filter, in which case the
/// active servlet with the narrowest coverage is evicted to make room.
pub struct Server {
    house: Arc<ClearingHouse>,
    active: Mutex<HashMap<PeerId, ActiveServlet>>,
    outstanding: Arc<Semaphore>,
}

impl Server {
    pub fn new(house: Arc<ClearingHouse>) -> Arc<Self> {
        Arc::new(Self {
            house,
            active: Mutex::new(HashMap::new()),
            outstanding: Arc::new(Semaphore::new(MAX_OUTSTANDING_SERVLETS)),
        })
    }

    #[tracing::instrument(name = "server_accept_loop", skip(self, listener))]
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, addr) = listener.accept().await?;
            tracing::info!(%addr, "accepted connection");
            let server = self.clone();
            tokio::spawn(async move {
                let permit = server.outstanding.clone().acquire_owned().await;
                let Ok(_permit) = permit else { return };
                if let Err(e) = server.negotiate(stream).await {
                    tracing::warn!(%addr, error = %e, "negotiation failed");
                }
            });
        }
    }

    /// Reads the filter handshake off a freshly accepted stream, then
    /// replies with this node's own filter (§4.9: the server-side
    /// filter, which here is simply its local predicate) before
    /// attempting admission. The accepted socket is cloned into three
    /// file descriptors, one per logical stream, so `Connection`'s
    /// independently-framed notice/request/data channels can each own
    /// a full-duplex `TcpStream` without multiplexing over one socket.
    async fn negotiate(self: Arc<Self>, stream: TcpStream) -> Result<()> {
        let mut framed = Framed::new(stream, HandshakeCodec);
        let handshake = match timeout(HANDSHAKE_TIMEOUT, futures::StreamExt::next(&mut framed)).await {
            Ok(Some(Ok(h))) => h,
            Ok(Some(Err(e))) => {
                tracing::warn!(error = %e, "bad handshake frame");
                return Ok(());
            }
            Ok(None) => return Ok(()),
            Err(_) => {
                tracing::warn!("handshake timed out");
                return Ok(());
            }
        };

        let reply_filter = self.house.local_predicate_snapshot().await;
        if let Err(e) = futures::SinkExt::send(&mut framed, FilterHandshake::new(reply_filter)).await {
            tracing::warn!(error = %e, "failed to send handshake reply");
            return Ok(());
        }

        let std_stream = framed.into_inner().into_std()?;
        let notices = TcpStream::from_std(std_stream.try_clone()?)?;
        let requests = TcpStream::from_std(std_stream.try_clone()?)?;
        let data = TcpStream::from_std(std_stream)?;
        let connection = Connection::new(notices, requests, data);

        let id = self.house.allocate_peer_id();
        self.admit(id, handshake.filter, connection).await;
        Ok(())
    }

    #[tracing::instrument(skip(self, connection), fields(peer = id))]
    async fn admit(self: Arc<Self>, id: PeerId, filter: Filter, connection: Connection) {
        let mut active = self.active.lock().await;

        if active.len() >= MAX_ACTIVE_SERVLETS {
            match self.pick_eviction(&active, &filter) {
                Some(victim) => {
                    if let Some(evicted) = active.remove(&victim) {
                        tracing::info!(peer = victim, "preempting narrower servlet");
                        drop(active);
                        evicted.handle.shutdown().await;
                        active = self.active.lock().await;
                    }
                }
                None => {
                    tracing::info!(peer = id, "rejecting connection, at capacity");
                    return;
                }
            }
        }

        let handle = Peer::spawn(id, connection, filter.clone(), self.house.clone()).await;
        active.insert(id, ActiveServlet { filter, handle });
    }

    /// Among active servlets whose filter is strictly included by
    /// `newcomer`, picks the one with the narrowest coverage: the
    /// fewest other active filters it itself strictly includes.
    fn pick_eviction(
        &self,
        active: &HashMap<PeerId, ActiveServlet>,
        newcomer: &Filter,
    ) -> Option<PeerId> {
        let candidates: Vec<PeerId> = active
            .iter()
            .filter(|(_, servlet)| newcomer.strictly_includes(&servlet.filter))
            .map(|(id, _)| *id)
            .collect();

        candidates.into_iter().min_by_key(|id| {
            let filter = &active[id].filter;
            active
                .values()
                .filter(|other| filter.strictly_includes(&other.filter))
                .count()
        })
    }

    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }
}
