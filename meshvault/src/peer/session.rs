use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::clearinghouse::{ClearingHouse, Notice, PeerId};
use crate::connection::Connection;
use crate::filter::Filter;
use crate::piece::PieceSpec;
use crate::wire::{DataMessage, NoticeMessage, RequestMessage};

use super::{DataSpecQueue, NoticeQueue, PieceSlot};

#[derive(thiserror::Error, Debug)]
pub enum PeerError {
    #[error("wire error: {0}")]
    Wire(#[from] crate::wire::WireError),

    #[error("clearing house error: {0}")]
    ClearingHouse(#[from] crate::clearinghouse::ClearingHouseError),
}

impl<T> From<mpsc::error::SendError<T>> for PeerError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        // The only reason a send to one of our own tasks fails is that
        // task having already exited, which is cancellation, not an
        // error worth propagating to the caller.
        PeerError::Wire(crate::wire::WireError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "peer task channel closed",
        )))
    }
}

/// A live peer connection: six cooperative tasks sharing a handful of
/// queues, plus transient `FileScanner` tasks spawned per incoming
/// piece request.
pub struct Peer;

/// A handle to a spawned `Peer`'s tasks and queues. Dropping this does
/// not stop the peer; call `shutdown` for that.
pub struct PeerHandle {
    pub id: PeerId,
    wants: Arc<DataSpecQueue>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerHandle {
    /// Queues a piece we'd like to fetch from this peer.
    pub fn request(&self, spec: PieceSpec) {
        self.wants.push(spec);
    }

    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Peer {
    #[tracing::instrument(skip(connection, house), fields(peer = id))]
    pub async fn spawn(
        id: PeerId,
        connection: Connection,
        filter: Filter,
        house: Arc<ClearingHouse>,
    ) -> PeerHandle {
        let (notice_sink, notice_stream) = connection.notices.split();
        let (request_sink, request_stream) = connection.requests.split();
        let (data_sink, data_stream) = connection.data.split();

        let outgoing_notices = Arc::new(NoticeQueue::new());
        let wants = Arc::new(DataSpecQueue::new());
        let piece_slot = Arc::new(PieceSlot::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (notice_feed_tx, notice_feed_rx) = mpsc::unbounded_channel();

        house.add_peer(id, notice_feed_tx, wants.clone()).await;

        // Bootstrap: tell the peer about every file already in the
        // archive that its filter admits, not just future changes.
        for path in house.walk_archive().unwrap_or_default() {
            if !filter.includes(&path) {
                continue;
            }
            if let Ok(info) = house.archive().file_info_for(&path).await {
                outgoing_notices.push(Notice::Added(crate::piece::FilePieceSpecSet::all(info)));
            }
        }

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Self::notice_sender(
            id,
            notice_sink,
            outgoing_notices.clone(),
            notice_feed_rx,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::notice_receiver(
            id,
            notice_stream,
            house.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::request_sender(
            id,
            request_sink,
            wants.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::request_receiver(
            id,
            request_stream,
            piece_slot.clone(),
            house.clone(),
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::piece_sender(
            id,
            data_sink,
            piece_slot,
            shutdown_rx.clone(),
        )));

        tasks.push(tokio::spawn(Self::piece_receiver(
            id,
            data_stream,
            house.clone(),
            shutdown_rx,
        )));

        PeerHandle {
            id,
            wants,
            shutdown: shutdown_tx,
            tasks,
        }
    }

    #[tracing::instrument(name = "notice_sender", skip_all, fields(peer = id))]
    async fn notice_sender(
        id: PeerId,
        mut sink: impl SinkExt<NoticeMessage, Error = crate::wire::WireError> + Unpin,
        queue: Arc<NoticeQueue>,
        mut feed: mpsc::UnboundedReceiver<Notice>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                Some(notice) = feed.recv() => {
                    queue.push(notice);
                }
                notice = queue.pop() => {
                    let msg = match notice {
                        Notice::Added(set) => NoticeMessage::Addition(set),
                        Notice::RemovedFile(path) => NoticeMessage::RemovedFile(path),
                        Notice::RemovedFiles(paths) => NoticeMessage::RemovedFiles(paths),
                    };
                    if let Err(e) = sink.send(msg).await {
                        tracing::warn!(peer = id, error = %e, "failed to send notice");
                        break;
                    }
                }
            }
        }
        tracing::debug!(peer = id, "notice sender stopped");
    }

    #[tracing::instrument(name = "notice_receiver", skip_all, fields(peer = id))]
    async fn notice_receiver(
        id: PeerId,
        mut stream: impl StreamExt<Item = Result<NoticeMessage, crate::wire::WireError>> + Unpin,
        house: Arc<ClearingHouse>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                next = stream.next() => {
                    let Some(next) = next else { break };
                    match next {
                        Ok(NoticeMessage::Addition(set)) => {
                            for index in set.indexes() {
                                if let Ok(spec) = PieceSpec::new(set.file_info().clone(), index) {
                                    if let Err(e) = house.process_spec(id, spec).await {
                                        tracing::warn!(peer = id, error = %e, "failed to gate incoming notice");
                                    }
                                }
                            }
                        }
                        Ok(NoticeMessage::RemovedFile(_)) | Ok(NoticeMessage::RemovedFiles(_)) => {
                            // Nothing further to request; in-flight wants for
                            // a removed file are simply left to fail the
                            // next time they're serviced.
                        }
                        Err(e) => {
                            tracing::warn!(peer = id, error = %e, "bad notice frame");
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(peer = id, "notice receiver stopped");
    }

    #[tracing::instrument(name = "request_sender", skip_all, fields(peer = id))]
    async fn request_sender(
        id: PeerId,
        mut sink: impl SinkExt<RequestMessage, Error = crate::wire::WireError> + Unpin,
        wants: Arc<DataSpecQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                spec = wants.pop() => {
                    if let Err(e) = sink.send(RequestMessage { spec }).await {
                        tracing::warn!(peer = id, error = %e, "failed to send request");
                        break;
                    }
                }
            }
        }
        tracing::debug!(peer = id, "request sender stopped");
    }

    #[tracing::instrument(name = "request_receiver", skip_all, fields(peer = id))]
    async fn request_receiver(
        id: PeerId,
        mut stream: impl StreamExt<Item = Result<RequestMessage, crate::wire::WireError>> + Unpin,
        piece_slot: Arc<PieceSlot>,
        house: Arc<ClearingHouse>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                next = stream.next() => {
                    let Some(next) = next else { break };
                    match next {
                        Ok(RequestMessage { spec }) => {
                            let house = house.clone();
                            let slot = piece_slot.clone();
                            tokio::spawn(Self::file_scanner(id, spec, house, slot));
                        }
                        Err(e) => {
                            tracing::warn!(peer = id, error = %e, "bad request frame");
                            break;
                        }
                    }
                }
            }
        }
        tracing::debug!(peer = id, "request receiver stopped");
    }

    /// Transient task: reads one requested piece off disk and hands it
    /// to `PieceSender` via the one-slot rendezvous.
    #[tracing::instrument(name = "file_scanner", skip(house, slot), fields(peer = id))]
    async fn file_scanner(
        id: PeerId,
        spec: PieceSpec,
        house: Arc<ClearingHouse>,
        slot: Arc<PieceSlot>,
    ) {
        match house.get_piece(&spec).await {
            Ok(Some(bytes)) => match crate::piece::Piece::new(spec, bytes, -1) {
                Ok(piece) => slot.put(piece).await,
                Err(e) => tracing::warn!(peer = id, error = %e, "piece size mismatch on disk"),
            },
            Ok(None) => tracing::debug!(peer = id, "requested piece not held, dropping"),
            Err(e) => tracing::warn!(peer = id, error = %e, "disk read for request failed"),
        }
    }

    #[tracing::instrument(name = "piece_sender", skip_all, fields(peer = id))]
    async fn piece_sender(
        id: PeerId,
        mut sink: impl SinkExt<DataMessage, Error = crate::wire::WireError> + Unpin,
        slot: Arc<PieceSlot>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                piece = slot.take() => {
                    if let Err(e) = sink.send(DataMessage { piece }).await {
                        tracing::warn!(peer = id, error = %e, "failed to send piece");
                        break;
                    }
                }
            }
        }
        tracing::debug!(peer = id, "piece sender stopped");
    }

    #[tracing::instrument(name = "piece_receiver", skip_all, fields(peer = id))]
    async fn piece_receiver(
        id: PeerId,
        mut stream: impl StreamExt<Item = Result<DataMessage, crate::wire::WireError>> + Unpin,
        house: Arc<ClearingHouse>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() { break; }
                }
                next = stream.next() => {
                    let Some(next) = next else { break };
                    match next {
                        Ok(DataMessage { piece }) => {
                            match house.process_piece(id, piece).await {
                                Ok(true) => {
                                    tracing::info!(peer = id, "local subscription satisfied, stopping piece receiver");
                                    break;
                                }
                                Ok(false) => {}
                                Err(e) => tracing::warn!(peer = id, error = %e, "failed to store received piece"),
                            }
                        }
                        Err(e) => {
                            tracing::warn!(peer = id, error = %e, "bad data frame");
                            break;
                        }
                    }
                }
            }
        }
        house.remove_peer(id).await;
        tracing::debug!(peer = id, "piece receiver stopped");
    }
}
