use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, Mutex, Notify};

use crate::archive::{Archive, ArchiveChange, ArchiveError};
use crate::delay_queue::{DelayQueueError, PathDelayQueue};
use crate::filter::Filter;
use crate::path::ArchivePath;
use crate::peer::DataSpecQueue;
use crate::piece::{FileId, FilePieceSpecSet, Piece, PieceSpec};

pub type PeerId = u64;

/// What a peer needs to hear about, fanned out by the clearing house
/// whenever the archive's contents change.
#[derive(Debug, Clone)]
pub enum Notice {
    Added(FilePieceSpecSet),
    RemovedFile(FileId),
    RemovedFiles(Vec<FileId>),
}

#[derive(thiserror::Error, Debug)]
pub enum ClearingHouseError {
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("delay queue error: {0}")]
    DelayQueue(#[from] DelayQueueError),
}

pub type Result<T> = std::result::Result<T, ClearingHouseError>;

struct PeerRegistration {
    notices: mpsc::UnboundedSender<Notice>,
    wants: Arc<DataSpecQueue>,
}

/// The registry of connected peers and the single point through which
/// pieces enter and leave the archive. Every mutation to the archive's
/// visible contents is fanned out to every registered peer as a
/// `Notice` here, so peers never need to poll for changes.
///
/// `local_predicate` is this node's own subscription: what it still
/// wants. A publisher's is `Everything` and never narrows. A
/// subscriber's starts as its parsed subscription filter and narrows
/// one completed file at a time via `Filter::remove_if_possible`, until
/// it reaches `Nothing` and the subscription is fully satisfied.
pub struct ClearingHouse {
    archive: Arc<Archive>,
    deletions: Arc<PathDelayQueue>,
    peers: Mutex<HashMap<PeerId, PeerRegistration>>,
    next_peer_id: AtomicU64,
    local_predicate: Mutex<Filter>,
    received_file_count: AtomicU64,
    predicate_changed: Notify,
}

impl ClearingHouse {
    pub fn new(archive: Arc<Archive>, deletions: Arc<PathDelayQueue>, local_predicate: Filter) -> Self {
        Self {
            archive,
            deletions,
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(0),
            local_predicate: Mutex::new(local_predicate),
            received_file_count: AtomicU64::new(0),
            predicate_changed: Notify::new(),
        }
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn allocate_peer_id(&self) -> PeerId {
        self.next_peer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn received_file_count(&self) -> u64 {
        self.received_file_count.load(Ordering::Relaxed)
    }

    pub async fn local_predicate_snapshot(&self) -> Filter {
        self.local_predicate.lock().await.clone()
    }

    /// Resolves once the local subscription is fully satisfied, i.e.
    /// `local_predicate` has narrowed to `Filter::Nothing`. Resolves
    /// immediately if that's already true (in particular, a publisher
    /// whose predicate is `Everything` never resolves).
    pub async fn wait_until_satisfied(&self) {
        loop {
            if self.local_predicate.lock().await.satisfies_nothing() {
                return;
            }
            self.predicate_changed.notified().await;
        }
    }

    #[tracing::instrument(skip(self, sender, wants))]
    pub async fn add_peer(&self, id: PeerId, sender: mpsc::UnboundedSender<Notice>, wants: Arc<DataSpecQueue>) {
        self.peers.lock().await.insert(
            id,
            PeerRegistration {
                notices: sender,
                wants,
            },
        );
        tracing::info!(peer = id, "peer registered");
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_peer(&self, id: PeerId) {
        self.peers.lock().await.remove(&id);
        tracing::info!(peer = id, "peer unregistered");
    }

    async fn fan_out(&self, notice: Notice) {
        let mut peers = self.peers.lock().await;
        peers.retain(|id, reg| match reg.notices.send(notice.clone()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(peer = id, "peer channel closed, dropping from registry");
                false
            }
        });
    }

    /// Like `fan_out`, but skips `source` — used when announcing a piece
    /// that just arrived from that very peer, so it is never told about
    /// its own contribution.
    async fn fan_out_except(&self, source: PeerId, notice: Notice) {
        let mut peers = self.peers.lock().await;
        peers.retain(|id, reg| {
            if *id == source {
                return true;
            }
            match reg.notices.send(notice.clone()) {
                Ok(()) => true,
                Err(_) => {
                    tracing::debug!(peer = id, "peer channel closed, dropping from registry");
                    false
                }
            }
        });
    }

    /// Gates an incoming piece-availability notice from `peer`: if the
    /// local predicate wants `spec`'s path and the archive doesn't
    /// already have it, enqueues a request for it on that peer.
    #[tracing::instrument(skip(self, spec), fields(path = %spec.path(), index = spec.index, peer))]
    pub async fn process_spec(&self, peer: PeerId, spec: PieceSpec) -> Result<()> {
        {
            let predicate = self.local_predicate.lock().await;
            if !predicate.includes(spec.path()) {
                return Ok(());
            }
        }
        if self.archive.has_piece(&spec).await? {
            return Ok(());
        }
        let peers = self.peers.lock().await;
        if let Some(reg) = peers.get(&peer) {
            reg.wants.push(spec);
        }
        Ok(())
    }

    /// Writes a piece received from `source` into the archive, if the
    /// local predicate still wants its path. Pieces outside the local
    /// predicate are dropped unwritten — nothing asked for them. If the
    /// write completes the file, narrows the predicate, bumps the
    /// received-file counter, schedules its deletion if it carries a
    /// non-negative time-to-live, and announces it to every other peer.
    /// Returns whether the local subscription is now fully satisfied.
    #[tracing::instrument(skip(self, piece), fields(path = %piece.spec.path(), index = piece.spec.index, peer = source))]
    pub async fn process_piece(&self, source: PeerId, piece: Piece) -> Result<bool> {
        let path = piece.spec.path().clone();
        {
            let predicate = self.local_predicate.lock().await;
            if !predicate.includes(&path) {
                tracing::debug!(peer = source, path = %path, "piece outside local subscription, dropping");
                return Ok(predicate.satisfies_nothing());
            }
        }

        let spec = piece.spec.clone();
        let time_to_live = piece.time_to_live;
        match self.archive.put_piece(piece).await {
            Ok(()) => {}
            Err(ArchiveError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(peer = source, path = %path, "file vanished under us, dropping piece");
                return Ok(self.local_predicate.lock().await.satisfies_nothing());
            }
            Err(e) => return Err(e.into()),
        }

        let complete = self.is_file_complete(&spec.file_info).await?;
        if complete {
            self.received_file_count.fetch_add(1, Ordering::Relaxed);
            {
                let mut predicate = self.local_predicate.lock().await;
                if let Some(narrowed) = predicate.remove_if_possible(&path) {
                    *predicate = narrowed;
                }
            }
            self.predicate_changed.notify_waiters();

            self.fan_out_except(source, Notice::Added(FilePieceSpecSet::all(spec.file_info.clone())))
                .await;

            if time_to_live >= 0 {
                let when = SystemTime::now() + Duration::from_secs(time_to_live as u64);
                self.remove(spec.file_info.id.clone(), when).await?;
            }
        } else {
            self.fan_out_except(
                source,
                Notice::Added(FilePieceSpecSet::single(spec.file_info.clone(), spec.index)),
            )
            .await;
        }

        Ok(self.local_predicate.lock().await.satisfies_nothing())
    }

    async fn is_file_complete(&self, info: &crate::piece::FileInfo) -> Result<bool> {
        Ok(self.archive.visible_path(&info.id).exists())
    }

    pub async fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Vec<u8>>> {
        Ok(self.archive.get_piece(spec).await?)
    }

    pub fn walk_archive(&self) -> Result<Vec<ArchivePath>> {
        Ok(self.archive.walk()?)
    }

    /// Schedules a file for removal at `when`, announcing it to every
    /// peer immediately so they stop requesting it even before the
    /// underlying bytes are actually deleted.
    #[tracing::instrument(skip(self))]
    pub async fn remove(&self, id: FileId, when: SystemTime) -> Result<()> {
        self.deletions.push(id.clone(), when)?;
        self.fan_out(Notice::RemovedFile(id)).await;
        Ok(())
    }

    pub async fn remove_many(&self, ids: Vec<FileId>, when: SystemTime) -> Result<()> {
        for id in &ids {
            self.deletions.push(id.clone(), when)?;
        }
        self.fan_out(Notice::RemovedFiles(ids)).await;
        Ok(())
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// Translates one filesystem change observed under the archive root
    /// into the corresponding `Notice` fan-out, announcing newly
    /// complete files or already-gone ones to every peer.
    async fn handle_archive_change(&self, change: ArchiveChange) -> Result<()> {
        match change {
            ArchiveChange::Created(absolute) | ArchiveChange::Modified(absolute) => {
                let Some(path) = self.archive.path_for(&absolute) else {
                    return Ok(());
                };
                if !self.archive.visible_path(&path).is_file() {
                    return Ok(());
                }
                let info = self.archive.file_info_for(&path).await?;
                self.fan_out(Notice::Added(FilePieceSpecSet::all(info))).await;
            }
            ArchiveChange::Removed(absolute) => {
                if let Some(path) = self.archive.path_for(&absolute) {
                    self.fan_out(Notice::RemovedFile(path)).await;
                }
            }
        }
        Ok(())
    }

    /// Spawns the background task that watches the archive root for
    /// files dropped onto disk outside the wire protocol (e.g. by an
    /// external process) and announces them the same way a received
    /// piece would be.
    pub fn spawn_watcher(self: &Arc<Self>) -> Result<tokio::task::JoinHandle<()>> {
        let mut watcher = self.archive.watch()?;
        let house = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(change) = watcher.recv().await {
                if let Err(e) = house.handle_archive_change(change).await {
                    tracing::warn!(error = %e, "failed to handle archive change");
                }
            }
            tracing::debug!("file watcher stopped");
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::piece::FileInfo;

    async fn house(dir: &std::path::Path) -> ClearingHouse {
        let archive = Arc::new(crate::archive::Archive::open(dir, 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.join("deletions.heap")).unwrap());
        ClearingHouse::new(archive, deletions, Filter::everything())
    }

    #[tokio::test]
    async fn process_piece_fans_out_to_registered_peers() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        house.add_peer(1, tx, Arc::new(DataSpecQueue::new())).await;

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![0; 8], -1).unwrap();
        house.process_piece(99, piece).await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert!(matches!(notice, Notice::Added(_)));
    }

    #[tokio::test]
    async fn process_piece_never_notifies_the_source_peer() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        house.add_peer(1, tx, Arc::new(DataSpecQueue::new())).await;

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![0; 8], -1).unwrap();
        house.process_piece(1, piece).await.unwrap();

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn remove_peer_stops_future_fan_out() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path()).await;

        let (tx, rx) = mpsc::unbounded_channel();
        house.add_peer(1, tx, Arc::new(DataSpecQueue::new())).await;
        house.remove_peer(1).await;
        drop(rx);

        assert_eq!(house.peer_count().await, 0);
    }

    #[tokio::test]
    async fn remove_schedules_deletion_and_notifies_peers() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path()).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        house.add_peer(1, tx, Arc::new(DataSpecQueue::new())).await;

        let id = ArchivePath::new("gone.bin").unwrap();
        house.remove(id.clone(), SystemTime::now()).await.unwrap();

        let notice = rx.recv().await.unwrap();
        assert!(matches!(notice, Notice::RemovedFile(removed) if removed == id));
    }

    #[tokio::test]
    async fn process_piece_outside_local_predicate_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(crate::archive::Archive::open(dir.path(), 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.path().join("deletions.heap")).unwrap());
        let house = ClearingHouse::new(archive, deletions, Filter::nothing());

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![0; 8], -1).unwrap();
        let done = house.process_piece(1, piece).await.unwrap();

        assert!(done);
        assert!(!house.archive().visible_path(&ArchivePath::new("f.bin").unwrap()).exists());
    }

    #[tokio::test]
    async fn completing_a_file_narrows_the_local_predicate_to_satisfied() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(crate::archive::Archive::open(dir.path(), 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.path().join("deletions.heap")).unwrap());
        let path = ArchivePath::new("f.bin").unwrap();
        let predicate = Filter::of(vec![crate::filter::Predicate::new("f.bin").unwrap()]);
        let house = ClearingHouse::new(archive, deletions, predicate);

        let info = FileInfo::new(path, 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![0; 8], -1).unwrap();
        let done = house.process_piece(1, piece).await.unwrap();

        assert!(done);
        assert_eq!(house.received_file_count(), 1);
        assert!(house.local_predicate_snapshot().await.satisfies_nothing());
    }

    #[tokio::test]
    async fn completing_a_file_with_a_ttl_schedules_its_deletion() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(crate::archive::Archive::open(dir.path(), 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.path().join("deletions.heap")).unwrap());
        let house = ClearingHouse::new(archive, deletions.clone(), Filter::everything());

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![0; 8], 60).unwrap();
        house.process_piece(1, piece).await.unwrap();

        assert_eq!(deletions.len(), 1);
    }

    #[tokio::test]
    async fn process_spec_requests_a_wanted_missing_piece() {
        let dir = tempfile::tempdir().unwrap();
        let house = house(dir.path()).await;

        let wants = Arc::new(DataSpecQueue::new());
        house.add_peer(1, mpsc::unbounded_channel().0, wants.clone()).await;

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        house.process_spec(1, spec.clone()).await.unwrap();

        assert_eq!(wants.try_pop(), Some(spec));
    }

    #[tokio::test]
    async fn process_spec_ignores_a_piece_outside_the_local_predicate() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(crate::archive::Archive::open(dir.path(), 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.path().join("deletions.heap")).unwrap());
        let house = ClearingHouse::new(archive, deletions, Filter::nothing());

        let wants = Arc::new(DataSpecQueue::new());
        house.add_peer(1, mpsc::unbounded_channel().0, wants.clone()).await;

        let info = FileInfo::new(ArchivePath::new("f.bin").unwrap(), 8, 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        house.process_spec(1, spec).await.unwrap();

        assert!(wants.try_pop().is_none());
    }

    #[tokio::test]
    async fn wait_until_satisfied_resolves_immediately_for_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(crate::archive::Archive::open(dir.path(), 8).await.unwrap());
        let deletions = Arc::new(PathDelayQueue::open(dir.path().join("deletions.heap")).unwrap());
        let house = ClearingHouse::new(archive, deletions, Filter::nothing());

        tokio::time::timeout(std::time::Duration::from_millis(200), house.wait_until_satisfied())
            .await
            .expect("should not block when already satisfied");
    }
}
