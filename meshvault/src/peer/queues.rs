use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::clearinghouse::Notice;
use crate::piece::{FilePieceSpecSet, PieceSpec};

/// Outgoing notices queued for delivery to one peer.
///
/// Additions and removals are tracked in separate queues and popped in
/// strict alternation (when both are non-empty) so a steady stream of
/// additions can never starve a pending removal notice from ever being
/// sent — `last_was_addition` is the alternation cursor.
pub struct NoticeQueue {
    inner: Mutex<NoticeQueueInner>,
    notify: Notify,
}

struct NoticeQueueInner {
    additions: VecDeque<FilePieceSpecSet>,
    removals: VecDeque<Notice>,
    last_was_addition: bool,
}

impl NoticeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NoticeQueueInner {
                additions: VecDeque::new(),
                removals: VecDeque::new(),
                last_was_addition: false,
            }),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, notice: Notice) {
        let mut inner = self.inner.lock().unwrap();
        match notice {
            Notice::Added(set) => {
                if let Some(merged) = Self::merge_with_pending(&mut inner.additions, set) {
                    inner.additions.push_back(merged);
                }
            }
            other => inner.removals.push_back(other),
        }
        drop(inner);
        self.notify.notify_one();
    }

    /// Merges `set` into the last queued addition for the same file if
    /// one is pending, so a burst of piece-level additions for one file
    /// collapses into a single outgoing notice.
    fn merge_with_pending(
        additions: &mut VecDeque<FilePieceSpecSet>,
        set: FilePieceSpecSet,
    ) -> Option<FilePieceSpecSet> {
        if let Some(back) = additions.back() {
            if back.file_info().id == set.file_info().id {
                let back = additions.pop_back().unwrap();
                return back.merge(set).ok();
            }
        }
        Some(set)
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.additions.is_empty() && inner.removals.is_empty()
    }

    pub fn try_pop(&self) -> Option<Notice> {
        let mut inner = self.inner.lock().unwrap();
        let want_addition = !inner.last_was_addition;

        let popped = if want_addition && !inner.additions.is_empty() {
            inner.last_was_addition = true;
            inner.additions.pop_front().map(Notice::Added)
        } else if !inner.removals.is_empty() {
            inner.last_was_addition = false;
            inner.removals.pop_front()
        } else if !inner.additions.is_empty() {
            inner.last_was_addition = true;
            inner.additions.pop_front().map(Notice::Added)
        } else {
            None
        };
        popped
    }

    pub async fn pop(&self) -> Notice {
        loop {
            if let Some(notice) = self.try_pop() {
                return notice;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for NoticeQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Pieces this peer has asked us for and we haven't sent yet. Requests
/// for the same piece collapse into one entry.
pub struct DataSpecQueue {
    inner: Mutex<VecDeque<PieceSpec>>,
    notify: Notify,
}

impl DataSpecQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, spec: PieceSpec) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.contains(&spec) {
            inner.push_back(spec);
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub fn try_pop(&self) -> Option<PieceSpec> {
        self.inner.lock().unwrap().pop_front()
    }

    pub async fn pop(&self) -> PieceSpec {
        loop {
            if let Some(spec) = self.try_pop() {
                return spec;
            }
            self.notify.notified().await;
        }
    }
}

impl Default for DataSpecQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// A one-slot rendezvous between the task that reads a requested piece
/// off disk (`FileScanner`) and the task that writes it to the wire
/// (`PieceSender`). Holding at most one piece at a time is the
/// mechanism by which disk reads for one peer never race ahead of what
/// its socket can actually drain.
pub struct PieceSlot {
    inner: Mutex<Option<crate::piece::Piece>>,
    filled: Notify,
    drained: Notify,
}

impl PieceSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            filled: Notify::new(),
            drained: Notify::new(),
        }
    }

    /// Waits until the slot is empty, then places `piece` in it.
    pub async fn put(&self, piece: crate::piece::Piece) {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.is_none() {
                    *inner = Some(piece);
                    self.filled.notify_one();
                    return;
                }
            }
            self.drained.notified().await;
        }
    }

    /// Waits until the slot holds a piece, then removes and returns it.
    pub async fn take(&self) -> crate::piece::Piece {
        loop {
            {
                let mut inner = self.inner.lock().unwrap();
                if let Some(piece) = inner.take() {
                    self.drained.notify_one();
                    return piece;
                }
            }
            self.filled.notified().await;
        }
    }
}

impl Default for PieceSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArchivePath;
    use crate::piece::FileInfo;

    fn info(id: &str) -> FileInfo {
        FileInfo::new(ArchivePath::new(id).unwrap(), 16, 8)
    }

    #[tokio::test]
    async fn alternates_between_additions_and_removals() {
        let q = NoticeQueue::new();
        q.push(Notice::Added(FilePieceSpecSet::all(info("a"))));
        q.push(Notice::RemovedFile(ArchivePath::new("b").unwrap()));
        q.push(Notice::Added(FilePieceSpecSet::all(info("c"))));

        assert!(matches!(q.pop().await, Notice::Added(_)));
        assert!(matches!(q.pop().await, Notice::RemovedFile(_)));
        assert!(matches!(q.pop().await, Notice::Added(_)));
    }

    #[tokio::test]
    async fn consecutive_additions_to_the_same_file_merge() {
        let q = NoticeQueue::new();
        q.push(Notice::Added(FilePieceSpecSet::single(info("a"), 0)));
        q.push(Notice::Added(FilePieceSpecSet::single(info("a"), 1)));

        match q.pop().await {
            Notice::Added(set) => {
                assert!(set.contains(0));
                assert!(set.contains(1));
            }
            _ => panic!("wrong variant"),
        }
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn data_spec_queue_deduplicates_repeated_requests() {
        let q = DataSpecQueue::new();
        let info = info("a");
        let spec = crate::piece::PieceSpec::new(info, 0).unwrap();
        q.push(spec.clone());
        q.push(spec.clone());
        assert_eq!(q.pop().await, spec);
        assert!(q.try_pop().is_none());
    }
}
