use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio::time::{sleep, Duration};

use crate::heap::{HeapError, HeapRecord, MinHeapFile};
use crate::path::ArchivePath;

/// Longest path, in bytes, a delay-queue entry can carry.
pub const MAX_PATH_LEN: usize = 255;

const WHEN_BYTES: usize = 8;
const LEN_BYTES: usize = 2;

#[derive(thiserror::Error, Debug)]
pub enum DelayQueueError {
    #[error("heap storage error: {0}")]
    Heap(#[from] HeapError),

    #[error("path {len} bytes long exceeds the {MAX_PATH_LEN} byte limit")]
    PathTooLong { len: usize },
}

pub type Result<T> = std::result::Result<T, DelayQueueError>;

/// `(when, path)`: a path scheduled to become visible at `when`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub when_millis: i64,
    pub path: ArchivePath,
}

impl HeapRecord for PathEntry {
    const SIZE: usize = WHEN_BYTES + LEN_BYTES + MAX_PATH_LEN;

    fn key(&self) -> i64 {
        self.when_millis
    }

    fn write_to(&self, buf: &mut [u8]) {
        let path_bytes = self.path.as_str().as_bytes();
        buf[0..8].copy_from_slice(&self.when_millis.to_le_bytes());
        buf[8..10].copy_from_slice(&(path_bytes.len() as u16).to_le_bytes());
        buf[10..10 + path_bytes.len()].copy_from_slice(path_bytes);
        for b in &mut buf[10 + path_bytes.len()..] {
            *b = 0;
        }
    }

    fn read_from(buf: &[u8]) -> Self {
        let when_millis = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let len = u16::from_le_bytes(buf[8..10].try_into().unwrap()) as usize;
        let path = String::from_utf8_lossy(&buf[10..10 + len]).into_owned();
        PathEntry {
            when_millis,
            path: ArchivePath::from_normalized(path),
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before the epoch")
        .as_millis() as i64
}

/// A persistent, time-ordered queue of paths awaiting a deferred action
/// (deletion). Entries become visible to consumers only once their
/// scheduled time has passed.
///
/// Closing the queue is cooperative: waiters blocked in `peek_due` or
/// `wait_until_empty` simply resolve to `Ok(None)` / `Ok(())` rather
/// than an error, so a normal shutdown never surfaces as a failure.
pub struct PathDelayQueue {
    heap: Mutex<MinHeapFile<PathEntry>>,
    notify: Notify,
    closed: AtomicBool,
}

impl PathDelayQueue {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            heap: Mutex::new(MinHeapFile::open(path)?),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn push(&self, path: ArchivePath, when: SystemTime) -> Result<()> {
        if path.as_str().len() > MAX_PATH_LEN {
            return Err(DelayQueueError::PathTooLong {
                len: path.as_str().len(),
            });
        }
        let when_millis = when
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        self.heap
            .lock()
            .unwrap()
            .push(PathEntry { when_millis, path })?;
        self.notify.notify_waiters();
        Ok(())
    }

    /// Waits until the earliest entry is due, then returns it without
    /// removing it. Resolves to `Ok(None)` if the queue is closed before
    /// an entry becomes due.
    #[tracing::instrument(skip(self))]
    pub async fn peek_due(&self) -> Result<Option<PathEntry>> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Ok(None);
            }

            let next_due = self.heap.lock().unwrap().peek_min();
            match next_due {
                None => self.wait_for_change().await,
                Some(entry) => {
                    let remaining = entry.when_millis - now_millis();
                    if remaining <= 0 {
                        return Ok(Some(entry));
                    }
                    tokio::select! {
                        _ = sleep(Duration::from_millis(remaining as u64)) => {},
                        _ = self.notify.notified() => {},
                    }
                }
            }
        }
    }

    /// Removes and returns the earliest entry if it is due; otherwise
    /// `Ok(None)` without blocking.
    pub fn remove_due(&self) -> Result<Option<PathEntry>> {
        let mut heap = self.heap.lock().unwrap();
        match heap.peek_min() {
            Some(entry) if entry.when_millis <= now_millis() => {
                let popped = heap.pop_min()?;
                drop(heap);
                self.notify.notify_waiters();
                Ok(popped)
            }
            _ => Ok(None),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn wait_until_empty(&self) {
        loop {
            if self.heap.lock().unwrap().is_empty() {
                return;
            }
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.wait_for_change().await;
        }
    }

    async fn wait_for_change(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.notify.notified().await;
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.heap.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn path(s: &str) -> ArchivePath {
        ArchivePath::new(s).unwrap()
    }

    #[tokio::test]
    async fn remove_due_is_none_before_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let q = PathDelayQueue::open(dir.path().join("q")).unwrap();
        q.push(path("a"), SystemTime::now() + StdDuration::from_secs(60))
            .unwrap();
        assert_eq!(q.remove_due().unwrap(), None);
    }

    #[tokio::test]
    async fn remove_due_returns_past_due_entries() {
        let dir = tempfile::tempdir().unwrap();
        let q = PathDelayQueue::open(dir.path().join("q")).unwrap();
        q.push(path("a"), SystemTime::now() - StdDuration::from_secs(1))
            .unwrap();
        let popped = q.remove_due().unwrap().unwrap();
        assert_eq!(popped.path, path("a"));
    }

    #[tokio::test]
    async fn peek_due_waits_for_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let q = PathDelayQueue::open(dir.path().join("q")).unwrap();
        q.push(path("a"), SystemTime::now() + StdDuration::from_millis(20))
            .unwrap();
        let entry = q.peek_due().await.unwrap().unwrap();
        assert_eq!(entry.path, path("a"));
    }

    #[tokio::test]
    async fn close_unblocks_peek_due_without_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let q = std::sync::Arc::new(PathDelayQueue::open(dir.path().join("q")).unwrap());
        let waiter = tokio::spawn({
            let q = q.clone();
            async move { q.peek_due().await }
        });
        tokio::time::sleep(StdDuration::from_millis(10)).await;
        q.close();
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result, None);
    }

    #[test]
    fn rejects_paths_longer_than_the_limit() {
        let dir = tempfile::tempdir().unwrap();
        let q = PathDelayQueue::open(dir.path().join("q")).unwrap();
        let long = "a".repeat(MAX_PATH_LEN + 1);
        assert!(matches!(
            q.push(path(&long), SystemTime::now()),
            Err(DelayQueueError::PathTooLong { .. })
        ));
    }
}
