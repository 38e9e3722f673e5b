use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::archive::HIDDEN_DIR;
use crate::delay_queue::PathDelayQueue;

/// The single worker that turns due entries in a `PathDelayQueue` into
/// actual file removals. A completed file has already been renamed from
/// its hidden staging path to its visible one, so the deleter tries the
/// visible path first and falls back to the hidden one, idempotently:
/// one or the other (or neither, if something already removed it) is
/// the expected outcome.
pub struct FileDeleter {
    handle: JoinHandle<()>,
}

impl FileDeleter {
    pub fn spawn(queue: Arc<PathDelayQueue>, archive_root: PathBuf) -> Self {
        let handle = tokio::spawn(Self::run(queue, archive_root));
        Self { handle }
    }

    #[tracing::instrument(name = "file_deleter", skip(queue, archive_root))]
    async fn run(queue: Arc<PathDelayQueue>, archive_root: PathBuf) {
        loop {
            match queue.peek_due().await {
                Ok(Some(_)) => match queue.remove_due() {
                    Ok(Some(entry)) => Self::remove_entry(&archive_root, &entry.path).await,
                    Ok(None) => {
                        // Another consumer raced us to it; nothing to do.
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "delay queue read failed");
                        break;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::error!(error = %e, "delay queue read failed");
                    break;
                }
            }
        }
        tracing::info!("file deleter stopped");
    }

    async fn remove_entry(archive_root: &std::path::Path, path: &crate::path::ArchivePath) {
        let visible = archive_root.join(path.to_path_buf());
        match tokio::fs::remove_file(&visible).await {
            Ok(()) => {
                tracing::info!(path = %path, "deleted file");
                return;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "delete of visible path failed");
            }
        }

        let hidden = archive_root.join(HIDDEN_DIR).join(path.to_path_buf());
        match tokio::fs::remove_file(&hidden).await {
            Ok(()) => tracing::info!(path = %path, "deleted staged file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(path = %path, "already gone");
            }
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "delete of staged path failed");
            }
        }
    }

    pub async fn shutdown(self) {
        let _ = self.handle.await;
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArchivePath;
    use std::time::{Duration, SystemTime};

    #[tokio::test]
    async fn deletes_files_once_they_become_due() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("victim.bin");
        tokio::fs::write(&file_path, b"data").await.unwrap();

        let queue = Arc::new(PathDelayQueue::open(dir.path().join("heap")).unwrap());
        queue
            .push(
                ArchivePath::new("victim.bin").unwrap(),
                SystemTime::now() - Duration::from_secs(1),
            )
            .unwrap();

        let deleter = FileDeleter::spawn(queue.clone(), dir.path().to_path_buf());
        queue.wait_until_empty().await;
        queue.close();
        deleter.shutdown().await;

        assert!(!file_path.exists());
    }
}
