mod disk_file;
mod watcher;

pub use disk_file::{DiskFile, DiskFileError};
pub use watcher::{walk_archive, ArchiveChange, FileWatcher};

use std::path::PathBuf;
use std::sync::Arc;

use lru::LruCache;
use tokio::fs::OpenOptions;
use tokio::sync::Mutex as AsyncMutex;

use crate::bitset::FiniteBitSet;
use crate::path::ArchivePath;
use crate::piece::{FileId, FileInfo, Piece, PieceSpec};

/// Hidden staging directory name under an archive's root. Files live
/// here, keyed by their archive path, until every piece has arrived;
/// only then are they promoted to their visible location.
pub const HIDDEN_DIR: &str = ".sruth";

/// Maximum number of file descriptors this archive keeps open at once.
/// Least-recently-used files are evicted (and their handles closed)
/// once the cache is full.
pub const MAX_OPEN_FILES: usize = 128;

#[derive(thiserror::Error, Debug)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("disk file error: {0}")]
    DiskFile(#[from] DiskFileError),

    #[error("path error: {0}")]
    Path(#[from] crate::path::PathError),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

type SharedDiskFile = Arc<AsyncMutex<DiskFile>>;

/// The set of files this node holds or is in the process of acquiring,
/// rooted at a single directory on disk. Incomplete files live hidden
/// under `.sruth/`; complete ones are promoted to their visible path.
pub struct Archive {
    root: PathBuf,
    piece_size: u64,
    open_files: AsyncMutex<LruCache<FileId, SharedDiskFile>>,
}

impl Archive {
    pub async fn open(root: impl Into<PathBuf>, piece_size: u64) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(root.join(HIDDEN_DIR)).await?;
        Ok(Self {
            root,
            piece_size,
            open_files: AsyncMutex::new(LruCache::new(
                std::num::NonZeroUsize::new(MAX_OPEN_FILES).unwrap(),
            )),
        })
    }

    /// Builds the `FileInfo` for an already-visible, complete file,
    /// using the archive's single configured piece size. Every file
    /// this node completes uses that same piece size, so a newly
    /// bootstrapped peer can be told about pre-existing files without
    /// this archive having to persist per-file piece sizes separately.
    pub async fn file_info_for(&self, path: &ArchivePath) -> Result<FileInfo> {
        let meta = tokio::fs::metadata(self.visible_path(path)).await?;
        Ok(FileInfo::new(path.clone(), meta.len(), self.piece_size))
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn hidden_path(&self, id: &FileId) -> PathBuf {
        self.root.join(HIDDEN_DIR).join(id.to_path_buf())
    }

    pub fn visible_path(&self, id: &FileId) -> PathBuf {
        self.root.join(id.to_path_buf())
    }

    /// Translates an absolute filesystem path (as reported by the file
    /// watcher) back into an `ArchivePath` relative to this archive's
    /// root, or `None` if it falls outside the root or under the hidden
    /// staging directory.
    pub fn path_for(&self, absolute: &std::path::Path) -> Option<ArchivePath> {
        let hidden_root = self.root.join(HIDDEN_DIR);
        if absolute.starts_with(&hidden_root) {
            return None;
        }
        let relative = absolute.strip_prefix(&self.root).ok()?;
        ArchivePath::new(relative).ok()
    }

    #[tracing::instrument(skip(self), fields(path = %info.id))]
    async fn open_or_create(&self, info: &FileInfo) -> Result<SharedDiskFile> {
        {
            let mut cache = self.open_files.lock().await;
            if let Some(existing) = cache.get(&info.id) {
                return Ok(existing.clone());
            }
        }

        // The cache lock is released above: everything that follows is
        // disk I/O and must never be done while holding it.
        let visible = self.visible_path(&info.id);
        let (path, held) = if visible.exists() {
            (visible, FiniteBitSet::all_set(info.piece_count() as usize))
        } else {
            let hidden = self.hidden_path(&info.id);
            if let Some(parent) = hidden.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            (hidden, FiniteBitSet::new(info.piece_count() as usize))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await?;
        file.set_len(info.file_size).await?;

        let disk_file = Arc::new(AsyncMutex::new(DiskFile::new(file, info.clone(), held)));

        let mut cache = self.open_files.lock().await;
        if let Some(existing) = cache.get(&info.id) {
            // Another task opened the same file while this one was doing
            // I/O unlocked; keep its handle instead of orphaning ours.
            return Ok(existing.clone());
        }
        if let Some((_, evicted)) = cache.push(info.id.clone(), disk_file.clone()) {
            drop(evicted);
        }
        Ok(disk_file)
    }

    #[tracing::instrument(skip(self, piece), fields(path = %piece.spec.path(), index = piece.spec.index))]
    pub async fn put_piece(&self, piece: Piece) -> Result<()> {
        let info = piece.spec.file_info.clone();
        let disk_file = self.open_or_create(&info).await?;
        let completed = {
            let mut guard = disk_file.lock().await;
            guard.put_piece(&piece).await?;
            guard.is_complete()
        };
        if completed {
            self.promote(&info.id).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_piece(&self, spec: &PieceSpec) -> Result<Option<Vec<u8>>> {
        let disk_file = self.open_or_create(&spec.file_info).await?;
        let mut guard = disk_file.lock().await;
        Ok(guard.get_piece(spec.index).await?)
    }

    pub async fn has_piece(&self, spec: &PieceSpec) -> Result<bool> {
        let disk_file = self.open_or_create(&spec.file_info).await?;
        let guard = disk_file.lock().await;
        Ok(guard.has_piece(spec.index))
    }

    /// Moves a completed file from its hidden staging path to its
    /// visible location. Evicts its cache entry first so the rename
    /// never races an in-flight write.
    async fn promote(&self, id: &FileId) -> Result<()> {
        let mut cache = self.open_files.lock().await;
        cache.pop(id);
        drop(cache);

        let hidden = self.hidden_path(id);
        let visible = self.visible_path(id);
        if let Some(parent) = visible.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&hidden, &visible).await?;
        tracing::info!(path = %id, "file complete, promoted from staging");
        Ok(())
    }

    /// Lists every complete file currently visible in the archive,
    /// excluding the hidden staging directory.
    pub fn walk(&self) -> Result<Vec<ArchivePath>> {
        let hidden_root = self.root.join(HIDDEN_DIR);
        let files = walk_archive(&self.root)?;
        Ok(files
            .into_iter()
            .filter(|p| !p.starts_with(&hidden_root))
            .filter_map(|p| {
                p.strip_prefix(&self.root)
                    .ok()
                    .and_then(|rel| ArchivePath::new(rel).ok())
            })
            .collect())
    }

    pub fn watch(&self) -> Result<FileWatcher> {
        Ok(FileWatcher::watch(&self.root)?)
    }
}

impl From<notify::Error> for ArchiveError {
    fn from(e: notify::Error) -> Self {
        ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl From<watcher::WatcherError> for ArchiveError {
    fn from(e: watcher::WatcherError) -> Self {
        ArchiveError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, size: u64) -> FileInfo {
        FileInfo::new(ArchivePath::new(id).unwrap(), size, 8)
    }

    #[tokio::test]
    async fn put_piece_stages_then_promotes_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path(), 8).await.unwrap();
        let info = info("a/b.bin", 16);

        let spec0 = PieceSpec::new(info.clone(), 0).unwrap();
        archive
            .put_piece(Piece::new(spec0, vec![1; 8], -1).unwrap())
            .await
            .unwrap();
        assert!(archive.hidden_path(&info.id).exists());
        assert!(!archive.visible_path(&info.id).exists());

        let spec1 = PieceSpec::new(info.clone(), 1).unwrap();
        archive
            .put_piece(Piece::new(spec1, vec![2; 8], -1).unwrap())
            .await
            .unwrap();
        assert!(!archive.hidden_path(&info.id).exists());
        assert!(archive.visible_path(&info.id).exists());
    }

    #[tokio::test]
    async fn get_piece_reads_back_what_was_put() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path(), 8).await.unwrap();
        let info = info("f.bin", 8);
        let spec = PieceSpec::new(info, 0).unwrap();
        archive
            .put_piece(Piece::new(spec.clone(), vec![9; 8], -1).unwrap())
            .await
            .unwrap();

        let bytes = archive.get_piece(&spec).await.unwrap().unwrap();
        assert_eq!(bytes, vec![9; 8]);
    }

    #[tokio::test]
    async fn walk_excludes_hidden_staging_files() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path(), 8).await.unwrap();
        let info = info("partial.bin", 16);
        let spec = PieceSpec::new(info, 0).unwrap();
        archive
            .put_piece(Piece::new(spec, vec![1; 8], -1).unwrap())
            .await
            .unwrap();

        let visible = archive.walk().unwrap();
        assert!(visible.is_empty());
    }
}
