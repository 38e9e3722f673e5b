use std::io::SeekFrom;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::bitset::FiniteBitSet;
use crate::piece::{FileInfo, Piece, PieceSpec};

#[derive(thiserror::Error, Debug)]
pub enum DiskFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {index} does not belong to file {file}")]
    WrongFile { index: u32, file: String },
}

pub type Result<T> = std::result::Result<T, DiskFileError>;

/// A single file on disk, tracked alongside which of its pieces this
/// node already holds. Mirrors a file's lifecycle from "just
/// discovered, no pieces yet" through "complete" once every piece has
/// landed.
pub struct DiskFile {
    file: File,
    info: FileInfo,
    held: FiniteBitSet,
}

impl DiskFile {
    /// Wraps an already-open file handle that has `held` populated from
    /// whatever bytes exist on disk (all-zero for a brand new file,
    /// `FiniteBitSet::all_set` for one recovered as already complete).
    pub fn new(file: File, info: FileInfo, held: FiniteBitSet) -> Self {
        Self { file, info, held }
    }

    pub fn info(&self) -> &FileInfo {
        &self.info
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.held.is_set(index as usize).unwrap_or(false)
    }

    pub fn is_complete(&self) -> bool {
        self.held.are_all_set()
    }

    #[tracing::instrument(skip(self, piece), fields(path = %piece.spec.path(), index = piece.spec.index))]
    pub async fn put_piece(&mut self, piece: &Piece) -> Result<()> {
        if piece.spec.file_info.id != self.info.id {
            return Err(DiskFileError::WrongFile {
                index: piece.spec.index,
                file: self.info.id.to_string(),
            });
        }
        self.file.seek(SeekFrom::Start(piece.spec.offset())).await?;
        self.file.write_all(&piece.bytes).await?;
        self.file.flush().await?;
        self.held = self.held.clone().set_bit(piece.spec.index as usize)?;
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(path = %self.info.id, index))]
    pub async fn get_piece(&mut self, index: u32) -> Result<Option<Vec<u8>>> {
        if !self.has_piece(index) {
            return Ok(None);
        }
        let spec = PieceSpec::new(self.info.clone(), index)
            .map_err(|_| DiskFileError::WrongFile {
                index,
                file: self.info.id.to_string(),
            })?;
        let mut buf = vec![0u8; spec.size() as usize];
        self.file.seek(SeekFrom::Start(spec.offset())).await?;
        self.file.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }
}

impl From<crate::bitset::BitSetError> for DiskFileError {
    fn from(_: crate::bitset::BitSetError) -> Self {
        DiskFileError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "piece index out of range for file",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::ArchivePath;
    use tokio::fs::OpenOptions;

    async fn open_empty(dir: &std::path::Path, name: &str, size: u64) -> (File, FileInfo) {
        let path = dir.join(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .unwrap();
        file.set_len(size).await.unwrap();
        let info = FileInfo::new(ArchivePath::new(name).unwrap(), size, 8);
        (file, info)
    }

    #[tokio::test]
    async fn put_then_get_round_trips_a_piece() {
        let dir = tempfile::tempdir().unwrap();
        let (file, info) = open_empty(dir.path(), "f.bin", 16).await;
        let mut disk_file = DiskFile::new(file, info.clone(), FiniteBitSet::new(2));

        let spec = PieceSpec::new(info, 0).unwrap();
        let piece = Piece::new(spec, vec![1; 8], -1).unwrap();
        disk_file.put_piece(&piece).await.unwrap();

        assert!(disk_file.has_piece(0));
        assert!(!disk_file.has_piece(1));
        let read_back = disk_file.get_piece(0).await.unwrap().unwrap();
        assert_eq!(read_back, vec![1; 8]);
    }

    #[tokio::test]
    async fn is_complete_once_every_piece_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let (file, info) = open_empty(dir.path(), "f.bin", 16).await;
        let mut disk_file = DiskFile::new(file, info.clone(), FiniteBitSet::new(2));
        assert!(!disk_file.is_complete());

        for index in 0..2 {
            let spec = PieceSpec::new(info.clone(), index).unwrap();
            let piece = Piece::new(spec, vec![0; 8], -1).unwrap();
            disk_file.put_piece(&piece).await.unwrap();
        }
        assert!(disk_file.is_complete());
    }
}
