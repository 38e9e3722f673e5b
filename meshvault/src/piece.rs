use bitvec::prelude::*;

use crate::path::ArchivePath;

/// Canonical piece size used when a file's piece size isn't otherwise
/// specified.
pub const DEFAULT_PIECE_SIZE: u64 = 131_072;

/// Identity of a file-or-category within the archive. A category is a
/// directory `ArchivePath`; it matches every path nested under it.
pub type FileId = ArchivePath;

/// `(FileId, fileSize, pieceSize)`. Two `FileInfo`s are equal iff all
/// three fields agree; this is the unit peers compare to detect a
/// mismatched view of the same file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileInfo {
    pub id: FileId,
    pub file_size: u64,
    pub piece_size: u64,
}

#[derive(thiserror::Error, Debug)]
pub enum PieceError {
    #[error("piece index {index} out of range for {piece_count} pieces")]
    IndexOutOfRange { index: u32, piece_count: u32 },

    #[error("file info mismatch for {id}: {a:?} vs {b:?}")]
    FileInfoMismatch {
        id: FileId,
        a: Box<FileInfo>,
        b: Box<FileInfo>,
    },

    #[error("piece data length {actual} does not match spec size {expected}")]
    SizeMismatch { expected: u64, actual: usize },
}

pub type Result<T> = std::result::Result<T, PieceError>;

impl FileInfo {
    pub fn new(id: FileId, file_size: u64, piece_size: u64) -> Self {
        debug_assert!(piece_size > 0, "piece size must be positive");
        Self {
            id,
            file_size,
            piece_size,
        }
    }

    /// `ceil(file_size / piece_size)`, zero when the file is empty.
    pub fn piece_count(&self) -> u32 {
        if self.file_size == 0 {
            0
        } else {
            ((self.file_size - 1) / self.piece_size + 1) as u32
        }
    }

    pub fn piece_len(&self, index: u32) -> u64 {
        if index as u64 == self.piece_count() as u64 - 1 {
            ((self.file_size - 1) % self.piece_size) + 1
        } else {
            self.piece_size
        }
    }
}

/// `(FileInfo, index)`, the unit of transfer identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PieceSpec {
    pub file_info: FileInfo,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(file_info: FileInfo, index: u32) -> Result<Self> {
        let piece_count = file_info.piece_count();
        if index >= piece_count {
            return Err(PieceError::IndexOutOfRange { index, piece_count });
        }
        Ok(Self { file_info, index })
    }

    pub fn offset(&self) -> u64 {
        self.index as u64 * self.file_info.piece_size
    }

    pub fn size(&self) -> u64 {
        self.file_info.piece_len(self.index)
    }

    pub fn path(&self) -> &ArchivePath {
        &self.file_info.id
    }
}

/// `(PieceSpec, bytes, timeToLive)`. `time_to_live` is in seconds;
/// negative means "never schedule for deletion".
#[derive(Debug, Clone)]
pub struct Piece {
    pub spec: PieceSpec,
    pub bytes: Vec<u8>,
    pub time_to_live: i64,
}

impl Piece {
    pub fn new(spec: PieceSpec, bytes: Vec<u8>, time_to_live: i64) -> Result<Self> {
        if bytes.len() as u64 != spec.size() {
            return Err(PieceError::SizeMismatch {
                expected: spec.size(),
                actual: bytes.len(),
            });
        }
        Ok(Self {
            spec,
            bytes,
            time_to_live,
        })
    }
}

/// Either "all pieces of a `FileInfo`" or an explicit bitmap over it.
/// Closed under union via `merge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilePieceSpecSet {
    All(FileInfo),
    Some {
        file_info: FileInfo,
        indexes: BitVec<u8, Lsb0>,
    },
}

impl FilePieceSpecSet {
    pub fn all(file_info: FileInfo) -> Self {
        FilePieceSpecSet::All(file_info)
    }

    pub fn single(file_info: FileInfo, index: u32) -> Self {
        let piece_count = file_info.piece_count() as usize;
        let mut indexes = bitvec![u8, Lsb0; 0; piece_count];
        indexes.set(index as usize, true);
        FilePieceSpecSet::Some { file_info, indexes }
    }

    pub fn file_info(&self) -> &FileInfo {
        match self {
            FilePieceSpecSet::All(info) => info,
            FilePieceSpecSet::Some { file_info, .. } => file_info,
        }
    }

    fn same_file(&self, other: &FilePieceSpecSet) -> Result<()> {
        if self.file_info().id != other.file_info().id {
            return Ok(());
        }
        if self.file_info() != other.file_info() {
            return Err(PieceError::FileInfoMismatch {
                id: self.file_info().id.clone(),
                a: Box::new(self.file_info().clone()),
                b: Box::new(other.file_info().clone()),
            });
        }
        Ok(())
    }

    /// Commutative, associative union. Merging `All` with anything of
    /// the same `FileInfo` yields `All`; merging two `All`s that share a
    /// `FileId` but disagree on size/piece-size is a `FileInfoMismatch`.
    pub fn merge(self, other: FilePieceSpecSet) -> Result<FilePieceSpecSet> {
        self.same_file(&other)?;
        if self.file_info().id != other.file_info().id {
            // Different files entirely; callers are expected to key sets
            // by FileId before merging. Last-writer-wins is not a valid
            // outcome here, so prefer the caller's own set unchanged.
            return Ok(self);
        }

        match (self, other) {
            (FilePieceSpecSet::All(info), _) | (_, FilePieceSpecSet::All(info)) => {
                Ok(FilePieceSpecSet::All(info))
            }
            (
                FilePieceSpecSet::Some {
                    file_info,
                    mut indexes,
                },
                FilePieceSpecSet::Some {
                    indexes: other_indexes,
                    ..
                },
            ) => {
                indexes |= other_indexes;
                Ok(FilePieceSpecSet::Some { file_info, indexes })
            }
        }
    }

    pub fn contains(&self, index: u32) -> bool {
        match self {
            FilePieceSpecSet::All(_) => true,
            FilePieceSpecSet::Some { indexes, .. } => {
                indexes.get(index as usize).is_some_and(|b| *b)
            }
        }
    }

    /// Iterates the concrete indexes named by this set.
    pub fn indexes(&self) -> Vec<u32> {
        match self {
            FilePieceSpecSet::All(info) => (0..info.piece_count()).collect(),
            FilePieceSpecSet::Some { indexes, .. } => indexes
                .iter()
                .enumerate()
                .filter_map(|(i, b)| b.then_some(i as u32))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(size: u64) -> FileInfo {
        FileInfo::new(ArchivePath::new("f").unwrap(), size, 131_072)
    }

    #[test]
    fn piece_count_is_ceil_division() {
        assert_eq!(info(300_000).piece_count(), 3);
        assert_eq!(info(0).piece_count(), 0);
        assert_eq!(info(131_072).piece_count(), 1);
        assert_eq!(info(131_073).piece_count(), 2);
    }

    #[test]
    fn last_piece_len_is_remainder() {
        let info = info(300_000);
        assert_eq!(info.piece_len(0), 131_072);
        assert_eq!(info.piece_len(1), 131_072);
        assert_eq!(info.piece_len(2), 300_000 - 2 * 131_072);
    }

    #[test]
    fn piece_spec_rejects_out_of_range_index() {
        let info = info(1);
        assert!(matches!(
            PieceSpec::new(info, 1),
            Err(PieceError::IndexOutOfRange { .. })
        ));
    }

    #[test]
    fn merge_all_absorbs_partial() {
        let info = info(300_000);
        let all = FilePieceSpecSet::all(info.clone());
        let partial = FilePieceSpecSet::single(info, 0);
        let merged = all.merge(partial).unwrap();
        assert!(matches!(merged, FilePieceSpecSet::All(_)));
    }

    #[test]
    fn merge_partials_unions_bits() {
        let info = info(300_000);
        let a = FilePieceSpecSet::single(info.clone(), 0);
        let b = FilePieceSpecSet::single(info, 1);
        let merged = a.merge(b).unwrap();
        assert!(merged.contains(0));
        assert!(merged.contains(1));
        assert!(!merged.contains(2));
    }

    #[test]
    fn merge_mismatched_file_infos_for_same_id_errors() {
        let id = ArchivePath::new("f").unwrap();
        let a = FilePieceSpecSet::all(FileInfo::new(id.clone(), 300_000, 131_072));
        let b = FilePieceSpecSet::all(FileInfo::new(id, 300_001, 131_072));
        assert!(matches!(
            a.merge(b),
            Err(PieceError::FileInfoMismatch { .. })
        ));
    }
}
