mod record;

pub use record::HeapRecord;

use std::fs::OpenOptions;
use std::io;
use std::marker::PhantomData;
use std::path::Path;

use fs4::FileExt;
use memmap2::MmapMut;

const VERSION: i32 = 1;
const HEADER_SIZE: usize = 12; // version:i32 + eltSize:i32 + count:i32
const GOLDEN_RATIO: f64 = 1.618_034;

#[derive(thiserror::Error, Debug)]
pub enum HeapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("heap file was built for a different element size")]
    BadHeader,

    #[error("heap file version {found} is not supported (expected {expected})")]
    UnsupportedVersion { found: i32, expected: i32 },
}

pub type Result<T> = std::result::Result<T, HeapError>;

/// A persistent binary min-heap backed by a memory-mapped file.
///
/// Every operation that mutates the heap holds a whole-file advisory
/// lock for its duration via `fs4`, so the structure is safe to share
/// across processes on the same host. Growth doubles capacity by the
/// golden ratio so amortized append cost stays O(1) without the file
/// size trending toward a power of two.
pub struct MinHeapFile<T: HeapRecord> {
    file: std::fs::File,
    map: MmapMut,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: HeapRecord> MinHeapFile<T> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let len = file.metadata()?.len();
        if len < HEADER_SIZE as u64 {
            file.set_len(HEADER_SIZE as u64)?;
            let mut map = unsafe { MmapMut::map_mut(&file)? };
            write_header(&mut map, T::SIZE as i32, 0);
            map.flush()?;
            let capacity = 0;
            return Ok(Self {
                file,
                map,
                capacity,
                _marker: PhantomData,
            });
        }

        let map = unsafe { MmapMut::map_mut(&file)? };
        let version = read_i32(&map, 0);
        let elt_size = read_i32(&map, 4);
        if version != VERSION {
            return Err(HeapError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }
        if elt_size != T::SIZE as i32 {
            return Err(HeapError::BadHeader);
        }
        let capacity = (map.len() - HEADER_SIZE) / T::SIZE;

        Ok(Self {
            file,
            map,
            capacity,
            _marker: PhantomData,
        })
    }

    pub fn len(&self) -> usize {
        read_i32(&self.map, 8) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn peek_min(&self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        Some(self.read_slot(0))
    }

    pub fn push(&mut self, record: T) -> Result<()> {
        self.file.lock_exclusive()?;
        let result = self.push_locked(record);
        FileExt::unlock(&self.file)?;
        result
    }

    fn push_locked(&mut self, record: T) -> Result<()> {
        let count = self.len();
        if count == self.capacity {
            self.grow()?;
        }

        // Durably append first: once the on-disk count is bumped the
        // record is part of the heap even if the process dies before
        // sift_up restores heap order. A crash before the count write
        // leaves it un-counted, at worst costing a duplicate re-add by
        // the caller rather than losing any entry already counted.
        self.write_slot(count, &record);
        self.map.flush_range(HEADER_SIZE + count * T::SIZE, T::SIZE)?;
        write_count(&mut self.map, count as i32 + 1);
        self.map.flush_range(8, 4)?;

        self.sift_up(count);
        self.map.flush()?;
        Ok(())
    }

    pub fn pop_min(&mut self) -> Result<Option<T>> {
        self.file.lock_exclusive()?;
        let result = self.pop_min_locked();
        FileExt::unlock(&self.file)?;
        result
    }

    fn pop_min_locked(&mut self) -> Result<Option<T>> {
        let count = self.len();
        if count == 0 {
            return Ok(None);
        }

        let min = self.read_slot(0);
        let last = self.read_slot(count - 1);
        self.write_slot(0, &last);
        write_count(&mut self.map, count as i32 - 1);
        self.map.flush_range(8, 4)?;

        if count > 1 {
            self.sift_down(0, count - 1);
        }
        self.map.flush()?;
        Ok(Some(min))
    }

    fn grow(&mut self) -> Result<()> {
        let new_capacity = ((self.capacity as f64 * GOLDEN_RATIO).ceil() as usize).max(8);
        let new_len = HEADER_SIZE + new_capacity * T::SIZE;
        self.file.set_len(new_len as u64)?;
        self.map = unsafe { MmapMut::map_mut(&self.file)? };
        self.capacity = new_capacity;
        Ok(())
    }

    fn slot_offset(&self, index: usize) -> usize {
        HEADER_SIZE + index * T::SIZE
    }

    fn read_slot(&self, index: usize) -> T {
        let offset = self.slot_offset(index);
        T::read_from(&self.map[offset..offset + T::SIZE])
    }

    fn write_slot(&mut self, index: usize, record: &T) {
        let offset = self.slot_offset(index);
        record.write_to(&mut self.map[offset..offset + T::SIZE]);
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.read_slot(parent).key() <= self.read_slot(index).key() {
                break;
            }
            self.swap_slots(parent, index);
            index = parent;
        }
    }

    fn sift_down(&mut self, mut index: usize, count: usize) {
        loop {
            let left = 2 * index + 1;
            let right = 2 * index + 2;
            let mut smallest = index;
            if left < count && self.read_slot(left).key() < self.read_slot(smallest).key() {
                smallest = left;
            }
            if right < count && self.read_slot(right).key() < self.read_slot(smallest).key() {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap_slots(index, smallest);
            index = smallest;
        }
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        let va = self.read_slot(a);
        let vb = self.read_slot(b);
        self.write_slot(a, &vb);
        self.write_slot(b, &va);
    }
}

fn read_i32(map: &MmapMut, offset: usize) -> i32 {
    i32::from_le_bytes(map[offset..offset + 4].try_into().unwrap())
}

/// Writes the 12-byte header: `{version: i32, eltSize: i32, count: i32}`.
fn write_header(map: &mut MmapMut, elt_size: i32, count: i32) {
    map[0..4].copy_from_slice(&VERSION.to_le_bytes());
    map[4..8].copy_from_slice(&elt_size.to_le_bytes());
    map[8..12].copy_from_slice(&count.to_le_bytes());
}

fn write_count(map: &mut MmapMut, count: i32) {
    map[8..12].copy_from_slice(&count.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestRecord {
        when: i64,
    }

    impl HeapRecord for TestRecord {
        const SIZE: usize = 8;

        fn key(&self) -> i64 {
            self.when
        }

        fn write_to(&self, buf: &mut [u8]) {
            buf.copy_from_slice(&self.when.to_le_bytes());
        }

        fn read_from(buf: &[u8]) -> Self {
            TestRecord {
                when: i64::from_le_bytes(buf.try_into().unwrap()),
            }
        }
    }

    #[test]
    fn pops_in_ascending_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut heap: MinHeapFile<TestRecord> = MinHeapFile::open(dir.path().join("heap")).unwrap();

        for when in [5, 1, 4, 2, 3] {
            heap.push(TestRecord { when }).unwrap();
        }
        assert_eq!(heap.len(), 5);

        let mut popped = Vec::new();
        while let Some(r) = heap.pop_min().unwrap() {
            popped.push(r.when);
        }
        assert_eq!(popped, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn survives_reopen_after_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("heap");
        {
            let mut heap: MinHeapFile<TestRecord> = MinHeapFile::open(&path).unwrap();
            for when in 0..20 {
                heap.push(TestRecord { when }).unwrap();
            }
        }

        let mut reopened: MinHeapFile<TestRecord> = MinHeapFile::open(&path).unwrap();
        assert_eq!(reopened.len(), 20);
        assert_eq!(reopened.peek_min().unwrap().when, 0);
        assert_eq!(reopened.pop_min().unwrap().unwrap().when, 0);
        assert_eq!(reopened.pop_min().unwrap().unwrap().when, 1);
    }

    #[test]
    fn empty_heap_pops_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut heap: MinHeapFile<TestRecord> = MinHeapFile::open(dir.path().join("heap")).unwrap();
        assert!(heap.pop_min().unwrap().is_none());
    }
}
