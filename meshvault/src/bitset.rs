use bitvec::prelude::*;

#[derive(thiserror::Error, Debug)]
pub enum BitSetError {
    #[error("index {index} out of range for bitset of size {size}")]
    IndexOutOfRange { index: usize, size: usize },
}

pub type Result<T> = std::result::Result<T, BitSetError>;

/// "Which pieces do I have", with an O(1) all-set singleton so that a
/// completed file's `getPiece` path never needs to allocate or scan a
/// bitmap to prove it has every piece.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiniteBitSet {
    Bitmap { size: usize, bits: BitVec<u8, Lsb0> },
    Complete { size: usize },
}

impl FiniteBitSet {
    pub fn new(size: usize) -> Self {
        FiniteBitSet::Bitmap {
            size,
            bits: bitvec![u8, Lsb0; 0; size],
        }
    }

    pub fn all_set(size: usize) -> Self {
        FiniteBitSet::Complete { size }
    }

    pub fn size(&self) -> usize {
        match self {
            FiniteBitSet::Bitmap { size, .. } => *size,
            FiniteBitSet::Complete { size } => *size,
        }
    }

    fn check(&self, index: usize) -> Result<()> {
        if index >= self.size() {
            Err(BitSetError::IndexOutOfRange {
                index,
                size: self.size(),
            })
        } else {
            Ok(())
        }
    }

    pub fn is_set(&self, index: usize) -> Result<bool> {
        self.check(index)?;
        Ok(match self {
            FiniteBitSet::Bitmap { bits, .. } => bits[index],
            FiniteBitSet::Complete { .. } => true,
        })
    }

    /// Sets a bit, returning the (possibly unchanged) resulting set. A
    /// no-op on an already-complete set.
    pub fn set_bit(self, index: usize) -> Result<Self> {
        self.check(index)?;
        match self {
            FiniteBitSet::Complete { .. } => Ok(self),
            FiniteBitSet::Bitmap { size, mut bits } => {
                bits.set(index, true);
                Ok(FiniteBitSet::Bitmap { size, bits })
            }
        }
    }

    pub fn are_all_set(&self) -> bool {
        match self {
            FiniteBitSet::Complete { .. } => true,
            FiniteBitSet::Bitmap { bits, .. } => bits.all(),
        }
    }

    pub fn count_set(&self) -> usize {
        match self {
            FiniteBitSet::Complete { size } => *size,
            FiniteBitSet::Bitmap { bits, .. } => bits.count_ones(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_bit_on_complete_is_noop() {
        let complete = FiniteBitSet::all_set(4);
        let still = complete.clone().set_bit(2).unwrap();
        assert_eq!(still, complete);
        assert!(still.are_all_set());
    }

    #[test]
    fn are_all_set_is_true_once_every_bit_is_set() {
        let mut bs = FiniteBitSet::new(3);
        assert!(!bs.are_all_set());
        bs = bs.set_bit(0).unwrap();
        bs = bs.set_bit(1).unwrap();
        assert!(!bs.are_all_set());
        bs = bs.set_bit(2).unwrap();
        assert!(bs.are_all_set());
    }

    #[test]
    fn out_of_range_is_an_error() {
        let bs = FiniteBitSet::new(3);
        assert!(matches!(
            bs.is_set(3),
            Err(BitSetError::IndexOutOfRange { index: 3, size: 3 })
        ));
    }

    #[test]
    fn complete_is_set_is_always_true() {
        let bs = FiniteBitSet::all_set(5);
        for i in 0..5 {
            assert!(bs.is_set(i).unwrap());
        }
    }
}
