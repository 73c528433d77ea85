//! Convenience bitwise operations.

use core::ops::BitOr;

/// Value of a NOR flash byte after erasure.
pub const ERASED_BYTE: u8 = 0xFF;

/// Simple check for particular bits being set or cleared.
pub trait BitFlags {
    fn is_set(&self, bit: u8) -> bool;
    fn is_clear(&self, bit: u8) -> bool;
}

/// Checks that every '1' bit is a '1' on the
/// right hand side.
pub trait BitSubset: Copy {
    fn is_subset_of(self, rhs: Self) -> bool;
}

/// Variant of the BitSubset trait for slices.
pub trait SliceBitSubset {
    /// Checks that every '1' in self is '1' in T
    fn is_subset_of(self, rhs: Self) -> bool;
}

/// Blanket implementation for any types convertible to u32.
impl<U: Copy + Into<u32>> BitFlags for U {
    fn is_set(&self, bit: u8) -> bool {
        debug_assert!(bit < 32);
        ((*self).into() & (1u32 << bit)) != 0
    }

    fn is_clear(&self, bit: u8) -> bool { !self.is_set(bit) }
}

impl<U: Copy + BitOr<Output = Self> + PartialEq> BitSubset for U {
    fn is_subset_of(self, rhs: Self) -> bool { (self | rhs) == rhs }
}

impl<T: BitSubset> SliceBitSubset for &[T] {
    fn is_subset_of(self, rhs: Self) -> bool {
        if self.len() > rhs.len() {
            false
        } else {
            self.iter().zip(rhs.iter()).all(|(a, b)| a.is_subset_of(*b))
        }
    }
}

/// Whether a range read back from NOR flash is still in its erased state.
pub fn is_erased(bytes: &[u8]) -> bool { bytes.iter().all(|b| *b == ERASED_BYTE) }
