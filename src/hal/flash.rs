//! External, byte addressable non-volatile storage.
//!
//! Implementers follow NOR semantics: an erased byte reads `0xFF`, and a
//! write can only clear bits. Callers are responsible for erasing the
//! covering sectors before writing new content.
use core::fmt;

/// Reads and writes a range of bytes at an absolute device address.
pub trait ReadWrite {
    type Error: Clone + Copy + fmt::Debug;

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;

    /// Programs `bytes` starting at `address`. Writes may span page
    /// boundaries; the implementer splits them as needed.
    fn write(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error>;

    /// Start and end (exclusive) of the addressable range.
    fn range(&self) -> (u32, u32);
}

/// Erasure at sector granularity.
pub trait SectorErase: ReadWrite {
    /// Erases the sector that contains `address`.
    fn erase_sector(&mut self, address: u32) -> nb::Result<(), Self::Error>;

    /// Size of the smallest erasable unit, in bytes.
    fn sector_size(&self) -> usize;
}
