//! Utilities to manipulate generic memory
#![macro_use]

#[macro_export]
macro_rules! kb {
    ($val:expr) => {
        $val * 1024
    };
}
#[macro_export]
macro_rules! mb {
    ($val:expr) => {
        $val * 1024 * 1024
    };
}

/// Contiguous range of a memory device, in bytes from the device origin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub location: u32,
    pub size: usize,
}

impl Region {
    pub const fn new(location: u32, size: usize) -> Self { Self { location, size } }

    /// First address past the end of the region.
    pub const fn end(&self) -> u32 { self.location + self.size as u32 }

    pub const fn contains(&self, address: u32) -> bool {
        address >= self.location && address < self.end()
    }

    /// Whether two regions share at least one address.
    pub const fn overlaps(&self, other: &Region) -> bool {
        self.location < other.end() && other.location < self.end()
    }

    /// Whether a span of `length` bytes starting `offset` bytes into the
    /// region stays inside it.
    pub fn fits(&self, offset: u32, length: usize) -> bool {
        (offset as usize).checked_add(length).map_or(false, |end| end <= self.size)
    }

    /// Start addresses of every `block`-sized block needed to cover the first
    /// `length` bytes of this region.
    pub fn blocks(&self, length: usize, block: usize) -> impl Iterator<Item = u32> {
        let location = self.location;
        let count = blocks_to_cover(length, block);
        (0..count).map(move |i| location + (i * block) as u32)
    }
}

/// Number of `block`-sized blocks needed to hold `length` bytes.
pub const fn blocks_to_cover(length: usize, block: usize) -> usize { (length + block - 1) / block }
