//! Internal flash memory map of the STM32F412, from table 5 of the
//! reference manual. Sectors are the erase unit, so they double as the
//! program memory pages exposed to the update system.

/// Address blocks of the internal flash.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Block {
    /// Main memory, but reserved for the boot stage and its bookkeeping.
    Boot,
    /// Main memory, where the application is written.
    Main,
    SystemMemory,
    OneTimeProgrammable,
    OptionBytes,
}

/// A memory map sector, with an associated block and an address range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Sector {
    pub block: Block,
    pub start: u32,
    pub size: u32,
}

pub struct MemoryMap {
    pub sectors: [Sector; SECTOR_NUMBER],
}

pub const SECTOR_NUMBER: usize = 15;

pub const MEMORY_MAP: MemoryMap = MemoryMap {
    sectors: [
        Sector::new(Block::Boot, 0x0800_0000, 0x4000),
        Sector::new(Block::Boot, 0x0800_4000, 0x4000),
        Sector::new(Block::Boot, 0x0800_8000, 0x4000),
        Sector::new(Block::Boot, 0x0800_C000, 0x4000),
        Sector::new(Block::Main, 0x0801_0000, 0x10000),
        Sector::new(Block::Main, 0x0802_0000, 0x20000),
        Sector::new(Block::Main, 0x0804_0000, 0x20000),
        Sector::new(Block::Main, 0x0806_0000, 0x20000),
        Sector::new(Block::Main, 0x0808_0000, 0x20000),
        Sector::new(Block::Main, 0x080A_0000, 0x20000),
        Sector::new(Block::Main, 0x080C_0000, 0x20000),
        Sector::new(Block::Main, 0x080E_0000, 0x20000),
        Sector::new(Block::SystemMemory, 0x1FFF_0000, 0x7800),
        Sector::new(Block::OneTimeProgrammable, 0x1FFF_7800, 0x210),
        Sector::new(Block::OptionBytes, 0x1FFF_C000, 0x10),
    ],
};

impl Sector {
    const fn new(block: Block, start: u32, size: u32) -> Self { Sector { block, start, size } }
    pub const fn end(&self) -> u32 { self.start + self.size }
    pub const fn contains(&self, address: u32) -> bool { address >= self.start && address < self.end() }
    pub const fn is_writable(&self) -> bool { self.block as u8 == Block::Main as u8 }
    const fn is_in_main_memory_area(&self) -> bool {
        self.block as u8 == Block::Main as u8 || self.block as u8 == Block::Boot as u8
    }
}

impl MemoryMap {
    /// Verifies that the main memory area is consecutive and well formed.
    pub const fn is_sound(&self) -> bool {
        let mut index = 1;
        while index < SECTOR_NUMBER {
            let (previous, sector) = (&self.sectors[index - 1], &self.sectors[index]);
            if sector.is_in_main_memory_area() && previous.end() != sector.start {
                return false;
            }
            index += 1;
        }
        true
    }

    /// Index of the sector containing `address`. Only main memory sectors
    /// have a number the flash controller accepts.
    pub const fn number(&self, address: u32) -> Option<u8> {
        let mut index = 0;
        while index < SECTOR_NUMBER {
            let sector = &self.sectors[index];
            if sector.is_in_main_memory_area() && sector.contains(address) {
                return Some(index as u8);
            }
            index += 1;
        }
        None
    }

    /// Writable sector containing `address`.
    pub fn writable_sector(&self, address: u32) -> Option<&Sector> {
        self.sectors.iter().find(|s| s.is_writable() && s.contains(address))
    }

    /// Whether `[start, start + size)` lies entirely in writable sectors.
    pub const fn is_writable(&self, start: u32, size: usize) -> bool {
        if size == 0 {
            return false;
        }
        let last = start as u64 + size as u64 - 1;
        let mut index = 0;
        let (mut first_ok, mut last_ok) = (false, false);
        while index < SECTOR_NUMBER {
            let sector = &self.sectors[index];
            if sector.is_writable() {
                first_ok |= sector.contains(start);
                last_ok |= (sector.start as u64) <= last && last < sector.end() as u64;
            }
            index += 1;
        }
        first_ok && last_ok
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use static_assertions::const_assert;

    const_assert!(MEMORY_MAP.is_sound());

    #[test]
    fn sectors_are_located_by_address() {
        assert_eq!(MEMORY_MAP.number(0x0800_0000), Some(0));
        assert_eq!(MEMORY_MAP.number(0x0802_1234), Some(5));
        assert_eq!(MEMORY_MAP.number(0x080F_FFFF), Some(11));
        assert_eq!(MEMORY_MAP.number(0x1FFF_0000), None);
        assert_eq!(MEMORY_MAP.writable_sector(0x0800_4000), None);
        assert_eq!(MEMORY_MAP.writable_sector(0x0804_0010).map(|s| s.start), Some(0x0804_0000));
    }

    #[test]
    fn only_main_memory_is_writable() {
        assert!(MEMORY_MAP.is_writable(0x0801_0000, 0x30000));
        assert!(MEMORY_MAP.is_writable(0x0801_1234, 0x4000));
        assert!(!MEMORY_MAP.is_writable(0x0800_C000, 0x8000));
        assert!(!MEMORY_MAP.is_writable(0x080E_0000, 0x20001));
        assert!(!MEMORY_MAP.is_writable(0x0801_0000, 0));
    }
}
