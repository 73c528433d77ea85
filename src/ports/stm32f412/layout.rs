//! Memory layout for the STM32F412 port.
//!
//! External flash (16MB N25Q128A, 4KB subsectors):
//!
//! | Region | Location   | Size    |
//! |--------|------------|---------|
//! | header | 0x00000000 | 4KB     |
//! | state  | 0x00001000 | 4KB     |
//! | slot A | 0x00010000 | 960KB   |
//! | slot B | 0x00100000 | 960KB   |
//!
//! The application occupies the main memory sectors of the internal flash,
//! from 0x08010000 to the end of the 1MB bank.
use crate::{
    devices::layout::Layout,
    drivers::{spi_nor::SUBSECTOR_SIZE, stm32f4::memory_map::MEMORY_MAP},
    hal::time::Ticks,
    utilities::memory::Region,
};
use static_assertions::const_assert;

pub const EXTERNAL_FLASH_SIZE: usize = mb!(16);
pub const SYSCLK_HZ: u32 = 100_000_000;

/// Five minutes at one tick per millisecond.
pub const VALIDATION_TIMEOUT: Ticks = Ticks(5 * 60 * 1000);

pub const LAYOUT: Layout = Layout {
    header: Region::new(0x0000_0000, SUBSECTOR_SIZE),
    state: Region::new(0x0000_1000, SUBSECTOR_SIZE),
    slots: [Region::new(0x0001_0000, kb!(960)), Region::new(0x0010_0000, kb!(960))],
    sector_size: SUBSECTOR_SIZE,
    program: Region::new(0x0801_0000, kb!(960)),
    validation_timeout: VALIDATION_TIMEOUT,
    persist_interval: 16,
};

const_assert!(LAYOUT.is_sound());
const_assert!(LAYOUT.slots[1].end() as usize <= EXTERNAL_FLASH_SIZE);
const_assert!(MEMORY_MAP.is_writable(LAYOUT.program.location, LAYOUT.program.size));
