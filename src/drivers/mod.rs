//! Driver implementations for all supported platforms. They offer
//! a safe API over the `hal` traits.

pub mod cycle_clock;
pub mod spi_nor;

pub mod stm32f4 {
    pub mod memory_map;
    #[cfg(all(feature = "stm32f4_any", target_arch = "arm"))]
    pub mod flash;
}
