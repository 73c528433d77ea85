//! # Rootstock
//!
//! Fail-safe firmware update transactions for battery powered field
//! controllers. The crate backs up the running firmware to external
//! flash, stages a new image received in chunks, commits it, and rolls
//! back to the last known good image when the new firmware fails to
//! confirm itself within a validation window.
#![cfg_attr(test, allow(unused_imports))]
#![cfg_attr(target_arch = "arm", no_std)]

#[cfg(all(feature = "stm32f412", target_arch = "arm"))]
pub use stm32f4::stm32f412 as stm32pac;

extern crate static_assertions;

#[cfg(target_arch = "arm")]
pub(crate) use defmt as logging;
#[cfg(not(target_arch = "arm"))]
pub(crate) use log as logging;

#[macro_use]
pub mod utilities {
    #[macro_use]
    pub mod memory;
    pub mod bitwise;
    #[macro_use]
    pub mod poll;
}

pub mod hal;
pub mod devices;
pub mod drivers;
pub mod ports;
pub mod error;
