//! Full project ports for specific targets. They provide the board
//! level layout and a method to construct the generic update system
//! from specific parts.
#[cfg(target_arch = "arm")]
use crate::devices::rollback::RestartRequired;

pub mod stm32f412;

/// Resets the device. Consumes the token returned by every operation
/// that rewrote program memory.
#[cfg(target_arch = "arm")]
pub fn reset(_: RestartRequired) -> ! { cortex_m::peripheral::SCB::sys_reset() }
