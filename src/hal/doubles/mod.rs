//! Host-only test doubles for the HAL traits.
//!
//! These are public so integration tests under `tests/` can drive the
//! update system end to end without hardware.

pub mod error;
pub mod flash;
pub mod program;
pub mod qspi;
pub mod time;
