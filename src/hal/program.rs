//! Internal program memory, the flash the MCU executes from.
use core::fmt;

/// Page-erasable program memory.
///
/// Pages may be of uneven size (as on the STM32F4 family), so callers ask
/// for the page that covers an address instead of assuming a fixed size.
pub trait ProgramMemory {
    type Error: Clone + Copy + fmt::Debug;

    /// Start address and size of the page containing `address`, or `None`
    /// if the address is not programmable.
    fn page_span(&self, address: u32) -> Option<(u32, usize)>;

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error>;

    /// Erases the page starting at `address`.
    fn erase_page(&mut self, address: u32) -> nb::Result<(), Self::Error>;

    /// Programs previously erased memory.
    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error>;

    /// Runs `f` with interrupts masked. Reprogramming the memory the CPU is
    /// executing from must not be interleaved with any other code.
    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R
    where
        Self: Sized,
    {
        f(self)
    }
}
