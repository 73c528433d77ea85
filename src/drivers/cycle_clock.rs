//! Millisecond scheduler ticks derived from a free running cycle counter
//! (the DWT cycle counter on Cortex-M).
//!
//! The counter wraps quickly at core frequency, so elapsed cycles are
//! accumulated on every read. `now()` must be called at least once per
//! counter period ([`CycleClock::period`], about 43 s at 100 MHz); whole
//! periods between two reads are lost and the clock runs slow.
use crate::hal::time::{self, Ticks};
use core::cell::Cell;

pub struct CycleClock<F: Fn() -> u32> {
    cycles: F,
    cycles_per_tick: u32,
    last: Cell<u32>,
    remainder: Cell<u32>,
    ticks: Cell<u32>,
}

impl<F: Fn() -> u32> CycleClock<F> {
    /// One tick per millisecond at `sysclk_hz`.
    pub fn new(cycles: F, sysclk_hz: u32) -> Self {
        let last = Cell::new(cycles());
        Self {
            cycles,
            cycles_per_tick: (sysclk_hz / 1000).max(1),
            last,
            remainder: Cell::new(0),
            ticks: Cell::new(0),
        }
    }

    /// Longest gap between two reads that loses no time.
    pub fn period(&self) -> Ticks { Ticks(u32::MAX / self.cycles_per_tick) }
}

impl<F: Fn() -> u32> time::Now for CycleClock<F> {
    fn now(&self) -> Ticks {
        let current = (self.cycles)();
        let elapsed = current.wrapping_sub(self.last.get()) as u64 + self.remainder.get() as u64;
        let per_tick = self.cycles_per_tick as u64;
        self.last.set(current);
        self.remainder.set((elapsed % per_tick) as u32);
        self.ticks.set(self.ticks.get().wrapping_add((elapsed / per_tick) as u32));
        Ticks(self.ticks.get())
    }
}
