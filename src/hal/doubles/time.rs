use crate::hal::time::{Now, Ticks};
use std::{cell::Cell, rc::Rc};

/// Manually advanced tick source. Clones share the same counter, so a test
/// can keep a handle while the system under test owns another.
#[derive(Clone, Default, Debug)]
pub struct FakeClock(Rc<Cell<u32>>);

impl FakeClock {
    pub fn starting_at(ticks: u32) -> Self { Self(Rc::new(Cell::new(ticks))) }
    pub fn advance(&self, ticks: u32) { self.0.set(self.0.get().wrapping_add(ticks)) }
}

impl Now for FakeClock {
    fn now(&self) -> Ticks { Ticks(self.0.get()) }
}
