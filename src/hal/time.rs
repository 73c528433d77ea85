//! Time units.

/// Monotonic scheduler tick counter. Wraps around; compare instants only
/// through [`Ticks::elapsed_since`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct Ticks(pub u32);

impl Ticks {
    /// Ticks elapsed from `earlier` to `self`, with wrapping arithmetic.
    pub fn elapsed_since(self, earlier: Ticks) -> Ticks { Ticks(self.0.wrapping_sub(earlier.0)) }
}

pub trait Now {
    fn now(&self) -> Ticks;
}
