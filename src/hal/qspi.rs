//! Serial command bus used to talk to external NOR flash.

/// Quad SPI configured in indirect mode.
///
/// Indirect mode forces all communication to occur through explicit
/// command frames: an optional instruction byte, an optional address,
/// optional data and a number of dummy cycles.
pub trait Indirect {
    type Error;

    fn write(
        &mut self,
        instruction: Option<u8>,
        address: Option<u32>,
        data: Option<&[u8]>,
        dummy_cycles: u8,
    ) -> nb::Result<(), Self::Error>;

    fn read(
        &mut self,
        instruction: Option<u8>,
        address: Option<u32>,
        data: &mut [u8],
        dummy_cycles: u8,
    ) -> nb::Result<(), Self::Error>;
}
