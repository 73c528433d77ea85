//! Port for STM32F412 boards with a Micron N25Q128A external flash.
pub mod layout;

#[cfg(all(feature = "stm32f412", target_arch = "arm"))]
mod device {
    use super::layout::{EXTERNAL_FLASH_SIZE, LAYOUT, SYSCLK_HZ};
    use crate::{
        devices::{
            keys::{DeviceKey, DEVICE_ID_SIZE, KEY_SIZE},
            ota::Ota,
        },
        drivers::{
            cycle_clock::CycleClock,
            spi_nor::{self, SpiNorFlash},
            stm32f4::flash::McuFlash,
        },
        hal::qspi,
        stm32pac::FLASH,
    };
    use cortex_m::peripheral::{DCB, DWT};

    /// Base of the 96 bit unique device id, from section 30.1 of the
    /// reference manual.
    const UID_BASE: u32 = 0x1FFF_7A10;

    pub type Clock = CycleClock<fn() -> u32>;
    pub type BoardOta<QSPI> = Ota<SpiNorFlash<QSPI>, McuFlash, Clock>;

    /// First 8 bytes of the factory programmed unique id.
    pub fn device_id() -> [u8; DEVICE_ID_SIZE] {
        let mut id = [0u8; DEVICE_ID_SIZE];
        for (index, byte) in id.iter_mut().enumerate() {
            // NOTE(Safety): the unique id is a read-only, always mapped
            // system memory area.
            *byte = unsafe { core::ptr::read_volatile((UID_BASE as *const u8).add(index)) };
        }
        id
    }

    fn cycles() -> u32 { DWT::get_cycle_count() }

    /// Builds the update system. [`Ota::boot`] must run next.
    ///
    /// Time comes from the DWT cycle counter, which wraps every 43 s at
    /// [`SYSCLK_HZ`]. While a validation window is open the application
    /// must call [`Ota::check_validation`] more often than that.
    pub fn ota<QSPI: qspi::Indirect>(
        qspi: QSPI,
        flash: FLASH,
        dwt: &mut DWT,
        dcb: &mut DCB,
        secret: [u8; KEY_SIZE],
    ) -> Result<BoardOta<QSPI>, spi_nor::Error> {
        dcb.enable_trace();
        dwt.enable_cycle_counter();
        let external = SpiNorFlash::new(qspi, EXTERNAL_FLASH_SIZE)?;
        let clock: Clock = CycleClock::new(cycles as fn() -> u32, SYSCLK_HZ);
        let keys = DeviceKey { secret, device_id: device_id() };
        Ok(Ota::new(external, McuFlash::new(flash), clock, &keys, &LAYOUT))
    }
}

#[cfg(all(feature = "stm32f412", target_arch = "arm"))]
pub use device::*;
