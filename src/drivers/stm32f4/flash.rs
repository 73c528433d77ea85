//! Internal Flash controller for the STM32F4 family, exposed as the
//! program memory the update system reprograms.
use super::memory_map::MEMORY_MAP;
use crate::{
    error::{self, Convertible},
    hal::program::ProgramMemory,
    stm32pac::FLASH,
    utilities::poll::{self, Exhausted},
};

///From section 3.5.1 of the reference manual.
const UNLOCK_KEYS: [u32; 2] = [0x45670123, 0xCDEF89AB];

/// Byte parallelism, valid across the whole supply voltage range.
const PSIZE_X8: u8 = 0b00;

pub struct McuFlash {
    flash: FLASH,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Error {
    MemoryNotReachable,
    MisalignedAccess,
    ProgrammingFailed,
    TimeOut,
}

impl Convertible for Error {
    fn into(self) -> error::Error {
        match self {
            Error::MemoryNotReachable | Error::MisalignedAccess => error::Error::TooLarge,
            Error::ProgrammingFailed | Error::TimeOut => error::Error::IoFailure,
        }
    }
}

impl McuFlash {
    pub fn new(flash: FLASH) -> Self { Self { flash } }

    fn unlock(&mut self) {
        // NOTE(Safety): Unsafe block to use the 'bits' convenience function.
        // Applies to all blocks in this file unless specified otherwise
        self.flash.keyr.write(|w| unsafe { w.bits(UNLOCK_KEYS[0]) });
        self.flash.keyr.write(|w| unsafe { w.bits(UNLOCK_KEYS[1]) });
        self.flash.cr.modify(|_, w| unsafe { w.psize().bits(PSIZE_X8) });
    }

    fn lock(&mut self) { self.flash.cr.modify(|_, w| w.lock().set_bit()); }

    fn is_busy(&self) -> bool { self.flash.sr.read().bsy().bit_is_set() }

    fn idle(&self) -> nb::Result<(), Error> {
        if self.is_busy() {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    /// Waits for the current operation, then reports and clears any
    /// programming error flags.
    fn settle(&mut self) -> Result<(), Error> {
        poll!(poll::DEFAULT_ATTEMPTS, self.idle()).map_err(|e| match e {
            Exhausted::TimedOut => Error::TimeOut,
            Exhausted::Failed(e) => e,
        })?;
        let status = self.flash.sr.read();
        let failed = status.pgserr().bit_is_set()
            || status.pgperr().bit_is_set()
            || status.pgaerr().bit_is_set()
            || status.wrperr().bit_is_set();
        // Error flags are cleared by writing ones.
        self.flash.sr.write(|w| unsafe { w.bits(0xF3) });
        if failed {
            Err(Error::ProgrammingFailed)
        } else {
            Ok(())
        }
    }
}

impl ProgramMemory for McuFlash {
    type Error = Error;

    fn page_span(&self, address: u32) -> Option<(u32, usize)> {
        MEMORY_MAP.writable_sector(address).map(|s| (s.start, s.size as usize))
    }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        if !MEMORY_MAP.is_writable(address, bytes.len()) {
            return Err(nb::Error::Other(Error::MemoryNotReachable));
        }
        let base = address as *const u8;
        for (index, byte) in bytes.iter_mut().enumerate() {
            // NOTE(Safety): the range was checked to lie in main memory,
            // which is always mapped. Writes only happen through a mutable
            // reference to this same driver, so there can't be a data race.
            *byte = unsafe { core::ptr::read_volatile(base.add(index)) };
        }
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> nb::Result<(), Self::Error> {
        let sector = MEMORY_MAP.writable_sector(address).ok_or(nb::Error::Other(Error::MemoryNotReachable))?;
        if sector.start != address {
            return Err(nb::Error::Other(Error::MisalignedAccess));
        }
        let number = MEMORY_MAP.number(address).ok_or(nb::Error::Other(Error::MemoryNotReachable))?;
        self.idle()?;
        self.unlock();
        self.flash.cr.modify(|_, w| unsafe { w.ser().set_bit().snb().bits(number) });
        self.flash.cr.modify(|_, w| w.strt().set_bit());
        let result = self.settle();
        self.flash.cr.modify(|_, w| w.ser().clear_bit());
        self.lock();
        Ok(result?)
    }

    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        if !MEMORY_MAP.is_writable(address, bytes.len()) {
            return Err(nb::Error::Other(Error::MemoryNotReachable));
        }
        self.idle()?;
        self.unlock();
        self.flash.cr.modify(|_, w| w.pg().set_bit());
        let base = address as *mut u8;
        let mut result = Ok(());
        for (index, byte) in bytes.iter().enumerate() {
            // NOTE(Safety): Writing to a memory-mapped flash directly is
            // naturally unsafe. The range was checked against the memory
            // map, and the boot stage sectors are never writable.
            unsafe { core::ptr::write_volatile(base.add(index), *byte) };
            result = self.settle();
            if result.is_err() {
                break;
            }
        }
        self.flash.cr.modify(|_, w| w.pg().clear_bit());
        self.lock();
        Ok(result?)
    }

    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        cortex_m::interrupt::free(|_| f(self))
    }
}
