use super::error::FakeError;
use crate::{
    hal::flash,
    utilities::bitwise::{SliceBitSubset, ERASED_BYTE},
};
use std::{cell::Cell, rc::Rc};

/// Handle to a [`FakeFlash`] power supply. Clones share the same supply, so
/// a test can cut power while the system under test owns the flash.
#[derive(Clone, Default, Debug)]
pub struct PowerSwitch(Rc<Cell<Option<usize>>>);

impl PowerSwitch {
    /// Every mutation after the next `count` fails until restored.
    pub fn cut_after(&self, count: usize) { self.0.set(Some(count)) }
    pub fn restore(&self) { self.0.set(None) }
}

/// In-memory NOR flash.
///
/// Writes AND into the existing content the way real NOR cells do, so a
/// missing erase shows up as corrupted data (and in `overwrites`) instead of
/// silently succeeding.
pub struct FakeFlash {
    base: u32,
    data: Vec<u8>,
    sector_size: usize,
    /// Start address of every sector erased, in order.
    pub erased_sectors: Vec<u32>,
    /// Number of successful write calls.
    pub writes: usize,
    /// Writes that tried to set bits which were not erased.
    pub overwrites: usize,
    /// When set, every access fails.
    pub faulty: bool,
    /// Every access reports busy forever.
    pub stalled: bool,
    /// Number of upcoming polls that report busy before proceeding.
    pub busy_polls: u32,
    power: PowerSwitch,
}

impl FakeFlash {
    pub fn new(base: u32, size: usize, sector_size: usize) -> Self {
        FakeFlash {
            base,
            data: vec![ERASED_BYTE; size],
            sector_size,
            erased_sectors: Vec::new(),
            writes: 0,
            overwrites: 0,
            faulty: false,
            stalled: false,
            busy_polls: 0,
            power: PowerSwitch::default(),
        }
    }

    /// Simulates a power cut after `count` more writes or erases: every
    /// mutation from then on fails until [`FakeFlash::restore_power`].
    pub fn cut_power_after(&mut self, count: usize) { self.power.cut_after(count) }

    pub fn restore_power(&mut self) { self.power.restore() }

    pub fn power(&self) -> PowerSwitch { self.power.clone() }

    /// Raw view of the stored bytes.
    pub fn contents(&self, address: u32, length: usize) -> &[u8] {
        let start = (address - self.base) as usize;
        &self.data[start..start + length]
    }

    /// Flips bits regardless of NOR rules, to model decay or tampering.
    pub fn corrupt(&mut self, address: u32, mask: u8) {
        let index = (address - self.base) as usize;
        self.data[index] ^= mask;
    }

    fn access(&mut self, address: u32, length: usize) -> nb::Result<usize, FakeError> {
        if self.stalled {
            return Err(nb::Error::WouldBlock);
        }
        if self.busy_polls > 0 {
            self.busy_polls -= 1;
            return Err(nb::Error::WouldBlock);
        }
        if self.faulty || address < self.base {
            return Err(nb::Error::Other(FakeError));
        }
        let start = (address - self.base) as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(start),
            _ => Err(nb::Error::Other(FakeError)),
        }
    }

    fn mutate(&mut self) -> nb::Result<(), FakeError> {
        match self.power.0.get() {
            Some(0) => Err(nb::Error::Other(FakeError)),
            Some(left) => {
                self.power.0.set(Some(left - 1));
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl flash::ReadWrite for FakeFlash {
    type Error = FakeError;

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        let start = self.access(address, bytes.len())?;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn write(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        let start = self.access(address, bytes.len())?;
        self.mutate()?;
        let cells = &mut self.data[start..start + bytes.len()];
        if !bytes.is_subset_of(&*cells) {
            self.overwrites += 1;
        }
        cells.iter_mut().zip(bytes).for_each(|(cell, byte)| *cell &= *byte);
        self.writes += 1;
        Ok(())
    }

    fn range(&self) -> (u32, u32) { (self.base, self.base + self.data.len() as u32) }
}

impl flash::SectorErase for FakeFlash {
    fn erase_sector(&mut self, address: u32) -> nb::Result<(), Self::Error> {
        self.access(address, 1)?;
        self.mutate()?;
        let sector = (address - self.base) as usize / self.sector_size * self.sector_size;
        let end = (sector + self.sector_size).min(self.data.len());
        self.data[sector..end].iter_mut().for_each(|cell| *cell = ERASED_BYTE);
        self.erased_sectors.push(self.base + sector as u32);
        Ok(())
    }

    fn sector_size(&self) -> usize { self.sector_size }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::flash::{ReadWrite, SectorErase};

    #[test]
    fn writes_only_clear_bits_until_erased() {
        // Given
        let mut flash = FakeFlash::new(0, 0x2000, 0x1000);
        flash.write(0x10, &[0xF0]).unwrap();

        // When
        flash.write(0x10, &[0x0F]).unwrap();
        let mut byte = [0u8];
        flash.read(0x10, &mut byte).unwrap();

        // Then
        assert_eq!(byte, [0x00]);
        assert_eq!(flash.overwrites, 1);

        // When
        flash.erase_sector(0x0FFF).unwrap();
        flash.read(0x10, &mut byte).unwrap();

        // Then
        assert_eq!(byte, [ERASED_BYTE]);
        assert_eq!(flash.erased_sectors, vec![0x0000]);
    }

    #[test]
    fn out_of_range_accesses_fail() {
        let mut flash = FakeFlash::new(0x1000, 0x100, 0x100);
        assert_eq!(flash.write(0x0FFF, &[0]), Err(nb::Error::Other(FakeError)));
        assert_eq!(flash.write(0x10FF, &[0, 0]), Err(nb::Error::Other(FakeError)));
        assert!(flash.write(0x10FF, &[0]).is_ok());
    }

    #[test]
    fn power_cut_blocks_mutations_but_not_reads() {
        // Given
        let mut flash = FakeFlash::new(0, 0x100, 0x100);
        flash.cut_power_after(1);

        // Then
        assert!(flash.write(0, &[0x00]).is_ok());
        assert!(flash.write(1, &[0x00]).is_err());
        assert!(flash.erase_sector(0).is_err());
        assert!(flash.read(0, &mut [0u8; 2]).is_ok());

        flash.restore_power();
        assert!(flash.erase_sector(0).is_ok());
    }
}
