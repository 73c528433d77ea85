use super::error::FakeError;
use crate::{
    hal::program::ProgramMemory,
    utilities::bitwise::{SliceBitSubset, ERASED_BYTE},
};

/// In-memory program flash with uniform pages.
///
/// Records every erase and write, and separately counts those issued
/// outside a [`ProgramMemory::critical`] section.
pub struct FakeProgramMemory {
    base: u32,
    page_size: usize,
    data: Vec<u8>,
    in_critical: bool,
    /// Start address of every page erased, in order.
    pub erased_pages: Vec<u32>,
    pub writes: usize,
    /// Writes that tried to set bits which were not erased.
    pub overwrites: usize,
    /// Erases or writes performed with interrupts enabled.
    pub unmasked_operations: usize,
    /// Number of critical sections entered.
    pub critical_sections: usize,
    /// When set, every erase and write fails.
    pub faulty: bool,
    /// When set, the write after this many successful ones fails once.
    pub fail_after_writes: Option<usize>,
}

impl FakeProgramMemory {
    pub fn new(base: u32, size: usize, page_size: usize) -> Self {
        FakeProgramMemory {
            base,
            page_size,
            data: vec![ERASED_BYTE; size],
            in_critical: false,
            erased_pages: Vec::new(),
            writes: 0,
            overwrites: 0,
            unmasked_operations: 0,
            critical_sections: 0,
            faulty: false,
            fail_after_writes: None,
        }
    }

    /// Places firmware directly, as a factory programmer would.
    pub fn load(&mut self, address: u32, bytes: &[u8]) {
        let start = (address - self.base) as usize;
        self.data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    pub fn contents(&self, address: u32, length: usize) -> &[u8] {
        let start = (address - self.base) as usize;
        &self.data[start..start + length]
    }

    fn index(&self, address: u32, length: usize) -> nb::Result<usize, FakeError> {
        let start = address.checked_sub(self.base).ok_or(nb::Error::Other(FakeError))? as usize;
        match start.checked_add(length) {
            Some(end) if end <= self.data.len() => Ok(start),
            _ => Err(nb::Error::Other(FakeError)),
        }
    }

    fn mutation(&mut self) -> nb::Result<(), FakeError> {
        if self.faulty {
            return Err(nb::Error::Other(FakeError));
        }
        if !self.in_critical {
            self.unmasked_operations += 1;
        }
        Ok(())
    }
}

impl ProgramMemory for FakeProgramMemory {
    type Error = FakeError;

    fn page_span(&self, address: u32) -> Option<(u32, usize)> {
        let offset = address.checked_sub(self.base)? as usize;
        if offset >= self.data.len() {
            return None;
        }
        let page = offset / self.page_size * self.page_size;
        Some((self.base + page as u32, self.page_size))
    }

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        let start = self.index(address, bytes.len())?;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn erase_page(&mut self, address: u32) -> nb::Result<(), Self::Error> {
        let (page, size) = self.page_span(address).ok_or(nb::Error::Other(FakeError))?;
        self.mutation()?;
        let start = (page - self.base) as usize;
        self.data[start..start + size].iter_mut().for_each(|cell| *cell = ERASED_BYTE);
        self.erased_pages.push(page);
        Ok(())
    }

    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        let start = self.index(address, bytes.len())?;
        self.mutation()?;
        match self.fail_after_writes {
            Some(0) => {
                self.fail_after_writes = None;
                return Err(nb::Error::Other(FakeError));
            }
            Some(remaining) => self.fail_after_writes = Some(remaining - 1),
            None => (),
        }
        let cells = &mut self.data[start..start + bytes.len()];
        if !bytes.is_subset_of(&*cells) {
            self.overwrites += 1;
        }
        cells.iter_mut().zip(bytes).for_each(|(cell, byte)| *cell &= *byte);
        self.writes += 1;
        Ok(())
    }

    fn critical<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.critical_sections += 1;
        self.in_critical = true;
        let result = f(self);
        self.in_critical = false;
        result
    }
}
