//! Driver for Micron style serial NOR flash (N25Q family and compatibles),
//! generic over a QSPI bus in indirect mode.
//!
//! Geometry follows the N25Q128A: 256 byte program pages grouped in 4KB
//! subsectors, which are the erase unit exposed to the update system.
use crate::{
    error::{self, Convertible},
    hal::{
        flash::{ReadWrite, SectorErase},
        qspi,
    },
    utilities::{
        bitwise::BitFlags,
        poll::{self, Exhausted},
    },
};

/// From the N25Q128A datasheet, table 19.
pub const MANUFACTURER_ID: u8 = 0x20;
pub const PAGE_SIZE: usize = 256;
pub const SUBSECTOR_SIZE: usize = 16 * PAGE_SIZE;

/// Status polls allowed while a program or erase completes.
const BUSY_ATTEMPTS: u32 = poll::DEFAULT_ATTEMPTS;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Error {
    TimeOut,
    QspiError,
    WrongManufacturerId,
    AddressOutOfRange,
}

impl Convertible for Error {
    fn into(self) -> error::Error {
        match self {
            Error::AddressOutOfRange => error::Error::TooLarge,
            Error::TimeOut | Error::QspiError | Error::WrongManufacturerId => error::Error::IoFailure,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Command {
    PageProgram = 0x02,
    Read = 0x03,
    WriteDisable = 0x04,
    ReadStatus = 0x05,
    WriteEnable = 0x06,
    SubsectorErase = 0x20,
    ReadId = 0x9E,
}

struct Status {
    write_in_progress: bool,
    _write_enable_latch: bool,
}

enum CommandData<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
    None,
}

pub struct SpiNorFlash<QSPI: qspi::Indirect> {
    qspi: QSPI,
    size: usize,
}

impl<QSPI: qspi::Indirect> SpiNorFlash<QSPI> {
    /// Verifies the manufacturer id before handing out the driver.
    pub fn new(qspi: QSPI, size: usize) -> Result<Self, Error> {
        let mut flash = Self { qspi, size };
        flash.verify_id()?;
        Ok(flash)
    }

    pub fn release(self) -> QSPI { self.qspi }

    // Low level helper for executing Micron commands
    fn execute_command(
        qspi: &mut QSPI,
        command: Command,
        address: Option<u32>,
        data: CommandData,
    ) -> Result<(), Error> {
        match data {
            CommandData::Write(buffer) => {
                poll!(qspi.write(Some(command as u8), address, Some(buffer), 0))
            }
            CommandData::Read(buffer) => poll!(qspi.read(Some(command as u8), address, buffer, 0)),
            CommandData::None => poll!(qspi.write(Some(command as u8), address, None, 0)),
        }
        .map_err(|e| match e {
            Exhausted::TimedOut => Error::TimeOut,
            Exhausted::Failed(_) => Error::QspiError,
        })
    }

    fn verify_id(&mut self) -> Result<(), Error> {
        let mut response = [0u8; 1];
        Self::execute_command(&mut self.qspi, Command::ReadId, None, CommandData::Read(&mut response))?;
        match response[0] {
            MANUFACTURER_ID => Ok(()),
            _ => Err(Error::WrongManufacturerId),
        }
    }

    fn status(&mut self) -> Result<Status, Error> {
        let mut response = [0u8; 1];
        Self::execute_command(&mut self.qspi, Command::ReadStatus, None, CommandData::Read(&mut response))?;
        let response = response[0];
        Ok(Status {
            write_in_progress: response.is_set(0),
            _write_enable_latch: response.is_set(1),
        })
    }

    /// Yields while a previous program or erase is still running.
    fn ready(&mut self) -> nb::Result<(), Error> {
        if self.status()?.write_in_progress {
            Err(nb::Error::WouldBlock)
        } else {
            Ok(())
        }
    }

    fn wait_until_write_complete(&mut self) -> Result<(), Error> {
        poll!(BUSY_ATTEMPTS, self.ready()).map_err(|e| match e {
            Exhausted::TimedOut => Error::TimeOut,
            Exhausted::Failed(e) => e,
        })
    }

    fn check_range(&self, address: u32, length: usize) -> Result<(), Error> {
        match (address as usize).checked_add(length) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(Error::AddressOutOfRange),
        }
    }

    fn program_page(&mut self, address: u32, bytes: &[u8]) -> Result<(), Error> {
        Self::execute_command(&mut self.qspi, Command::WriteEnable, None, CommandData::None)?;
        Self::execute_command(&mut self.qspi, Command::PageProgram, Some(address), CommandData::Write(bytes))?;
        self.wait_until_write_complete()
    }
}

impl<QSPI: qspi::Indirect> ReadWrite for SpiNorFlash<QSPI> {
    type Error = Error;

    fn read(&mut self, address: u32, bytes: &mut [u8]) -> nb::Result<(), Self::Error> {
        self.check_range(address, bytes.len())?;
        self.ready()?;
        Ok(Self::execute_command(&mut self.qspi, Command::Read, Some(address), CommandData::Read(bytes))?)
    }

    /// Splits `bytes` at page boundaries, as a page program wraps around
    /// within its page instead of crossing into the next one.
    fn write(&mut self, address: u32, bytes: &[u8]) -> nb::Result<(), Self::Error> {
        self.check_range(address, bytes.len())?;
        self.ready()?;
        let mut address = address;
        let mut remaining = bytes;
        while !remaining.is_empty() {
            let room = PAGE_SIZE - (address as usize % PAGE_SIZE);
            let (page, rest) = remaining.split_at(room.min(remaining.len()));
            self.program_page(address, page)?;
            address += page.len() as u32;
            remaining = rest;
        }
        Ok(())
    }

    fn range(&self) -> (u32, u32) { (0, self.size as u32) }
}

impl<QSPI: qspi::Indirect> SectorErase for SpiNorFlash<QSPI> {
    fn erase_sector(&mut self, address: u32) -> nb::Result<(), Self::Error> {
        self.check_range(address, 1)?;
        self.ready()?;
        let subsector = address - (address % SUBSECTOR_SIZE as u32);
        Self::execute_command(&mut self.qspi, Command::WriteEnable, None, CommandData::None)?;
        Self::execute_command(&mut self.qspi, Command::SubsectorErase, Some(subsector), CommandData::None)?;
        self.wait_until_write_complete()?;
        Self::execute_command(&mut self.qspi, Command::WriteDisable, None, CommandData::None)?;
        Ok(())
    }

    fn sector_size(&self) -> usize { SUBSECTOR_SIZE }
}
