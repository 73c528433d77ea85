//! Persisted progress record of the update in flight.
//!
//! Records are appended one after the other through the state sector, and
//! the sector is only erased once it is full. The newest record that passes
//! its checksum wins; a record torn by a power cut fails its checksum and is
//! skipped over.
use super::{backup_header::Version, traits::ExternalFlash};
use crate::{
    error::Error,
    hal::time::Ticks,
    utilities::{bitwise::is_erased, memory::Region},
};
use crc::crc32;

pub const STATE_SIZE: usize = 32;
pub const STATE_MAGIC: u16 = 0x07A5;
const CHECKSUM_OFFSET: usize = STATE_SIZE - 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum State {
    None = 0,
    InProgress = 1,
    PendingReboot = 2,
    PendingConfirm = 3,
    Success = 4,
    Failed = 5,
    RolledBack = 6,
}

impl State {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => State::None,
            1 => State::InProgress,
            2 => State::PendingReboot,
            3 => State::PendingConfirm,
            4 => State::Success,
            5 => State::Failed,
            6 => State::RolledBack,
            _ => return None,
        })
    }

    /// Whether a new transfer may begin from this state.
    pub fn accepts_start(self) -> bool {
        matches!(
            self,
            State::None | State::InProgress | State::Success | State::Failed | State::RolledBack
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct OtaState {
    pub state: State,
    /// [`Error::code`] of the failure that ended the last update, or zero.
    pub error_code: u8,
    pub target_version: Version,
    pub previous_version: Version,
    pub chunks_received: u16,
    pub total_chunks: u16,
    pub firmware_size: u32,
    pub firmware_crc: u32,
    pub timestamp: Ticks,
}

impl OtaState {
    pub const IDLE: OtaState = OtaState {
        state: State::None,
        error_code: 0,
        target_version: Version::new(0, 0, 0),
        previous_version: Version::new(0, 0, 0),
        chunks_received: 0,
        total_chunks: 0,
        firmware_size: 0,
        firmware_crc: 0,
        timestamp: Ticks(0),
    };

    pub fn serialize(&self) -> [u8; STATE_SIZE] {
        let mut bytes = [0u8; STATE_SIZE];
        bytes[0..2].copy_from_slice(&STATE_MAGIC.to_le_bytes());
        bytes[2] = self.state as u8;
        bytes[3] = self.error_code;
        bytes[4..7].copy_from_slice(&self.target_version.to_bytes());
        bytes[7..10].copy_from_slice(&self.previous_version.to_bytes());
        bytes[10..12].copy_from_slice(&self.chunks_received.to_le_bytes());
        bytes[12..14].copy_from_slice(&self.total_chunks.to_le_bytes());
        bytes[14..18].copy_from_slice(&self.firmware_size.to_le_bytes());
        bytes[18..22].copy_from_slice(&self.firmware_crc.to_le_bytes());
        bytes[22..26].copy_from_slice(&self.timestamp.0.to_le_bytes());
        let checksum = crc32::checksum_ieee(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// Parses a record. Erased, torn or unknown records yield `None`.
    pub fn deserialize(bytes: &[u8; STATE_SIZE]) -> Option<Self> {
        let u16_at = |offset: usize| u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
        let u32_at = |offset: usize| {
            u32::from_le_bytes([bytes[offset], bytes[offset + 1], bytes[offset + 2], bytes[offset + 3]])
        };
        if u16_at(0) != STATE_MAGIC || crc32::checksum_ieee(&bytes[..CHECKSUM_OFFSET]) != u32_at(CHECKSUM_OFFSET) {
            return None;
        }
        Some(OtaState {
            state: State::from_byte(bytes[2])?,
            error_code: bytes[3],
            target_version: Version::from_bytes([bytes[4], bytes[5], bytes[6]]),
            previous_version: Version::from_bytes([bytes[7], bytes[8], bytes[9]]),
            chunks_received: u16_at(10),
            total_chunks: u16_at(12),
            firmware_size: u32_at(14),
            firmware_crc: u32_at(18),
            timestamp: Ticks(u32_at(22)),
        })
    }
}

/// Result of scanning the state sector.
struct Scan {
    latest: Option<OtaState>,
    /// Address of the first never-written record, if any remain.
    free: Option<u32>,
}

fn scan<F: ExternalFlash>(flash: &mut F, region: Region) -> Result<Scan, Error> {
    let mut latest = None;
    for address in region.blocks(region.size - region.size % STATE_SIZE, STATE_SIZE) {
        let mut bytes = [0u8; STATE_SIZE];
        poll!(flash.read(address, &mut bytes))?;
        if is_erased(&bytes) {
            return Ok(Scan { latest, free: Some(address) });
        }
        if let Some(state) = OtaState::deserialize(&bytes) {
            latest = Some(state);
        }
    }
    Ok(Scan { latest, free: None })
}

/// Loads the newest valid record. A blank or unreadable sector reads as
/// [`OtaState::IDLE`].
pub fn load_state<F: ExternalFlash>(flash: &mut F, region: Region) -> Result<OtaState, Error> {
    Ok(scan(flash, region)?.latest.unwrap_or(OtaState::IDLE))
}

/// Appends a record, erasing the sector first if it is full.
pub fn store_state<F: ExternalFlash>(
    flash: &mut F,
    region: Region,
    state: &OtaState,
) -> Result<(), Error> {
    let address = match scan(flash, region)?.free {
        Some(address) => address,
        None => {
            for sector in region.blocks(region.size, flash.sector_size()) {
                poll!(flash.erase_sector(sector))?;
            }
            region.location
        }
    };

    let bytes = state.serialize();
    poll!(flash.write(address, &bytes))?;
    let mut readback = [0u8; STATE_SIZE];
    poll!(flash.read(address, &mut readback))?;
    if readback != bytes {
        return Err(Error::IoFailure);
    }
    Ok(())
}
