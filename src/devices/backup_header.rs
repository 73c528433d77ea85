//! Backup header: the single record describing both firmware slots.
//!
//! The header lives alone in the first sector of external flash. It is
//! never modified in place. Every change goes through [`write_header`],
//! which erases the sector, writes the full record and reads it back, so a
//! power cut leaves either the previous header or one that fails its
//! checksum, never a half updated record that passes it.
use super::traits::ExternalFlash;
use crate::{
    error::Error,
    hal::time::Ticks,
    logging::warn,
    utilities::{bitwise::is_erased, memory::Region},
};
use crc::crc32;

pub const HEADER_SIZE: usize = 64;
pub const HEADER_MAGIC: u32 = 0x5254_4B48;
/// Legacy position-keyed XOR cipher with CRC-32 integrity.
pub const FORMAT_VERSION: u8 = 1;

const NOT_ARMED: u32 = 0xFFFF_FFFF;
const CHECKSUM_OFFSET: usize = HEADER_SIZE - 4;
const SLOT_OFFSETS: [usize; 2] = [8, 20];
const EXPECTED_VERSION_OFFSET: usize = 32;
const FAILED_VERSION_OFFSET: usize = 35;
const VALIDATION_START_OFFSET: usize = 40;
const ROLLBACK_COUNT_OFFSET: usize = 44;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum SlotId {
    A = 0,
    B = 1,
}

impl SlotId {
    pub const fn other(self) -> Self {
        match self {
            SlotId::A => SlotId::B,
            SlotId::B => SlotId::A,
        }
    }

    pub const fn index(self) -> usize { self as usize }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotId::A),
            1 => Some(SlotId::B),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum SlotStatus {
    Empty = 0,
    Valid = 1,
    PendingValidation = 2,
    Failed = 3,
}

impl SlotStatus {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(SlotStatus::Empty),
            1 => Some(SlotStatus::Valid),
            2 => Some(SlotStatus::PendingValidation),
            3 => Some(SlotStatus::Failed),
            _ => None,
        }
    }
}

/// Semantic firmware version.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Default)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct Version {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Version {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self { Self { major, minor, patch } }
    pub const fn to_bytes(self) -> [u8; 3] { [self.major, self.minor, self.patch] }
    pub const fn from_bytes(bytes: [u8; 3]) -> Self { Self::new(bytes[0], bytes[1], bytes[2]) }
}

/// Metadata for one firmware slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct SlotEntry {
    pub status: SlotStatus,
    pub version: Version,
    /// Plaintext image size in bytes.
    pub size: u32,
    /// Integrity checksum of the encrypted slot content.
    pub checksum: u32,
}

impl SlotEntry {
    pub const EMPTY: SlotEntry =
        SlotEntry { status: SlotStatus::Empty, version: Version::new(0, 0, 0), size: 0, checksum: 0 };
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct BackupHeader {
    /// Slot whose image is currently programmed into internal memory.
    pub active_slot: SlotId,
    pub slots: [SlotEntry; 2],
    pub expected_version: Version,
    pub failed_version: Version,
    /// Tick at which the pending slot's validation window opened.
    pub validation_start: Option<Ticks>,
    pub rollback_count: u32,
}

impl BackupHeader {
    /// Header for a device that has never been updated.
    pub const fn fresh() -> Self {
        BackupHeader {
            active_slot: SlotId::A,
            slots: [SlotEntry::EMPTY; 2],
            expected_version: Version::new(0, 0, 0),
            failed_version: Version::new(0, 0, 0),
            validation_start: None,
            rollback_count: 0,
        }
    }

    pub fn slot(&self, id: SlotId) -> &SlotEntry { &self.slots[id.index()] }
    pub fn slot_mut(&mut self, id: SlotId) -> &mut SlotEntry { &mut self.slots[id.index()] }
    pub fn active(&self) -> &SlotEntry { self.slot(self.active_slot) }
    pub fn active_mut(&mut self) -> &mut SlotEntry { self.slot_mut(self.active_slot) }
    pub fn inactive(&self) -> &SlotEntry { self.slot(self.active_slot.other()) }

    pub fn serialize(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&HEADER_MAGIC.to_le_bytes());
        bytes[4] = FORMAT_VERSION;
        bytes[5] = self.active_slot as u8;
        for (entry, &offset) in self.slots.iter().zip(SLOT_OFFSETS.iter()) {
            bytes[offset] = entry.status as u8;
            bytes[offset + 1..offset + 4].copy_from_slice(&entry.version.to_bytes());
            bytes[offset + 4..offset + 8].copy_from_slice(&entry.size.to_le_bytes());
            bytes[offset + 8..offset + 12].copy_from_slice(&entry.checksum.to_le_bytes());
        }
        bytes[EXPECTED_VERSION_OFFSET..EXPECTED_VERSION_OFFSET + 3]
            .copy_from_slice(&self.expected_version.to_bytes());
        bytes[FAILED_VERSION_OFFSET..FAILED_VERSION_OFFSET + 3]
            .copy_from_slice(&self.failed_version.to_bytes());
        let validation_start = self.validation_start.map_or(NOT_ARMED, |ticks| ticks.0);
        bytes[VALIDATION_START_OFFSET..VALIDATION_START_OFFSET + 4]
            .copy_from_slice(&validation_start.to_le_bytes());
        bytes[ROLLBACK_COUNT_OFFSET..ROLLBACK_COUNT_OFFSET + 4]
            .copy_from_slice(&self.rollback_count.to_le_bytes());
        let checksum = crc32::checksum_ieee(&bytes[..CHECKSUM_OFFSET]);
        bytes[CHECKSUM_OFFSET..].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    pub fn deserialize(bytes: &[u8; HEADER_SIZE]) -> Result<Self, Error> {
        let stored_checksum = read_u32(bytes, CHECKSUM_OFFSET);
        if crc32::checksum_ieee(&bytes[..CHECKSUM_OFFSET]) != stored_checksum
            || read_u32(bytes, 0) != HEADER_MAGIC
            || bytes[4] != FORMAT_VERSION
        {
            return Err(Error::CorruptHeader);
        }

        let active_slot = SlotId::from_byte(bytes[5]).ok_or(Error::CorruptHeader)?;
        let mut slots = [SlotEntry::EMPTY; 2];
        for (entry, &offset) in slots.iter_mut().zip(SLOT_OFFSETS.iter()) {
            *entry = SlotEntry {
                status: SlotStatus::from_byte(bytes[offset]).ok_or(Error::CorruptHeader)?,
                version: read_version(bytes, offset + 1),
                size: read_u32(bytes, offset + 4),
                checksum: read_u32(bytes, offset + 8),
            };
        }
        let validation_start = match read_u32(bytes, VALIDATION_START_OFFSET) {
            NOT_ARMED => None,
            ticks => Some(Ticks(ticks)),
        };

        Ok(BackupHeader {
            active_slot,
            slots,
            expected_version: read_version(bytes, EXPECTED_VERSION_OFFSET),
            failed_version: read_version(bytes, FAILED_VERSION_OFFSET),
            validation_start,
            rollback_count: read_u32(bytes, ROLLBACK_COUNT_OFFSET),
        })
    }
}

/// Tick value that can be stored as an armed validation start. The erased
/// pattern is reserved for "not armed".
pub fn armable(now: Ticks) -> Ticks { Ticks(now.0.min(NOT_ARMED - 1)) }

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}

fn read_version(bytes: &[u8], offset: usize) -> Version {
    Version::new(bytes[offset], bytes[offset + 1], bytes[offset + 2])
}

fn load<F: ExternalFlash>(flash: &mut F, region: Region) -> Result<[u8; HEADER_SIZE], Error> {
    let mut bytes = [0u8; HEADER_SIZE];
    poll!(flash.read(region.location, &mut bytes))?;
    Ok(bytes)
}

/// Loads and verifies the header.
pub fn read_header<F: ExternalFlash>(flash: &mut F, region: Region) -> Result<BackupHeader, Error> {
    BackupHeader::deserialize(&load(flash, region)?)
}

/// Replaces the stored header. Only returns `Ok` once the record has been
/// read back and matches what was written.
pub fn write_header<F: ExternalFlash>(
    flash: &mut F,
    region: Region,
    header: &BackupHeader,
) -> Result<(), Error> {
    let bytes = header.serialize();
    poll!(flash.erase_sector(region.location))?;
    poll!(flash.write(region.location, &bytes))?;
    if load(flash, region)? != bytes {
        warn!("Backup header read-back does not match what was written");
        return Err(Error::IoFailure);
    }
    Ok(())
}

/// Returns the stored header, writing a fresh one first if the header
/// sector has never been programmed. A programmed but unreadable header
/// is reported as [`Error::CorruptHeader`] and left untouched.
pub fn init_if_fresh<F: ExternalFlash>(flash: &mut F, region: Region) -> Result<BackupHeader, Error> {
    let bytes = load(flash, region)?;
    if is_erased(&bytes) {
        let header = BackupHeader::fresh();
        write_header(flash, region, &header)?;
        return Ok(header);
    }
    BackupHeader::deserialize(&bytes)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::hal::{doubles::flash::FakeFlash, flash::ReadWrite};

    const REGION: Region = Region::new(0x0000, 0x1000);

    fn flash() -> FakeFlash { FakeFlash::new(0, 0x4000, 0x1000) }

    fn populated_header() -> BackupHeader {
        BackupHeader {
            active_slot: SlotId::B,
            slots: [
                SlotEntry {
                    status: SlotStatus::Failed,
                    version: Version::new(2, 1, 0),
                    size: 10_000,
                    checksum: 0xDEAD_BEEF,
                },
                SlotEntry {
                    status: SlotStatus::Valid,
                    version: Version::new(2, 0, 3),
                    size: 9_876,
                    checksum: 0x1234_5678,
                },
            ],
            expected_version: Version::new(2, 1, 0),
            failed_version: Version::new(2, 1, 0),
            validation_start: Some(Ticks(4242)),
            rollback_count: 3,
        }
    }

    #[test]
    fn serialized_layout_matches_the_wire_format() {
        // Given
        let header = populated_header();

        // When
        let bytes = header.serialize();

        // Then
        assert_eq!(&bytes[0..4], &[0x48, 0x4B, 0x54, 0x52]);
        assert_eq!(bytes[4], FORMAT_VERSION);
        assert_eq!(bytes[5], 1);
        assert_eq!(&bytes[8..12], &[3, 2, 1, 0]);
        assert_eq!(&bytes[12..16], &10_000u32.to_le_bytes());
        assert_eq!(&bytes[20..24], &[1, 2, 0, 3]);
        assert_eq!(&bytes[40..44], &4242u32.to_le_bytes());
        assert_eq!(&bytes[44..48], &3u32.to_le_bytes());
        assert_eq!(&bytes[60..64], &crc32::checksum_ieee(&bytes[..60]).to_le_bytes());
        assert_eq!(BackupHeader::deserialize(&bytes), Ok(header));
    }

    #[test]
    fn unarmed_validation_is_stored_as_erased_word() {
        let bytes = BackupHeader::fresh().serialize();
        assert_eq!(&bytes[40..44], &[0xFF; 4]);
        assert_eq!(BackupHeader::deserialize(&bytes).unwrap().validation_start, None);
        assert_eq!(armable(Ticks(u32::MAX)), Ticks(u32::MAX - 1));
    }

    #[test]
    fn any_single_bit_flip_is_rejected() {
        let bytes = populated_header().serialize();
        for byte in 0..HEADER_SIZE {
            for bit in 0..8 {
                let mut flipped = bytes;
                flipped[byte] ^= 1 << bit;
                assert_eq!(BackupHeader::deserialize(&flipped), Err(Error::CorruptHeader));
            }
        }
    }

    #[test]
    fn unknown_format_versions_and_fields_are_rejected() {
        // Given
        let mut bytes = populated_header().serialize();
        bytes[4] = 2;
        let checksum = crc32::checksum_ieee(&bytes[..60]);
        bytes[60..].copy_from_slice(&checksum.to_le_bytes());

        // Then
        assert_eq!(BackupHeader::deserialize(&bytes), Err(Error::CorruptHeader));

        // Given
        let mut bytes = populated_header().serialize();
        bytes[8] = 7;
        let checksum = crc32::checksum_ieee(&bytes[..60]);
        bytes[60..].copy_from_slice(&checksum.to_le_bytes());

        // Then
        assert_eq!(BackupHeader::deserialize(&bytes), Err(Error::CorruptHeader));
    }

    #[test]
    fn headers_survive_a_write_read_cycle_through_flash() {
        // Given
        let mut flash = flash();
        let header = populated_header();

        // When
        write_header(&mut flash, REGION, &header).unwrap();
        let mut updated = header;
        updated.rollback_count += 1;
        write_header(&mut flash, REGION, &updated).unwrap();

        // Then
        assert_eq!(read_header(&mut flash, REGION), Ok(updated));
        assert_eq!(flash.erased_sectors, vec![0x0000, 0x0000]);
        assert_eq!(flash.overwrites, 0);
    }

    #[test]
    fn fresh_flash_gets_an_initial_header() {
        // Given
        let mut flash = flash();
        assert_eq!(read_header(&mut flash, REGION), Err(Error::CorruptHeader));

        // When
        let header = init_if_fresh(&mut flash, REGION).unwrap();

        // Then
        assert_eq!(header, BackupHeader::fresh());
        assert_eq!(header.active_slot, SlotId::A);
        assert_eq!(header.slots, [SlotEntry::EMPTY; 2]);
        assert_eq!(read_header(&mut flash, REGION), Ok(header));
    }

    #[test]
    fn existing_headers_are_kept_and_corrupt_ones_reported() {
        // Given
        let mut flash = flash();
        write_header(&mut flash, REGION, &populated_header()).unwrap();

        // Then
        assert_eq!(init_if_fresh(&mut flash, REGION), Ok(populated_header()));

        // When
        flash.corrupt(0x0010, 0x01);

        // Then
        assert_eq!(init_if_fresh(&mut flash, REGION), Err(Error::CorruptHeader));
        let mut raw = [0u8; 1];
        flash.read(0x0010, &mut raw).unwrap();
        assert_eq!(raw[0], populated_header().serialize()[0x10] ^ 0x01);
    }

    #[test]
    fn interrupted_writes_are_io_failures() {
        // Given
        let mut flash = flash();
        flash.cut_power_after(1);

        // Then
        assert_eq!(write_header(&mut flash, REGION, &populated_header()), Err(Error::IoFailure));
    }
}
