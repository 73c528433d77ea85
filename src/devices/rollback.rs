//! Moves firmware between internal program memory and the encrypted slots.
//!
//! Both directions are verified. A slot is only ever programmed into
//! internal memory after its full content has been checked against the
//! header, and a backup is only reported once its integrity checksum has
//! been computed over what was actually written.
use super::{
    backup_header::{write_header, BackupHeader, SlotEntry, SlotId, SlotStatus, Version},
    cipher::{self, IntegrityDigest},
    keys::Key,
    layout::Layout,
    traits::{ExternalFlash, Program},
};
use crate::{
    error::Error,
    logging::{error, info},
    utilities::memory::Region,
};
use crc::{crc32, Hasher32};

/// Transfer granularity between the two memories.
const BLOCK_SIZE: usize = 256;

/// The device must be reset for the new program memory content to run.
/// Performed by the outermost driver (see `ports::reset`).
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct RestartRequired;

/// Checksums of a slot's content, gathered in a single pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotDigest {
    /// Integrity checksum of the ciphertext, as stored in the header.
    pub integrity: u32,
    /// CRC-32 of the decrypted image.
    pub plaintext_crc: u32,
}

/// Reads the first `size` bytes of `slot` once, decrypting as it goes.
pub fn digest_slot<F: ExternalFlash>(
    flash: &mut F,
    key: &Key,
    slot: Region,
    size: usize,
) -> Result<SlotDigest, Error> {
    let mut integrity = IntegrityDigest::new();
    let mut plaintext = crc32::Digest::new(crc32::IEEE);
    let mut buffer = [0u8; BLOCK_SIZE];
    let mut offset = 0usize;
    while offset < size {
        let block = &mut buffer[..(size - offset).min(BLOCK_SIZE)];
        poll!(flash.read(slot.location + offset as u32, block))?;
        integrity.update(block);
        cipher::decrypt(key, offset as u32, block);
        plaintext.write(block);
        offset += block.len();
    }
    Ok(SlotDigest { integrity: integrity.finish(key), plaintext_crc: plaintext.sum32() })
}

/// CRC-32 of the first `size` bytes of program memory.
pub fn program_crc<P: Program>(program: &mut P, region: Region, size: usize) -> Result<u32, Error> {
    let mut digest = crc32::Digest::new(crc32::IEEE);
    let mut buffer = [0u8; BLOCK_SIZE];
    let mut offset = 0usize;
    while offset < size {
        let block = &mut buffer[..(size - offset).min(BLOCK_SIZE)];
        poll!(program.read(region.location + offset as u32, block))?;
        digest.write(block);
        offset += block.len();
    }
    Ok(digest.sum32())
}

/// Checks a slot against the integrity checksum recorded in its entry.
pub fn verify_slot<F: ExternalFlash>(
    flash: &mut F,
    key: &Key,
    layout: &Layout,
    entry: &SlotEntry,
    id: SlotId,
) -> Result<SlotDigest, Error> {
    if entry.size as usize > layout.slot_capacity() {
        return Err(Error::TooLarge);
    }
    let digest = digest_slot(flash, key, layout.slot(id), entry.size as usize)?;
    if digest.integrity != entry.checksum {
        return Err(Error::ChecksumMismatch);
    }
    Ok(digest)
}

/// Encrypts the first `size` bytes of program memory into slot `id` and
/// returns the entry describing it. The header is left to the caller.
pub fn backup<F: ExternalFlash, P: Program>(
    flash: &mut F,
    program: &mut P,
    key: &Key,
    layout: &Layout,
    id: SlotId,
    size: usize,
    version: Version,
) -> Result<SlotEntry, Error> {
    let slot = layout.slot(id);
    if size == 0 || size > slot.size || size > layout.program.size {
        return Err(Error::TooLarge);
    }
    for sector in slot.blocks(size, flash.sector_size()) {
        poll!(flash.erase_sector(sector))?;
    }

    let mut buffer = [0u8; BLOCK_SIZE];
    let mut offset = 0usize;
    while offset < size {
        let block = &mut buffer[..(size - offset).min(BLOCK_SIZE)];
        poll!(program.read(layout.program.location + offset as u32, block))?;
        cipher::encrypt(key, offset as u32, block);
        poll!(flash.write(slot.location + offset as u32, block))?;
        offset += block.len();
    }

    // The checksum is taken from flash, not from the buffers written.
    let digest = digest_slot(flash, key, slot, size)?;
    if digest.plaintext_crc != program_crc(program, layout.program, size)? {
        error!("Backup into slot {:?} does not match program memory", id);
        return Err(Error::IoFailure);
    }
    info!("Backed up {} bytes of running firmware into slot {:?}", size, id);
    Ok(SlotEntry { status: SlotStatus::Valid, version, size: size as u32, checksum: digest.integrity })
}

/// Reprograms internal memory with the decrypted content of slot `id`.
///
/// The slot is fully verified before program memory is touched. Erase and
/// programming then run as one critical section, followed by a read-back
/// check.
pub fn program_from_slot<F: ExternalFlash, P: Program>(
    flash: &mut F,
    program: &mut P,
    key: &Key,
    layout: &Layout,
    entry: &SlotEntry,
    id: SlotId,
) -> Result<(), Error> {
    let size = entry.size as usize;
    if size == 0 {
        return Err(Error::NoBackup);
    }
    if size > layout.program.size {
        return Err(Error::TooLarge);
    }
    let digest = verify_slot(flash, key, layout, entry, id)?;

    info!("Programming {} bytes from slot {:?}", size, id);
    let slot = layout.slot(id);
    let destination = layout.program;
    program.critical(|program| -> Result<(), Error> {
        let mut address = destination.location;
        while address < destination.location + size as u32 {
            let (page, page_size) = program.page_span(address).ok_or(Error::TooLarge)?;
            poll!(program.erase_page(page))?;
            address = page + page_size as u32;
        }

        let mut buffer = [0u8; BLOCK_SIZE];
        let mut offset = 0usize;
        while offset < size {
            let block = &mut buffer[..(size - offset).min(BLOCK_SIZE)];
            poll!(flash.read(slot.location + offset as u32, block))?;
            cipher::decrypt(key, offset as u32, block);
            poll!(program.write_bytes(destination.location + offset as u32, block))?;
            offset += block.len();
        }
        Ok(())
    })?;

    if program_crc(program, destination, size)? != digest.plaintext_crc {
        error!("Program memory does not match slot {:?} after programming", id);
        return Err(Error::IoFailure);
    }
    Ok(())
}

/// Restores the backup held in the inactive slot and makes it active.
///
/// Fails with [`Error::NoBackup`] if that slot is not `Valid`, and with
/// [`Error::ChecksumMismatch`] (program memory untouched) if its content
/// does not verify.
pub fn restore<F: ExternalFlash, P: Program>(
    flash: &mut F,
    program: &mut P,
    key: &Key,
    layout: &Layout,
    header: &mut BackupHeader,
) -> Result<RestartRequired, Error> {
    let source = header.active_slot.other();
    let entry = *header.slot(source);
    if entry.status != SlotStatus::Valid {
        error!("No valid backup in slot {:?} to restore from", source);
        return Err(Error::NoBackup);
    }
    program_from_slot(flash, program, key, layout, &entry, source)?;
    header.active_slot = source;
    write_header(flash, layout.header, header)?;
    info!("Restored firmware from slot {:?}", source);
    Ok(RestartRequired)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        devices::{backup_header::read_header, keys::KEY_SIZE},
        hal::{
            doubles::{flash::FakeFlash, program::FakeProgramMemory},
            time::Ticks,
        },
    };

    const KEY: Key = Key([0xA7; KEY_SIZE]);
    const PROGRAM_BASE: u32 = 0x0800_0000;
    const LAYOUT: Layout = Layout {
        header: Region::new(0x0000, 0x1000),
        state: Region::new(0x1000, 0x1000),
        slots: [Region::new(0x2000, 0x4000), Region::new(0x6000, 0x4000)],
        sector_size: 0x1000,
        program: Region::new(PROGRAM_BASE, 0x3000),
        validation_timeout: Ticks(100),
        persist_interval: 4,
    };

    fn firmware(size: usize, seed: u8) -> Vec<u8> {
        (0..size).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
    }

    fn devices() -> (FakeFlash, FakeProgramMemory) {
        (FakeFlash::new(0, 0xA000, 0x1000), FakeProgramMemory::new(PROGRAM_BASE, 0x3000, 0x800))
    }

    #[test]
    fn backup_then_restore_reproduces_the_firmware() {
        // Given
        let (mut flash, mut program) = devices();
        let original = firmware(5000, 1);
        program.load(PROGRAM_BASE, &original);
        let entry =
            backup(&mut flash, &mut program, &KEY, &LAYOUT, SlotId::B, 5000, Version::new(1, 0, 0)).unwrap();
        let mut header = BackupHeader::fresh();
        *header.slot_mut(SlotId::B) = entry;
        program.load(PROGRAM_BASE, &firmware(5000, 99));

        // When
        let restart = restore(&mut flash, &mut program, &KEY, &LAYOUT, &mut header);

        // Then
        assert_eq!(restart, Ok(RestartRequired));
        assert_eq!(program.contents(PROGRAM_BASE, 5000), &original[..]);
        assert_eq!(header.active_slot, SlotId::B);
        assert_eq!(read_header(&mut flash, LAYOUT.header), Ok(header));
        assert_eq!(program.unmasked_operations, 0);
        assert_eq!(program.critical_sections, 1);
        assert_eq!(program.erased_pages, vec![PROGRAM_BASE, PROGRAM_BASE + 0x800, PROGRAM_BASE + 0x1000]);
    }

    #[test]
    fn backups_are_stored_encrypted() {
        let (mut flash, mut program) = devices();
        let original = firmware(300, 7);
        program.load(PROGRAM_BASE, &original);
        backup(&mut flash, &mut program, &KEY, &LAYOUT, SlotId::A, 300, Version::default()).unwrap();
        assert_ne!(flash.contents(0x2000, 300), &original[..]);
    }

    #[test]
    fn corrupted_backups_never_touch_program_memory() {
        // Given
        let (mut flash, mut program) = devices();
        program.load(PROGRAM_BASE, &firmware(2000, 3));
        let entry =
            backup(&mut flash, &mut program, &KEY, &LAYOUT, SlotId::B, 2000, Version::default()).unwrap();
        let mut header = BackupHeader::fresh();
        *header.slot_mut(SlotId::B) = entry;
        flash.corrupt(0x6000 + 1234, 0x10);
        let running = firmware(2000, 42);
        program.load(PROGRAM_BASE, &running);

        // When
        let result = restore(&mut flash, &mut program, &KEY, &LAYOUT, &mut header);

        // Then
        assert_eq!(result, Err(Error::ChecksumMismatch));
        assert!(program.erased_pages.is_empty());
        assert_eq!(program.contents(PROGRAM_BASE, 2000), &running[..]);
        assert_eq!(header.active_slot, SlotId::A);
    }

    #[test]
    fn restoring_requires_a_valid_backup() {
        let (mut flash, mut program) = devices();
        let mut header = BackupHeader::fresh();
        header.slot_mut(SlotId::B).status = SlotStatus::Failed;
        assert_eq!(restore(&mut flash, &mut program, &KEY, &LAYOUT, &mut header), Err(Error::NoBackup));
    }

    #[test]
    fn program_memory_faults_surface_as_io_failures() {
        // Given
        let (mut flash, mut program) = devices();
        program.load(PROGRAM_BASE, &firmware(1000, 5));
        let entry =
            backup(&mut flash, &mut program, &KEY, &LAYOUT, SlotId::B, 1000, Version::default()).unwrap();
        program.faulty = true;

        // Then
        assert_eq!(
            program_from_slot(&mut flash, &mut program, &KEY, &LAYOUT, &entry, SlotId::B),
            Err(Error::IoFailure)
        );
    }

    #[test]
    fn slot_digests_cover_both_representations() {
        // Given
        let (mut flash, mut program) = devices();
        let original = firmware(700, 9);
        program.load(PROGRAM_BASE, &original);

        // When
        let entry =
            backup(&mut flash, &mut program, &KEY, &LAYOUT, SlotId::A, 700, Version::default()).unwrap();
        let digest = digest_slot(&mut flash, &KEY, LAYOUT.slot(SlotId::A), 700).unwrap();

        // Then
        assert_eq!(digest.integrity, entry.checksum);
        assert_eq!(digest.plaintext_crc, crc32::checksum_ieee(&original));
        assert_eq!(digest.integrity, cipher::integrity(&KEY, flash.contents(0x2000, 700)));
    }
}
