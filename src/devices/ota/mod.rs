//! Over-the-air update state machine.
//!
//! This module contains the whole update transaction: staging a new image,
//! committing it, classifying the following boot, and confirming or rolling
//! back the new firmware. Construction is the responsibility of the
//! `ports` module, as it depends on board specific information.
//!
//! Slot roles never overlap. Staging always writes the slot opposite the
//! active one, and a backup of the running firmware always lands in the
//! active slot, so the source and destination of any copy are distinct.
use super::{
    backup_header::{self, BackupHeader, SlotEntry, SlotId, SlotStatus, Version},
    keys::{Key, KeyProvider},
    layout::Layout,
    ota_state::{self, OtaState, State},
    receiver::Receiver,
    rollback::{self, RestartRequired},
    traits::{ExternalFlash, Program},
};
use crate::{
    error::Error,
    hal::time::{self, Ticks},
    logging::{error, info, warn},
};

mod boot;
mod transfer;
mod validation;

pub use boot::{Boot, BootKind};
pub use transfer::Reply;
pub use validation::Validation;

/// Snapshot of the persisted bookkeeping, for field diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub struct Diagnostics {
    pub active_slot: SlotId,
    pub slots: [SlotEntry; 2],
    pub expected_version: Version,
    pub failed_version: Version,
    pub rollback_count: u32,
    pub state: State,
    pub error_code: u8,
    pub chunks_received: u16,
    pub total_chunks: u16,
}

pub struct Ota<EXTF: ExternalFlash, PM: Program, CLK: time::Now> {
    pub(crate) flash: EXTF,
    pub(crate) program: PM,
    pub(crate) clock: CLK,
    pub(crate) key: Key,
    pub(crate) layout: &'static Layout,
    pub(crate) header: BackupHeader,
    pub(crate) state: OtaState,
    pub(crate) receiver: Option<Receiver>,
    pub(crate) unpersisted: u16,
    pub(crate) booted: bool,
    /// Raised when a failed operation still rewrote program memory.
    pub(crate) pending_restart: Option<RestartRequired>,
}

impl<EXTF: ExternalFlash, PM: Program, CLK: time::Now> Ota<EXTF, PM, CLK> {
    /// Takes ownership of the storage devices. Nothing is read until
    /// [`Ota::boot`], which must run before any other operation.
    pub fn new<K: KeyProvider>(
        flash: EXTF,
        program: PM,
        clock: CLK,
        keys: &K,
        layout: &'static Layout,
    ) -> Self {
        Ota {
            flash,
            program,
            clock,
            key: keys.key(),
            layout,
            header: BackupHeader::fresh(),
            state: OtaState::IDLE,
            receiver: None,
            unpersisted: 0,
            booted: false,
            pending_restart: None,
        }
    }

    /// Gives the devices back, e.g. to simulate a reset.
    pub fn release(self) -> (EXTF, PM, CLK) { (self.flash, self.program, self.clock) }

    pub fn header(&self) -> &BackupHeader { &self.header }
    pub fn state(&self) -> &OtaState { &self.state }
    pub fn layout(&self) -> &'static Layout { self.layout }
    pub fn program_memory(&self) -> &PM { &self.program }

    /// Takes the restart owed by an operation that failed after program
    /// memory had already been rewritten (see [`Ota::finish`]).
    pub fn take_restart(&mut self) -> Option<RestartRequired> { self.pending_restart.take() }

    pub fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            active_slot: self.header.active_slot,
            slots: self.header.slots,
            expected_version: self.header.expected_version,
            failed_version: self.header.failed_version,
            rollback_count: self.header.rollback_count,
            state: self.state.state,
            error_code: self.state.error_code,
            chunks_received: self.state.chunks_received,
            total_chunks: self.state.total_chunks,
        }
    }

    fn ensure_booted(&self) -> Result<(), Error> {
        if self.booted {
            Ok(())
        } else {
            Err(Error::InvalidState)
        }
    }

    fn now(&self) -> Ticks { self.clock.now() }

    fn write_header(&mut self) -> Result<(), Error> {
        backup_header::write_header(&mut self.flash, self.layout.header, &self.header)
    }

    fn persist_state(&mut self) -> Result<(), Error> {
        ota_state::store_state(&mut self.flash, self.layout.state, &self.state)
    }

    /// Moves the update record to `state`, persisting it.
    fn transition(&mut self, state: State, error: Option<Error>) -> Result<(), Error> {
        info!("Update state {:?} -> {:?}", self.state.state, state);
        self.state.state = state;
        self.state.error_code = error.map_or(0, |e| e.code());
        self.persist_state()
    }

    /// Clears a reported terminal state so it is only observed once.
    fn clear_state(&mut self) -> Result<(), Error> {
        if self.state == OtaState::IDLE {
            return Ok(());
        }
        self.state = OtaState::IDLE;
        self.persist_state()
    }

    /// Whether internal memory currently holds the image described by
    /// slot `id`.
    fn program_matches(&mut self, id: SlotId) -> Result<bool, Error> {
        let entry = *self.header.slot(id);
        if entry.size == 0 || entry.size as usize > self.layout.program.size {
            return Ok(false);
        }
        let digest = match rollback::verify_slot(&mut self.flash, &self.key, self.layout, &entry, id) {
            Ok(digest) => digest,
            Err(Error::ChecksumMismatch) => return Ok(false),
            Err(e) => return Err(e),
        };
        let programmed = rollback::program_crc(&mut self.program, self.layout.program, entry.size as usize)?;
        Ok(programmed == digest.plaintext_crc)
    }

    /// Ensures the active slot holds a verified backup of the running
    /// firmware, creating one from internal memory if needed.
    fn ensure_backup(&mut self) -> Result<(), Error> {
        let active = self.header.active_slot;
        let entry = *self.header.active();
        if entry.status == SlotStatus::Valid {
            match rollback::verify_slot(&mut self.flash, &self.key, self.layout, &entry, active) {
                Ok(_) => return Ok(()),
                Err(Error::ChecksumMismatch) => warn!("Backup in slot {:?} no longer verifies", active),
                Err(e) => return Err(e),
            }
        }

        let size = if entry.status == SlotStatus::Valid && entry.size > 0 {
            entry.size as usize
        } else {
            self.layout.max_image_size()
        };
        let backup = rollback::backup(
            &mut self.flash,
            &mut self.program,
            &self.key,
            self.layout,
            active,
            size,
            entry.version,
        )?;
        *self.header.slot_mut(active) = backup;
        Ok(())
    }

    /// Puts the previous slot back in charge after an interrupted or failed
    /// commit of slot `staged`. Reprograms internal memory only if it no
    /// longer holds the previous image.
    fn revert_commit(&mut self, staged: SlotId, cause: Error) -> Result<Option<RestartRequired>, Error> {
        let previous = staged.other();
        warn!("Reverting commit of slot {:?}", staged);
        self.header.active_slot = previous;
        self.header.slot_mut(staged).status = SlotStatus::Empty;
        self.header.validation_start = None;
        self.write_header()?;
        self.receiver = None;
        self.transition(State::Failed, Some(cause))?;

        if self.program_matches(previous)? {
            return Ok(None);
        }
        error!("Program memory was modified, reprogramming slot {:?}", previous);
        let entry = *self.header.slot(previous);
        rollback::program_from_slot(
            &mut self.flash,
            &mut self.program,
            &self.key,
            self.layout,
            &entry,
            previous,
        )?;
        Ok(Some(RestartRequired))
    }
}


#[cfg(test)]
mod test {
    use super::{fixtures::*, *};

    #[test]
    fn operations_require_a_boot_first() {
        let (ota, _) = device(&firmware(100, 1));
        let (flash, program, clock) = ota.release();
        let mut ota = Ota::new(flash, program, clock, &KEY, &LAYOUT);
        assert_eq!(ota.start(100, 0, Version::new(1, 0, 0)), Err(Error::InvalidState));
        assert_eq!(ota.confirm(), Err(Error::InvalidState));
    }

    #[test]
    fn diagnostics_reflect_persisted_bookkeeping() {
        // Given
        let (mut ota, _) = device(&firmware(100, 1));
        ota.start(300, 0, Version::new(3, 0, 0)).unwrap();
        ota.chunk(0, 0, &[0u8; 128]).unwrap();

        // When
        let diagnostics = ota.diagnostics();

        // Then
        assert_eq!(diagnostics.state, State::InProgress);
        assert_eq!(diagnostics.chunks_received, 1);
        assert_eq!(diagnostics.total_chunks, 3);
        assert_eq!(diagnostics.rollback_count, 0);
        assert_eq!(diagnostics.active_slot, SlotId::A);
    }

    #[test]
    fn fresh_devices_back_up_the_whole_program_region() {
        // Given
        let running = firmware(LAYOUT.program.size, 0x11);
        let (mut ota, _) = device(&running);
        let image = firmware(1000, 0x22);

        // When
        ota.start(1000, crc(&image), Version::new(1, 1, 0)).unwrap();
        send_all(&mut ota, &image);
        let _restart = ota.finish().unwrap();

        // Then
        let backup = ota.header().slot(SlotId::A);
        assert_eq!(backup.status, SlotStatus::Valid);
        assert_eq!(backup.size as usize, LAYOUT.program.size);
        let digest = rollback::digest_slot(&mut ota.flash, &KEY, LAYOUT.slot(SlotId::A), LAYOUT.program.size)
            .unwrap();
        assert_eq!(digest.plaintext_crc, crc(&running));
    }
}
