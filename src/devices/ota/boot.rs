use super::*;

/// How the current boot relates to the update lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum BootKind {
    Normal,
    /// First boot into a committed image. The validation window is open
    /// and the application must call `confirm()` before it closes and
    /// before any reset.
    PostOta,
    /// The previous image was restored after a failed update.
    PostRollback,
    /// A commit was interrupted before the new image took over; the
    /// previous image stays active.
    CommitAborted,
    /// A transfer was in progress. Staged data is kept, but the transport
    /// must resend every chunk it has not seen acknowledged since.
    TransferResumed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Boot {
    Continue(BootKind),
    /// Program memory was rewritten during boot; reset before continuing.
    Restart(RestartRequired),
}

impl<EXTF: ExternalFlash, PM: Program, CLK: time::Now> Ota<EXTF, PM, CLK> {
    /// Loads the persisted bookkeeping and finishes whatever a reset or
    /// power loss interrupted.
    ///
    /// * An erased header is initialised; a corrupt one is re-initialised,
    /// as backups without trusted metadata cannot be restored anyway.
    /// * An interrupted rollback (active slot `Failed`) is run again.
    /// * A pending image whose window was already armed never confirmed
    /// before this reset, so it is rolled back.
    /// * A pending image whose window is not armed yet is checked against
    /// internal memory. If it is really running, the window opens now;
    /// otherwise the commit never completed and is reverted.
    /// * Terminal update states are reported once and cleared.
    pub fn boot(&mut self) -> Result<Boot, Error> {
        self.header = match backup_header::init_if_fresh(&mut self.flash, self.layout.header) {
            Ok(header) => header,
            Err(Error::CorruptHeader) => {
                warn!("Backup header is corrupt, re-initialising. Existing backups are lost");
                let header = BackupHeader::fresh();
                backup_header::write_header(&mut self.flash, self.layout.header, &header)?;
                header
            }
            Err(e) => return Err(e),
        };
        self.state = ota_state::load_state(&mut self.flash, self.layout.state)?;
        self.receiver = None;
        self.unpersisted = 0;
        self.pending_restart = None;
        self.booted = true;
        info!(
            "Booting from slot {:?} ({:?}), update state {:?}",
            self.header.active_slot,
            self.header.active().status,
            self.state.state
        );

        match self.header.active().status {
            SlotStatus::Failed => return self.resume_rollback(),
            SlotStatus::PendingValidation => return self.resume_validation(),
            SlotStatus::Empty | SlotStatus::Valid => (),
        }

        let kind = match self.state.state {
            State::None => BootKind::Normal,
            State::InProgress => return self.resume_transfer(),
            State::PendingReboot => {
                warn!("Commit never reached its header update, discarding it");
                self.transition(State::Failed, Some(Error::InvalidState))?;
                BootKind::CommitAborted
            }
            State::RolledBack => BootKind::PostRollback,
            State::PendingConfirm | State::Success | State::Failed => BootKind::Normal,
        };
        self.clear_state()?;
        Ok(Boot::Continue(kind))
    }

    fn resume_rollback(&mut self) -> Result<Boot, Error> {
        warn!("Rollback of slot {:?} was interrupted, restoring again", self.header.active_slot);
        if self.state.state != State::RolledBack {
            self.transition(State::RolledBack, Some(Error::ValidationTimeout))?;
        }
        let restart = rollback::restore(
            &mut self.flash,
            &mut self.program,
            &self.key,
            self.layout,
            &mut self.header,
        )?;
        Ok(Boot::Restart(restart))
    }

    fn resume_validation(&mut self) -> Result<Boot, Error> {
        if self.header.validation_start.is_some() {
            warn!("Reset while {:?} was awaiting confirmation", self.header.active().version);
            let restart = self.rollback(Some(Error::ValidationTimeout))?;
            return Ok(Boot::Restart(restart));
        }

        let staged = self.header.active_slot;
        if !self.program_matches(staged)? {
            return Ok(match self.revert_commit(staged, Error::IoFailure)? {
                Some(restart) => Boot::Restart(restart),
                None => Boot::Continue(BootKind::CommitAborted),
            });
        }

        self.header.validation_start = Some(backup_header::armable(self.now()));
        self.write_header()?;
        self.transition(State::PendingConfirm, None)?;
        info!("Running {:?}, awaiting confirmation", self.header.active().version);
        Ok(Boot::Continue(BootKind::PostOta))
    }

    fn resume_transfer(&mut self) -> Result<Boot, Error> {
        let staging = self.layout.slot(self.header.active_slot.other());
        match Receiver::new(staging, self.key, self.state.firmware_size) {
            Ok(receiver) => {
                self.receiver = Some(receiver);
                self.state.chunks_received = 0;
                self.persist_state()?;
                info!("Resuming transfer of {} bytes", self.state.firmware_size);
                Ok(Boot::Continue(BootKind::TransferResumed))
            }
            Err(e) => {
                warn!("Persisted transfer is unusable, discarding it");
                self.transition(State::Failed, Some(e))?;
                self.clear_state()?;
                Ok(Boot::Continue(BootKind::Normal))
            }
        }
    }
}
