use super::*;

/// Result of polling the validation window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Validation {
    /// No image is awaiting confirmation.
    NotPending,
    Pending { remaining: Ticks },
    /// The window closed; the previous image was restored.
    RolledBack(RestartRequired),
}

impl<EXTF: ExternalFlash, PM: Program, CLK: time::Now> Ota<EXTF, PM, CLK> {
    /// Accepts the running image, closing the validation window.
    ///
    /// Must be called before the device resets for any reason. A reset
    /// while the window is open counts as a failed image and rolls back at
    /// the next boot, however much of the window was left.
    pub fn confirm(&mut self) -> Result<(), Error> {
        self.ensure_booted()?;
        if self.header.active().status != SlotStatus::PendingValidation {
            return Err(Error::InvalidState);
        }
        let version = self.header.active().version;
        self.header.active_mut().status = SlotStatus::Valid;
        self.header.validation_start = None;
        self.write_header()?;
        self.transition(State::Success, None)?;
        info!("Firmware {:?} confirmed", version);
        Ok(())
    }

    /// To be called periodically by the application. Rolls back once the
    /// window has been open for the configured timeout.
    ///
    /// The window is measured with the clock given at construction, so
    /// calls must come often enough for that clock to keep time. A
    /// [`CycleClock`](crate::drivers::cycle_clock::CycleClock) needs one
    /// read per [`period`](crate::drivers::cycle_clock::CycleClock::period).
    pub fn check_validation(&mut self) -> Result<Validation, Error> {
        self.ensure_booted()?;
        if self.header.active().status != SlotStatus::PendingValidation {
            return Ok(Validation::NotPending);
        }
        let timeout = self.layout.validation_timeout;
        let started = match self.header.validation_start {
            Some(started) => started,
            None => return Ok(Validation::Pending { remaining: timeout }),
        };
        let elapsed = self.now().elapsed_since(started);
        if elapsed.0 >= timeout.0 {
            warn!("Validation window of {:?} expired", self.header.active().version);
            return self.rollback(Some(Error::ValidationTimeout)).map(Validation::RolledBack);
        }
        Ok(Validation::Pending { remaining: Ticks(timeout.0 - elapsed.0) })
    }

    /// Rejects the image awaiting confirmation, e.g. after a failed self
    /// test, and restores the previous one.
    pub fn force_rollback(&mut self) -> Result<RestartRequired, Error> {
        self.ensure_booted()?;
        if self.header.active().status != SlotStatus::PendingValidation {
            return Err(Error::InvalidState);
        }
        self.rollback(None)
    }

    /// Marks the active image failed, then restores the backup. The header
    /// is committed first so an interrupted restore is resumed at boot
    /// without counting the rollback twice.
    pub(super) fn rollback(&mut self, reason: Option<Error>) -> Result<RestartRequired, Error> {
        let failed = self.header.active().version;
        self.header.active_mut().status = SlotStatus::Failed;
        self.header.failed_version = failed;
        self.header.rollback_count = self.header.rollback_count.saturating_add(1);
        self.header.validation_start = None;
        self.write_header()?;
        self.transition(State::RolledBack, reason)?;
        error!("Rolling back {:?} (rollback #{})", failed, self.header.rollback_count);
        rollback::restore(&mut self.flash, &mut self.program, &self.key, self.layout, &mut self.header)
    }
}
