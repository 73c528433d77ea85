use super::*;
use crate::devices::{
    protocol::{Request, Response},
    receiver::{chunks_for, MAX_CHUNKS},
};

/// Outcome of handling one transport request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reply {
    pub response: Response,
    /// Set whenever program memory was rewritten, by a commit or by the
    /// revert of a failed one. The caller must send the response and then
    /// reset.
    pub restart: Option<RestartRequired>,
}

impl Reply {
    fn with(response: Response) -> Self { Reply { response, restart: None } }
}

impl<EXTF: ExternalFlash, PM: Program, CLK: time::Now> Ota<EXTF, PM, CLK> {
    /// Begins receiving a `firmware_size` byte image into the inactive slot.
    ///
    /// Every check runs before anything is written. A start while another
    /// transfer is in progress restarts the transfer from scratch.
    pub fn start(&mut self, firmware_size: u32, firmware_crc: u32, version: Version) -> Result<(), Error> {
        self.ensure_booted()?;
        if !self.state.state.accepts_start()
            || self.header.active().status == SlotStatus::PendingValidation
        {
            return Err(Error::InvalidState);
        }
        let size = firmware_size as usize;
        if size == 0 {
            return Err(Error::EmptyImage);
        }
        if size > self.layout.max_image_size() || chunks_for(size) > MAX_CHUNKS {
            return Err(Error::TooLarge);
        }

        let staging = self.header.active_slot.other();
        let receiver = Receiver::new(self.layout.slot(staging), self.key, firmware_size)?;
        self.receiver = None;
        if *self.header.slot(staging) != SlotEntry::EMPTY {
            *self.header.slot_mut(staging) = SlotEntry::EMPTY;
            self.write_header()?;
        }
        receiver.prepare(&mut self.flash)?;

        self.state = OtaState {
            state: State::InProgress,
            error_code: 0,
            target_version: version,
            previous_version: self.header.active().version,
            chunks_received: 0,
            total_chunks: receiver.total_chunks(),
            firmware_size,
            firmware_crc,
            timestamp: self.now(),
        };
        self.persist_state()?;
        self.receiver = Some(receiver);
        self.unpersisted = 0;
        info!("Receiving {:?} ({} bytes) into slot {:?}", version, firmware_size, staging);
        Ok(())
    }

    /// Stores one chunk and returns the transfer progress in percent.
    pub fn chunk(&mut self, index: u16, offset_check: u16, payload: &[u8]) -> Result<u8, Error> {
        self.ensure_booted()?;
        if self.state.state != State::InProgress {
            return Err(Error::InvalidState);
        }
        let receiver = self.receiver.as_mut().ok_or(Error::InvalidState)?;
        let fresh = receiver.accept(&mut self.flash, index, offset_check, payload)?;
        let (received, complete, percent) =
            (receiver.chunks_received(), receiver.is_complete(), receiver.progress_percent());
        if fresh {
            self.unpersisted += 1;
            self.state.chunks_received = received;
            if self.unpersisted >= self.layout.persist_interval || complete {
                self.unpersisted = 0;
                self.persist_state()?;
            }
        }
        Ok(percent)
    }

    /// Verifies and commits the staged image.
    ///
    /// On success program memory holds the new image, its slot is pending
    /// validation, and the device must be reset. A checksum mismatch fails
    /// the update without touching program memory. If programming fails the
    /// previous image is put back; when that reprograms internal memory the
    /// reset it requires is left in [`Ota::take_restart`].
    pub fn finish(&mut self) -> Result<RestartRequired, Error> {
        self.ensure_booted()?;
        let (complete, size) = match (&self.receiver, self.state.state) {
            (Some(receiver), State::InProgress) => (receiver.is_complete(), receiver.firmware_size()),
            _ => return Err(Error::InvalidState),
        };
        if !complete {
            warn!("Finish requested with {} of {} chunks", self.state.chunks_received, self.state.total_chunks);
            return Err(Error::InvalidState);
        }

        let staged = self.header.active_slot.other();
        let digest = rollback::digest_slot(&mut self.flash, &self.key, self.layout.slot(staged), size as usize)?;
        if digest.plaintext_crc != self.state.firmware_crc {
            error!("Staged image checksum does not match, discarding it");
            self.receiver = None;
            self.transition(State::Failed, Some(Error::ChecksumMismatch))?;
            return Err(Error::ChecksumMismatch);
        }

        self.ensure_backup()?;
        let committed = self.header;
        let version = self.state.target_version;
        *self.header.slot_mut(staged) = SlotEntry {
            status: SlotStatus::PendingValidation,
            version,
            size,
            checksum: digest.integrity,
        };
        self.header.expected_version = version;
        self.header.active_slot = staged;
        self.header.validation_start = None;
        if let Err(e) = self.write_header() {
            self.header = committed;
            return Err(e);
        }
        self.receiver = None;
        self.transition(State::PendingReboot, None)?;

        let entry = *self.header.slot(staged);
        match rollback::program_from_slot(
            &mut self.flash,
            &mut self.program,
            &self.key,
            self.layout,
            &entry,
            staged,
        ) {
            Ok(()) => {
                info!("Committed {:?}, restart required", version);
                Ok(RestartRequired)
            }
            Err(e) => {
                error!("Programming the new image failed: {:?}", e);
                match self.revert_commit(staged, e) {
                    Ok(Some(restart)) => {
                        warn!("Previous image reprogrammed, restart required");
                        self.pending_restart = Some(restart);
                    }
                    Ok(None) => info!("Previous image still in place"),
                    Err(revert) => error!("Reverting the commit failed: {:?}", revert),
                }
                Err(e)
            }
        }
    }

    /// Abandons the transfer in progress. Program memory is never touched.
    pub fn abort(&mut self) -> Result<(), Error> {
        self.ensure_booted()?;
        if self.state.state != State::InProgress {
            return Err(Error::InvalidState);
        }
        self.receiver = None;
        self.unpersisted = 0;
        self.state = OtaState::IDLE;
        self.persist_state()?;
        info!("Transfer aborted");
        Ok(())
    }

    /// Dispatches a decoded transport request.
    pub fn handle(&mut self, request: Request<'_>) -> Reply {
        let outcome = match request {
            Request::Start { size, crc, version } => self.start(size, crc, version).map(|_| Reply::with(Response::Ready)),
            Request::Chunk { index, offset_check, payload } => {
                self.chunk(index, offset_check, payload).map(|percent| Reply::with(Response::ChunkOk(percent)))
            }
            Request::Finish => match self.finish() {
                Ok(restart) => Ok(Reply { response: Response::Rebooting, restart: Some(restart) }),
                Err(e) => Ok(Reply { response: Response::for_error(e), restart: self.take_restart() }),
            },
            Request::Abort => match self.abort() {
                Err(Error::InvalidState) => Ok(Reply::with(Response::Ok)),
                other => other.map(|_| Reply::with(Response::Ok)),
            },
        };
        outcome.unwrap_or_else(|e| Reply::with(Response::for_error(e)))
    }

    /// Decodes and handles a raw frame.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Reply {
        match Request::decode(frame) {
            Ok(request) => self.handle(request),
            Err(e) => Reply::with(Response::for_error(e)),
        }
    }
}
