//! Firmware transfer receiver.
//!
//! Stages an incoming image into the inactive slot, encrypting each chunk
//! as it lands. Chunks may arrive in any order and may be retransmitted;
//! a bitmap tracks which ones have been stored so completeness does not
//! depend on arrival order.
use super::{cipher, keys::Key, traits::ExternalFlash};
use crate::{
    error::Error,
    logging::info,
    utilities::memory::{blocks_to_cover, Region},
};

/// Payload bytes carried by every chunk but the last.
pub const CHUNK_SIZE: usize = 128;
/// Largest number of chunks a single image may span.
pub const MAX_CHUNKS: usize = 8192;

const BITMAP_WORDS: usize = MAX_CHUNKS / 32;

/// Number of chunks needed to carry `size` bytes.
pub const fn chunks_for(size: usize) -> usize { blocks_to_cover(size, CHUNK_SIZE) }

/// Byte offset a chunk index addresses.
pub const fn offset_of(index: u16) -> u32 { index as u32 * CHUNK_SIZE as u32 }

/// Truncated offset the transport sends alongside a chunk index.
pub const fn offset_check(index: u16) -> u16 { offset_of(index) as u16 }

pub struct Receiver {
    slot: Region,
    key: Key,
    firmware_size: u32,
    total_chunks: u16,
    received: [u32; BITMAP_WORDS],
    distinct: u16,
}

impl Receiver {
    /// Sets up reception of a `firmware_size` byte image into `slot`.
    /// Nothing is written until [`Receiver::prepare`] or the first chunk.
    pub fn new(slot: Region, key: Key, firmware_size: u32) -> Result<Self, Error> {
        let size = firmware_size as usize;
        if size == 0 {
            return Err(Error::EmptyImage);
        }
        if size > slot.size || chunks_for(size) > MAX_CHUNKS {
            return Err(Error::TooLarge);
        }
        Ok(Self {
            slot,
            key,
            firmware_size,
            total_chunks: chunks_for(size) as u16,
            received: [0; BITMAP_WORDS],
            distinct: 0,
        })
    }

    /// Erases the slot sectors that will hold the image.
    pub fn prepare<F: ExternalFlash>(&self, flash: &mut F) -> Result<(), Error> {
        let sector_size = flash.sector_size();
        for sector in self.slot.blocks(self.firmware_size as usize, sector_size) {
            poll!(flash.erase_sector(sector))?;
        }
        info!("Staging slot erased for {} bytes", self.firmware_size);
        Ok(())
    }

    /// Encrypts and stores `bytes` at `offset` from the slot start. Rejected
    /// without writing if it would overrun the slot.
    pub fn write_chunk<F: ExternalFlash>(
        &mut self,
        flash: &mut F,
        offset: u32,
        bytes: &[u8],
    ) -> Result<(), Error> {
        if !self.slot.fits(offset, bytes.len()) {
            return Err(Error::TooLarge);
        }
        let mut buffer = [0u8; CHUNK_SIZE];
        let mut position = offset;
        for block in bytes.chunks(CHUNK_SIZE) {
            let buffer = &mut buffer[..block.len()];
            buffer.copy_from_slice(block);
            cipher::encrypt(&self.key, position, buffer);
            poll!(flash.write(self.slot.location + position, buffer))?;
            position += block.len() as u32;
        }
        Ok(())
    }

    /// Stores chunk `index`. Returns whether it had not been seen before;
    /// retransmitted chunks are acknowledged without being rewritten.
    pub fn accept<F: ExternalFlash>(
        &mut self,
        flash: &mut F,
        index: u16,
        check: u16,
        payload: &[u8],
    ) -> Result<bool, Error> {
        if index >= self.total_chunks {
            return Err(Error::TooLarge);
        }
        if check != offset_check(index) {
            return Err(Error::OffsetMismatch);
        }
        let expected = self.expected_length(index);
        if payload.len() > expected {
            return Err(Error::TooLarge);
        }
        if payload.len() < expected {
            return Err(Error::OffsetMismatch);
        }
        if self.has(index) {
            return Ok(false);
        }

        self.write_chunk(flash, offset_of(index), payload)?;
        self.received[index as usize / 32] |= 1 << (index % 32);
        self.distinct += 1;
        Ok(true)
    }

    fn expected_length(&self, index: u16) -> usize {
        let remaining = self.firmware_size - offset_of(index);
        (remaining as usize).min(CHUNK_SIZE)
    }

    pub fn has(&self, index: u16) -> bool {
        index < self.total_chunks && self.received[index as usize / 32] & (1 << (index % 32)) != 0
    }

    pub fn chunks_received(&self) -> u16 { self.distinct }
    pub fn total_chunks(&self) -> u16 { self.total_chunks }
    pub fn firmware_size(&self) -> u32 { self.firmware_size }
    pub fn is_complete(&self) -> bool { self.distinct == self.total_chunks }

    pub fn progress_percent(&self) -> u8 {
        (self.distinct as u32 * 100 / self.total_chunks as u32) as u8
    }
}
