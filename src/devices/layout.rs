//! Placement of every persisted structure.
//!
//! A `Layout` is a board level constant. It is checked at compile time by
//! the port that defines it (see `ports::stm32f412`).
use super::{backup_header::{SlotId, HEADER_SIZE}, ota_state::STATE_SIZE};
use crate::{hal::time::Ticks, utilities::memory::Region};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Layout {
    /// External flash sector holding the backup header.
    pub header: Region,
    /// External flash sector holding the update progress log.
    pub state: Region,
    /// The two encrypted firmware slots in external flash.
    pub slots: [Region; 2],
    /// Erase granularity of the external flash.
    pub sector_size: usize,
    /// Internal program memory occupied by the application.
    pub program: Region,
    /// Window, in scheduler ticks, for new firmware to confirm itself.
    pub validation_timeout: Ticks,
    /// Progress is persisted every this many distinct chunks.
    pub persist_interval: u16,
}

impl Layout {
    pub const fn slot(&self, id: SlotId) -> Region { self.slots[id.index()] }

    /// Largest image a slot can hold.
    pub const fn slot_capacity(&self) -> usize { self.slots[0].size }

    /// Largest image the update system accepts.
    pub const fn max_image_size(&self) -> usize {
        if self.slot_capacity() < self.program.size {
            self.slot_capacity()
        } else {
            self.program.size
        }
    }

    const fn is_aligned(&self, region: &Region) -> bool {
        region.location as usize % self.sector_size == 0 && region.size % self.sector_size == 0
    }

    /// Verifies that the layout is well formed: sector aligned, large
    /// enough, and free of overlaps between external flash regions.
    pub const fn is_sound(&self) -> bool {
        let external = [self.header, self.state, self.slots[0], self.slots[1]];
        let mut i = 0;
        while i < external.len() {
            if self.sector_size == 0 || !self.is_aligned(&external[i]) || external[i].size == 0 {
                return false;
            }
            let mut j = i + 1;
            while j < external.len() {
                if external[i].overlaps(&external[j]) {
                    return false;
                }
                j += 1;
            }
            i += 1;
        }
        self.header.size >= HEADER_SIZE
            && self.state.size >= STATE_SIZE
            && self.slots[0].size == self.slots[1].size
            && self.program.size > 0
            && self.persist_interval > 0
    }
}
