use crate::hal::qspi::Indirect;
use std::collections::VecDeque;

/// Single command frame observed on the bus.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Write { instruction: Option<u8>, address: Option<u32>, data: Vec<u8> },
    Read { instruction: Option<u8>, address: Option<u32>, length: usize },
}

impl Frame {
    pub fn instruction(&self) -> Option<u8> {
        match self {
            Frame::Write { instruction, .. } | Frame::Read { instruction, .. } => *instruction,
        }
    }

    pub fn address(&self) -> Option<u32> {
        match self {
            Frame::Write { address, .. } | Frame::Read { address, .. } => *address,
        }
    }
}

/// Scripted command bus. Every frame is logged in order; reads are answered
/// from `to_read`, front first, with zeroes once the script runs out.
#[derive(Default)]
pub struct MockQspi {
    pub frames: Vec<Frame>,
    pub to_read: VecDeque<Vec<u8>>,
}

impl MockQspi {
    pub fn clear(&mut self) {
        self.frames.clear();
        self.to_read.clear();
    }

    /// Instruction bytes of every frame so far.
    pub fn instructions(&self) -> Vec<u8> {
        self.frames.iter().filter_map(Frame::instruction).collect()
    }
}

impl Indirect for MockQspi {
    type Error = ();

    fn write(
        &mut self,
        instruction: Option<u8>,
        address: Option<u32>,
        data: Option<&[u8]>,
        _dummy_cycles: u8,
    ) -> nb::Result<(), Self::Error> {
        let data = data.map(<[u8]>::to_vec).unwrap_or_default();
        self.frames.push(Frame::Write { instruction, address, data });
        Ok(())
    }

    fn read(
        &mut self,
        instruction: Option<u8>,
        address: Option<u32>,
        data: &mut [u8],
        _dummy_cycles: u8,
    ) -> nb::Result<(), Self::Error> {
        self.frames.push(Frame::Read { instruction, address, length: data.len() });
        data.iter_mut().for_each(|byte| *byte = 0);
        data.iter_mut().zip(self.to_read.pop_front().unwrap_or_default()).for_each(|(o, i)| *o = i);
        Ok(())
    }
}
