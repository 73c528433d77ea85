//! Error type for the update transaction system as a whole.
//!
//! Every fallible operation in the crate returns this single [`Error`]. Driver
//! errors are lifted into it through [`Convertible`], so `?` works across the
//! HAL boundary without each driver knowing about the business logic.
use ufmt::{uDisplay, uWrite, uwrite, uwriteln, Formatter};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(target_arch = "arm", derive(defmt::Format))]
pub enum Error {
    /// A flash read, write or erase failed, or never completed.
    IoFailure,
    /// The backup header failed its checksum or carries unknown fields.
    CorruptHeader,
    /// A slot or image checksum did not match its recorded value.
    ChecksumMismatch,
    /// An image or chunk does not fit the slot or program memory.
    TooLarge,
    /// The operation is not allowed in the current update state.
    InvalidState,
    /// The new firmware did not confirm itself in time.
    ValidationTimeout,
    /// A transfer was started for a zero length image.
    EmptyImage,
    /// A chunk's offset check does not correspond to its index.
    OffsetMismatch,
    /// A rollback was requested but no valid backup exists.
    NoBackup,
    /// A transport message could not be decoded.
    Malformed,
}

/// Exposes a report-able error type for a given driver, so that
/// its errors can be lifted into the crate-wide [`Error`].
pub trait Convertible {
    fn into(self) -> Error;
}

impl<T: Convertible> From<T> for Error {
    fn from(t: T) -> Self { Convertible::into(t) }
}

impl Error {
    /// Stable one byte code, used both in the persisted update state and
    /// in error responses sent over the transport.
    pub const fn code(&self) -> u8 {
        match self {
            Error::IoFailure => 0x01,
            Error::CorruptHeader => 0x02,
            Error::ChecksumMismatch => 0x03,
            Error::TooLarge => 0x04,
            Error::InvalidState => 0x05,
            Error::ValidationTimeout => 0x06,
            Error::EmptyImage => 0x07,
            Error::OffsetMismatch => 0x08,
            Error::NoBackup => 0x09,
            Error::Malformed => 0x0A,
        }
    }

    /// Inverse of [`Error::code`]. Unknown codes yield `None`.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Error::IoFailure,
            0x02 => Error::CorruptHeader,
            0x03 => Error::ChecksumMismatch,
            0x04 => Error::TooLarge,
            0x05 => Error::InvalidState,
            0x06 => Error::ValidationTimeout,
            0x07 => Error::EmptyImage,
            0x08 => Error::OffsetMismatch,
            0x09 => Error::NoBackup,
            0x0A => Error::Malformed,
            _ => return None,
        })
    }

    fn description(&self) -> &'static str {
        match self {
            Error::IoFailure => "flash access failed or timed out",
            Error::CorruptHeader => "backup header is corrupt",
            Error::ChecksumMismatch => "checksum mismatch",
            Error::TooLarge => "image does not fit",
            Error::InvalidState => "operation not allowed in the current state",
            Error::ValidationTimeout => "firmware was not confirmed in time",
            Error::EmptyImage => "image is empty",
            Error::OffsetMismatch => "chunk offset does not match its index",
            Error::NoBackup => "no valid backup to restore from",
            Error::Malformed => "malformed message",
        }
    }

    /// Writes a single diagnostic line describing the error.
    pub fn report<W: uWrite + ?Sized>(&self, sink: &mut W) -> Result<(), W::Error> {
        uwriteln!(sink, "[Error {}] -> {}", self.code(), self)
    }
}

impl uDisplay for Error {
    fn fmt<W: uWrite + ?Sized>(&self, f: &mut Formatter<'_, W>) -> Result<(), W::Error> {
        uwrite!(f, "{}", self.description())
    }
}
