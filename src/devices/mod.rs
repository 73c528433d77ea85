//! Complex modules with business logic related to the problem
//! domain, that lay on top of abstract drivers. Devices are
//! generic, while board specifics (memory map, hardware id) are
//! handled in the `ports` module.

pub mod backup_header;
pub mod cipher;
pub mod keys;
pub mod layout;
pub mod ota;
pub mod ota_state;
pub mod protocol;
pub mod receiver;
pub mod rollback;

/// General purpose traits that summarize requirements on devices.
pub mod traits {
    use crate::{
        error,
        hal::{flash, program},
    };
    use marker_blanket::marker_blanket;

    /// A supported external flash must be able to read, write, erase
    /// sectors, and report errors to the update system.
    #[marker_blanket]
    pub trait ExternalFlash: flash::SectorErase<Error: error::Convertible> {}

    /// A supported program memory must be page erasable and report errors
    /// to the update system.
    #[marker_blanket]
    pub trait Program: program::ProgramMemory<Error: error::Convertible> {}
}
