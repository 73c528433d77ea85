//! Bounded polling of non-blocking operations.
//!
//! Flash peripherals report a busy state through `nb::Error::WouldBlock`.
//! Spinning on them with `nb::block!` can hang forever on a wedged chip, so
//! every flash access in this crate goes through [`bounded`], which gives up
//! after a fixed number of attempts and reports a timeout instead.

use crate::error::{Convertible, Error};

/// Default attempt budget for a single flash operation.
pub const DEFAULT_ATTEMPTS: u32 = 500_000;

/// Outcome of a polling loop that did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exhausted<E> {
    /// The operation was still busy after the attempt budget ran out.
    TimedOut,
    /// The operation failed outright.
    Failed(E),
}

/// Retries `operation` while it yields `WouldBlock`, up to `attempts` times.
pub fn bounded<T, E, F>(attempts: u32, mut operation: F) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> nb::Result<T, E>,
{
    for _ in 0..attempts {
        match operation() {
            Ok(value) => return Ok(value),
            Err(nb::Error::Other(error)) => return Err(Exhausted::Failed(error)),
            Err(nb::Error::WouldBlock) => continue,
        }
    }
    Err(Exhausted::TimedOut)
}

impl<E: Convertible> Convertible for Exhausted<E> {
    fn into(self) -> Error {
        match self {
            Exhausted::TimedOut => Error::IoFailure,
            Exhausted::Failed(error) => Convertible::into(error),
        }
    }
}

/// Like `nb::block!`, but bounded by [`DEFAULT_ATTEMPTS`].
#[macro_export]
macro_rules! poll {
    ($e:expr) => {
        $crate::utilities::poll::bounded($crate::utilities::poll::DEFAULT_ATTEMPTS, || $e)
    };
    ($attempts:expr, $e:expr) => {
        $crate::utilities::poll::bounded($attempts, || $e)
    };
}
