//! Common error-handling support.
//!
//! The kernel distinguishes two tiers of failure caused by user code, on top
//! of the plain `abi::Error` codes used internally: errors that are *returned*
//! to the caller, and errors that *end* the caller. A third tier -- kernel
//! bugs -- panics and never reaches this type.

use abi::{Error, ExceptionReason};

/// An error committed by user code when interacting with a syscall.
///
/// This is the returned error type of the syscall implementations.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UserError {
    /// A recoverable error, indicated to the errant task by returning the
    /// negative error code. Argument validation failures land here; they
    /// happen before any state change, so returning them has no side
    /// effects.
    Recoverable(Error),
    /// An unrecoverable error. The task is terminated through the exception
    /// protocol with the given reason and never runs again; its pager
    /// decides when to reap it.
    Fatal(ExceptionReason),
}

/// Convenience conversion for the common recoverable case, so syscall code
/// can use `?` on `Result<_, Error>` values.
impl From<Error> for UserError {
    fn from(e: Error) -> Self {
        UserError::Recoverable(e)
    }
}

impl From<ExceptionReason> for UserError {
    fn from(r: ExceptionReason) -> Self {
        UserError::Fatal(r)
    }
}
