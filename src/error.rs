//! Error handling utils.
//!
//! Every fallible operation in this crate returns a [`Result`] carrying the
//! [`Error`] enum below rather than a raw `-1`/`errno` pair. `io::Error`
//! already captures the OS error code at the point of failure and survives a
//! fiber suspension without relying on a process-global `errno`, so variants
//! that wrap a syscall failure simply carry one.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Represents all error cases the runtime can surface.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The underlying OS call failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A blocking reference the caller was suspended on was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The stack pool could not grow, or the event multiplexer refused a
    /// registration.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The blocking-I/O worker pool replied with an operation pointer that
    /// does not match the one submitted. Kept as a typed, non-panicking
    /// variant rather than treated as a fatal programming error; see
    /// DESIGN.md.
    #[error("worker pool protocol violation")]
    WorkerProtocolViolation,
}

const _: () = {
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};

impl Error {
    /// `true` if this error is [`Error::Cancelled`].
    #[inline(always)]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Error returned by [`crate::codec`] primitive reads/writes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CodecError {
    #[error("underlying stream failed: {0}")]
    Io(#[from] io::Error),
    #[error("length prefix exceeds 5 bytes (32-bit values only)")]
    LengthPrefixTooLong,
    #[error("string was not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}
