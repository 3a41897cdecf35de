//! Crate-wide error classification.
//!
//! Every module defines its own `thiserror` error enum; this module adds
//! the coarse classification callers branch on without matching each enum
//! individually. The scheduler in particular distinguishes *busy* and
//! *in-progress* outcomes from plain failures.

use rustix::io::Errno;

/// Coarse classification of an error, shared across all module errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An argument was rejected before reaching the operating system.
    InvalidArgument,
    /// An allocation or kernel resource limit was hit.
    NoMemory,
    /// The operation is not supported by this object or backend.
    NotSupported,
    /// The object to create already exists.
    AlreadyExists,
    /// The referenced object does not exist.
    NotFound,
    /// The object is in use and the operation would disturb it.
    Busy,
    /// The operation started and will complete asynchronously.
    InProgress,
    /// The underlying device or I/O channel failed.
    DeviceFault,
    /// The caller lacks the rights for this operation.
    PermissionDenied,
    /// The peer hung up.
    HangUp,
    /// A bounded wait elapsed.
    TimedOut,
}

impl ErrorKind {
    /// The closest kernel errno for this kind, for surfaces that speak
    /// errno to legacy clients.
    pub fn errno(self) -> Errno {
        match self {
            ErrorKind::InvalidArgument => Errno::INVAL,
            ErrorKind::NoMemory => Errno::NOMEM,
            ErrorKind::NotSupported => Errno::OPNOTSUPP,
            ErrorKind::AlreadyExists => Errno::EXIST,
            ErrorKind::NotFound => Errno::NOENT,
            ErrorKind::Busy => Errno::BUSY,
            ErrorKind::InProgress => Errno::INPROGRESS,
            ErrorKind::DeviceFault => Errno::IO,
            ErrorKind::PermissionDenied => Errno::ACCESS,
            ErrorKind::HangUp => Errno::PIPE,
            ErrorKind::TimedOut => Errno::TIMEDOUT,
        }
    }
}

/// Implemented by all module error types to expose their [`ErrorKind`].
pub trait Kind {
    /// The coarse classification of this error.
    fn kind(&self) -> ErrorKind;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_distinct_errnos() {
        let kinds = [
            ErrorKind::InvalidArgument,
            ErrorKind::NoMemory,
            ErrorKind::NotSupported,
            ErrorKind::AlreadyExists,
            ErrorKind::NotFound,
            ErrorKind::Busy,
            ErrorKind::InProgress,
            ErrorKind::DeviceFault,
            ErrorKind::PermissionDenied,
            ErrorKind::HangUp,
            ErrorKind::TimedOut,
        ];
        for (i, a) in kinds.iter().enumerate() {
            for b in &kinds[i + 1..] {
                assert_ne!(a.errno(), b.errno());
            }
        }
    }
}
