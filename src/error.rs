// SPDX-License-Identifier: MIT
//
// Error surface for mapping and mutex operations.

use std::io;

use thiserror::Error;

/// Errors reported by [`SharedMemorySegment`](crate::SharedMemorySegment)
/// and [`NamedMutex`](crate::NamedMutex) operations.
///
/// Every variant that wraps an OS-call failure carries the originating
/// `io::Error`, so the raw OS error code stays available through
/// [`Error::os_error_code`]. A timeout is never an error; timed-out waits
/// come back as `Ok(WaitOutcome::Timeout)`.
#[derive(Debug, Error)]
pub enum Error {
    /// The backing file could not be opened or created.
    #[error("failed to create backing file: {source}")]
    CreateFailed {
        /// OS error from the file-creation call.
        source: io::Error,
    },

    /// The named object does not exist or access to it was denied.
    #[error("failed to open named object `{name}`: {source}")]
    OpenFailed {
        /// Requested global object name.
        name: String,
        /// OS error from the open call.
        source: io::Error,
    },

    /// The named mapping object could not be created.
    #[error("failed to create mapping object: {source}")]
    MapCreateFailed {
        /// OS error from the mapping-creation call.
        source: io::Error,
    },

    /// The mapping object exists but its view could not be mapped
    /// into the address space.
    #[error("failed to map view: {source}")]
    MapViewFailed {
        /// OS error from the view-mapping call.
        source: io::Error,
    },

    /// The wait call itself failed (distinct from a timeout).
    #[error("wait on mutex failed: {source}")]
    WaitFailed {
        /// OS error from the wait call.
        source: io::Error,
    },

    /// `release` was called without holding the mutex.
    #[error("mutex is not owned by the calling thread: {source}")]
    NotOwned {
        /// OS error reporting the ownership violation.
        source: io::Error,
    },

    /// A caller-supplied argument was rejected before any OS call.
    #[error("{message}")]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// A `read`/`write` range falls outside the mapped region or the
    /// caller's buffer. Nothing is copied.
    #[error("range {offset}+{len} exceeds {limit}-byte bound")]
    OutOfRange {
        /// Start offset of the rejected range.
        offset: u32,
        /// Length of the rejected range.
        len: u32,
        /// Size of the region or buffer the range was checked against.
        limit: usize,
    },

    /// The instance is unopened or already closed.
    #[error("operation on an unopened or closed handle")]
    InvalidHandle,
}

/// Fieldless mirror of [`Error`], for binding layers that dispatch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::CreateFailed`].
    CreateFailed,
    /// See [`Error::OpenFailed`].
    OpenFailed,
    /// See [`Error::MapCreateFailed`].
    MapCreateFailed,
    /// See [`Error::MapViewFailed`].
    MapViewFailed,
    /// See [`Error::WaitFailed`].
    WaitFailed,
    /// See [`Error::NotOwned`].
    NotOwned,
    /// See [`Error::InvalidArgument`].
    InvalidArgument,
    /// See [`Error::OutOfRange`].
    OutOfRange,
    /// See [`Error::InvalidHandle`].
    InvalidHandle,
}

impl Error {
    /// The kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CreateFailed { .. } => ErrorKind::CreateFailed,
            Error::OpenFailed { .. } => ErrorKind::OpenFailed,
            Error::MapCreateFailed { .. } => ErrorKind::MapCreateFailed,
            Error::MapViewFailed { .. } => ErrorKind::MapViewFailed,
            Error::WaitFailed { .. } => ErrorKind::WaitFailed,
            Error::NotOwned { .. } => ErrorKind::NotOwned,
            Error::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Error::OutOfRange { .. } => ErrorKind::OutOfRange,
            Error::InvalidHandle => ErrorKind::InvalidHandle,
        }
    }

    /// Raw OS error code of the failing call, when one exists.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Error::CreateFailed { source }
            | Error::OpenFailed { source, .. }
            | Error::MapCreateFailed { source }
            | Error::MapViewFailed { source }
            | Error::WaitFailed { source }
            | Error::NotOwned { source } => source.raw_os_error(),
            Error::InvalidArgument { .. } | Error::OutOfRange { .. } | Error::InvalidHandle => None,
        }
    }

    pub(crate) fn invalid_argument(message: impl Into<String>) -> Self {
        Error::InvalidArgument {
            message: message.into(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
