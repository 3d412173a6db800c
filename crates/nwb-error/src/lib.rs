#![forbid(unsafe_code)]
//! Error types for NetWB.
//!
//! # Error Taxonomy
//!
//! | Class | Variant | Surfaced |
//! |-------|---------|----------|
//! | Fatal before queuing | `NoMemory`, `CacheUnavailable` | Synchronously from the driver entry point |
//! | Per-page planning failure | `NoMemory`, `InvalidRequest` | Remaining pages killed; error recorded on the mapping |
//! | Per-subrequest I/O failure | `Io`, `WriteFailed` | Asynchronously via subrequest termination |
//! | Cancellation | `Cancelled` | Request result when its issuer is dropped before queuing finished |
//!
//! Group-mismatch deferral is not an error: the page is re-dirtied for a
//! later pass and nothing is recorded.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`WbError::to_errno`].
//! The mapping is exhaustive (no wildcard arms).
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `NoMemory` | `ENOMEM` |
//! | `WriteFailed` | `EIO` |
//! | `CacheUnavailable` | `ENOBUFS` |
//! | `InvalidRequest` | `EINVAL` |
//! | `Cancelled` | `EINTR` |
//!
//! ## Cloning
//!
//! A single failure is recorded on the subrequest, on the owning request, and
//! on the mapping's error channel, then returned to a synchronous waiter. `std::io::Error`
//! is not `Clone`, so [`WbError`] implements `Clone` by re-creating I/O errors
//! from their raw OS code (or kind and message when there is none).

use thiserror::Error;

/// Unified error type for all NetWB operations.
#[derive(Debug, Error)]
pub enum WbError {
    /// Operating system or transport I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Allocation exhaustion while building a request or subrequest.
    #[error("out of memory")]
    NoMemory,

    /// A backend reported failure for the write covering `pos`.
    #[error("write failed at {pos:#x}: {detail}")]
    WriteFailed { pos: u64, detail: String },

    /// Caching was required for this inode but the cache could not be bound.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),

    /// The caller handed the engine something it cannot write.
    #[error("invalid write request: {0}")]
    InvalidRequest(String),

    /// The request's issuer went away before it finished queuing.
    #[error("operation cancelled")]
    Cancelled,
}

impl WbError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::NoMemory => libc::ENOMEM,
            Self::WriteFailed { .. } => libc::EIO,
            Self::CacheUnavailable(_) => libc::ENOBUFS,
            Self::InvalidRequest(_) => libc::EINVAL,
            Self::Cancelled => libc::EINTR,
        }
    }

    /// Whether a collector may reasonably retry the write that produced this.
    ///
    /// Allocation and argument errors will fail identically on a retry.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            ) || err.raw_os_error() == Some(libc::EAGAIN),
            Self::WriteFailed { .. } => true,
            Self::NoMemory | Self::CacheUnavailable(_) | Self::InvalidRequest(_) | Self::Cancelled => {
                false
            }
        }
    }
}

impl Clone for WbError {
    fn clone(&self) -> Self {
        match self {
            Self::Io(err) => Self::Io(err.raw_os_error().map_or_else(
                || std::io::Error::new(err.kind(), err.to_string()),
                std::io::Error::from_raw_os_error,
            )),
            Self::NoMemory => Self::NoMemory,
            Self::WriteFailed { pos, detail } => Self::WriteFailed {
                pos: *pos,
                detail: detail.clone(),
            },
            Self::CacheUnavailable(detail) => Self::CacheUnavailable(detail.clone()),
            Self::InvalidRequest(detail) => Self::InvalidRequest(detail.clone()),
            Self::Cancelled => Self::Cancelled,
        }
    }
}

impl From<std::collections::TryReserveError> for WbError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::NoMemory
    }
}

/// Result alias using `WbError`.
pub type Result<T> = std::result::Result<T, WbError>;
