#![forbid(unsafe_code)]
//! Shared vocabulary types for the NetWB write-back engine.
//!
//! Everything here is plain data: unit-carrying newtypes for file positions
//! and identities, the request-origin and stream-source enums, and a few
//! page geometry constants. No I/O and no locking.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Base page size of the page cache.
pub const PAGE_SIZE: usize = 4096;

/// Largest folio the page cache hands out (512 base pages).
pub const MAX_FOLIO_SIZE: usize = 2 * 1024 * 1024;

/// Number of parallel output streams per write request.
pub const NR_IO_STREAMS: usize = 2;

/// Stream slot of the upload-to-server stream.
pub const UPLOAD_STREAM: usize = 0;

/// Stream slot of the write-to-cache stream.
pub const CACHE_STREAM: usize = 1;

/// Byte position within a file.
///
/// A unit-carrying wrapper so that file positions are never confused with
/// in-page offsets or lengths.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct FilePos(pub u64);

impl FilePos {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Add an in-memory length, saturating at `u64::MAX`.
    #[must_use]
    pub fn saturating_add_len(self, len: usize) -> Self {
        Self(self.0.saturating_add(len_to_u64(len)))
    }

    /// Distance from `self` forward to `later`, or `None` if `later` is behind.
    #[must_use]
    pub fn distance_to(self, later: Self) -> Option<u64> {
        later.0.checked_sub(self.0)
    }
}

/// Identity of a dirty-tracking cohort (for example a snapshot context).
///
/// Pages carrying a different group than the request being built are
/// deferred to a later write-back pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u64);

/// Diagnostic identifier of a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DebugId(pub u32);

/// Validated folio size (a power of two in `PAGE_SIZE..=MAX_FOLIO_SIZE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FolioSize(usize);

impl FolioSize {
    pub const BASE: Self = Self(PAGE_SIZE);

    pub fn new(value: usize) -> Result<Self, GeometryError> {
        if !value.is_power_of_two() || !(PAGE_SIZE..=MAX_FOLIO_SIZE).contains(&value) {
            return Err(GeometryError::InvalidFolioSize(value));
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> usize {
        self.0
    }
}

/// What started a write request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoOrigin {
    /// Whole-file write-back pass over dirty pagecache pages.
    Writeback,
    /// Monolithic non-pagecache payload written back in one go.
    WritebackSingle,
    /// Data copied into the pagecache and written in the same call.
    Writethrough,
    /// Buffered-but-uncached write straight to the server.
    UnbufferedWrite,
    /// Direct I/O write.
    DioWrite,
    /// Clean pages read from the server that only need copying to the cache.
    Pgpriv2CopyToCache,
}

impl IoOrigin {
    /// Whether requests of this origin may also be written to the local cache.
    #[must_use]
    pub fn is_cacheable(self) -> bool {
        matches!(
            self,
            Self::Writeback | Self::WritebackSingle | Self::Writethrough | Self::Pgpriv2CopyToCache
        )
    }
}

/// Destination of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamSource {
    UploadToServer,
    WriteToCache,
}

impl StreamSource {
    /// Fixed stream slot for this destination.
    #[must_use]
    pub fn stream_nr(self) -> usize {
        match self {
            Self::UploadToServer => UPLOAD_STREAM,
            Self::WriteToCache => CACHE_STREAM,
        }
    }
}

/// How hard a write-back pass should try.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Opportunistic: skip contended locks and pages already under writeback.
    #[default]
    None,
    /// Data-integrity: wait for locks and for in-flight writeback.
    All,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GeometryError {
    #[error("invalid folio size {0} (must be power of two in 4096..=2097152)")]
    InvalidFolioSize(usize),
    #[error("range overflow: pos={pos} len={len}")]
    RangeOverflow { pos: u64, len: u64 },
}

/// Widen an in-memory length to a file length.
#[inline]
#[must_use]
pub fn len_to_u64(len: usize) -> u64 {
    u64::try_from(len).unwrap_or(u64::MAX)
}

/// Narrow a file length to an in-memory length, saturating on 32-bit hosts.
#[inline]
#[must_use]
pub fn u64_to_len(len: u64) -> usize {
    usize::try_from(len).unwrap_or(usize::MAX)
}

impl fmt::Display for FilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

impl fmt::Display for DebugId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R={:x}", self.0)
    }
}

impl fmt::Display for StreamSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UploadToServer => f.write_str("upload"),
            Self::WriteToCache => f.write_str("cache"),
        }
    }
}
