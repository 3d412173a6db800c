#![forbid(unsafe_code)]
//! NetWB public API facade.
//!
//! Re-exports the write-issue engine from `nwb-write` together with the
//! page-cache model, identifiers and error type it is driven with. This is
//! the crate a network filesystem client depends on.

pub use nwb_error::{Result, WbError};
pub use nwb_page::{Folio, FolioGroup, FolioPrivate, Mapping, StreamingWrite, WritebackControl};
pub use nwb_types::{DebugId, FilePos, FolioSize, GroupId, IoOrigin, StreamSource, SyncMode};
pub use nwb_write::*;
