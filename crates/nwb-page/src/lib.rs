#![forbid(unsafe_code)]
//! Pagecache collaborator model for the NetWB write-back engine.
//!
//! Provides [`Folio`] (a cached page with lock, dirty, writeback and group
//! state), [`Mapping`] (the folio index of one file, with its size, error
//! channel and group reference counts) and [`WritebackControl`] (the cursor
//! and budget of one write-back pass).

pub mod folio;
pub mod mapping;

pub use folio::{Folio, FolioGroup, FolioPrivate, StreamingWrite};
pub use mapping::{Mapping, WritebackControl, redirty_for_writepage};
