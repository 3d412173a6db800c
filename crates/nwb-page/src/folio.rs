//! Pagecache folios as seen by the write-back engine.
//!
//! A [`Folio`] carries its data plus the small amount of state the engine
//! manipulates: the page lock, dirty and writeback bits, and the private
//! attachment that says which dirty-tracking group the data belongs to (or
//! that only a sub-range is valid, for streaming writes).

use nwb_types::{FilePos, FolioSize, GroupId, len_to_u64};
use parking_lot::{Condvar, Mutex};
use std::ops::Range;

/// Valid-data window of a folio populated by a small streaming write.
///
/// Only `[dirty_offset, dirty_offset + dirty_len)` holds data; the rest of
/// the folio was never read from the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamingWrite {
    pub group: Option<GroupId>,
    pub dirty_offset: usize,
    pub dirty_len: usize,
}

impl StreamingWrite {
    #[must_use]
    pub fn dirty_end(&self) -> usize {
        self.dirty_offset + self.dirty_len
    }
}

/// Private attachment on a folio.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FolioPrivate {
    #[default]
    None,
    /// Fully dirty data belonging to a write-back group.
    Group(GroupId),
    /// Clean data read from the server that only needs copying to the cache.
    CopyToCache,
    /// Partially populated by a streaming write.
    Streaming(StreamingWrite),
}

/// Cohort a folio belongs to for write-back purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolioGroup {
    /// Dirty data, possibly tagged with a group.
    Dirty(Option<GroupId>),
    /// The special copy-to-cache cohort.
    CopyToCache,
}

impl FolioGroup {
    #[must_use]
    pub fn is_copy_to_cache(self) -> bool {
        matches!(self, Self::CopyToCache)
    }

    /// Whether a request built for `group` may write this folio.
    #[must_use]
    pub fn matches(self, group: Option<GroupId>) -> bool {
        match self {
            Self::Dirty(g) => g == group,
            Self::CopyToCache => false,
        }
    }
}

#[derive(Debug, Default)]
struct FolioState {
    locked: bool,
    dirty: bool,
    writeback: bool,
    uptodate: bool,
    private: FolioPrivate,
}

/// A unit of cached file data.
#[derive(Debug)]
pub struct Folio {
    pos: FilePos,
    data: Mutex<Vec<u8>>,
    state: Mutex<FolioState>,
    changed: Condvar,
}

impl Folio {
    /// Create an empty pagecache folio at `pos`. Its contents are not up
    /// to date until something fills them.
    #[must_use]
    pub fn new(pos: FilePos, size: FolioSize) -> Self {
        let folio = Self::with_bytes(pos, vec![0_u8; size.get()]);
        folio.set_uptodate(false);
        folio
    }

    /// Wrap caller-owned bytes as an anonymous, up-to-date folio.
    ///
    /// Used for payloads that never enter the pagecache (unbuffered and
    /// monolithic writes). The size is whatever `bytes` holds.
    #[must_use]
    pub fn with_bytes(pos: FilePos, bytes: Vec<u8>) -> Self {
        Self {
            pos,
            data: Mutex::new(bytes),
            state: Mutex::new(FolioState {
                uptodate: true,
                ..FolioState::default()
            }),
            changed: Condvar::new(),
        }
    }

    #[must_use]
    pub fn pos(&self) -> FilePos {
        self.pos
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.lock().len()
    }

    #[must_use]
    pub fn end(&self) -> FilePos {
        self.pos.saturating_add_len(self.size())
    }

    // ── Lock ────────────────────────────────────────────────────────────────

    pub fn try_lock(&self) -> bool {
        let mut state = self.state.lock();
        if state.locked {
            return false;
        }
        state.locked = true;
        true
    }

    pub fn lock(&self) {
        let mut state = self.state.lock();
        while state.locked {
            self.changed.wait(&mut state);
        }
        state.locked = true;
    }

    pub fn unlock(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.locked, "unlocking an unlocked folio at {}", self.pos);
        state.locked = false;
        drop(state);
        self.changed.notify_all();
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state.lock().locked
    }

    // ── Dirty / writeback ───────────────────────────────────────────────────

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.state.lock().dirty
    }

    pub fn mark_dirty(&self) {
        self.state.lock().dirty = true;
    }

    /// Clear the dirty bit ahead of writing the folio out.
    ///
    /// Returns whether the folio was dirty.
    pub fn clear_dirty_for_io(&self) -> bool {
        std::mem::replace(&mut self.state.lock().dirty, false)
    }

    #[must_use]
    pub fn is_writeback(&self) -> bool {
        self.state.lock().writeback
    }

    pub fn start_writeback(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.writeback, "folio at {} already under writeback", self.pos);
        state.writeback = true;
    }

    pub fn end_writeback(&self) {
        let mut state = self.state.lock();
        state.writeback = false;
        drop(state);
        self.changed.notify_all();
    }

    /// Block until no writeback is in flight on this folio.
    pub fn wait_writeback(&self) {
        let mut state = self.state.lock();
        while state.writeback {
            self.changed.wait(&mut state);
        }
    }

    #[must_use]
    pub fn is_uptodate(&self) -> bool {
        self.state.lock().uptodate
    }

    pub fn set_uptodate(&self, uptodate: bool) {
        self.state.lock().uptodate = uptodate;
    }

    // ── Private attachment ──────────────────────────────────────────────────

    #[must_use]
    pub fn private(&self) -> FolioPrivate {
        self.state.lock().private
    }

    pub fn set_private(&self, private: FolioPrivate) {
        self.state.lock().private = private;
    }

    /// Remove and return the private attachment.
    pub fn detach_private(&self) -> FolioPrivate {
        std::mem::take(&mut self.state.lock().private)
    }

    /// The write-back cohort this folio belongs to.
    #[must_use]
    pub fn group(&self) -> FolioGroup {
        match self.private() {
            FolioPrivate::None => FolioGroup::Dirty(None),
            FolioPrivate::Group(group) => FolioGroup::Dirty(Some(group)),
            FolioPrivate::CopyToCache => FolioGroup::CopyToCache,
            FolioPrivate::Streaming(info) => FolioGroup::Dirty(info.group),
        }
    }

    /// Streaming-write descriptor, if only part of the folio holds data.
    #[must_use]
    pub fn streaming(&self) -> Option<StreamingWrite> {
        match self.private() {
            FolioPrivate::Streaming(info) => Some(info),
            _ => None,
        }
    }

    /// Note that the folio's contents reached every destination.
    ///
    /// Detaches the private attachment, ends writeback, and returns the
    /// group whose reference the caller must now drop.
    pub fn written_back(&self) -> Option<GroupId> {
        let private = self.detach_private();
        self.end_writeback();
        match private {
            FolioPrivate::Group(group) => Some(group),
            FolioPrivate::Streaming(info) => info.group,
            FolioPrivate::None | FolioPrivate::CopyToCache => None,
        }
    }

    // ── Data ────────────────────────────────────────────────────────────────

    /// Zero `[from, to)` within the folio (clamped to the folio size).
    pub fn zero_segment(&self, from: usize, to: usize) {
        let mut data = self.data.lock();
        let to = to.min(data.len());
        if from < to {
            data[from..to].fill(0);
        }
    }

    /// Copy `bytes` into the folio at `offset`, returning how many fit.
    pub fn write_at(&self, offset: usize, bytes: &[u8]) -> usize {
        let mut data = self.data.lock();
        if offset >= data.len() {
            return 0;
        }
        let n = bytes.len().min(data.len() - offset);
        data[offset..offset + n].copy_from_slice(&bytes[..n]);
        n
    }

    /// Append the bytes in `range` (clamped to the folio) to `out`.
    pub fn read_into(&self, range: Range<usize>, out: &mut Vec<u8>) {
        let data = self.data.lock();
        let end = range.end.min(data.len());
        if range.start < end {
            out.extend_from_slice(&data[range.start..end]);
        }
    }

    /// Snapshot of the whole folio contents.
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Whether `pos` falls inside this folio.
    #[must_use]
    pub fn contains(&self, pos: FilePos) -> bool {
        pos >= self.pos && pos.0 < self.pos.0.saturating_add(len_to_u64(self.size()))
    }
}
