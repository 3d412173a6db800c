//! Rolling buffer of folios attached to a write request.
//!
//! The issuer appends folios at the tail and moves a cursor forward as data
//! is routed to subrequests; the collector releases folios from the head
//! once every stream has finished with them. Positions inside the buffer
//! are named by [`BufferCursor`] (segment sequence number plus offset),
//! which stays valid across head releases because sequence numbers are
//! never reused.

use nwb_error::{Result, WbError};
use nwb_page::Folio;
use nwb_types::{DebugId, FilePos, len_to_u64};
use std::collections::VecDeque;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

/// What the collector must do with a folio once it is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMark {
    /// A pagecache folio under writeback: end writeback and drop its group.
    Pagecache,
    /// Caller-supplied memory: just drop the reference.
    Pinned,
}

#[derive(Debug)]
struct Segment {
    folio: Arc<Folio>,
    mark: BufferMark,
    size: usize,
}

/// Position within a [`RollingBuffer`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct BufferCursor {
    seq: u64,
    offset: usize,
}

/// A byte range of one folio.
#[derive(Debug, Clone)]
pub struct FolioSlice {
    pub folio: Arc<Folio>,
    pub range: Range<usize>,
}

impl FolioSlice {
    #[must_use]
    pub fn len(&self) -> usize {
        self.range.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// File position of the first byte of the slice.
    #[must_use]
    pub fn file_pos(&self) -> FilePos {
        self.folio.pos().saturating_add_len(self.range.start)
    }
}

/// Data iterator handed to backends: an ordered run of folio slices.
///
/// Holds its own folio references, so it stays valid after the buffer
/// releases the folios.
#[derive(Debug, Clone, Default)]
pub struct IoIter {
    slices: VecDeque<FolioSlice>,
    count: usize,
}

impl IoIter {
    /// Iterate over whole folios.
    #[must_use]
    pub fn from_folios<I>(folios: I) -> Self
    where
        I: IntoIterator<Item = Arc<Folio>>,
    {
        let mut iter = Self::default();
        for folio in folios {
            let size = folio.size();
            iter.push(FolioSlice {
                folio,
                range: 0..size,
            });
        }
        iter
    }

    fn push(&mut self, slice: FolioSlice) {
        if slice.is_empty() {
            return;
        }
        self.count += slice.len();
        self.slices.push_back(slice);
    }

    /// Bytes remaining.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of folio slices (discontiguous segments) spanned.
    #[must_use]
    pub fn nr_segs(&self) -> usize {
        self.slices.len()
    }

    /// File position of the next byte, if any remain.
    #[must_use]
    pub fn start_pos(&self) -> Option<FilePos> {
        self.slices.front().map(FolioSlice::file_pos)
    }

    pub fn slices(&self) -> impl Iterator<Item = &FolioSlice> {
        self.slices.iter()
    }

    /// Drop `n` bytes from the front.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.slices.front_mut() else {
                break;
            };
            let take = n.min(front.len());
            front.range.start += take;
            self.count -= take;
            n -= take;
            if front.is_empty() {
                self.slices.pop_front();
            }
        }
    }

    /// Keep only the first `n` bytes.
    pub fn truncate(&mut self, n: usize) {
        if n >= self.count {
            return;
        }
        let mut kept = 0_usize;
        let mut keep_slices = 0_usize;
        for slice in &mut self.slices {
            if kept == n {
                break;
            }
            let take = (n - kept).min(slice.len());
            slice.range.end = slice.range.start + take;
            kept += take;
            keep_slices += 1;
        }
        self.slices.truncate(keep_slices);
        self.count = n;
    }

    /// Gather the remaining bytes into one contiguous buffer.
    #[must_use]
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.count);
        for slice in &self.slices {
            slice.folio.read_into(slice.range.clone(), &mut out);
        }
        out
    }
}

/// Folio queue shared between the issuer (tail) and collector (head).
#[derive(Debug)]
pub struct RollingBuffer {
    debug_id: DebugId,
    segments: VecDeque<Segment>,
    first_seq: u64,
    cursor: BufferCursor,
}

impl RollingBuffer {
    #[must_use]
    pub fn new(debug_id: DebugId) -> Self {
        Self {
            debug_id,
            segments: VecDeque::new(),
            first_seq: 0,
            cursor: BufferCursor::default(),
        }
    }

    /// Make sure at least one more folio can be appended without allocating.
    pub fn make_space(&mut self) -> Result<()> {
        self.segments.try_reserve(1).map_err(|_| WbError::NoMemory)
    }

    /// Attach a folio at the tail.
    pub fn append(&mut self, folio: Arc<Folio>, mark: BufferMark) -> Result<()> {
        self.make_space()?;
        let size = folio.size();
        trace!(
            target: "nwb::rolling_buffer",
            wreq = %self.debug_id,
            pos = %folio.pos(),
            size,
            ?mark,
            "buffer_append"
        );
        self.segments.push_back(Segment { folio, mark, size });
        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Current issue cursor.
    #[must_use]
    pub fn snapshot(&self) -> BufferCursor {
        self.cursor
    }

    fn segment(&self, seq: u64) -> Option<&Segment> {
        let idx = usize::try_from(seq.checked_sub(self.first_seq)?).ok()?;
        self.segments.get(idx)
    }

    /// Move the issue cursor forward by `n` bytes.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(size) = self.segment(self.cursor.seq).map(|s| s.size) else {
                self.cursor.offset += n;
                return;
            };
            let avail = size.saturating_sub(self.cursor.offset);
            if n < avail {
                self.cursor.offset += n;
                return;
            }
            n -= avail;
            self.cursor.seq += 1;
            self.cursor.offset = 0;
        }
    }

    /// Pin `len` bytes starting at `from` into a standalone iterator.
    pub fn extract(&self, from: BufferCursor, len: usize) -> Result<IoIter> {
        if from.seq < self.first_seq {
            return Err(WbError::InvalidRequest(format!(
                "buffer position {}:{} already released",
                from.seq, from.offset
            )));
        }
        let mut iter = IoIter::default();
        let mut seq = from.seq;
        let mut offset = from.offset;
        let mut remaining = len;
        while remaining > 0 {
            let Some(seg) = self.segment(seq) else {
                return Err(WbError::InvalidRequest(format!(
                    "buffer underrun: {remaining} of {len} bytes missing"
                )));
            };
            if offset < seg.size {
                let take = remaining.min(seg.size - offset);
                iter.push(FolioSlice {
                    folio: Arc::clone(&seg.folio),
                    range: offset..offset + take,
                });
                remaining -= take;
            }
            offset = 0;
            seq += 1;
        }
        Ok(iter)
    }

    /// Detach every head folio that ends at or before `pos` and lies wholly
    /// behind the issue cursor.
    pub fn release_to(&mut self, pos: FilePos) -> Vec<(Arc<Folio>, BufferMark)> {
        let mut released = Vec::new();
        while self.first_seq < self.cursor.seq {
            let Some(front) = self.segments.front() else {
                break;
            };
            if front.folio.end() > pos {
                break;
            }
            if let Some(seg) = self.segments.pop_front() {
                released.push((seg.folio, seg.mark));
                self.first_seq += 1;
            }
        }
        if !released.is_empty() {
            trace!(
                target: "nwb::rolling_buffer",
                wreq = %self.debug_id,
                to = %pos,
                count = released.len(),
                "buffer_release"
            );
        }
        released
    }

    /// Detach everything, for request teardown.
    pub fn drain(&mut self) -> Vec<(Arc<Folio>, BufferMark)> {
        let drained: Vec<_> = self.segments.drain(..).map(|s| (s.folio, s.mark)).collect();
        self.first_seq += len_to_u64(drained.len());
        self.cursor = BufferCursor {
            seq: self.first_seq,
            offset: 0,
        };
        drained
    }
}
