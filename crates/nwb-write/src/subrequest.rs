//! A contiguous slice of a write request bound for one stream.
//!
//! While a subrequest is the issuer's open construct it keeps growing; the
//! mutable part therefore lives behind a mutex. The three lifecycle bits are
//! atomics so the collector can scan stream queues without taking that lock:
//! `in_progress` is cleared with release ordering only after the outcome has
//! been recorded.
//!
//! An in-flight subrequest also holds a strong reference on its request, so
//! an asynchronous request survives its submitter dropping every handle.
//! The reference is taken when the subrequest is opened or reissued and
//! released once the termination has woken the collector.

use crate::request::WriteRequest;
use crate::rolling_buffer::{BufferCursor, IoIter};
use nwb_error::{Result, WbError};
use nwb_types::{FilePos, StreamSource, len_to_u64};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{trace, warn};

#[derive(Debug)]
struct SubreqInner {
    len: usize,
    nr_segs: usize,
    /// Buffer position the data starts at, until the iterator is pinned.
    cursor: BufferCursor,
    /// Everything this subrequest covers, pinned at first dispatch.
    pinned: IoIter,
    /// What the current dispatch should write.
    io_iter: IoIter,
    transferred: usize,
    retry_count: u32,
    error: Option<WbError>,
}

/// One unit of I/O dispatched to a backend.
#[derive(Debug)]
pub struct Subrequest {
    rreq: Weak<WriteRequest>,
    /// Strong reference held while in flight.
    pin: Mutex<Option<Arc<WriteRequest>>>,
    debug_index: u32,
    source: StreamSource,
    start: FilePos,
    inner: Mutex<SubreqInner>,
    in_progress: AtomicBool,
    failed: AtomicBool,
    made_progress: AtomicBool,
}

impl Subrequest {
    pub(crate) fn new(
        rreq: Weak<WriteRequest>,
        debug_index: u32,
        source: StreamSource,
        start: FilePos,
        cursor: BufferCursor,
    ) -> Self {
        Self {
            rreq,
            pin: Mutex::new(None),
            debug_index,
            source,
            start,
            inner: Mutex::new(SubreqInner {
                len: 0,
                nr_segs: 0,
                cursor,
                pinned: IoIter::default(),
                io_iter: IoIter::default(),
                transferred: 0,
                retry_count: 0,
                error: None,
            }),
            in_progress: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            made_progress: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn debug_index(&self) -> u32 {
        self.debug_index
    }

    #[must_use]
    pub fn source(&self) -> StreamSource {
        self.source
    }

    #[must_use]
    pub fn stream_nr(&self) -> usize {
        self.source.stream_nr()
    }

    /// File position of the first byte covered.
    #[must_use]
    pub fn start(&self) -> FilePos {
        self.start
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the last byte covered.
    #[must_use]
    pub fn end(&self) -> FilePos {
        self.start.saturating_add_len(self.len())
    }

    #[must_use]
    pub fn nr_segs(&self) -> usize {
        self.inner.lock().nr_segs
    }

    /// Bytes confirmed written so far.
    #[must_use]
    pub fn transferred(&self) -> usize {
        self.inner.lock().transferred
    }

    /// Where the backend should write the data currently in [`io_iter`].
    ///
    /// Moves forward past already-transferred bytes when the subrequest is
    /// retried.
    ///
    /// [`io_iter`]: Self::io_iter
    #[must_use]
    pub fn write_pos(&self) -> FilePos {
        self.start.saturating_add_len(self.transferred())
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.lock().retry_count
    }

    /// Data to write on this dispatch.
    #[must_use]
    pub fn io_iter(&self) -> IoIter {
        self.inner.lock().io_iter.clone()
    }

    /// Contiguous copy of the data to write on this dispatch.
    #[must_use]
    pub fn copy_data(&self) -> Vec<u8> {
        self.inner.lock().io_iter.copy_to_vec()
    }

    #[must_use]
    pub fn error(&self) -> Option<WbError> {
        self.inner.lock().error.clone()
    }

    #[must_use]
    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn made_progress(&self) -> bool {
        self.made_progress.load(Ordering::Acquire)
    }

    /// The request this belongs to, if it is still alive.
    #[must_use]
    pub fn request(&self) -> Option<Arc<WriteRequest>> {
        self.rreq.upgrade()
    }

    // ── Issuer side ─────────────────────────────────────────────────────────

    pub(crate) fn mark_in_progress(&self) {
        *self.pin.lock() = self.rreq.upgrade();
        self.in_progress.store(true, Ordering::Release);
    }

    /// Extend the covered range by `part` bytes over `segs` new segments.
    pub(crate) fn grow(&self, part: usize, segs: usize) -> (usize, usize) {
        let mut inner = self.inner.lock();
        inner.len += part;
        inner.nr_segs += segs;
        (inner.len, inner.nr_segs)
    }

    pub(crate) fn cursor(&self) -> BufferCursor {
        self.inner.lock().cursor
    }

    pub(crate) fn set_io_iter(&self, iter: IoIter) {
        let mut inner = self.inner.lock();
        inner.pinned = iter.clone();
        inner.io_iter = iter;
    }

    /// Pinned data not yet confirmed written.
    pub(crate) fn retry_source(&self) -> IoIter {
        let inner = self.inner.lock();
        let mut source = inner.pinned.clone();
        source.advance(inner.transferred);
        source
    }

    /// Record a failure that happened before dispatch.
    pub(crate) fn mark_failed(&self, err: WbError) {
        let mut inner = self.inner.lock();
        if inner.error.is_none() {
            inner.error = Some(err);
        }
        drop(inner);
        self.failed.store(true, Ordering::Release);
    }

    /// Reset for another dispatch of the unfinished tail.
    pub(crate) fn prepare_retry(&self, iter: IoIter) {
        let mut inner = self.inner.lock();
        inner.io_iter = iter;
        inner.retry_count += 1;
        inner.error = None;
        drop(inner);
        *self.pin.lock() = self.rreq.upgrade();
        self.failed.store(false, Ordering::Release);
        self.made_progress.store(false, Ordering::Release);
        self.in_progress.store(true, Ordering::Release);
    }

    // ── Backend side ────────────────────────────────────────────────────────

    /// Report the outcome of the current dispatch.
    ///
    /// Must be called exactly once per dispatch. `Ok(n)` reports `n` bytes
    /// written; fewer than were outstanding is recorded as a short write,
    /// which the collector may retry.
    pub fn terminated(self: &Arc<Self>, result: Result<usize>) {
        if !self.is_in_progress() {
            warn!(
                target: "nwb::collect",
                index = self.debug_index,
                start = %self.start,
                "subreq_terminated_twice"
            );
            return;
        }

        let mut inner = self.inner.lock();
        match result {
            Ok(n) => {
                let outstanding = inner.len - inner.transferred;
                let n = n.min(outstanding);
                inner.transferred += n;
                if n > 0 {
                    self.made_progress.store(true, Ordering::Release);
                }
                if n < outstanding {
                    let at = self.start.0 + len_to_u64(inner.transferred);
                    inner.error = Some(WbError::WriteFailed {
                        pos: at,
                        detail: format!("short write: {n} of {outstanding} bytes"),
                    });
                    self.failed.store(true, Ordering::Release);
                }
            }
            Err(err) => {
                if inner.error.is_none() {
                    inner.error = Some(err);
                }
                self.failed.store(true, Ordering::Release);
            }
        }
        trace!(
            target: "nwb::collect",
            index = self.debug_index,
            source = ?self.source,
            start = %self.start,
            len = inner.len,
            transferred = inner.transferred,
            failed = self.is_failed(),
            "subreq_terminated"
        );
        drop(inner);

        let held = self.pin.lock().take();
        self.in_progress.store(false, Ordering::Release);
        if let Some(wreq) = held.or_else(|| self.request()) {
            wreq.wake_collector();
        }
    }
}
