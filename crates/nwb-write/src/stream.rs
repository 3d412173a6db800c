//! Output streams of a write request.
//!
//! Each request has two: upload-to-server and write-to-cache. The part the
//! collector needs (queue, availability, progress marks) is [`Stream`],
//! shared through the request. The issuer's build state for the open
//! subrequest is [`StreamBuilder`], owned by the issuer alone.

use crate::backend::WriteBackend;
use crate::subrequest::Subrequest;
use nwb_types::{FilePos, StreamSource, len_to_u64};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub struct Stream {
    source: StreamSource,
    backend: Option<Arc<dyn WriteBackend>>,
    avail: AtomicBool,
    active: AtomicBool,
    subrequests: Mutex<VecDeque<Arc<Subrequest>>>,
    collected_to: AtomicU64,
    transferred: AtomicU64,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("source", &self.source)
            .field("bound", &self.backend.is_some())
            .field("avail", &self.is_avail())
            .field("active", &self.is_active())
            .field("queued", &self.nr_queued())
            .field("collected_to", &self.collected_to())
            .finish()
    }
}

impl Stream {
    /// A stream whose availability starts out as `avail`. An unbound stream
    /// is never available.
    pub(crate) fn new(
        source: StreamSource,
        backend: Option<Arc<dyn WriteBackend>>,
        avail: bool,
        start: FilePos,
    ) -> Self {
        let avail = avail && backend.is_some();
        Self {
            source,
            backend,
            avail: AtomicBool::new(avail),
            active: AtomicBool::new(avail),
            subrequests: Mutex::new(VecDeque::new()),
            collected_to: AtomicU64::new(start.0),
            transferred: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn source(&self) -> StreamSource {
        self.source
    }

    #[must_use]
    pub fn stream_nr(&self) -> usize {
        self.source.stream_nr()
    }

    pub(crate) fn backend(&self) -> Option<&Arc<dyn WriteBackend>> {
        self.backend.as_ref()
    }

    /// Whether this stream may receive new subrequests.
    #[must_use]
    pub fn is_avail(&self) -> bool {
        self.avail.load(Ordering::Acquire)
    }

    pub(crate) fn set_avail(&self, avail: bool) {
        self.avail
            .store(avail && self.backend.is_some(), Ordering::Release);
    }

    /// Whether the collector must look at this stream.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// End of the contiguous collected prefix.
    #[must_use]
    pub fn collected_to(&self) -> FilePos {
        FilePos(self.collected_to.load(Ordering::Acquire))
    }

    /// Bytes confirmed written by collected subrequests.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn nr_queued(&self) -> usize {
        self.subrequests.lock().len()
    }

    // ── Queue ───────────────────────────────────────────────────────────────

    /// Append to the queue. The first subrequest on an inactive stream
    /// seeds `collected_to` and then activates the stream.
    pub(crate) fn push_tail(&self, subreq: Arc<Subrequest>) {
        let mut queue = self.subrequests.lock();
        let start = subreq.start();
        queue.push_back(subreq);
        if queue.len() == 1 && !self.active.load(Ordering::Acquire) {
            self.collected_to.store(start.0, Ordering::Relaxed);
            self.active.store(true, Ordering::Release);
        }
    }

    pub(crate) fn peek_head(&self) -> Option<Arc<Subrequest>> {
        self.subrequests.lock().front().cloned()
    }

    pub(crate) fn pop_head(&self) -> Option<Arc<Subrequest>> {
        self.subrequests.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.subrequests.lock().is_empty()
    }

    /// Note that `subreq` has been collected.
    pub(crate) fn mark_collected(&self, subreq: &Subrequest) {
        self.collected_to
            .fetch_max(subreq.end().0, Ordering::AcqRel);
        self.transferred
            .fetch_add(len_to_u64(subreq.transferred()), Ordering::AcqRel);
    }
}

/// Issuer-private state for building subrequests on one stream.
#[derive(Debug)]
pub(crate) struct StreamBuilder {
    /// Subrequest still accepting data.
    pub construct: Option<Arc<Subrequest>>,
    pub sreq_max_len: usize,
    pub sreq_max_segs: usize,
    /// Offset within the folio being planned where this stream's data starts.
    pub submit_off: usize,
    /// Bytes of the current folio still to route to this stream.
    pub submit_len: usize,
    /// How far past `submit_off` the current folio still reaches.
    pub submit_extendable_to: usize,
}

impl StreamBuilder {
    pub fn new() -> Self {
        Self {
            construct: None,
            sreq_max_len: usize::MAX,
            sreq_max_segs: usize::MAX,
            submit_off: 0,
            submit_len: 0,
            submit_extendable_to: 0,
        }
    }

    pub fn set_submit(&mut self, off: usize, len: usize) {
        self.submit_off = off;
        self.submit_len = len;
    }
}
