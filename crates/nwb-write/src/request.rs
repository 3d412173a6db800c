//! Write requests and their creation.
//!
//! A [`WriteRequest`] is shared (`Arc`) between the issuing thread, the
//! backends holding its subrequests, and the collector. The issuing thread
//! owns a [`WriteIssuer`] wrapping the request; only it adds subrequests.

use crate::backend::WriteBackend;
use crate::config::WriteConfig;
use crate::inode::NetfsInode;
use crate::rolling_buffer::RollingBuffer;
use crate::stats::WriteStats;
use crate::stream::{Stream, StreamBuilder};
use nwb_error::{Result, WbError};
use nwb_page::Mapping;
use nwb_types::{
    CACHE_STREAM, DebugId, FilePos, GroupId, IoOrigin, NR_IO_STREAMS, StreamSource, UPLOAD_STREAM,
    len_to_u64,
};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use tracing::{debug, warn};

/// Callback run once with the final result of an asynchronous write.
pub type CompletionFn = Box<dyn FnOnce(Result<u64>) + Send>;

/// Caller-side I/O control block for write-through and unbuffered writes.
pub struct Kiocb {
    pub pos: FilePos,
    /// Present for asynchronous callers; `None` means wait for completion.
    pub complete: Option<CompletionFn>,
}

impl fmt::Debug for Kiocb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kiocb")
            .field("pos", &self.pos)
            .field("is_async", &self.complete.is_some())
            .finish()
    }
}

impl Kiocb {
    #[must_use]
    pub fn sync(pos: FilePos) -> Self {
        Self {
            pos,
            complete: None,
        }
    }

    #[must_use]
    pub fn with_completion(pos: FilePos, complete: CompletionFn) -> Self {
        Self {
            pos,
            complete: Some(complete),
        }
    }
}

/// Result of a write-through or unbuffered write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// Synchronous completion: bytes written.
    Written(u64),
    /// Asynchronous: the completion callback will report the result.
    Queued,
}

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// The issuer may still add subrequests.
    Building,
    /// Every subrequest has been queued.
    AllQueued,
    /// The collector has observed the all-queued state and is winding down.
    Collecting,
    /// Final result recorded; completion delivered.
    Done,
}

impl RequestState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Building,
            1 => Self::AllQueued,
            2 => Self::Collecting,
            _ => Self::Done,
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct WaitState {
    pub in_flight: usize,
    pub kicks: u64,
}

/// One write operation: a set of folios routed to up to two streams.
pub struct WriteRequest {
    debug_id: DebugId,
    origin: IoOrigin,
    start: FilePos,
    group: Option<GroupId>,
    wsize: usize,
    config: WriteConfig,

    len: AtomicU64,
    i_size: AtomicU64,
    issued_to: AtomicU64,
    cleaned_to: AtomicU64,

    state: AtomicU8,
    upload_to_server: AtomicBool,
    pause: AtomicBool,
    failed: AtomicBool,
    offload_collection: AtomicBool,

    pub(crate) streams: [Stream; NR_IO_STREAMS],
    pub(crate) buffer: Mutex<RollingBuffer>,
    pub(crate) mapping: Arc<Mapping>,
    pub(crate) stats: Arc<WriteStats>,

    next_subreq_index: AtomicU32,
    pub(crate) error: Mutex<Option<WbError>>,
    pub(crate) result: Mutex<Option<Result<u64>>>,
    pub(crate) completion: Mutex<Option<CompletionFn>>,

    pub(crate) collect_lock: Mutex<()>,
    pub(crate) needs_collect: AtomicBool,
    pub(crate) wait: Mutex<WaitState>,
    pub(crate) waitq: Condvar,
}

impl fmt::Debug for WriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteRequest")
            .field("debug_id", &self.debug_id)
            .field("origin", &self.origin)
            .field("start", &self.start)
            .field("len", &self.len())
            .field("state", &self.state())
            .field("issued_to", &self.issued_to())
            .field("cleaned_to", &self.cleaned_to())
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

impl WriteRequest {
    fn new(
        inode: &NetfsInode,
        debug_id: DebugId,
        start: FilePos,
        origin: IoOrigin,
        cache: Option<Arc<dyn WriteBackend>>,
    ) -> Result<Self> {
        let mut buffer = RollingBuffer::new(debug_id);
        buffer.make_space()?;
        let mapping = Arc::clone(inode.mapping());
        let cache_bound = cache.is_some();
        Ok(Self {
            debug_id,
            origin,
            start,
            group: inode.writeback_group(),
            wsize: inode.config().wsize,
            config: *inode.config(),
            len: AtomicU64::new(0),
            i_size: AtomicU64::new(mapping.i_size()),
            issued_to: AtomicU64::new(start.0),
            cleaned_to: AtomicU64::new(start.0),
            state: AtomicU8::new(RequestState::Building as u8),
            upload_to_server: AtomicBool::new(false),
            pause: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            offload_collection: AtomicBool::new(false),
            streams: [
                Stream::new(
                    StreamSource::UploadToServer,
                    Some(Arc::clone(inode.upload())),
                    false,
                    start,
                ),
                Stream::new(StreamSource::WriteToCache, cache, cache_bound, start),
            ],
            buffer: Mutex::new(buffer),
            mapping,
            stats: Arc::clone(inode.stats()),
            next_subreq_index: AtomicU32::new(0),
            error: Mutex::new(None),
            result: Mutex::new(None),
            completion: Mutex::new(None),
            collect_lock: Mutex::new(()),
            needs_collect: AtomicBool::new(false),
            wait: Mutex::new(WaitState::default()),
            waitq: Condvar::new(),
        })
    }

    // ── Identity ────────────────────────────────────────────────────────────

    #[must_use]
    pub fn debug_id(&self) -> DebugId {
        self.debug_id
    }

    #[must_use]
    pub fn origin(&self) -> IoOrigin {
        self.origin
    }

    #[must_use]
    pub fn start(&self) -> FilePos {
        self.start
    }

    /// Dirty-tracking group this request writes; pages of other groups are
    /// skipped.
    #[must_use]
    pub fn group(&self) -> Option<GroupId> {
        self.group
    }

    #[must_use]
    pub fn wsize(&self) -> usize {
        self.wsize
    }

    #[must_use]
    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    #[must_use]
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    // ── Extent ──────────────────────────────────────────────────────────────

    #[must_use]
    pub fn len(&self) -> u64 {
        self.len.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn add_len(&self, n: usize) {
        self.len.fetch_add(len_to_u64(n), Ordering::AcqRel);
    }

    /// Grow the request so it reaches at least `end`.
    pub(crate) fn extend_len_to(&self, end: FilePos) {
        let span = end.0.saturating_sub(self.start.0);
        self.len.fetch_max(span, Ordering::AcqRel);
    }

    pub(crate) fn set_len(&self, n: u64) {
        self.len.store(n, Ordering::Release);
    }

    /// File size snapshot the planner clips writes against.
    #[must_use]
    pub fn i_size(&self) -> u64 {
        self.i_size.load(Ordering::Acquire)
    }

    pub(crate) fn set_i_size(&self, size: u64) {
        self.i_size.store(size, Ordering::Release);
    }

    /// Everything below this position has been routed to subrequests.
    #[must_use]
    pub fn issued_to(&self) -> FilePos {
        FilePos(self.issued_to.load(Ordering::Acquire))
    }

    pub(crate) fn raise_issued_to(&self, pos: FilePos) {
        self.issued_to.fetch_max(pos.0, Ordering::Release);
    }

    /// Everything below this position has been released from the buffer.
    #[must_use]
    pub fn cleaned_to(&self) -> FilePos {
        FilePos(self.cleaned_to.load(Ordering::Acquire))
    }

    pub(crate) fn raise_cleaned_to(&self, pos: FilePos) {
        self.cleaned_to.fetch_max(pos.0, Ordering::AcqRel);
    }

    // ── Streams ─────────────────────────────────────────────────────────────

    #[must_use]
    pub fn stream(&self, stream_nr: usize) -> &Stream {
        &self.streams[stream_nr]
    }

    #[must_use]
    pub fn upload_stream(&self) -> &Stream {
        &self.streams[UPLOAD_STREAM]
    }

    #[must_use]
    pub fn cache_stream(&self) -> &Stream {
        &self.streams[CACHE_STREAM]
    }

    /// Allow or forbid further uploads on this request.
    pub fn set_upload_avail(&self, avail: bool) {
        self.streams[UPLOAD_STREAM].set_avail(avail);
    }

    pub(crate) fn upload_backend(&self) -> Option<&Arc<dyn WriteBackend>> {
        self.streams[UPLOAD_STREAM].backend()
    }

    pub(crate) fn next_subreq_index(&self) -> u32 {
        self.next_subreq_index.fetch_add(1, Ordering::Relaxed)
    }

    // ── Flags ───────────────────────────────────────────────────────────────

    #[must_use]
    pub fn state(&self) -> RequestState {
        RequestState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Publish that the issuer will add no more subrequests.
    pub(crate) fn set_all_queued(&self) {
        let _ = self.state.compare_exchange(
            RequestState::Building as u8,
            RequestState::AllQueued as u8,
            Ordering::Release,
            Ordering::Relaxed,
        );
    }

    pub(crate) fn enter_collecting(&self) {
        let _ = self.state.compare_exchange(
            RequestState::AllQueued as u8,
            RequestState::Collecting as u8,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    /// Move to `Done`, returning false if something else got there first.
    pub(crate) fn set_done(&self) -> bool {
        self.state.swap(RequestState::Done as u8, Ordering::AcqRel) != RequestState::Done as u8
    }

    #[must_use]
    pub fn is_all_queued(&self) -> bool {
        self.state() >= RequestState::AllQueued
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state() == RequestState::Done
    }

    /// Set the "upload pass begun" marker, returning its previous value.
    pub(crate) fn test_and_set_upload_to_server(&self) -> bool {
        self.upload_to_server.swap(true, Ordering::AcqRel)
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause.load(Ordering::Acquire)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.pause.store(paused, Ordering::Release);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Collection runs in whatever context terminates a subrequest, rather
    /// than in a waiting caller.
    #[must_use]
    pub fn offload_collection(&self) -> bool {
        self.offload_collection.load(Ordering::Acquire)
    }

    pub(crate) fn set_offload_collection(&self) {
        self.offload_collection.store(true, Ordering::Release);
    }

    // ── Errors and completion ───────────────────────────────────────────────

    /// Record a request-level failure. The first error is the one reported.
    pub(crate) fn record_error(&self, err: WbError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            warn!(
                target: "nwb::collect",
                wreq = %self.debug_id,
                error = %err,
                "write_request_failed"
            );
            *slot = Some(err);
        }
        drop(slot);
        self.failed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn error(&self) -> Option<WbError> {
        self.error.lock().clone()
    }

    pub(crate) fn set_completion(&self, complete: CompletionFn) {
        *self.completion.lock() = Some(complete);
        self.set_offload_collection();
    }

    /// Final result, once the request is done.
    #[must_use]
    pub fn result(&self) -> Option<Result<u64>> {
        self.result.lock().clone()
    }
}

/// Issuing-side handle on a request under construction.
///
/// Owned by exactly one thread at a time. Holds the per-stream build state
/// and the group references the planner has taken over from folios it
/// finished without attaching them to the buffer.
///
/// Dropping it before [`end_issue_write`](Self::end_issue_write) cancels
/// the request: whatever was already queued still completes, but the result
/// is `Cancelled` unless an earlier error was recorded.
#[derive(Debug)]
pub struct WriteIssuer {
    pub(crate) wreq: Arc<WriteRequest>,
    pub(crate) builders: [StreamBuilder; NR_IO_STREAMS],
    pub(crate) released_groups: Vec<GroupId>,
}

impl WriteIssuer {
    #[must_use]
    pub fn wreq(&self) -> &Arc<WriteRequest> {
        &self.wreq
    }

    /// Whether `stream_nr` has a subrequest still accepting data.
    #[must_use]
    pub fn has_construct(&self, stream_nr: usize) -> bool {
        self.builders[stream_nr].construct.is_some()
    }

    /// Drop group references collected from folios the planner finished
    /// without attaching them to the buffer.
    pub(crate) fn put_released_groups(&mut self) {
        for group in self.released_groups.drain(..) {
            self.wreq.mapping.put_group(group, 1);
        }
    }
}

impl Drop for WriteIssuer {
    fn drop(&mut self) {
        if !self.wreq.is_all_queued() {
            self.wreq.record_error(WbError::Cancelled);
            self.end_issue_write();
        }
        self.put_released_groups();
    }
}

/// Allocate a write request for `inode` starting at `start`.
///
/// Binds the local cache for cacheable origins. When the cache cannot be
/// bound the request goes ahead without it, unless the inode requires
/// caching.
pub fn create_write_req(inode: &NetfsInode, start: FilePos, origin: IoOrigin) -> Result<WriteIssuer> {
    let debug_id = inode.next_debug_id();
    let cache = if origin.is_cacheable() {
        bind_cache(inode, debug_id, start)?
    } else {
        None
    };

    let wreq = Arc::new(WriteRequest::new(inode, debug_id, start, origin, cache)?);
    debug!(
        target: "nwb::write_issue",
        wreq = %debug_id,
        ?origin,
        start = %start,
        i_size = wreq.i_size(),
        cache = wreq.cache_stream().is_avail(),
        "write_request_created"
    );
    Ok(WriteIssuer {
        wreq,
        builders: [StreamBuilder::new(), StreamBuilder::new()],
        released_groups: Vec::new(),
    })
}

fn bind_cache(
    inode: &NetfsInode,
    debug_id: DebugId,
    start: FilePos,
) -> Result<Option<Arc<dyn WriteBackend>>> {
    let required = inode.config().cache_required;
    let Some(provider) = inode.cache().filter(|p| p.is_enabled()) else {
        if required {
            return Err(WbError::CacheUnavailable("no cache enabled".to_owned()));
        }
        return Ok(None);
    };
    match provider.begin_write_operation(debug_id, start) {
        Ok(backend) => Ok(Some(backend)),
        Err(err) if required => Err(WbError::CacheUnavailable(err.to_string())),
        Err(err) => {
            warn!(
                target: "nwb::write_issue",
                wreq = %debug_id,
                error = %err,
                "cache_bind_failed"
            );
            Ok(None)
        }
    }
}
