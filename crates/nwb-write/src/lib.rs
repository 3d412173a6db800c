#![forbid(unsafe_code)]
//! Write-issue engine for network filesystems.
//!
//! Dirty pagecache folios (or caller buffers, for unbuffered and direct I/O)
//! are carved into subrequests and routed to two parallel streams: an upload
//! stream bound for the server and an optional cache stream bound for local
//! persistent storage. Each stream caps its subrequests by length and
//! segment count; completions are collected in file order, failed
//! subrequests are retried from the pinned data, and folios are released
//! once every stream has moved past them.
//!
//! The entry points are [`writepages`], the write-through trio
//! ([`begin_writethrough`], [`Writethrough::advance_writethrough`],
//! [`Writethrough::end_writethrough`]), [`write_unbuffered`],
//! [`writeback_single`] and [`copy_to_cache`]. Backends plug in through [`WriteBackend`] and
//! [`CacheProvider`].

mod backend;
mod collect;
mod config;
mod inode;
mod issue;
mod planner;
mod request;
mod rolling_buffer;
mod stats;
mod stream;
mod subrequest;
mod writeback;

pub use backend::{CacheProvider, StreamLimits, WriteBackend};
pub use config::WriteConfig;
pub use inode::NetfsInode;
pub use request::{
    CompletionFn, Kiocb, RequestState, WriteIssuer, WriteOutcome, WriteRequest, create_write_req,
};
pub use rolling_buffer::{BufferCursor, BufferMark, FolioSlice, IoIter, RollingBuffer};
pub use stats::{WriteStats, WriteStatsSnapshot};
pub use stream::Stream;
pub use subrequest::Subrequest;
pub use writeback::{
    Writethrough, begin_writethrough, copy_to_cache, kill_dirty_pages, perform_writethrough,
    write_unbuffered, writeback_single, writepages,
};

#[cfg(test)]
pub(crate) mod test_support {
    use crate::{CacheProvider, NetfsInode, StreamLimits, Subrequest, WriteBackend, WriteConfig};
    use crate::request::WriteRequest;
    use nwb_error::{Result, WbError};
    use nwb_page::Mapping;
    use nwb_types::{DebugId, FilePos, FolioSize};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// One dispatch as the backend saw it.
    #[derive(Debug, Clone)]
    pub struct RecordedWrite {
        pub index: u32,
        pub start: u64,
        pub data: Vec<u8>,
        pub retry: u32,
    }

    #[derive(Debug)]
    enum Fault {
        Error(WbError),
        Short(usize),
    }

    /// Backend that records every dispatch and completes it inline, or
    /// holds it until [`Recorder::complete_all`].
    #[derive(Debug)]
    pub struct Recorder {
        deferred: bool,
        writes: Mutex<Vec<RecordedWrite>>,
        pending: Mutex<Vec<Arc<Subrequest>>>,
        faults: Mutex<VecDeque<Fault>>,
        prepare_error: Mutex<Option<WbError>>,
        prepared: Mutex<Vec<StreamLimits>>,
        begin_calls: AtomicUsize,
    }

    impl Recorder {
        fn build(deferred: bool) -> Arc<Self> {
            Arc::new(Self {
                deferred,
                writes: Mutex::new(Vec::new()),
                pending: Mutex::new(Vec::new()),
                faults: Mutex::new(VecDeque::new()),
                prepare_error: Mutex::new(None),
                prepared: Mutex::new(Vec::new()),
                begin_calls: AtomicUsize::new(0),
            })
        }

        pub fn completing() -> Arc<Self> {
            Self::build(false)
        }

        pub fn deferred() -> Arc<Self> {
            Self::build(true)
        }

        pub fn writes(&self) -> Vec<RecordedWrite> {
            self.writes.lock().clone()
        }

        pub fn begin_calls(&self) -> usize {
            self.begin_calls.load(Ordering::SeqCst)
        }

        /// Limits offered to `prepare_write`, in call order.
        pub fn prepared(&self) -> Vec<StreamLimits> {
            self.prepared.lock().clone()
        }

        pub fn fail_prepare(&self, err: WbError) {
            *self.prepare_error.lock() = Some(err);
        }

        /// Fail the next `n` dispatches with `err`.
        pub fn fail_next(&self, n: usize, err: WbError) {
            let mut faults = self.faults.lock();
            for _ in 0..n {
                faults.push_back(Fault::Error(err.clone()));
            }
        }

        /// Make the next dispatch write only `n` bytes.
        pub fn short_next(&self, n: usize) {
            self.faults.lock().push_back(Fault::Short(n));
        }

        pub fn complete_all(&self) {
            let pending = std::mem::take(&mut *self.pending.lock());
            for subreq in pending {
                self.finish(&subreq);
            }
        }

        fn finish(&self, subreq: &Arc<Subrequest>) {
            let fault = self.faults.lock().pop_front();
            match fault {
                Some(Fault::Error(err)) => subreq.terminated(Err(err)),
                Some(Fault::Short(n)) => subreq.terminated(Ok(n)),
                None => subreq.terminated(Ok(subreq.io_iter().count())),
            }
        }
    }

    impl WriteBackend for Recorder {
        fn prepare_write(&self, _subreq: &Subrequest, limits: &mut StreamLimits) -> Result<()> {
            self.prepared.lock().push(*limits);
            match self.prepare_error.lock().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn issue_write(&self, subreq: Arc<Subrequest>) {
            self.writes.lock().push(RecordedWrite {
                index: subreq.debug_index(),
                start: subreq.write_pos().0,
                data: subreq.copy_data(),
                retry: subreq.retry_count(),
            });
            if self.deferred {
                self.pending.lock().push(subreq);
            } else {
                self.finish(&subreq);
            }
        }

        fn begin_writeback(&self, wreq: &WriteRequest) {
            self.begin_calls.fetch_add(1, Ordering::SeqCst);
            wreq.set_upload_avail(true);
        }
    }

    /// Cache provider handing out a [`Recorder`], or refusing to bind.
    #[derive(Debug)]
    pub struct RecorderCache {
        backend: Arc<Recorder>,
        fail: bool,
    }

    impl RecorderCache {
        pub fn new() -> Self {
            Self {
                backend: Recorder::completing(),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                backend: Recorder::completing(),
                fail: true,
            }
        }

        pub fn backend(&self) -> &Arc<Recorder> {
            &self.backend
        }
    }

    impl CacheProvider for RecorderCache {
        fn begin_write_operation(
            &self,
            _debug_id: DebugId,
            _start: FilePos,
        ) -> Result<Arc<dyn WriteBackend>> {
            if self.fail {
                return Err(WbError::Io(std::io::Error::other("cache offline")));
            }
            Ok(Arc::clone(&self.backend) as Arc<dyn WriteBackend>)
        }
    }

    pub fn inode_with(config: WriteConfig, upload: Arc<dyn WriteBackend>) -> NetfsInode {
        NetfsInode::new(Arc::new(Mapping::new(FolioSize::BASE)), upload, config).expect("inode")
    }
}
