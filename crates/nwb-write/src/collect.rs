//! Result collection for write requests.
//!
//! The collector walks each active stream's queue from the head, retiring
//! subrequests that have terminated, retrying transient failures, and
//! releasing buffer folios that every stream has finished with. Once the
//! issuer has queued everything and all queues drain, it records the final
//! result, ends the request and wakes waiters.
//!
//! There is no collector thread. Collection runs either in whichever
//! context terminates a subrequest (requests with `offload_collection`) or
//! in the thread waiting for the request. Concurrent attempts are folded
//! together by a try-lock and a "needs another pass" flag.

use crate::request::WriteRequest;
use crate::rolling_buffer::BufferMark;
use crate::subrequest::Subrequest;
use nwb_error::{Result, WbError};
use nwb_types::{FilePos, StreamSource};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, info, trace, warn};

impl WriteRequest {
    /// Note that something changed and collection may be able to progress.
    pub fn wake_collector(&self) {
        if self.offload_collection() {
            self.collect();
        } else {
            self.kick_waiters();
        }
    }

    fn kick_waiters(&self) {
        let mut wait = self.wait.lock();
        wait.kicks += 1;
        drop(wait);
        self.waitq.notify_all();
    }

    /// Run collection until nothing more can be done right now.
    pub fn collect(&self) {
        self.needs_collect.store(true, Ordering::SeqCst);
        while self.needs_collect.load(Ordering::SeqCst) {
            let Some(guard) = self.collect_lock.try_lock() else {
                return;
            };
            while self.needs_collect.swap(false, Ordering::SeqCst) {
                while self.collect_once() {}
            }
            drop(guard);
        }
    }

    /// One pass over both streams. Returns whether anything changed.
    fn collect_once(&self) -> bool {
        if self.is_done() {
            return false;
        }
        // Read before scanning the queues: a stale "not yet" only delays
        // completion to the next pass.
        let all_queued = self.is_all_queued();
        if all_queued {
            self.enter_collecting();
        }

        let mut progressed = false;
        for stream in &self.streams {
            if !stream.is_active() {
                continue;
            }
            while let Some(subreq) = stream.peek_head() {
                if subreq.is_in_progress() {
                    break;
                }
                if subreq.is_failed() && self.retry_failed(&subreq) {
                    progressed = true;
                    break;
                }
                if subreq.is_failed() {
                    self.retire_failed(&subreq);
                }
                stream.pop_head();
                stream.mark_collected(&subreq);
                self.note_collected();
                trace!(
                    target: "nwb::collect",
                    wreq = %self.debug_id(),
                    stream = subreq.stream_nr(),
                    index = subreq.debug_index(),
                    collected_to = %stream.collected_to(),
                    "subreq_collected"
                );
                progressed = true;
            }
        }

        // Folios below the first unfinished subrequest of every stream, and
        // below anything the issuer may still route, are finished with.
        let mut clean_to = if all_queued { u64::MAX } else { self.issued_to().0 };
        let mut idle = true;
        for stream in self.streams.iter().filter(|s| s.is_active()) {
            if let Some(front) = stream.peek_head() {
                idle = false;
                clean_to = clean_to.min(front.start().0);
            }
        }
        progressed |= self.release_buffer(FilePos(clean_to));

        if all_queued && idle {
            self.finish();
            return false;
        }
        progressed
    }

    /// Re-dispatch `subreq` if its failure looks transient and it has retry
    /// budget left.
    fn retry_failed(&self, subreq: &Arc<Subrequest>) -> bool {
        let Some(err) = subreq.error() else {
            return false;
        };
        if !err.is_transient()
            || subreq.retry_count() >= self.config().max_retries
            || self.is_failed()
        {
            return false;
        }
        let mut source = subreq.retry_source();
        self.reissue_write(subreq, &mut source);
        true
    }

    fn retire_failed(&self, subreq: &Subrequest) {
        let err = subreq
            .error()
            .unwrap_or_else(|| WbError::InvalidRequest("subrequest failed".to_owned()));
        match subreq.source() {
            StreamSource::UploadToServer => self.record_error(err),
            StreamSource::WriteToCache => {
                // The server copy is authoritative; a cache failure only
                // stops further caching on this request.
                warn!(
                    target: "nwb::collect",
                    wreq = %self.debug_id(),
                    start = %subreq.start(),
                    error = %err,
                    "cache_write_failed"
                );
                self.cache_stream().set_avail(false);
            }
        }
    }

    fn note_collected(&self) {
        let max = self.config().max_in_flight;
        let mut wait = self.wait.lock();
        wait.in_flight = wait.in_flight.saturating_sub(1);
        if self.is_paused() && (max == 0 || wait.in_flight < max) {
            self.set_paused(false);
            wait.kicks += 1;
            debug!(
                target: "nwb::collect",
                wreq = %self.debug_id(),
                in_flight = wait.in_flight,
                "write_resumed"
            );
            drop(wait);
            self.waitq.notify_all();
        }
    }

    /// Release finished folios, ending writeback on pagecache ones.
    fn release_buffer(&self, clean_to: FilePos) -> bool {
        let released = self.buffer.lock().release_to(clean_to);
        if released.is_empty() {
            return false;
        }
        for (folio, mark) in released {
            self.retire_folio(&folio, mark);
        }
        true
    }

    fn retire_folio(&self, folio: &nwb_page::Folio, mark: BufferMark) {
        if mark == BufferMark::Pagecache {
            if let Some(group) = folio.written_back() {
                self.mapping.put_group(group, 1);
            }
        }
        self.raise_cleaned_to(folio.end());
    }

    /// Bytes confirmed written: by the server when anything was uploaded,
    /// otherwise by the cache.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        let upload = self.upload_stream();
        if upload.is_active() {
            upload.transferred()
        } else {
            self.cache_stream().transferred()
        }
    }

    fn finish(&self) {
        for (folio, mark) in self.buffer.lock().drain() {
            self.retire_folio(&folio, mark);
        }

        let result = match self.error() {
            Some(err) => {
                if self.origin().is_cacheable() {
                    self.mapping.set_error(&err);
                }
                Err(err)
            }
            None => Ok(self.transferred()),
        };
        info!(
            target: "nwb::collect",
            wreq = %self.debug_id(),
            origin = ?self.origin(),
            len = self.len(),
            transferred = self.transferred(),
            ok = result.is_ok(),
            "write_request_done"
        );
        *self.result.lock() = Some(result.clone());
        self.set_done();

        let complete = self.completion.lock().take();
        if let Some(complete) = complete {
            complete(result);
        }
        self.kick_waiters();
    }

    // ── Waiting ─────────────────────────────────────────────────────────────

    /// Block until `done` holds, collecting in this thread when nobody else
    /// will.
    fn wait_until(&self, done: impl Fn(&Self) -> bool) {
        loop {
            let seen = self.wait.lock().kicks;
            if !self.offload_collection() {
                self.collect();
            }
            if done(self) {
                return;
            }
            let mut wait = self.wait.lock();
            while wait.kicks == seen && !done(self) {
                self.waitq.wait(&mut wait);
            }
        }
    }

    /// Wait for the request to finish and return its result.
    pub fn wait_for_write(&self) -> Result<u64> {
        self.wait_until(WriteRequest::is_done);
        self.result().unwrap_or_else(|| {
            Err(WbError::InvalidRequest(
                "request finished without result".to_owned(),
            ))
        })
    }

    /// Wait until the issuer may submit again: backpressure cleared, or the
    /// request failed or finished.
    pub fn wait_for_paused_write(&self) {
        trace!(target: "nwb::collect", wreq = %self.debug_id(), "wait_for_paused_write");
        self.wait_until(|wreq| !wreq.is_paused() || wreq.is_failed() || wreq.is_done());
    }
}

#[cfg(test)]
mod tests {
    use crate::request::create_write_req;
    use crate::rolling_buffer::BufferMark;
    use crate::test_support::{Recorder, inode_with};
    use crate::WriteConfig;
    use nwb_error::WbError;
    use nwb_page::Folio;
    use nwb_types::{FilePos, IoOrigin, UPLOAD_STREAM};
    use std::sync::Arc;

    fn setup(config: WriteConfig, rec: &Arc<Recorder>, len: usize) -> crate::WriteIssuer {
        let inode = inode_with(config, Arc::clone(rec) as _);
        let issuer =
            create_write_req(&inode, FilePos(0), IoOrigin::UnbufferedWrite).expect("create");
        issuer.wreq().set_upload_avail(true);
        let folio = Arc::new(Folio::with_bytes(FilePos(0), vec![7; len]));
        issuer
            .wreq()
            .buffer
            .lock()
            .append(folio, BufferMark::Pinned)
            .expect("append");
        issuer
    }

    #[test]
    fn transient_failure_is_retried_with_same_identity() {
        let rec = Recorder::completing();
        rec.fail_next(1, WbError::WriteFailed {
            pos: 0,
            detail: "flaky".to_owned(),
        });
        let mut issuer = setup(WriteConfig::default(), &rec, 100);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 100, false)
            .expect("advance");
        issuer.end_issue_write();
        let wreq = Arc::clone(issuer.wreq());
        assert_eq!(wreq.wait_for_write().expect("retried write"), 100);

        let writes = rec.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].index, writes[1].index);
        assert_eq!(writes[1].retry, 1);
        assert_eq!(wreq.stats.snapshot().wh_retry_write_subreq, 1);
    }

    #[test]
    fn short_write_retries_only_the_tail() {
        let rec = Recorder::completing();
        rec.short_next(40);
        let mut issuer = setup(WriteConfig::default(), &rec, 100);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 100, false)
            .expect("advance");
        issuer.end_issue_write();
        let wreq = Arc::clone(issuer.wreq());
        assert_eq!(wreq.wait_for_write().expect("write"), 100);
        let writes = rec.writes();
        assert_eq!(writes.len(), 2);
        assert_eq!((writes[1].start, writes[1].data.len()), (40, 60));
    }

    #[test]
    fn retry_budget_exhaustion_fails_request() {
        let rec = Recorder::completing();
        rec.fail_next(10, WbError::WriteFailed {
            pos: 0,
            detail: "down".to_owned(),
        });
        let cfg = WriteConfig {
            max_retries: 2,
            ..WriteConfig::default()
        };
        let mut issuer = setup(cfg, &rec, 10);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 10, false)
            .expect("advance");
        issuer.end_issue_write();
        let wreq = Arc::clone(issuer.wreq());
        assert!(matches!(
            wreq.wait_for_write(),
            Err(WbError::WriteFailed { .. })
        ));
        assert_eq!(rec.writes().len(), 3);
        assert!(wreq.is_failed());
    }

    #[test]
    fn deferred_completion_collects_in_waiter() {
        let rec = Recorder::deferred();
        let mut issuer = setup(WriteConfig::default(), &rec, 64);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 64, false)
            .expect("advance");
        issuer.end_issue_write();
        let wreq = Arc::clone(issuer.wreq());
        assert!(!wreq.is_done());

        let completer = {
            let rec = Arc::clone(&rec);
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                rec.complete_all();
            })
        };
        assert_eq!(wreq.wait_for_write().expect("write"), 64);
        completer.join().expect("completer");
    }

    #[test]
    fn dropped_issuer_cancels_but_finishes_queued_io() {
        let rec = Recorder::deferred();
        let mut issuer = setup(WriteConfig::default(), &rec, 64);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 64, true)
            .expect("advance");
        let wreq = Arc::clone(issuer.wreq());
        drop(issuer);
        assert!(wreq.is_all_queued());

        rec.complete_all();
        assert!(matches!(wreq.wait_for_write(), Err(WbError::Cancelled)));
        assert_eq!(rec.writes().len(), 1);
        assert!(wreq.buffer.lock().is_empty());
    }

    #[test]
    fn buffer_released_only_after_collection() {
        let rec = Recorder::deferred();
        let mut issuer = setup(WriteConfig::default(), &rec, 64);
        issuer
            .advance_write(UPLOAD_STREAM, FilePos(0), 64, false)
            .expect("advance");
        issuer.wreq().buffer.lock().advance(64);
        issuer.wreq().raise_issued_to(FilePos(64));
        issuer.issue_write(UPLOAD_STREAM);

        let wreq = Arc::clone(issuer.wreq());
        wreq.collect();
        assert_eq!(wreq.buffer.lock().len(), 1, "in-flight data stays pinned");
        rec.complete_all();
        wreq.collect();
        assert!(wreq.buffer.lock().is_empty());
        assert_eq!(wreq.cleaned_to(), FilePos(64));
    }
}
