//! Subrequest construction and dispatch.
//!
//! The issuer grows one open subrequest (the "construct") per stream. Data
//! routed to a stream extends the construct while it stays contiguous and
//! under the stream's length and segment limits; otherwise the construct is
//! dispatched and a new one started.

use crate::backend::StreamLimits;
use crate::request::{WriteIssuer, WriteRequest};
use crate::rolling_buffer::IoIter;
use crate::subrequest::Subrequest;
use nwb_error::{Result, WbError};
use nwb_types::{FilePos, NR_IO_STREAMS, StreamSource};
use std::sync::Arc;
use tracing::{debug, trace, warn};

impl WriteIssuer {
    /// Open a new construct on `stream_nr` starting at `start`.
    pub fn prepare_write(&mut self, stream_nr: usize, start: FilePos) -> Result<()> {
        let wreq = &self.wreq;
        let cursor = {
            let mut buffer = wreq.buffer.lock();
            buffer.make_space()?;
            buffer.snapshot()
        };
        let stream = &wreq.streams[stream_nr];
        let subreq = Arc::new(Subrequest::new(
            Arc::downgrade(wreq),
            wreq.next_subreq_index(),
            stream.source(),
            start,
            cursor,
        ));

        let mut limits = StreamLimits {
            extendable_to: self.builders[stream_nr].submit_extendable_to,
            ..StreamLimits::unbounded()
        };
        match stream.source() {
            StreamSource::UploadToServer => {
                wreq.stats.record_upload();
                limits.max_len = wreq.wsize();
                limits.max_segs = wreq.config().max_segs;
            }
            StreamSource::WriteToCache => wreq.stats.record_cache_write(),
        }
        if let Some(backend) = stream.backend() {
            if let Err(err) = backend.prepare_write(&subreq, &mut limits) {
                warn!(
                    target: "nwb::write_issue",
                    wreq = %wreq.debug_id(),
                    stream = stream_nr,
                    start = %start,
                    error = %err,
                    "prepare_write_failed"
                );
                wreq.stats.record_prepare_failed();
                subreq.mark_failed(err);
            }
        }
        let limits = limits.clamp();

        let builder = &mut self.builders[stream_nr];
        builder.sreq_max_len = limits.max_len;
        builder.sreq_max_segs = limits.max_segs;

        trace!(
            target: "nwb::write_issue",
            wreq = %wreq.debug_id(),
            stream = stream_nr,
            index = subreq.debug_index(),
            start = %start,
            max_len = limits.max_len,
            max_segs = limits.max_segs,
            "subreq_prepare"
        );
        subreq.mark_in_progress();
        stream.push_tail(Arc::clone(&subreq));
        builder.construct = Some(subreq);
        Ok(())
    }

    /// Route `len` bytes at `start` to `stream_nr`.
    ///
    /// Returns how many bytes were taken: all of them if the stream is
    /// unavailable, otherwise as many as fit in the current construct.
    /// `to_eof` dispatches the construct immediately after extending it.
    pub fn advance_write(
        &mut self,
        stream_nr: usize,
        start: FilePos,
        len: usize,
        to_eof: bool,
    ) -> Result<usize> {
        if !self.wreq.streams[stream_nr].is_avail() {
            trace!(
                target: "nwb::write_issue",
                wreq = %self.wreq.debug_id(),
                stream = stream_nr,
                start = %start,
                len,
                "advance_skip_unavailable"
            );
            return Ok(len);
        }
        if len == 0 {
            return Ok(0);
        }

        if self.builders[stream_nr]
            .construct
            .as_ref()
            .is_some_and(|c| c.end() != start)
        {
            self.issue_write(stream_nr);
        }
        if self.builders[stream_nr].construct.is_none() {
            self.prepare_write(stream_nr, start)?;
        }

        let builder = &mut self.builders[stream_nr];
        let subreq = builder
            .construct
            .clone()
            .ok_or_else(|| WbError::InvalidRequest("no open subrequest".to_owned()))?;
        let part = builder.sreq_max_len.saturating_sub(subreq.len()).min(len);
        let (new_len, nr_segs) = subreq.grow(part, 1);
        builder.submit_extendable_to = builder.submit_extendable_to.saturating_sub(part);
        let full = new_len >= builder.sreq_max_len || nr_segs >= builder.sreq_max_segs;

        trace!(
            target: "nwb::write_issue",
            wreq = %self.wreq.debug_id(),
            stream = stream_nr,
            index = subreq.debug_index(),
            start = %start,
            part,
            len = new_len,
            nr_segs,
            "subreq_advance"
        );
        if full || to_eof {
            self.issue_write(stream_nr);
        }
        Ok(part)
    }

    /// Dispatch the construct on `stream_nr`, if any.
    pub fn issue_write(&mut self, stream_nr: usize) {
        let Some(subreq) = self.builders[stream_nr].construct.take() else {
            return;
        };
        let extracted = self
            .wreq
            .buffer
            .lock()
            .extract(subreq.cursor(), subreq.len());
        match extracted {
            Ok(iter) => subreq.set_io_iter(iter),
            Err(err) => subreq.mark_failed(err),
        }
        self.wreq.dispatch(subreq, true);
    }

    /// Dispatch every open construct, publish that nothing more will be
    /// queued, and make sure collection happens even if nothing is in flight.
    pub fn end_issue_write(&mut self) {
        for stream_nr in 0..NR_IO_STREAMS {
            self.issue_write(stream_nr);
        }
        self.wreq.set_all_queued();
        debug!(
            target: "nwb::write_issue",
            wreq = %self.wreq.debug_id(),
            len = self.wreq.len(),
            issued_to = %self.wreq.issued_to(),
            "end_issue_write"
        );
        if self.wreq.streams.iter().all(|s| s.is_empty()) {
            self.wreq.wake_collector();
        }
        self.put_released_groups();
    }
}

impl WriteRequest {
    /// Hand `subreq` to its stream's backend.
    ///
    /// A subrequest that already failed (for example in `prepare_write`) is
    /// terminated with its recorded error instead.
    pub(crate) fn dispatch(&self, subreq: Arc<Subrequest>, first: bool) {
        if first {
            self.note_dispatched();
        }
        if subreq.is_failed() {
            let err = subreq
                .error()
                .unwrap_or_else(|| WbError::InvalidRequest("subrequest failed".to_owned()));
            subreq.terminated(Err(err));
            return;
        }
        let Some(backend) = self.streams[subreq.stream_nr()].backend() else {
            subreq.terminated(Err(WbError::InvalidRequest(
                "stream has no backend".to_owned(),
            )));
            return;
        };
        trace!(
            target: "nwb::write_issue",
            wreq = %self.debug_id(),
            stream = subreq.stream_nr(),
            index = subreq.debug_index(),
            start = %subreq.start(),
            len = subreq.len(),
            retry = subreq.retry_count(),
            "subreq_submit"
        );
        backend.issue_write(subreq);
    }

    /// Re-dispatch the unfinished tail of a failed subrequest.
    ///
    /// Takes `len - transferred` bytes from the front of `source` as the new
    /// data and advances `source` past them.
    pub fn reissue_write(&self, subreq: &Arc<Subrequest>, source: &mut IoIter) {
        let size = subreq.len() - subreq.transferred();
        let mut iter = source.clone();
        source.advance(size);
        iter.truncate(size);
        subreq.prepare_retry(iter);
        self.stats.record_retry();
        debug!(
            target: "nwb::write_issue",
            wreq = %self.debug_id(),
            stream = subreq.stream_nr(),
            index = subreq.debug_index(),
            at = %subreq.write_pos(),
            size,
            retry = subreq.retry_count(),
            "subreq_reissue"
        );
        self.dispatch(Arc::clone(subreq), false);
    }

    fn note_dispatched(&self) {
        let max = self.config().max_in_flight;
        let mut wait = self.wait.lock();
        wait.in_flight += 1;
        if max > 0 && wait.in_flight >= max && !self.is_paused() {
            self.set_paused(true);
            debug!(
                target: "nwb::write_issue",
                wreq = %self.debug_id(),
                in_flight = wait.in_flight,
                "write_paused"
            );
        }
    }
}
