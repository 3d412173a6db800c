//! Page write planner: decides how each folio is split between the upload
//! and cache streams.
//!
//! For every folio the planner works out which byte range is valid (the
//! whole folio, a streaming-write window, or a prefix clipped at EOF),
//! which streams want it, and then feeds the range to the streams in file
//! order, always serving the stream whose next byte is lowest.

use crate::request::WriteIssuer;
use crate::rolling_buffer::BufferMark;
use nwb_error::Result;
use nwb_page::{Folio, WritebackControl, redirty_for_writepage};
use nwb_types::{
    CACHE_STREAM, FilePos, IoOrigin, NR_IO_STREAMS, StreamSource, UPLOAD_STREAM, u64_to_len,
};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Valid range of a folio after EOF clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Extent {
    foff: usize,
    flen: usize,
    to_eof: bool,
}

impl WriteIssuer {
    /// Plan one locked, dirty-cleared pagecache folio.
    ///
    /// The folio is unlocked on success. It is either attached to the buffer
    /// (and routed to one or both streams), redirtied for a later pass
    /// (foreign group), or finished on the spot (beyond EOF, or nowhere to
    /// write it). An error means the folio was not touched and is still
    /// locked; failures after that point fail the request instead.
    pub fn write_folio(&mut self, wbc: &mut WritebackControl, folio: Arc<Folio>) -> Result<()> {
        self.wreq.buffer.lock().make_space()?;

        let i_size = self.wreq.mapping.i_size();
        let fpos = folio.pos();
        let fsize = folio.size();
        let origin = self.wreq.origin();

        if fpos.0 >= i_size {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_beyond_eof");
            if origin != IoOrigin::Writethrough {
                folio.start_writeback();
            }
            folio.unlock();
            self.finish_unattached(&folio);
            self.put_released_groups();
            return Ok(());
        }

        if fpos.saturating_add_len(fsize).0 > self.wreq.i_size() {
            self.wreq.set_i_size(i_size);
        }

        let fgroup = folio.group();
        let finfo = folio.streaming();
        let streamw = finfo.is_some();
        let avail_to_eof = u64_to_len(i_size - fpos.0);
        let (foff, fend) = finfo.map_or((0, fsize), |info| (info.dirty_offset, info.dirty_end()));
        let mut flen = fend;
        let mut to_eof = false;
        if origin == IoOrigin::Writethrough {
            flen = flen.min(avail_to_eof);
        } else if flen > avail_to_eof {
            flen = avail_to_eof;
            if !streamw {
                folio.zero_segment(flen, fsize);
            }
            to_eof = true;
        } else if flen == avail_to_eof {
            to_eof = true;
        }
        let extent = Extent {
            foff,
            flen: flen.saturating_sub(foff),
            to_eof,
        };

        // Discontinuities: copy-to-cache data never goes to the server, and
        // pages from another group wait for a request built for that group.
        if fgroup.is_copy_to_cache() {
            self.issue_write(UPLOAD_STREAM);
        } else if !fgroup.matches(self.wreq.group()) {
            debug!(
                target: "nwb::page",
                wreq = %self.wreq.debug_id(),
                pos = %fpos,
                ?fgroup,
                "folio_wrong_group"
            );
            redirty_for_writepage(wbc, &folio);
            folio.unlock();
            self.issue_write(UPLOAD_STREAM);
            self.issue_write(CACHE_STREAM);
            return Ok(());
        }

        if extent.foff > 0 {
            self.issue_write(UPLOAD_STREAM);
        }
        if streamw {
            self.issue_write(CACHE_STREAM);
        }

        // Write-through pages were put under writeback when first touched.
        if origin == IoOrigin::Writeback {
            folio.start_writeback();
        }
        folio.unlock();

        let upload_avail = self.wreq.upload_stream().is_avail();
        let cache_avail = self.wreq.cache_stream().is_avail();
        if fgroup.is_copy_to_cache() {
            if !cache_avail {
                trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_cancel_copy");
                self.issue_write(UPLOAD_STREAM);
                self.finish_unattached(&folio);
                return Ok(());
            }
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_store_copy");
        } else if !upload_avail && !cache_avail {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_cancel_store");
            self.finish_unattached(&folio);
            return Ok(());
        } else {
            trace!(
                target: "nwb::page",
                wreq = %self.wreq.debug_id(),
                pos = %fpos,
                foff = extent.foff,
                flen = extent.flen,
                plus = self.has_construct(UPLOAD_STREAM),
                "folio_store"
            );
        }

        let attached = self
            .wreq
            .buffer
            .lock()
            .append(Arc::clone(&folio), BufferMark::Pagecache);
        if let Err(err) = attached {
            self.finish_unattached(&folio);
            self.abandon(err);
            return Ok(());
        }

        // Streaming windows never go to the cache, which needs whole,
        // aligned blocks; copy-to-cache data never goes to the server.
        for s in 0..NR_IO_STREAMS {
            let stream = &self.wreq.streams[s];
            let skip = !stream.is_avail()
                || (stream.source() == StreamSource::WriteToCache && streamw)
                || (stream.source() == StreamSource::UploadToServer
                    && fgroup.is_copy_to_cache());
            if skip {
                self.builders[s].set_submit(usize::MAX, 0);
            } else {
                self.builders[s].set_submit(extent.foff, extent.flen);
            }
        }

        if let Err(err) = self.route_folio(fpos, fsize, extent.to_eof) {
            self.abandon(err);
            return Ok(());
        }
        // Write-through counts copied bytes itself.
        if origin != IoOrigin::Writethrough {
            self.wreq
                .extend_len_to(fpos.saturating_add_len(extent.foff + extent.flen));
        }

        if extent.foff + extent.flen < fsize {
            for s in 0..NR_IO_STREAMS {
                self.issue_write(s);
            }
        }
        Ok(())
    }

    /// Plan one folio of a monolithic payload.
    ///
    /// No groups, streaming windows or page locks are involved; the folio
    /// is pinned in the buffer for the life of the request.
    pub fn write_folio_single(&mut self, folio: Arc<Folio>) -> Result<()> {
        let fpos = folio.pos();
        let fsize = folio.size();
        let i_size = self.wreq.i_size();
        let avail_to_eof = u64_to_len(i_size.saturating_sub(fpos.0));

        let mut flen = fsize;
        let mut to_eof = false;
        if flen > avail_to_eof {
            flen = avail_to_eof;
            folio.zero_segment(flen, fsize);
            to_eof = true;
        } else if flen == avail_to_eof {
            to_eof = true;
        }

        let upload_avail = self.wreq.upload_stream().is_avail();
        let cache_avail = self.wreq.cache_stream().is_avail();
        if !upload_avail && !cache_avail {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_cancel_store");
            return Ok(());
        }
        trace!(
            target: "nwb::page",
            wreq = %self.wreq.debug_id(),
            pos = %fpos,
            flen,
            "folio_store_single"
        );

        let attached = self
            .wreq
            .buffer
            .lock()
            .append(Arc::clone(&folio), BufferMark::Pinned);
        if let Err(err) = attached {
            self.abandon(err);
            return Ok(());
        }

        for s in 0..NR_IO_STREAMS {
            if self.wreq.streams[s].is_avail() {
                self.builders[s].set_submit(0, flen);
            } else {
                self.builders[s].set_submit(usize::MAX, 0);
            }
        }
        if let Err(err) = self.route_folio(fpos, fsize, to_eof) {
            self.abandon(err);
        }
        Ok(())
    }

    /// Plan one clean folio, just read from the server, for copying to the
    /// cache.
    ///
    /// The folio stays under writeback until its copy is collected. Folios
    /// beyond EOF, or already being copied, are skipped. An error means the
    /// folio was not touched.
    pub fn write_folio_copy(&mut self, folio: Arc<Folio>) -> Result<()> {
        self.wreq.buffer.lock().make_space()?;

        let fpos = folio.pos();
        let fsize = folio.size();
        let i_size = self.wreq.i_size();
        if fpos.0 >= i_size {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_beyond_eof");
            return Ok(());
        }
        if !self.wreq.cache_stream().is_avail() {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_cancel_copy");
            return Ok(());
        }
        if folio.is_writeback() {
            trace!(target: "nwb::page", wreq = %self.wreq.debug_id(), pos = %fpos, "folio_copy_busy");
            self.issue_write(CACHE_STREAM);
            return Ok(());
        }

        let avail_to_eof = u64_to_len(i_size - fpos.0);
        let flen = fsize.min(avail_to_eof);
        let to_eof = flen == avail_to_eof;
        trace!(
            target: "nwb::page",
            wreq = %self.wreq.debug_id(),
            pos = %fpos,
            flen,
            "folio_store_copy"
        );

        folio.start_writeback();
        let attached = self
            .wreq
            .buffer
            .lock()
            .append(Arc::clone(&folio), BufferMark::Pagecache);
        if let Err(err) = attached {
            folio.end_writeback();
            self.abandon(err);
            return Ok(());
        }

        self.builders[UPLOAD_STREAM].set_submit(usize::MAX, 0);
        self.builders[CACHE_STREAM].set_submit(0, flen);
        if let Err(err) = self.route_folio(fpos, fsize, to_eof) {
            self.abandon(err);
            return Ok(());
        }
        self.wreq.extend_len_to(fpos.saturating_add_len(flen));
        if flen < fsize {
            self.issue_write(CACHE_STREAM);
        }
        Ok(())
    }

    /// Feed the current folio's submit ranges to the streams, lowest
    /// `submit_off` first (ties to the lower stream), keeping the buffer
    /// cursor in step. Leaves the cursor at the end of the folio.
    fn route_folio(&mut self, fpos: FilePos, fsize: usize, to_eof: bool) -> Result<()> {
        let mut iter_off = 0_usize;
        while let Some(s) = self.lowest_submit_stream() {
            let submit_off = self.builders[s].submit_off;
            if submit_off > iter_off {
                self.wreq.buffer.lock().advance(submit_off - iter_off);
                iter_off = submit_off;
            }

            self.wreq.raise_issued_to(fpos.saturating_add_len(submit_off));
            self.builders[s].submit_extendable_to = fsize - submit_off;
            let submit_len = self.builders[s].submit_len;
            let part = self.advance_write(
                s,
                fpos.saturating_add_len(submit_off),
                submit_len,
                to_eof,
            )?;
            let builder = &mut self.builders[s];
            builder.submit_off += part;
            builder.submit_len = builder.submit_len.saturating_sub(part);
            if part == 0 {
                // Nothing accepted; the stream cannot take this folio.
                builder.submit_len = 0;
            }
        }

        if fsize > iter_off {
            self.wreq.buffer.lock().advance(fsize - iter_off);
        }
        self.wreq.raise_issued_to(fpos.saturating_add_len(fsize));
        Ok(())
    }

    fn lowest_submit_stream(&self) -> Option<usize> {
        let mut lowest: Option<(usize, usize)> = None;
        for (s, builder) in self.builders.iter().enumerate() {
            if builder.submit_len == 0 {
                continue;
            }
            if lowest.is_none_or(|(_, off)| builder.submit_off < off) {
                lowest = Some((s, builder.submit_off));
            }
        }
        lowest.map(|(s, _)| s)
    }

    /// Fail the request after a folio was already committed to it: stop both
    /// streams so later folios are finished without I/O, and flush whatever
    /// was built so the collector can retire it.
    fn abandon(&mut self, err: nwb_error::WbError) {
        warn!(
            target: "nwb::write_issue",
            wreq = %self.wreq.debug_id(),
            error = %err,
            "issue_abandoned"
        );
        self.wreq.record_error(err);
        self.wreq.set_upload_avail(false);
        self.wreq.cache_stream().set_avail(false);
        for s in 0..NR_IO_STREAMS {
            self.builders[s].set_submit(usize::MAX, 0);
            self.issue_write(s);
        }
    }

    /// Finish a folio that will not be attached to the buffer, keeping its
    /// group reference for release at the end of issue.
    pub(crate) fn finish_unattached(&mut self, folio: &Folio) {
        if let Some(group) = folio.written_back() {
            self.released_groups.push(group);
        }
    }
}
