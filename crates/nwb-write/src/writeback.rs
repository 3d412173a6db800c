//! Entry points that drive the planner: whole-file write-back, write-through,
//! unbuffered/direct writes, and monolithic single-payload write-back.

use crate::inode::NetfsInode;
use crate::request::{Kiocb, WriteIssuer, WriteOutcome, create_write_req};
use crate::rolling_buffer::BufferMark;
use nwb_error::{Result, WbError};
use nwb_page::{Folio, Mapping, WritebackControl};
use nwb_types::{FilePos, IoOrigin, PAGE_SIZE, SyncMode, UPLOAD_STREAM, len_to_u64, u64_to_len};
use parking_lot::MutexGuard;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Take the inode's write-back lock, or give up on contention when the pass
/// is only opportunistic.
fn lock_for_writeback(inode: &NetfsInode, mode: SyncMode) -> Option<MutexGuard<'_, ()>> {
    if let Some(guard) = inode.wb_lock.try_lock() {
        return Some(guard);
    }
    if mode == SyncMode::None {
        inode.stats().record_lock_skip();
        trace!(target: "nwb::write_issue", "writeback_lock_skip");
        return None;
    }
    inode.stats().record_lock_wait();
    Some(inode.wb_lock.lock())
}

/// Fire the upload backend's `begin_writeback` hook the first time a pass
/// reaches data meant for the server.
fn begin_upload(issuer: &WriteIssuer) {
    let wreq = issuer.wreq();
    if wreq.test_and_set_upload_to_server() {
        return;
    }
    if let Some(upload) = wreq.upload_backend() {
        upload.begin_writeback(wreq);
    }
}

// ── Whole-file write-back ───────────────────────────────────────────────────

/// Write back the dirty folios of `inode` selected by `wbc`.
///
/// Builds one request positioned at the first dirty folio and plans every
/// folio the iterator yields. Completion is collected asynchronously; I/O
/// errors surface through the mapping's error channel. An error returned
/// here means the pass itself broke down, and the folios it could not plan
/// have been cleaned with the error recorded.
pub fn writepages(inode: &NetfsInode, wbc: &mut WritebackControl) -> Result<()> {
    let Some(guard) = lock_for_writeback(inode, wbc.sync_mode) else {
        return Ok(());
    };
    let mapping = inode.mapping();
    let Some(first) = mapping.next_writeback_folio(wbc) else {
        return Ok(());
    };

    let mut issuer = match create_write_req(inode, first.pos(), IoOrigin::Writeback) {
        Ok(issuer) => issuer,
        Err(err) => {
            kill_dirty_pages(mapping, wbc, first, &err);
            return Err(err);
        }
    };
    let wreq = Arc::clone(issuer.wreq());
    wreq.set_offload_collection();
    inode.stats().record_writepages();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        start = %first.pos(),
        sync = ?wbc.sync_mode,
        "writepages_begin"
    );

    let mut result = Ok(());
    let mut next = Some(first);
    while let Some(folio) = next {
        if folio.pos() < wreq.issued_to() {
            warn!(
                target: "nwb::write_issue",
                wreq = %wreq.debug_id(),
                pos = %folio.pos(),
                issued_to = %wreq.issued_to(),
                "folio_behind_issue_point"
            );
        }
        if !folio.group().is_copy_to_cache() {
            begin_upload(&issuer);
        }
        if let Err(err) = issuer.write_folio(wbc, Arc::clone(&folio)) {
            wreq.record_error(err.clone());
            kill_dirty_pages(mapping, wbc, folio, &err);
            result = Err(err);
            break;
        }
        next = mapping.next_writeback_folio(wbc);
    }

    issuer.end_issue_write();
    drop(issuer);
    drop(guard);
    wreq.wake_collector();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        len = wreq.len(),
        issued_to = %wreq.issued_to(),
        ok = result.is_ok(),
        "writepages_end"
    );
    result
}

/// Abandon `first` and every folio still left in the pass: detach their
/// private state, cycle them through writeback to clean, and record `err`
/// for the next fsync.
pub fn kill_dirty_pages(
    mapping: &Mapping,
    wbc: &mut WritebackControl,
    first: Arc<Folio>,
    err: &WbError,
) {
    let mut killed = 0_usize;
    let mut next = Some(first);
    while let Some(folio) = next {
        folio.start_writeback();
        folio.unlock();
        if let Some(group) = folio.written_back() {
            mapping.put_group(group, 1);
        }
        killed += 1;
        next = mapping.next_writeback_folio(wbc);
    }
    mapping.set_error(err);
    warn!(target: "nwb::write_issue", killed, error = %err, "dirty_pages_killed");
}

// ── Write-through ───────────────────────────────────────────────────────────

/// An in-progress write-through: data is copied into the pagecache and
/// written out by the same call.
///
/// Holds the inode's write-back lock until [`end_writethrough`] is called.
///
/// [`end_writethrough`]: Writethrough::end_writethrough
#[derive(Debug)]
pub struct Writethrough<'a> {
    guard: MutexGuard<'a, ()>,
    issuer: WriteIssuer,
    cached: Option<Arc<Folio>>,
    is_async: bool,
}

/// Start a write-through at `iocb.pos`.
pub fn begin_writethrough(inode: &NetfsInode, iocb: Kiocb) -> Result<Writethrough<'_>> {
    let guard = inode.wb_lock.lock();
    let issuer = create_write_req(inode, iocb.pos, IoOrigin::Writethrough)?;
    let wreq = issuer.wreq();
    wreq.set_upload_avail(true);
    wreq.test_and_set_upload_to_server();
    let is_async = iocb.complete.is_some();
    if let Some(complete) = iocb.complete {
        wreq.set_completion(complete);
    }
    inode.stats().record_writethrough();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        pos = %iocb.pos,
        is_async,
        "writethrough_begin"
    );
    Ok(Writethrough {
        guard,
        issuer,
        cached: None,
        is_async,
    })
}

impl Writethrough<'_> {
    #[must_use]
    pub fn issuer(&self) -> &WriteIssuer {
        &self.issuer
    }

    /// Account `copied` bytes just written into the locked `folio`.
    ///
    /// The folio is put under writeback the first time it is seen. It is
    /// planned once the copy reaches the end of the page (`to_page_end`);
    /// otherwise it is unlocked and kept until more data arrives or the
    /// write-through ends. Either way the caller's lock is consumed.
    pub fn advance_writethrough(
        &mut self,
        wbc: &mut WritebackControl,
        folio: &Arc<Folio>,
        copied: usize,
        to_page_end: bool,
    ) -> Result<()> {
        match &self.cached {
            Some(cached) if Arc::ptr_eq(cached, folio) => {}
            Some(_) => {
                // A new page before the old one filled up: the old page is
                // complete as far as this write goes.
                self.flush_cached(wbc)?;
                self.start_folio(folio);
            }
            None => self.start_folio(folio),
        }
        self.issuer.wreq().add_len(copied);

        if !to_page_end {
            folio.unlock();
            return Ok(());
        }
        self.cached = None;
        self.plan(wbc, Arc::clone(folio))
    }

    fn start_folio(&mut self, folio: &Arc<Folio>) {
        folio.clear_dirty_for_io();
        folio.wait_writeback();
        folio.start_writeback();
        trace!(
            target: "nwb::page",
            wreq = %self.issuer.wreq().debug_id(),
            pos = %folio.pos(),
            "folio_writethrough_start"
        );
        self.cached = Some(Arc::clone(folio));
    }

    fn flush_cached(&mut self, wbc: &mut WritebackControl) -> Result<()> {
        let Some(folio) = self.cached.take() else {
            return Ok(());
        };
        folio.lock();
        self.plan(wbc, folio)
    }

    /// Plan a locked folio already under writeback; on failure finish it
    /// here so it does not stay under writeback.
    fn plan(&mut self, wbc: &mut WritebackControl, folio: Arc<Folio>) -> Result<()> {
        if let Err(err) = self.issuer.write_folio(wbc, Arc::clone(&folio)) {
            folio.unlock();
            self.issuer.finish_unattached(&folio);
            self.issuer.wreq().record_error(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Flush the last partial page, close the request and release the
    /// write-back lock. Waits for the result unless the caller supplied a
    /// completion callback.
    pub fn end_writethrough(mut self, wbc: &mut WritebackControl) -> Result<WriteOutcome> {
        // A flush failure is already recorded on the request.
        let _ = self.flush_cached(wbc);
        let Self {
            guard,
            mut issuer,
            is_async,
            ..
        } = self;
        issuer.end_issue_write();
        let wreq = Arc::clone(issuer.wreq());
        drop(issuer);
        drop(guard);

        if is_async {
            return Ok(WriteOutcome::Queued);
        }
        wreq.wait_for_write().map(WriteOutcome::Written)
    }
}

/// Copy `data` into the pagecache at `iocb.pos` and write it through.
///
/// Touched folios are tagged with the inode's current write-back group.
pub fn perform_writethrough(
    inode: &NetfsInode,
    iocb: Kiocb,
    data: &[u8],
) -> Result<WriteOutcome> {
    let pos = iocb.pos;
    let mut wt = begin_writethrough(inode, iocb)?;
    let mut wbc = WritebackControl::new(SyncMode::All);
    let mapping = inode.mapping();
    let group = inode.writeback_group();

    let mut done = 0_usize;
    while done < data.len() {
        let at = pos.saturating_add_len(done);
        let folio = mapping.grab_folio(at);
        folio.lock();
        let offset = u64_to_len(at.0 - folio.pos().0);
        let chunk = (data.len() - done).min(folio.size() - offset);
        mapping.write(at, &data[done..done + chunk], group);
        done += chunk;
        let to_page_end = offset + chunk == folio.size();
        wt.advance_writethrough(&mut wbc, &folio, chunk, to_page_end)?;
    }
    wt.end_writethrough(&mut wbc)
}

// ── Unbuffered and direct writes ────────────────────────────────────────────

impl WriteIssuer {
    /// Route `len` bytes of caller data, already loaded into the buffer, to
    /// the upload stream in `wsize` pieces, then close the request.
    ///
    /// Honors backpressure when `may_wait` is set and stops early once the
    /// request has failed.
    pub fn unbuffered_write(&mut self, may_wait: bool, len: usize) -> Result<()> {
        let wreq = Arc::clone(&self.wreq);
        let mut start = wreq.start();
        let mut remaining = len;
        let mut result = Ok(());
        while remaining > 0 {
            let part = match self.advance_write(UPLOAD_STREAM, start, remaining, false) {
                Ok(part) => part,
                Err(err) => {
                    wreq.record_error(err.clone());
                    result = Err(err);
                    break;
                }
            };
            start = start.saturating_add_len(part);
            remaining -= part;
            wreq.buffer.lock().advance(part);
            wreq.raise_issued_to(start);

            if may_wait && wreq.is_paused() {
                wreq.wait_for_paused_write();
            }
            if wreq.is_failed() {
                break;
            }
        }
        self.end_issue_write();
        result
    }
}

/// Write `data` at `iocb.pos` straight to the server, bypassing the
/// pagecache.
pub fn write_unbuffered(
    inode: &NetfsInode,
    iocb: Kiocb,
    data: &[u8],
    origin: IoOrigin,
) -> Result<WriteOutcome> {
    if !matches!(origin, IoOrigin::UnbufferedWrite | IoOrigin::DioWrite) {
        return Err(WbError::InvalidRequest(format!(
            "{origin:?} is not an unbuffered origin"
        )));
    }
    let mut issuer = create_write_req(inode, iocb.pos, origin)?;
    let wreq = Arc::clone(issuer.wreq());
    wreq.set_upload_avail(true);
    {
        let mut buffer = wreq.buffer.lock();
        for (i, chunk) in data.chunks(PAGE_SIZE).enumerate() {
            let at = iocb.pos.saturating_add_len(i * PAGE_SIZE);
            buffer.append(
                Arc::new(Folio::with_bytes(at, chunk.to_vec())),
                BufferMark::Pinned,
            )?;
        }
    }
    wreq.set_len(len_to_u64(data.len()));

    let is_async = iocb.complete.is_some();
    if let Some(complete) = iocb.complete {
        wreq.set_completion(complete);
    }
    inode.stats().record_unbuffered();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        ?origin,
        pos = %iocb.pos,
        len = data.len(),
        is_async,
        "unbuffered_write_begin"
    );

    let issued = issuer.unbuffered_write(!is_async, data.len());
    drop(issuer);
    if is_async {
        return issued.map(|()| WriteOutcome::Queued);
    }
    let result = wreq.wait_for_write();
    issued?;
    result.map(WriteOutcome::Written)
}

// ── Monolithic payloads ─────────────────────────────────────────────────────

/// Write back a monolithic, non-pagecache payload of `size` bytes held in
/// `folios` (positioned from file offset 0).
pub fn writeback_single(
    inode: &NetfsInode,
    wbc: &WritebackControl,
    folios: &[Arc<Folio>],
    size: usize,
) -> Result<()> {
    let Some(guard) = lock_for_writeback(inode, wbc.sync_mode) else {
        return Ok(());
    };
    let mut issuer = create_write_req(inode, FilePos::ZERO, IoOrigin::WritebackSingle)?;
    let wreq = Arc::clone(issuer.wreq());
    wreq.set_i_size(len_to_u64(size));
    wreq.set_len(len_to_u64(size));
    wreq.set_offload_collection();
    inode.stats().record_writepages();
    begin_upload(&issuer);

    let mut result = Ok(());
    let mut remaining = size;
    for folio in folios {
        if remaining == 0 {
            break;
        }
        let part = folio.size().min(remaining);
        if let Err(err) = issuer.write_folio_single(Arc::clone(folio)) {
            wreq.record_error(err.clone());
            result = Err(err);
            break;
        }
        remaining -= part;
    }

    issuer.end_issue_write();
    drop(issuer);
    drop(guard);
    wreq.wake_collector();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        size,
        ok = result.is_ok(),
        "writeback_single_end"
    );
    result
}

// ── Copy to cache ───────────────────────────────────────────────────────────

/// Copy clean folios just read from the server into the local cache.
///
/// Nothing goes to the server. Each folio copied is put under writeback
/// until the cache confirms it, so callers wanting the copy finished wait
/// on [`Folio::wait_writeback`]. Without a usable cache this is a no-op.
pub fn copy_to_cache(inode: &NetfsInode, folios: &[Arc<Folio>]) -> Result<()> {
    let Some(first) = folios.first() else {
        return Ok(());
    };
    let mut issuer = create_write_req(inode, first.pos(), IoOrigin::Pgpriv2CopyToCache)?;
    let wreq = Arc::clone(issuer.wreq());
    if !wreq.cache_stream().is_avail() {
        trace!(target: "nwb::write_issue", wreq = %wreq.debug_id(), "copy_to_cache_no_cache");
        issuer.end_issue_write();
        return Ok(());
    }
    wreq.set_offload_collection();
    inode.stats().record_copy_to_cache();

    let mut result = Ok(());
    for folio in folios {
        if let Err(err) = issuer.write_folio_copy(Arc::clone(folio)) {
            wreq.record_error(err.clone());
            result = Err(err);
            break;
        }
    }

    issuer.end_issue_write();
    drop(issuer);
    wreq.wake_collector();
    debug!(
        target: "nwb::write_issue",
        wreq = %wreq.debug_id(),
        len = wreq.len(),
        ok = result.is_ok(),
        "copy_to_cache_end"
    );
    result
}
