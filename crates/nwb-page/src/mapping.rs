//! In-memory address space: the folio index of one file.
//!
//! The write-back engine treats the mapping as an external collaborator and
//! only needs a handful of things from it: the file size, an ascending walk
//! over dirty folios, a place to park write-back errors, and group
//! reference counts. The buffered-write helpers exist so callers and tests
//! can dirty folios the way a filesystem's write path would.

use crate::folio::{Folio, FolioPrivate, StreamingWrite};
use nwb_error::{Result, WbError};
use nwb_types::{FilePos, FolioSize, GroupId, SyncMode, len_to_u64, u64_to_len};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Parameters and progress of one write-back pass.
#[derive(Debug, Clone)]
pub struct WritebackControl {
    pub sync_mode: SyncMode,
    /// Folios still allowed in this pass (ignored for `SyncMode::All`).
    pub nr_to_write: i64,
    pub range_start: FilePos,
    /// Exclusive end of the range to write back.
    pub range_end: FilePos,
    /// Folios skipped or re-dirtied and left for a later pass.
    pub pages_skipped: u64,
    next: FilePos,
}

impl WritebackControl {
    #[must_use]
    pub fn new(sync_mode: SyncMode) -> Self {
        Self {
            sync_mode,
            nr_to_write: i64::MAX,
            range_start: FilePos::ZERO,
            range_end: FilePos(u64::MAX),
            pages_skipped: 0,
            next: FilePos::ZERO,
        }
    }

    /// Restrict the pass to `[start, end)`.
    #[must_use]
    pub fn with_range(mut self, start: FilePos, end: FilePos) -> Self {
        self.range_start = start;
        self.range_end = end;
        self.next = start;
        self
    }

    #[must_use]
    pub fn with_nr_to_write(mut self, nr: i64) -> Self {
        self.nr_to_write = nr;
        self
    }

    fn budget_exhausted(&self) -> bool {
        self.sync_mode == SyncMode::None && self.nr_to_write <= 0
    }
}

/// Re-mark a folio dirty so a later pass picks it up, and unlock it.
pub fn redirty_for_writepage(wbc: &mut WritebackControl, folio: &Folio) {
    folio.mark_dirty();
    wbc.pages_skipped += 1;
    tracing::trace!(
        target: "nwb::page",
        pos = folio.pos().0,
        "folio_redirty"
    );
}

/// The folio index, size and error channel of one file.
#[derive(Debug)]
pub struct Mapping {
    folio_size: FolioSize,
    folios: RwLock<BTreeMap<u64, Arc<Folio>>>,
    i_size: AtomicU64,
    wb_err: Mutex<Option<WbError>>,
    group_refs: Mutex<HashMap<GroupId, usize>>,
}

impl Mapping {
    #[must_use]
    pub fn new(folio_size: FolioSize) -> Self {
        Self {
            folio_size,
            folios: RwLock::new(BTreeMap::new()),
            i_size: AtomicU64::new(0),
            wb_err: Mutex::new(None),
            group_refs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn folio_size(&self) -> FolioSize {
        self.folio_size
    }

    #[must_use]
    pub fn i_size(&self) -> u64 {
        self.i_size.load(Ordering::Acquire)
    }

    pub fn set_i_size(&self, size: u64) {
        self.i_size.store(size, Ordering::Release);
    }

    fn extend_i_size(&self, end: u64) {
        self.i_size.fetch_max(end, Ordering::AcqRel);
    }

    fn folio_base(&self, pos: u64) -> u64 {
        let size = len_to_u64(self.folio_size.get());
        pos - pos % size
    }

    /// Look up the folio covering `pos`.
    #[must_use]
    pub fn folio(&self, pos: FilePos) -> Option<Arc<Folio>> {
        self.folios.read().get(&self.folio_base(pos.0)).cloned()
    }

    /// Find or create the folio covering `pos`.
    pub fn grab_folio(&self, pos: FilePos) -> Arc<Folio> {
        let base = self.folio_base(pos.0);
        if let Some(folio) = self.folios.read().get(&base) {
            return Arc::clone(folio);
        }
        let mut folios = self.folios.write();
        Arc::clone(
            folios
                .entry(base)
                .or_insert_with(|| Arc::new(Folio::new(FilePos(base), self.folio_size))),
        )
    }

    /// Insert a folio that was read or filled elsewhere.
    pub fn insert_folio(&self, folio: Arc<Folio>) {
        self.folios.write().insert(folio.pos().0, folio);
    }

    /// Number of folios currently marked dirty.
    #[must_use]
    pub fn nr_dirty(&self) -> usize {
        self.folios.read().values().filter(|f| f.is_dirty()).count()
    }

    /// All folios in ascending order.
    #[must_use]
    pub fn folios(&self) -> Vec<Arc<Folio>> {
        self.folios.read().values().cloned().collect()
    }

    // ── Buffered writes ─────────────────────────────────────────────────────

    /// Copy `data` into the pagecache at `pos`, dirtying whole folios.
    ///
    /// Every touched folio is marked up to date and tagged with `group`.
    /// Returns the folios touched, in ascending order.
    pub fn write(&self, pos: FilePos, data: &[u8], group: Option<GroupId>) -> Vec<Arc<Folio>> {
        let mut touched = Vec::new();
        let mut done = 0_usize;
        while done < data.len() {
            let at = pos.saturating_add_len(done);
            let folio = self.grab_folio(at);
            let offset = u64_to_len(at.0 - folio.pos().0);
            done += folio.write_at(offset, &data[done..]);
            folio.set_uptodate(true);
            self.attach_group(&folio, group);
            folio.mark_dirty();
            touched.push(folio);
        }
        self.extend_i_size(pos.saturating_add_len(data.len()).0);
        touched
    }

    /// Write `data` into a folio that has not been read from the server,
    /// recording only the valid sub-range.
    ///
    /// The write must fit in one folio. If the folio is already up to date
    /// this degrades to an ordinary buffered write.
    pub fn write_streaming(
        &self,
        pos: FilePos,
        data: &[u8],
        group: Option<GroupId>,
    ) -> Result<Arc<Folio>> {
        let folio = self.grab_folio(pos);
        let offset = u64_to_len(pos.0 - folio.pos().0);
        if offset + data.len() > folio.size() {
            return Err(WbError::InvalidRequest(format!(
                "streaming write crosses folio boundary: pos={pos} len={}",
                data.len()
            )));
        }
        if folio.is_uptodate() {
            self.write(pos, data, group);
            return Ok(folio);
        }

        folio.write_at(offset, data);
        let info = match folio.private() {
            FolioPrivate::Streaming(prev) => {
                let start = prev.dirty_offset.min(offset);
                let end = prev.dirty_end().max(offset + data.len());
                StreamingWrite {
                    group: prev.group,
                    dirty_offset: start,
                    dirty_len: end - start,
                }
            }
            _ => {
                if let Some(group) = group {
                    self.get_group(group);
                }
                StreamingWrite {
                    group,
                    dirty_offset: offset,
                    dirty_len: data.len(),
                }
            }
        };
        folio.set_private(FolioPrivate::Streaming(info));
        folio.mark_dirty();
        self.extend_i_size(pos.saturating_add_len(data.len()).0);
        Ok(folio)
    }

    /// Mark a clean, up-to-date folio for copying into the local cache.
    pub fn mark_copy_to_cache(&self, folio: &Folio) {
        folio.set_private(FolioPrivate::CopyToCache);
        folio.mark_dirty();
    }

    fn attach_group(&self, folio: &Folio, group: Option<GroupId>) {
        let Some(group) = group else {
            return;
        };
        if folio.private() == FolioPrivate::Group(group) {
            return;
        }
        if let FolioPrivate::Group(old) = folio.private() {
            self.put_group(old, 1);
        }
        self.get_group(group);
        folio.set_private(FolioPrivate::Group(group));
    }

    // ── Group references ────────────────────────────────────────────────────

    pub fn get_group(&self, group: GroupId) {
        *self.group_refs.lock().entry(group).or_insert(0) += 1;
    }

    /// Drop `n` references on `group`.
    pub fn put_group(&self, group: GroupId, n: usize) {
        let mut refs = self.group_refs.lock();
        if let Some(count) = refs.get_mut(&group) {
            *count = count.saturating_sub(n);
            if *count == 0 {
                refs.remove(&group);
                tracing::debug!(target: "nwb::page", %group, "group_released");
            }
        }
    }

    /// Outstanding references on `group`.
    #[must_use]
    pub fn group_refs(&self, group: GroupId) -> usize {
        self.group_refs.lock().get(&group).copied().unwrap_or(0)
    }

    // ── Error channel ───────────────────────────────────────────────────────

    /// Record a write-back error for the next fsync to report.
    ///
    /// The first error sticks until it is consumed.
    pub fn set_error(&self, err: &WbError) {
        let mut slot = self.wb_err.lock();
        if slot.is_none() {
            tracing::warn!(target: "nwb::page", error = %err, "mapping_error_recorded");
            *slot = Some(err.clone());
        }
    }

    /// Consume the pending write-back error, if any.
    pub fn take_error(&self) -> Option<WbError> {
        self.wb_err.lock().take()
    }

    // ── Write-back iteration ────────────────────────────────────────────────

    /// Yield the next dirty folio for this pass, locked and with its dirty
    /// bit cleared for I/O.
    ///
    /// Folios already under writeback are skipped in `SyncMode::None` and
    /// waited on in `SyncMode::All`. Returns `None` once the range or the
    /// page budget is exhausted.
    pub fn next_writeback_folio(&self, wbc: &mut WritebackControl) -> Option<Arc<Folio>> {
        loop {
            if wbc.budget_exhausted() || wbc.next >= wbc.range_end {
                return None;
            }
            let candidate = {
                let folios = self.folios.read();
                let start = self.folio_base(wbc.next.0);
                folios
                    .range(start..wbc.range_end.0)
                    .map(|(_, folio)| folio)
                    .find(|folio| folio.pos() >= wbc.next && folio.is_dirty())
                    .cloned()
            };
            let folio = candidate?;
            wbc.next = folio.end();

            folio.lock();
            if !folio.is_dirty() {
                folio.unlock();
                continue;
            }
            if folio.is_writeback() {
                if wbc.sync_mode == SyncMode::None {
                    folio.unlock();
                    wbc.pages_skipped += 1;
                    continue;
                }
                folio.wait_writeback();
            }
            if !folio.clear_dirty_for_io() {
                folio.unlock();
                continue;
            }
            wbc.nr_to_write -= 1;
            return Some(folio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> Mapping {
        Mapping::new(FolioSize::BASE)
    }

    #[test]
    fn buffered_write_dirties_each_touched_folio() {
        let m = mapping();
        let touched = m.write(FilePos(4000), &[1_u8; 200], Some(GroupId(1)));
        assert_eq!(touched.len(), 2);
        assert_eq!(m.i_size(), 4200);
        assert_eq!(m.nr_dirty(), 2);
        assert_eq!(m.group_refs(GroupId(1)), 2);
    }

    #[test]
    fn writeback_iter_yields_locked_folios_in_order() {
        let m = mapping();
        m.write(FilePos(8192), &[2_u8; 4096], None);
        m.write(FilePos(0), &[1_u8; 4096], None);
        let mut wbc = WritebackControl::new(SyncMode::All);

        let first = m.next_writeback_folio(&mut wbc).expect("first");
        assert_eq!(first.pos(), FilePos(0));
        assert!(first.is_locked());
        assert!(!first.is_dirty());
        first.unlock();

        let second = m.next_writeback_folio(&mut wbc).expect("second");
        assert_eq!(second.pos(), FilePos(8192));
        second.unlock();

        assert!(m.next_writeback_folio(&mut wbc).is_none());
    }

    #[test]
    fn nonsync_pass_skips_folios_under_writeback() {
        let m = mapping();
        let touched = m.write(FilePos(0), &[1_u8; 4096], None);
        touched[0].start_writeback();
        let mut wbc = WritebackControl::new(SyncMode::None);
        assert!(m.next_writeback_folio(&mut wbc).is_none());
        assert_eq!(wbc.pages_skipped, 1);
        assert!(touched[0].is_dirty());
    }

    #[test]
    fn page_budget_limits_nonsync_pass() {
        let m = mapping();
        m.write(FilePos(0), &[1_u8; 3 * 4096], None);
        let mut wbc = WritebackControl::new(SyncMode::None).with_nr_to_write(2);
        let mut seen = 0;
        while let Some(folio) = m.next_writeback_folio(&mut wbc) {
            folio.unlock();
            seen += 1;
        }
        assert_eq!(seen, 2);
    }

    #[test]
    fn streaming_write_tracks_valid_window() {
        let m = mapping();
        let folio = m
            .write_streaming(FilePos(100), &[9_u8; 50], None)
            .expect("streaming");
        let info = folio.streaming().expect("streaming info");
        assert_eq!((info.dirty_offset, info.dirty_len), (100, 50));

        m.write_streaming(FilePos(200), &[9_u8; 10], None)
            .expect("extend");
        let info = folio.streaming().expect("streaming info");
        assert_eq!((info.dirty_offset, info.dirty_len), (100, 110));
    }

    #[test]
    fn streaming_write_rejects_folio_crossing() {
        let m = mapping();
        let err = m
            .write_streaming(FilePos(4000), &[0_u8; 200], None)
            .unwrap_err();
        assert!(matches!(err, WbError::InvalidRequest(_)));
    }

    #[test]
    fn first_error_sticks_until_taken() {
        let m = mapping();
        m.set_error(&WbError::NoMemory);
        m.set_error(&WbError::Cancelled);
        assert!(matches!(m.take_error(), Some(WbError::NoMemory)));
        assert!(m.take_error().is_none());
    }

    #[test]
    fn put_group_saturates() {
        let m = mapping();
        m.get_group(GroupId(5));
        m.put_group(GroupId(5), 3);
        assert_eq!(m.group_refs(GroupId(5)), 0);
    }
}
