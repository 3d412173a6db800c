//! Lock-free write-back counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-inode write-issue counters.
#[derive(Debug, Default)]
pub struct WriteStats {
    wh_writepages: AtomicU64,
    wh_writethrough: AtomicU64,
    wh_unbuffered: AtomicU64,
    wh_copy_to_cache: AtomicU64,
    wh_upload: AtomicU64,
    wh_write: AtomicU64,
    wh_retry_write_subreq: AtomicU64,
    wh_prepare_failed: AtomicU64,
    wb_lock_skip: AtomicU64,
    wb_lock_wait: AtomicU64,
}

/// Point-in-time snapshot of [`WriteStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteStatsSnapshot {
    /// Write-back passes started (whole-file and monolithic).
    pub wh_writepages: u64,
    pub wh_writethrough: u64,
    pub wh_unbuffered: u64,
    /// Copy-to-cache passes over freshly read folios.
    pub wh_copy_to_cache: u64,
    /// Upload subrequests prepared.
    pub wh_upload: u64,
    /// Cache subrequests prepared.
    pub wh_write: u64,
    pub wh_retry_write_subreq: u64,
    pub wh_prepare_failed: u64,
    /// Opportunistic passes skipped because the write-back lock was busy.
    pub wb_lock_skip: u64,
    /// Data-integrity passes that had to wait for the write-back lock.
    pub wb_lock_wait: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl WriteStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_writepages(&self) {
        bump(&self.wh_writepages);
    }

    pub(crate) fn record_writethrough(&self) {
        bump(&self.wh_writethrough);
    }

    pub(crate) fn record_unbuffered(&self) {
        bump(&self.wh_unbuffered);
    }

    pub(crate) fn record_copy_to_cache(&self) {
        bump(&self.wh_copy_to_cache);
    }

    pub(crate) fn record_upload(&self) {
        bump(&self.wh_upload);
    }

    pub(crate) fn record_cache_write(&self) {
        bump(&self.wh_write);
    }

    pub(crate) fn record_retry(&self) {
        bump(&self.wh_retry_write_subreq);
    }

    pub(crate) fn record_prepare_failed(&self) {
        bump(&self.wh_prepare_failed);
    }

    pub(crate) fn record_lock_skip(&self) {
        bump(&self.wb_lock_skip);
    }

    pub(crate) fn record_lock_wait(&self) {
        bump(&self.wb_lock_wait);
    }

    #[must_use]
    pub fn snapshot(&self) -> WriteStatsSnapshot {
        WriteStatsSnapshot {
            wh_writepages: self.wh_writepages.load(Ordering::Relaxed),
            wh_writethrough: self.wh_writethrough.load(Ordering::Relaxed),
            wh_unbuffered: self.wh_unbuffered.load(Ordering::Relaxed),
            wh_copy_to_cache: self.wh_copy_to_cache.load(Ordering::Relaxed),
            wh_upload: self.wh_upload.load(Ordering::Relaxed),
            wh_write: self.wh_write.load(Ordering::Relaxed),
            wh_retry_write_subreq: self.wh_retry_write_subreq.load(Ordering::Relaxed),
            wh_prepare_failed: self.wh_prepare_failed.load(Ordering::Relaxed),
            wb_lock_skip: self.wb_lock_skip.load(Ordering::Relaxed),
            wb_lock_wait: self.wb_lock_wait.load(Ordering::Relaxed),
        }
    }
}
