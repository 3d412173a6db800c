//! Per-inode write-back context.

use crate::backend::{CacheProvider, WriteBackend};
use crate::config::WriteConfig;
use crate::stats::WriteStats;
use nwb_error::Result;
use nwb_page::Mapping;
use nwb_types::{DebugId, GroupId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Everything the engine needs to know about one file.
///
/// Holds the pagecache mapping, the backends, the tuning, and the
/// write-back lock that serializes write-back passes on this file.
pub struct NetfsInode {
    mapping: Arc<Mapping>,
    upload: Arc<dyn WriteBackend>,
    cache: Option<Arc<dyn CacheProvider>>,
    config: WriteConfig,
    stats: Arc<WriteStats>,
    pub(crate) wb_lock: Mutex<()>,
    writeback_group: Mutex<Option<GroupId>>,
    next_debug_id: AtomicU32,
}

impl fmt::Debug for NetfsInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetfsInode")
            .field("i_size", &self.mapping.i_size())
            .field("cache", &self.cache.is_some())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl NetfsInode {
    pub fn new(
        mapping: Arc<Mapping>,
        upload: Arc<dyn WriteBackend>,
        config: WriteConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            mapping,
            upload,
            cache: None,
            config,
            stats: Arc::new(WriteStats::new()),
            wb_lock: Mutex::new(()),
            writeback_group: Mutex::new(None),
            next_debug_id: AtomicU32::new(1),
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheProvider>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.mapping
    }

    #[must_use]
    pub fn config(&self) -> &WriteConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<WriteStats> {
        &self.stats
    }

    pub(crate) fn upload(&self) -> &Arc<dyn WriteBackend> {
        &self.upload
    }

    pub(crate) fn cache(&self) -> Option<&Arc<dyn CacheProvider>> {
        self.cache.as_ref()
    }

    /// Group that new write-back requests are built for. Dirty pages tagged
    /// with any other group are left for a later pass.
    #[must_use]
    pub fn writeback_group(&self) -> Option<GroupId> {
        *self.writeback_group.lock()
    }

    pub fn set_writeback_group(&self, group: Option<GroupId>) {
        *self.writeback_group.lock() = group;
    }

    pub(crate) fn next_debug_id(&self) -> DebugId {
        DebugId(self.next_debug_id.fetch_add(1, Ordering::Relaxed))
    }
}
