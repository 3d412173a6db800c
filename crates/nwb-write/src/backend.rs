//! Seams to the network filesystem and the local cache.

use crate::request::WriteRequest;
use crate::subrequest::Subrequest;
use nwb_error::Result;
use nwb_types::{DebugId, FilePos};
use std::sync::Arc;

/// Size limits for the subrequest currently being prepared on a stream.
///
/// Seeded by the engine (server `wsize` for upload, unbounded for the
/// cache) and narrowed by [`WriteBackend::prepare_write`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamLimits {
    pub max_len: usize,
    pub max_segs: usize,
    /// Bytes the folio being planned still offers past the subrequest's
    /// start. Read-only hint for backends that round writes up; zero when
    /// no pagecache folio is being planned.
    pub extendable_to: usize,
}

impl StreamLimits {
    #[must_use]
    pub fn unbounded() -> Self {
        Self {
            max_len: usize::MAX,
            max_segs: usize::MAX,
            extendable_to: 0,
        }
    }

    pub(crate) fn clamp(self) -> Self {
        Self {
            max_len: self.max_len.max(1),
            max_segs: self.max_segs.max(1),
            ..self
        }
    }
}

/// Destination that performs the actual writes for one stream.
///
/// `issue_write` may complete synchronously (by calling
/// [`Subrequest::terminated`] before it returns) or hand the subrequest to
/// another thread. Either way `terminated` must be called exactly once per
/// dispatch.
pub trait WriteBackend: Send + Sync {
    /// Adjust limits for a freshly created subrequest.
    ///
    /// An error fails the subrequest; it is still queued and completes with
    /// that error when dispatched.
    fn prepare_write(&self, subreq: &Subrequest, limits: &mut StreamLimits) -> Result<()> {
        let _ = (subreq, limits);
        Ok(())
    }

    /// Start writing `subreq`.
    fn issue_write(&self, subreq: Arc<Subrequest>);

    /// Called once per write-back pass, before the first page that needs
    /// uploading. Makes the upload stream available unless overridden.
    fn begin_writeback(&self, wreq: &WriteRequest) {
        wreq.set_upload_avail(true);
    }
}

/// Local persistent cache in front of the server.
pub trait CacheProvider: Send + Sync {
    fn is_enabled(&self) -> bool {
        true
    }

    /// Bind a cache write operation for a new request.
    fn begin_write_operation(
        &self,
        debug_id: DebugId,
        start: FilePos,
    ) -> Result<Arc<dyn WriteBackend>>;
}
