#![forbid(unsafe_code)]

use nwb_error::{Result, WbError};
use nwb_page::{Folio, Mapping, WritebackControl};
use nwb_types::{DebugId, FilePos, FolioSize, GroupId, IoOrigin, SyncMode};
use nwb_write::{
    CacheProvider, Kiocb, NetfsInode, Subrequest, WriteBackend, WriteConfig, WriteOutcome,
    WriteRequest, copy_to_cache, perform_writethrough, write_unbuffered, writepages,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

// ── In-memory destination ──────────────────────────────────────────────────

#[derive(Debug, Default)]
struct ServerFile {
    bytes: Mutex<Vec<u8>>,
    dispatched: Mutex<Vec<(u64, usize)>>,
    /// Request `issued_to` seen at each dispatch.
    watermarks: Mutex<Vec<u64>>,
    pending: Mutex<Vec<Arc<Subrequest>>>,
    fail_with: Mutex<Option<WbError>>,
    deferred: bool,
    refuse_upload: bool,
    begin_calls: AtomicUsize,
    peak_pending: AtomicUsize,
}

impl ServerFile {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn deferred() -> Arc<Self> {
        Arc::new(Self {
            deferred: true,
            ..Self::default()
        })
    }

    fn refusing_upload() -> Arc<Self> {
        Arc::new(Self {
            refuse_upload: true,
            ..Self::default()
        })
    }

    fn dispatched(&self) -> Vec<(u64, usize)> {
        self.dispatched.lock().clone()
    }

    fn watermarks(&self) -> Vec<u64> {
        self.watermarks.lock().clone()
    }

    /// The request behind the oldest held-back write, if still alive.
    fn in_flight_request(&self) -> Option<Arc<WriteRequest>> {
        self.pending.lock().first().and_then(|subreq| subreq.request())
    }

    fn contents(&self, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let mut out = bytes[..len.min(bytes.len())].to_vec();
        out.resize(len, 0);
        out
    }

    fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let n = pending.len();
        for subreq in pending {
            self.finish(&subreq);
        }
        n
    }

    fn finish(&self, subreq: &Arc<Subrequest>) {
        if let Some(err) = self.fail_with.lock().clone() {
            subreq.terminated(Err(err));
            return;
        }
        let data = subreq.copy_data();
        let at = usize::try_from(subreq.write_pos().0).expect("offset fits");
        let mut bytes = self.bytes.lock();
        if bytes.len() < at + data.len() {
            bytes.resize(at + data.len(), 0);
        }
        bytes[at..at + data.len()].copy_from_slice(&data);
        drop(bytes);
        subreq.terminated(Ok(data.len()));
    }
}

impl WriteBackend for ServerFile {
    fn issue_write(&self, subreq: Arc<Subrequest>) {
        self.dispatched
            .lock()
            .push((subreq.write_pos().0, subreq.io_iter().count()));
        if let Some(wreq) = subreq.request() {
            self.watermarks.lock().push(wreq.issued_to().0);
        }
        if self.deferred {
            let mut pending = self.pending.lock();
            pending.push(subreq);
            self.peak_pending.fetch_max(pending.len(), Ordering::SeqCst);
        } else {
            self.finish(&subreq);
        }
    }

    fn begin_writeback(&self, wreq: &WriteRequest) {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refuse_upload {
            wreq.set_upload_avail(true);
        }
    }
}

#[derive(Debug)]
struct LocalCache(Arc<ServerFile>);

impl CacheProvider for LocalCache {
    fn begin_write_operation(
        &self,
        _debug_id: DebugId,
        _start: FilePos,
    ) -> Result<Arc<dyn WriteBackend>> {
        Ok(Arc::clone(&self.0) as Arc<dyn WriteBackend>)
    }
}

fn inode(config: WriteConfig, server: &Arc<ServerFile>) -> NetfsInode {
    NetfsInode::new(
        Arc::new(Mapping::new(FolioSize::BASE)),
        Arc::clone(server) as Arc<dyn WriteBackend>,
        config,
    )
    .expect("inode")
}

fn cached_inode(
    config: WriteConfig,
    server: &Arc<ServerFile>,
    cache: &Arc<ServerFile>,
) -> NetfsInode {
    inode(config, server).with_cache(Arc::new(LocalCache(Arc::clone(cache))))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| u8::try_from(i % 251).unwrap_or(0) ^ seed)
        .collect()
}

fn assert_all_clean(mapping: &Mapping) {
    for folio in mapping.folios() {
        assert!(!folio.is_dirty(), "folio at {} still dirty", folio.pos());
        assert!(!folio.is_writeback(), "folio at {} under writeback", folio.pos());
        assert!(!folio.is_locked(), "folio at {} locked", folio.pos());
    }
}

// ── Whole-file write-back ──────────────────────────────────────────────────

#[test]
fn two_pages_split_for_server_but_not_for_cache() {
    let server = ServerFile::new();
    let cache = ServerFile::new();
    let cfg = WriteConfig {
        wsize: 4096,
        ..WriteConfig::default()
    };
    let inode = cached_inode(cfg, &server, &cache);
    let data = pattern(8192, 0x21);
    inode.mapping().write(FilePos(0), &data, None);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.dispatched(), vec![(0, 4096), (4096, 4096)]);
    assert_eq!(cache.dispatched(), vec![(0, 8192)]);
    assert_eq!(server.contents(8192), data);
    assert_eq!(cache.contents(8192), data);
    assert_eq!(server.begin_calls.load(Ordering::SeqCst), 1);
    assert_all_clean(inode.mapping());
    assert!(inode.mapping().take_error().is_none());
}

#[test]
fn streaming_page_is_uploaded_but_never_cached() {
    let server = ServerFile::new();
    let cache = ServerFile::new();
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    let folio = inode
        .mapping()
        .write_streaming(FilePos(100), &[0xAB; 50], None)
        .expect("streaming write");
    assert_eq!(inode.mapping().i_size(), 150);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.dispatched(), vec![(100, 50)]);
    assert!(cache.dispatched().is_empty());
    assert_eq!(&server.contents(150)[100..], &[0xAB; 50][..]);
    assert!(folio.streaming().is_none(), "streaming record detached");
    assert_all_clean(inode.mapping());
}

#[test]
fn issue_watermark_only_advances_and_ends_at_request_end() {
    let server = ServerFile::deferred();
    let cfg = WriteConfig {
        wsize: 4096,
        ..WriteConfig::default()
    };
    let inode = inode(cfg, &server);
    inode.mapping().write(FilePos(0), &[7; 4 * 4096], None);

    let mut wbc =
        WritebackControl::new(SyncMode::All).with_range(FilePos(4096), FilePos(4 * 4096));
    writepages(&inode, &mut wbc).expect("writepages");

    let wreq = server.in_flight_request().expect("request held by its writes");
    assert!(wreq.is_all_queued());
    assert_eq!(wreq.start(), FilePos(4096));
    assert_eq!(wreq.len(), 3 * 4096);
    assert_eq!(wreq.issued_to().0, wreq.start().0 + wreq.len());

    let marks = server.watermarks();
    assert_eq!(marks.len(), 3);
    assert!(marks.windows(2).all(|w| w[0] <= w[1]), "watermark went back: {marks:?}");

    assert_eq!(server.complete_pending(), 3);
    assert!(wreq.is_done());
    assert_eq!(wreq.result().expect("result").expect("write ok"), 3 * 4096);
    assert_eq!(inode.mapping().nr_dirty(), 1, "page outside the range untouched");
}

#[test]
fn page_straddling_eof_is_clipped_and_zero_filled() {
    let server = ServerFile::new();
    let cache = ServerFile::new();
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    let folio = inode.mapping().write(FilePos(0), &[0xEE; 4096], None)[0].clone();
    inode.mapping().set_i_size(3000);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.dispatched(), vec![(0, 3000)]);
    assert_eq!(cache.dispatched(), vec![(0, 3000)]);
    assert!(folio.to_vec()[3000..].iter().all(|b| *b == 0));
    assert_all_clean(inode.mapping());
}

#[test]
fn upload_unavailable_still_fills_cache() {
    let server = ServerFile::refusing_upload();
    let cache = ServerFile::new();
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    let data = pattern(4096, 3);
    inode.mapping().write(FilePos(0), &data, None);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert!(server.dispatched().is_empty());
    assert_eq!(cache.dispatched(), vec![(0, 4096)]);
    assert_eq!(cache.contents(4096), data);
    assert_all_clean(inode.mapping());
}

#[test]
fn nowhere_to_write_finishes_pages_without_io() {
    let server = ServerFile::refusing_upload();
    let inode = inode(WriteConfig::default(), &server);
    inode.mapping().write(FilePos(0), &[1; 8192], None);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert!(server.dispatched().is_empty());
    assert_all_clean(inode.mapping());
}

#[test]
fn foreign_group_page_is_redirtied_for_a_later_pass() {
    let server = ServerFile::new();
    let inode = inode(WriteConfig::default(), &server);
    inode.set_writeback_group(Some(GroupId(1)));
    let mapping = inode.mapping();
    mapping.write(FilePos(0), &[1; 4096], Some(GroupId(1)));
    mapping.write(FilePos(4096), &[2; 4096], Some(GroupId(2)));

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.dispatched(), vec![(0, 4096)]);
    assert_eq!(mapping.nr_dirty(), 1);
    let deferred = mapping.folio(FilePos(4096)).expect("second page");
    assert!(deferred.is_dirty());
    assert!(!deferred.is_writeback());
    assert_eq!(mapping.group_refs(GroupId(1)), 0);
    assert_eq!(mapping.group_refs(GroupId(2)), 1);

    // The next pass, built for the second group, picks it up.
    inode.set_writeback_group(Some(GroupId(2)));
    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("second pass");
    assert_eq!(server.dispatched(), vec![(0, 4096), (4096, 4096)]);
    assert_eq!(mapping.group_refs(GroupId(2)), 0);
    assert_all_clean(mapping);
}

#[test]
fn copy_to_cache_page_skips_server() {
    let server = ServerFile::new();
    let cache = ServerFile::new();
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    let mapping = inode.mapping();
    let folio = mapping.grab_folio(FilePos(0));
    folio.write_at(0, &[0x44; 4096]);
    folio.set_uptodate(true);
    mapping.set_i_size(4096);
    mapping.mark_copy_to_cache(&folio);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert!(server.dispatched().is_empty());
    assert_eq!(server.begin_calls.load(Ordering::SeqCst), 0);
    assert_eq!(cache.dispatched(), vec![(0, 4096)]);
    assert_all_clean(mapping);
}

#[test]
fn freshly_read_pages_are_copied_to_cache_only() {
    let server = ServerFile::new();
    let cache = ServerFile::deferred();
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    inode.mapping().set_i_size(6000);
    let first = pattern(4096, 0x10);
    let second = pattern(4096, 0x20);
    let folios = vec![
        Arc::new(Folio::with_bytes(FilePos(0), first.clone())),
        Arc::new(Folio::with_bytes(FilePos(4096), second.clone())),
    ];

    copy_to_cache(&inode, &folios).expect("copy");
    assert!(folios.iter().all(|f| f.is_writeback()), "held until the cache confirms");
    assert_eq!(cache.dispatched(), vec![(0, 6000)]);

    assert_eq!(cache.complete_pending(), 1);
    assert!(folios.iter().all(|f| !f.is_writeback()));
    let mut expected = first;
    expected.extend_from_slice(&second[..6000 - 4096]);
    assert_eq!(cache.contents(6000), expected);
    assert!(server.dispatched().is_empty());
    assert_eq!(server.begin_calls.load(Ordering::SeqCst), 0);
    assert_eq!(inode.stats().snapshot().wh_copy_to_cache, 1);
}

#[test]
fn copy_without_cache_does_nothing() {
    let server = ServerFile::new();
    let inode = inode(WriteConfig::default(), &server);
    let folio = Arc::new(Folio::with_bytes(FilePos(0), vec![1; 4096]));
    inode.mapping().set_i_size(4096);

    copy_to_cache(&inode, &[Arc::clone(&folio)]).expect("no-op");
    assert!(!folio.is_writeback());
    assert!(server.dispatched().is_empty());
    assert_eq!(inode.stats().snapshot().wh_copy_to_cache, 0);
}

#[test]
fn permanent_server_failure_lands_on_mapping() {
    let server = ServerFile::new();
    *server.fail_with.lock() = Some(WbError::Io(std::io::Error::other("quota exceeded")));
    let inode = inode(WriteConfig::default(), &server);
    inode.mapping().write(FilePos(0), &[9; 8192], None);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("pass itself succeeds");

    assert_eq!(server.dispatched().len(), 1, "non-transient errors are not retried");
    assert!(matches!(inode.mapping().take_error(), Some(WbError::Io(_))));
    assert_all_clean(inode.mapping());
}

#[test]
fn cache_failure_does_not_fail_the_write() {
    let server = ServerFile::new();
    let cache = ServerFile::new();
    *cache.fail_with.lock() = Some(WbError::Io(std::io::Error::other("cache full")));
    let inode = cached_inode(WriteConfig::default(), &server, &cache);
    let data = pattern(4096, 7);
    inode.mapping().write(FilePos(0), &data, None);

    let mut wbc = WritebackControl::new(SyncMode::All);
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.contents(4096), data);
    assert!(inode.mapping().take_error().is_none());
    assert_all_clean(inode.mapping());
}

#[test]
fn range_limited_pass_leaves_other_pages_dirty() {
    let server = ServerFile::new();
    let inode = inode(WriteConfig::default(), &server);
    inode.mapping().write(FilePos(0), &[5; 4 * 4096], None);

    let mut wbc =
        WritebackControl::new(SyncMode::All).with_range(FilePos(4096), FilePos(3 * 4096));
    writepages(&inode, &mut wbc).expect("writepages");

    assert_eq!(server.dispatched(), vec![(4096, 8192)]);
    assert_eq!(inode.mapping().nr_dirty(), 2);
}

// ── Write-through and unbuffered ───────────────────────────────────────────

#[test]
fn writethrough_lands_on_server_and_cleans_pages() {
    let server = ServerFile::new();
    let inode = inode(WriteConfig::default(), &server);
    let data = pattern(10_000, 0x5C);

    let outcome =
        perform_writethrough(&inode, Kiocb::sync(FilePos(0)), &data).expect("writethrough");

    assert_eq!(outcome, WriteOutcome::Written(10_000));
    assert_eq!(server.contents(10_000), data);
    assert_eq!(inode.mapping().i_size(), 10_000);
    assert_all_clean(inode.mapping());
    assert_eq!(inode.stats().snapshot().wh_writethrough, 1);
}

#[test]
fn async_unbuffered_write_reports_through_callback() {
    let server = ServerFile::deferred();
    let inode = inode(WriteConfig::default(), &server);
    let (tx, rx) = mpsc::channel();
    let iocb = Kiocb::with_completion(
        FilePos(0),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let outcome =
        write_unbuffered(&inode, iocb, &[3; 5000], IoOrigin::UnbufferedWrite).expect("queued");
    assert_eq!(outcome, WriteOutcome::Queued);
    assert!(rx.try_recv().is_err(), "nothing completed yet");

    assert_eq!(server.complete_pending(), 1);
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion delivered");
    assert_eq!(result.expect("write ok"), 5000);
}

#[test]
fn async_request_outlives_its_submitter() {
    let server = ServerFile::deferred();
    let cfg = WriteConfig {
        wsize: 2048,
        ..WriteConfig::default()
    };
    let inode = inode(cfg, &server);
    let data = pattern(5000, 0x3D);
    let (tx, rx) = mpsc::channel();
    let iocb = Kiocb::with_completion(
        FilePos(0),
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );

    let outcome = write_unbuffered(&inode, iocb, &data, IoOrigin::DioWrite).expect("queued");
    assert_eq!(outcome, WriteOutcome::Queued);

    // The submitter kept nothing; only the in-flight writes hold the request.
    let wreq = server.in_flight_request().expect("request kept alive");
    assert!(wreq.is_all_queued());
    assert!(!wreq.is_done());
    assert_eq!(wreq.issued_to().0, wreq.start().0 + wreq.len());
    drop(wreq);

    assert_eq!(server.complete_pending(), 3);
    let result = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("completion delivered");
    assert_eq!(result.expect("write ok"), 5000);
    assert_eq!(server.contents(5000), data);
}

#[test]
fn backpressure_bounds_in_flight_subrequests() {
    let server = ServerFile::deferred();
    let cfg = WriteConfig {
        wsize: 1024,
        max_in_flight: 2,
        ..WriteConfig::default()
    };
    let inode = Arc::new(inode(cfg, &server));
    let data = pattern(8 * 1024, 1);

    let writer = {
        let inode = Arc::clone(&inode);
        let data = data.clone();
        std::thread::spawn(move || {
            write_unbuffered(&inode, Kiocb::sync(FilePos(0)), &data, IoOrigin::DioWrite)
        })
    };
    while !writer.is_finished() {
        server.complete_pending();
        std::thread::sleep(Duration::from_millis(1));
    }
    let outcome = writer.join().expect("writer thread").expect("dio");

    assert_eq!(outcome, WriteOutcome::Written(8 * 1024));
    assert_eq!(server.contents(8 * 1024), data);
    assert!(server.peak_pending.load(Ordering::SeqCst) <= 2);
    assert_eq!(server.dispatched().len(), 8);
}

#[test]
fn single_payload_written_from_offset_zero() {
    let server = ServerFile::new();
    let inode = inode(WriteConfig::default(), &server);
    let folios = vec![
        Arc::new(Folio::with_bytes(FilePos(0), vec![1; 4096])),
        Arc::new(Folio::with_bytes(FilePos(4096), vec![2; 4096])),
    ];
    let wbc = WritebackControl::new(SyncMode::All);
    nwb_write::writeback_single(&inode, &wbc, &folios, 6000).expect("single");

    assert_eq!(server.dispatched(), vec![(0, 6000)]);
    let mut expected = vec![1; 4096];
    expected.extend(std::iter::repeat_n(2, 6000 - 4096));
    assert_eq!(server.contents(6000), expected);
}
