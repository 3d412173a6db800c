#![forbid(unsafe_code)]
//! Test tooling for the write-back engine: in-memory destinations that
//! record every dispatch, and a runner for JSON write-back scenarios.

use anyhow::{Context, Result, bail};
use nwb_error::WbError;
use nwb_page::{Mapping, WritebackControl};
use nwb_types::{DebugId, FilePos, FolioSize, GroupId, IoOrigin, SyncMode, u64_to_len};
use nwb_write::{
    CacheProvider, Kiocb, NetfsInode, StreamLimits, Subrequest, WriteBackend, WriteConfig,
    WriteOutcome, WriteRequest, WriteStatsSnapshot, perform_writethrough, write_unbuffered,
    writepages,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// ── Recording destination ──────────────────────────────────────────────────

/// One dispatch as seen by a [`RecordingBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub pos: u64,
    pub len: usize,
    pub retry: u32,
}

/// How a [`RecordingBackend`] should answer the next dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fault {
    /// Fail with a retryable error.
    Transient,
    /// Fail with an error the collector will not retry.
    Permanent,
    /// Accept only this many bytes.
    Short(usize),
}

impl Fault {
    fn error(self, pos: u64) -> WbError {
        match self {
            Self::Transient | Self::Short(_) => WbError::WriteFailed {
                pos,
                detail: "injected transient failure".to_owned(),
            },
            Self::Permanent => WbError::Io(std::io::Error::other("injected permanent failure")),
        }
    }
}

/// In-memory file that records each subrequest it is handed and applies
/// the data when the write completes.
///
/// Completes inline unless built with [`RecordingBackend::deferred`], in
/// which case writes wait for [`RecordingBackend::complete_pending`].
#[derive(Debug, Default)]
pub struct RecordingBackend {
    bytes: Mutex<Vec<u8>>,
    dispatches: Mutex<Vec<Dispatch>>,
    pending: Mutex<Vec<Arc<Subrequest>>>,
    faults: Mutex<VecDeque<Fault>>,
    max_len: Option<usize>,
    deferred: bool,
    refuse_upload: AtomicBool,
    begin_calls: AtomicUsize,
}

impl RecordingBackend {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn deferred() -> Arc<Self> {
        Arc::new(Self {
            deferred: true,
            ..Self::default()
        })
    }

    /// A destination that caps every subrequest at `max_len` bytes.
    #[must_use]
    pub fn with_max_len(max_len: usize) -> Arc<Self> {
        Arc::new(Self {
            max_len: Some(max_len),
            ..Self::default()
        })
    }

    /// Leave the upload stream unavailable when a pass begins.
    pub fn refuse_upload(&self, refuse: bool) {
        self.refuse_upload.store(refuse, Ordering::SeqCst);
    }

    pub fn inject(&self, fault: Fault) {
        self.faults.lock().push_back(fault);
    }

    #[must_use]
    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().clone()
    }

    #[must_use]
    pub fn begin_calls(&self) -> usize {
        self.begin_calls.load(Ordering::SeqCst)
    }

    /// The first `len` bytes of the file, zero-padded.
    #[must_use]
    pub fn contents(&self, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock();
        let mut out = bytes[..len.min(bytes.len())].to_vec();
        out.resize(len, 0);
        out
    }

    /// Complete every held write. Returns how many there were.
    pub fn complete_pending(&self) -> usize {
        let pending = std::mem::take(&mut *self.pending.lock());
        let n = pending.len();
        for subreq in pending {
            self.complete(&subreq);
        }
        n
    }

    fn complete(&self, subreq: &Arc<Subrequest>) {
        let fault = self.faults.lock().pop_front();
        let mut data = subreq.copy_data();
        match fault {
            Some(Fault::Short(n)) if n < data.len() => data.truncate(n),
            Some(fault @ (Fault::Transient | Fault::Permanent)) => {
                subreq.terminated(Err(fault.error(subreq.write_pos().0)));
                return;
            }
            _ => {}
        }
        let at = u64_to_len(subreq.write_pos().0);
        let mut bytes = self.bytes.lock();
        if bytes.len() < at + data.len() {
            bytes.resize(at + data.len(), 0);
        }
        bytes[at..at + data.len()].copy_from_slice(&data);
        drop(bytes);
        subreq.terminated(Ok(data.len()));
    }
}

impl WriteBackend for RecordingBackend {
    fn prepare_write(&self, _subreq: &Subrequest, limits: &mut StreamLimits) -> nwb_error::Result<()> {
        if let Some(max_len) = self.max_len {
            limits.max_len = limits.max_len.min(max_len);
        }
        Ok(())
    }

    fn issue_write(&self, subreq: Arc<Subrequest>) {
        self.dispatches.lock().push(Dispatch {
            pos: subreq.write_pos().0,
            len: subreq.io_iter().count(),
            retry: subreq.retry_count(),
        });
        if self.deferred {
            self.pending.lock().push(subreq);
        } else {
            self.complete(&subreq);
        }
    }

    fn begin_writeback(&self, wreq: &WriteRequest) {
        self.begin_calls.fetch_add(1, Ordering::SeqCst);
        if !self.refuse_upload.load(Ordering::SeqCst) {
            wreq.set_upload_avail(true);
        }
    }
}

/// Cache provider backed by a [`RecordingBackend`].
#[derive(Debug)]
pub struct MemoryCacheProvider {
    backend: Arc<RecordingBackend>,
    enabled: AtomicBool,
    fail_bind: AtomicBool,
}

impl MemoryCacheProvider {
    #[must_use]
    pub fn new(backend: Arc<RecordingBackend>) -> Self {
        Self {
            backend,
            enabled: AtomicBool::new(true),
            fail_bind: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<RecordingBackend> {
        &self.backend
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make binding fail, as when the cache volume is withdrawn.
    pub fn set_fail_bind(&self, fail: bool) {
        self.fail_bind.store(fail, Ordering::SeqCst);
    }
}

impl CacheProvider for MemoryCacheProvider {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn begin_write_operation(
        &self,
        debug_id: DebugId,
        _start: FilePos,
    ) -> nwb_error::Result<Arc<dyn WriteBackend>> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(WbError::CacheUnavailable(format!(
                "cache withdrawn for {debug_id}"
            )));
        }
        Ok(Arc::clone(&self.backend) as Arc<dyn WriteBackend>)
    }
}

// ── Scenarios ──────────────────────────────────────────────────────────────

/// A scripted sequence of writes and write-back passes against one file,
/// with the dispatches it must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub config: WriteConfig,
    /// Bind a local cache.
    #[serde(default)]
    pub cache: bool,
    /// Fail cache binding.
    #[serde(default)]
    pub cache_bind_fails: bool,
    /// Per-subrequest cap imposed by the server backend.
    #[serde(default)]
    pub upload_max_len: Option<usize>,
    /// Keep the upload stream unavailable.
    #[serde(default)]
    pub refuse_upload: bool,
    /// Faults the server applies to successive dispatches.
    #[serde(default)]
    pub upload_faults: Vec<Fault>,
    pub steps: Vec<Step>,
    pub expect: Expectation,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Buffered write of `len` bytes of `fill` at `pos`.
    Write {
        pos: u64,
        len: usize,
        fill: u8,
        #[serde(default)]
        group: Option<u64>,
    },
    /// Write into a page that was never read, leaving it partially valid.
    StreamingWrite {
        pos: u64,
        len: usize,
        fill: u8,
        #[serde(default)]
        group: Option<u64>,
    },
    /// Mark the (clean, up-to-date) page at `pos` for copying to the cache.
    CopyToCache { pos: u64, fill: u8 },
    SetSize { size: u64 },
    SetGroup { group: Option<u64> },
    Writepages {
        #[serde(default)]
        opportunistic: bool,
    },
    Writethrough { pos: u64, len: usize, fill: u8 },
    Unbuffered {
        pos: u64,
        len: usize,
        fill: u8,
        #[serde(default)]
        direct: bool,
    },
}

/// What a scenario must produce. Absent fields are not checked.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default)]
    pub upload: Option<Vec<(u64, usize)>>,
    #[serde(default)]
    pub cache: Option<Vec<(u64, usize)>>,
    #[serde(default)]
    pub dirty_after: Option<usize>,
    /// errno of the error left on the mapping, if any.
    #[serde(default)]
    pub mapping_errno: Option<i32>,
    #[serde(default)]
    pub step_errno: Option<i32>,
    #[serde(default)]
    pub begin_calls: Option<usize>,
}

/// What a scenario actually produced.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub upload: Vec<(u64, usize)>,
    pub cache: Vec<(u64, usize)>,
    pub dirty_after: usize,
    pub mapping_errno: Option<i32>,
    pub step_errno: Option<i32>,
    pub begin_calls: usize,
    pub written: Vec<u64>,
    pub stats: WriteStatsSnapshot,
}

impl ScenarioReport {
    /// Compare against `expect`, describing every mismatch.
    pub fn check(&self, expect: &Expectation) -> Result<()> {
        let mut mismatches = Vec::new();
        if let Some(upload) = &expect.upload {
            if *upload != self.upload {
                mismatches.push(format!("upload: expected {upload:?}, got {:?}", self.upload));
            }
        }
        if let Some(cache) = &expect.cache {
            if *cache != self.cache {
                mismatches.push(format!("cache: expected {cache:?}, got {:?}", self.cache));
            }
        }
        if let Some(dirty) = expect.dirty_after {
            if dirty != self.dirty_after {
                mismatches.push(format!(
                    "dirty_after: expected {dirty}, got {}",
                    self.dirty_after
                ));
            }
        }
        if expect.mapping_errno != self.mapping_errno {
            mismatches.push(format!(
                "mapping_errno: expected {:?}, got {:?}",
                expect.mapping_errno, self.mapping_errno
            ));
        }
        if expect.step_errno != self.step_errno {
            mismatches.push(format!(
                "step_errno: expected {:?}, got {:?}",
                expect.step_errno, self.step_errno
            ));
        }
        if let Some(calls) = expect.begin_calls {
            if calls != self.begin_calls {
                mismatches.push(format!(
                    "begin_calls: expected {calls}, got {}",
                    self.begin_calls
                ));
            }
        }
        if !mismatches.is_empty() {
            bail!("scenario {} diverged:\n  {}", self.name, mismatches.join("\n  "));
        }
        Ok(())
    }
}

fn shape(dispatches: &[Dispatch]) -> Vec<(u64, usize)> {
    dispatches.iter().map(|d| (d.pos, d.len)).collect()
}

/// Run `scenario` against a fresh in-memory file and report what happened.
///
/// The first step that fails stops the run; its errno is reported.
pub fn run_scenario(scenario: &Scenario) -> Result<ScenarioReport> {
    let server = match scenario.upload_max_len {
        Some(max_len) => RecordingBackend::with_max_len(max_len),
        None => RecordingBackend::new(),
    };
    server.refuse_upload(scenario.refuse_upload);
    for fault in &scenario.upload_faults {
        server.inject(*fault);
    }
    let cache = RecordingBackend::new();

    let mut inode = NetfsInode::new(
        Arc::new(Mapping::new(FolioSize::BASE)),
        Arc::clone(&server) as Arc<dyn WriteBackend>,
        scenario.config,
    )
    .with_context(|| format!("scenario {}: invalid config", scenario.name))?;
    if scenario.cache {
        let provider = MemoryCacheProvider::new(Arc::clone(&cache));
        provider.set_fail_bind(scenario.cache_bind_fails);
        inode = inode.with_cache(Arc::new(provider));
    }

    let mut written = Vec::new();
    let mut step_errno = None;
    for (index, step) in scenario.steps.iter().enumerate() {
        tracing::debug!(scenario = %scenario.name, index, ?step, "scenario_step");
        match apply_step(&inode, step) {
            Ok(Some(n)) => written.push(n),
            Ok(None) => {}
            Err(err) => {
                tracing::info!(scenario = %scenario.name, index, error = %err, "scenario_step_failed");
                step_errno = Some(err.to_errno());
                break;
            }
        }
    }

    Ok(ScenarioReport {
        name: scenario.name.clone(),
        upload: shape(&server.dispatches()),
        cache: shape(&cache.dispatches()),
        dirty_after: inode.mapping().nr_dirty(),
        mapping_errno: inode.mapping().take_error().map(|err| err.to_errno()),
        step_errno,
        begin_calls: server.begin_calls(),
        written,
        stats: inode.stats().snapshot(),
    })
}

fn apply_step(inode: &NetfsInode, step: &Step) -> nwb_error::Result<Option<u64>> {
    let mapping = inode.mapping();
    match *step {
        Step::Write {
            pos,
            len,
            fill,
            group,
        } => {
            mapping.write(FilePos(pos), &vec![fill; len], group.map(GroupId));
        }
        Step::StreamingWrite {
            pos,
            len,
            fill,
            group,
        } => {
            mapping.write_streaming(FilePos(pos), &vec![fill; len], group.map(GroupId))?;
        }
        Step::CopyToCache { pos, fill } => {
            let folio = mapping.grab_folio(FilePos(pos));
            folio.write_at(0, &vec![fill; folio.size()]);
            folio.set_uptodate(true);
            if folio.end().0 > mapping.i_size() {
                mapping.set_i_size(folio.end().0);
            }
            mapping.mark_copy_to_cache(&folio);
        }
        Step::SetSize { size } => mapping.set_i_size(size),
        Step::SetGroup { group } => inode.set_writeback_group(group.map(GroupId)),
        Step::Writepages { opportunistic } => {
            let mode = if opportunistic {
                SyncMode::None
            } else {
                SyncMode::All
            };
            let mut wbc = WritebackControl::new(mode);
            writepages(inode, &mut wbc)?;
        }
        Step::Writethrough { pos, len, fill } => {
            let outcome = perform_writethrough(inode, Kiocb::sync(FilePos(pos)), &vec![fill; len])?;
            return Ok(written_bytes(outcome));
        }
        Step::Unbuffered {
            pos,
            len,
            fill,
            direct,
        } => {
            let origin = if direct {
                IoOrigin::DioWrite
            } else {
                IoOrigin::UnbufferedWrite
            };
            let outcome = write_unbuffered(inode, Kiocb::sync(FilePos(pos)), &vec![fill; len], origin)?;
            return Ok(written_bytes(outcome));
        }
    }
    Ok(None)
}

fn written_bytes(outcome: WriteOutcome) -> Option<u64> {
    match outcome {
        WriteOutcome::Written(n) => Some(n),
        WriteOutcome::Queued => None,
    }
}

pub fn load_scenario(path: &Path) -> Result<Scenario> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read scenario {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("invalid scenario json {}", path.display()))
}

/// Load, run and check the scenario at `path`.
pub fn check_scenario_file(path: &Path) -> Result<ScenarioReport> {
    let scenario = load_scenario(path)?;
    let report = run_scenario(&scenario)?;
    report
        .check(&scenario.expect)
        .with_context(|| format!("fixture {}", path.display()))?;
    Ok(report)
}

/// Check every `*.json` scenario in `dir`, in name order.
pub fn check_fixture_dir(dir: &Path) -> Result<Vec<ScenarioReport>> {
    let mut paths = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("failed to list {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();
    if paths.is_empty() {
        bail!("no scenario fixtures in {}", dir.display());
    }
    paths.iter().map(|path| check_scenario_file(path)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario(steps: Vec<Step>) -> Scenario {
        Scenario {
            name: "inline".to_owned(),
            config: WriteConfig::default(),
            cache: false,
            cache_bind_fails: false,
            upload_max_len: None,
            refuse_upload: false,
            upload_faults: Vec::new(),
            steps,
            expect: Expectation::default(),
        }
    }

    #[test]
    fn step_json_uses_op_tag() {
        let step: Step =
            serde_json::from_str(r#"{"op": "write", "pos": 0, "len": 10, "fill": 7}"#)
                .expect("parse");
        assert!(matches!(
            step,
            Step::Write {
                pos: 0,
                len: 10,
                fill: 7,
                group: None
            }
        ));
    }

    #[test]
    fn buffered_write_then_writepages() {
        let report = run_scenario(&scenario(vec![
            Step::Write {
                pos: 0,
                len: 6000,
                fill: 1,
                group: None,
            },
            Step::Writepages {
                opportunistic: false,
            },
        ]))
        .expect("run");
        assert_eq!(report.upload, vec![(0, 6000)]);
        assert_eq!(report.dirty_after, 0);
        assert_eq!(report.begin_calls, 1);
        assert_eq!(report.stats.wh_writepages, 1);
    }

    #[test]
    fn short_write_is_retried_for_the_tail() {
        let mut s = scenario(vec![Step::Unbuffered {
            pos: 0,
            len: 1000,
            fill: 4,
            direct: false,
        }]);
        s.upload_faults = vec![Fault::Short(300)];
        let report = run_scenario(&s).expect("run");
        assert_eq!(report.upload, vec![(0, 1000), (300, 700)]);
        assert_eq!(report.written, vec![1000]);
        assert_eq!(report.stats.wh_retry_write_subreq, 1);
    }

    #[test]
    fn check_lists_every_mismatch() {
        let report = run_scenario(&scenario(vec![])).expect("run");
        let expect = Expectation {
            upload: Some(vec![(0, 1)]),
            dirty_after: Some(3),
            ..Expectation::default()
        };
        let err = report.check(&expect).expect_err("must diverge");
        let text = format!("{err:#}");
        assert!(text.contains("upload"));
        assert!(text.contains("dirty_after"));
    }

    #[test]
    fn recording_backend_applies_completed_data() {
        let backend = RecordingBackend::deferred();
        let inode = NetfsInode::new(
            Arc::new(Mapping::new(FolioSize::BASE)),
            Arc::clone(&backend) as Arc<dyn WriteBackend>,
            WriteConfig::default(),
        )
        .expect("inode");
        let (tx, rx) = std::sync::mpsc::channel();
        let outcome = write_unbuffered(
            &inode,
            Kiocb::with_completion(
                FilePos(10),
                Box::new(move |result| {
                    let _ = tx.send(result);
                }),
            ),
            &[9; 20],
            IoOrigin::UnbufferedWrite,
        )
        .expect("queued");
        assert_eq!(outcome, WriteOutcome::Queued);
        assert_eq!(backend.contents(30), vec![0; 30]);
        assert_eq!(backend.complete_pending(), 1);
        assert_eq!(rx.recv().expect("completion").expect("ok"), 20);
        let mut expected = vec![0; 10];
        expected.extend([9; 20]);
        assert_eq!(backend.contents(30), expected);
    }
}
