/*!
 * Process Registry
 *
 * Owns every live process record. Records are found by process ID or by
 * one of their stream references, and are removed and torn down when the
 * last of their external streams closes. Children whose status was never
 * collected are kept and reaped later. Collected statuses are retained up to
 * a fixed count, oldest evicted first.
 */

use super::record::ProcessRecord;
use super::status::ProcessStatus;
use crate::core::errors::{PopenError, PopenResult};
use crate::core::limits::{DEFAULT_WAIT_POLL_INTERVAL, MAX_FINISHED_STATUSES};
use crate::core::types::{Chunk, Pid, StreamKind, StreamRef, StreamRefs};
use ahash::RandomState;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::process::Child;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// A record stored in the registry
#[derive(Debug)]
pub struct LiveProcess {
    pid: Pid,
    streams: StreamRefs,
    record: Mutex<ProcessRecord>,
}

impl LiveProcess {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn streams(&self) -> StreamRefs {
        self.streams
    }

    pub fn lock(&self) -> MutexGuard<'_, ProcessRecord> {
        self.record.lock()
    }
}

/// Explicit registry of live process records
///
/// Cloning is cheap and every clone shares the same state, so external
/// streams can carry a handle back to the registry that owns their record.
#[derive(Clone)]
pub struct ProcessRegistry {
    by_pid: Arc<DashMap<Pid, Arc<LiveProcess>, RandomState>>,
    by_stream: Arc<DashMap<u64, Arc<LiveProcess>, RandomState>>,
    /// Collected statuses keyed by pid, tagged with an insertion sequence
    finished: Arc<DashMap<Pid, (u64, ProcessStatus), RandomState>>,
    orphans: Arc<DashMap<Pid, Child, RandomState>>,
    next_stream_id: Arc<AtomicU64>,
    next_finished_seq: Arc<AtomicU64>,
    max_finished: usize,
    wait_poll_interval: Duration,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            by_pid: Arc::new(DashMap::with_hasher(RandomState::new())),
            by_stream: Arc::new(DashMap::with_hasher(RandomState::new())),
            finished: Arc::new(DashMap::with_hasher(RandomState::new())),
            orphans: Arc::new(DashMap::with_hasher(RandomState::new())),
            next_stream_id: Arc::new(AtomicU64::new(1)),
            next_finished_seq: Arc::new(AtomicU64::new(0)),
            max_finished: MAX_FINISHED_STATUSES,
            wait_poll_interval: DEFAULT_WAIT_POLL_INTERVAL,
        }
    }

    /// Retain at most `max` collected statuses
    pub fn with_max_finished_statuses(mut self, max: usize) -> Self {
        self.max_finished = max.max(1);
        self
    }

    pub fn with_wait_poll_interval(mut self, interval: Duration) -> Self {
        self.wait_poll_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Issue three fresh stream references
    pub fn allocate_stream_refs(&self) -> StreamRefs {
        let base = self.next_stream_id.fetch_add(3, Ordering::SeqCst);
        StreamRefs {
            stdin: StreamRef::new(base, StreamKind::Stdin),
            stdout: StreamRef::new(base + 1, StreamKind::Stdout),
            stderr: StreamRef::new(base + 2, StreamKind::Stderr),
        }
    }

    /// Take ownership of a record whose external streams are attached
    ///
    /// At most one live record per process ID. A rejected record is torn
    /// down here and its child queued for reaping.
    pub fn insert(&self, mut record: ProcessRecord) -> PopenResult<Arc<LiveProcess>> {
        let pid = record.pid();
        let streams = match record.stream_refs() {
            Some(streams) => streams,
            None => {
                self.discard(&mut record);
                return Err(PopenError::InvalidState(format!(
                    "process {} has no external streams attached",
                    pid
                )));
            }
        };

        let entry = match self.by_pid.entry(pid) {
            Entry::Vacant(entry) => entry,
            Entry::Occupied(_) => {
                self.discard(&mut record);
                return Err(PopenError::InvalidState(format!(
                    "process {} is already registered",
                    pid
                )));
            }
        };
        let live = Arc::new(LiveProcess {
            pid,
            streams,
            record: Mutex::new(record),
        });
        entry.insert(Arc::clone(&live));

        for stream in [streams.stdin, streams.stdout, streams.stderr] {
            self.by_stream.insert(stream.id(), Arc::clone(&live));
        }
        self.finished.remove(&pid);
        self.reap_orphans();

        debug!(pid, live = self.by_pid.len(), "Registered process record");
        Ok(live)
    }

    /// Deregister a record before its streams are closed
    ///
    /// The record is torn down at once; later closes of its streams are
    /// rejected.
    pub fn remove(&self, pid: Pid) -> Option<Arc<LiveProcess>> {
        let (_, live) = self.by_pid.remove(&pid)?;
        let (child, status) = {
            let mut record = live.lock();
            let child = record.teardown();
            (child, record.exit_status())
        };
        self.release(&live, child, status);
        info!(pid, "Process record removed");
        Some(live)
    }

    fn discard(&self, record: &mut ProcessRecord) {
        if let Some(child) = record.teardown() {
            self.reap_or_queue(record.pid(), child);
        }
    }

    fn release(&self, live: &Arc<LiveProcess>, child: Option<Child>, status: Option<ProcessStatus>) {
        self.by_pid
            .remove_if(&live.pid, |_, current| Arc::ptr_eq(current, live));
        for s in [live.streams.stdin, live.streams.stdout, live.streams.stderr] {
            self.by_stream.remove(&s.id());
        }
        if let Some(status) = status {
            self.record_finished(live.pid, status);
        }
        if let Some(child) = child {
            self.reap_or_queue(live.pid, child);
        }
    }

    pub fn find_by_process_id(&self, pid: Pid) -> Option<Arc<LiveProcess>> {
        self.by_pid.get(&pid).map(|entry| Arc::clone(entry.value()))
    }

    pub fn find_by_stream_ref(&self, stream: StreamRef) -> Option<Arc<LiveProcess>> {
        self.by_stream
            .get(&stream.id())
            .map(|entry| Arc::clone(entry.value()))
            .filter(|live| live.streams.contains(stream))
    }

    /// Poll an output stream without blocking
    pub fn poll(&self, stream: StreamRef) -> PopenResult<Chunk> {
        if !stream.kind().is_output() {
            return Err(PopenError::InvalidStreamHandle(format!(
                "{} is not an output stream",
                stream
            )));
        }
        let live = self.find_by_stream_ref(stream).ok_or_else(|| {
            PopenError::InvalidStreamHandle(format!("{} does not belong to a live process", stream))
        })?;
        let mut record = live.lock();
        record.poll_stream(stream.kind())
    }

    /// Record that an external stream was closed
    ///
    /// When it was the last open stream of its process the record is removed
    /// and torn down, and its child is either reaped or queued for later
    /// reaping. Returns true in that case.
    pub fn notify_stream_closed(&self, stream: StreamRef) -> PopenResult<bool> {
        let live = self.find_by_stream_ref(stream).ok_or_else(|| {
            PopenError::InvalidStreamHandle(format!("{} does not belong to a live process", stream))
        })?;

        let (child, status) = {
            let mut record = live.lock();
            if !record.notify_stream_closed(stream.kind())? {
                return Ok(false);
            }
            let child = record.teardown();
            (child, record.exit_status())
        };

        self.release(&live, child, status);
        info!(pid = live.pid, "All streams closed, process record released");
        Ok(true)
    }

    /// Keep a child no record owns any more
    pub fn adopt(&self, pid: Pid, child: Child) {
        self.reap_or_queue(pid, child);
    }

    fn reap_or_queue(&self, pid: Pid, mut child: Child) {
        match child.try_wait() {
            Ok(Some(status)) => {
                self.record_finished(pid, ProcessStatus::from_exit_status(pid, status));
            }
            Ok(None) => {
                debug!(pid, "Child still running, queued for reaping");
                self.orphans.insert(pid, child);
            }
            Err(e) => warn!(pid, error = %e, "Failed to check child status"),
        }
    }

    fn record_finished(&self, pid: Pid, status: ProcessStatus) {
        let seq = self.next_finished_seq.fetch_add(1, Ordering::Relaxed);
        self.finished.insert(pid, (seq, status));

        while self.finished.len() > self.max_finished {
            let oldest = self
                .finished
                .iter()
                .min_by_key(|entry| entry.value().0)
                .map(|entry| (*entry.key(), entry.value().0));
            let Some((oldest_pid, oldest_seq)) = oldest else {
                break;
            };
            self.finished
                .remove_if(&oldest_pid, |_, (seq, _)| *seq == oldest_seq);
            trace!(pid = oldest_pid, "Evicted oldest finished status");
        }
    }

    /// Reap every queued child that has exited; returns how many were reaped
    pub fn reap_orphans(&self) -> usize {
        let mut reaped = 0;
        self.orphans.retain(|pid, child| match child.try_wait() {
            Ok(Some(status)) => {
                self.record_finished(*pid, ProcessStatus::from_exit_status(*pid, status));
                reaped += 1;
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(pid = *pid, error = %e, "Dropping unreapable child");
                false
            }
        });
        if reaped > 0 {
            debug!(reaped, "Reaped orphaned children");
        }
        reaped
    }

    /// Exit status of a known process without blocking
    pub fn try_wait(&self, pid: Pid) -> PopenResult<Option<ProcessStatus>> {
        if let Some(live) = self.find_by_process_id(pid) {
            let mut record = live.lock();
            return record.try_wait();
        }
        if let Some(entry) = self.finished.get(&pid) {
            return Ok(Some(entry.value().1));
        }
        if self.orphans.contains_key(&pid) {
            self.reap_orphans();
            return Ok(self.finished.get(&pid).map(|entry| entry.value().1));
        }
        Err(PopenError::NotFound(pid))
    }

    /// Block until the process exits or the timeout elapses
    pub fn wait(&self, pid: Pid, timeout: Option<Duration>) -> PopenResult<ProcessStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait(pid)? {
                return Ok(status);
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(PopenError::Timeout {
                        pid,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
            std::thread::sleep(self.wait_poll_interval);
        }
    }

    /// Like [`ProcessRegistry::wait`], sleeping on the tokio timer
    pub async fn wait_async(
        &self,
        pid: Pid,
        timeout: Option<Duration>,
    ) -> PopenResult<ProcessStatus> {
        let start = Instant::now();
        loop {
            if let Some(status) = self.try_wait(pid)? {
                return Ok(status);
            }
            if let Some(limit) = timeout {
                if start.elapsed() >= limit {
                    return Err(PopenError::Timeout {
                        pid,
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    });
                }
            }
            tokio::time::sleep(self.wait_poll_interval).await;
        }
    }

    /// Remove and return the collected status of a released process
    pub fn take_status(&self, pid: Pid) -> Option<ProcessStatus> {
        self.finished.remove(&pid).map(|(_, (_, status))| status)
    }

    /// Number of retained statuses of released processes
    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    /// Number of live records
    pub fn len(&self) -> usize {
        self.by_stream.len() / 3
    }

    pub fn is_empty(&self) -> bool {
        self.by_stream.is_empty()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("live", &self.len())
            .field("finished", &self.finished.len())
            .field("orphans", &self.orphans.len())
            .finish()
    }
}
