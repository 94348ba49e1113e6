/*!
 * Process Record
 * Pipes, read state and reference count of one launched child
 */

use super::options::LaunchOptions;
use super::status::ProcessStatus;
use crate::core::config::PopenConfig;
use crate::core::errors::{PopenError, PopenResult};
use crate::core::limits::OPEN_STREAM_COUNT;
use crate::core::types::{Chunk, Pid, StreamKind, StreamMode, StreamRefs};
use crate::io::{AsyncReadState, ReadState};
use crate::pipe::{Closer, FifoLocation, HandlePair, PipeEndpoint};
use nix::errno::Errno;
use nix::sys::wait::{waitid, Id, WaitPidFlag};
use nix::unistd;
use parking_lot::Mutex;
use std::io;
use std::process::{Child, Command, Stdio};
use tracing::{debug, info, warn};

/// Serializes launches: the child-side pipe ends are inheritable between
/// pipe creation and the post-spawn close, and must not leak into the child
/// of a concurrent launch
static LAUNCH_LOCK: Mutex<()> = Mutex::new(());

/// Internal aggregate for one launched child
///
/// Owns the three handle pairs and, in asynchronous mode, the read state of
/// stdout and stderr. Endpoints handed to external streams are moved out of
/// the pairs, so teardown never closes a descriptor twice.
#[derive(Debug)]
pub struct ProcessRecord {
    pid: Pid,
    command: String,
    mode: StreamMode,
    asynchronous: bool,
    child: Option<Child>,
    exit_status: Option<ProcessStatus>,
    stdin_pair: HandlePair,
    stdout_pair: HandlePair,
    stderr_pair: HandlePair,
    stdout_async: Option<AsyncReadState>,
    stderr_async: Option<AsyncReadState>,
    open_stream_count: u32,
    open_streams: [bool; 3],
    stream_refs: Option<StreamRefs>,
    torn_down: bool,
}

impl ProcessRecord {
    /// Create the pipes and spawn the child
    ///
    /// On success the parent's copies of the child-only ends (stdin read,
    /// stdout write, stderr write) are already closed.
    pub fn create(
        options: &LaunchOptions,
        config: &PopenConfig,
        closer: Closer,
    ) -> PopenResult<Self> {
        if options.command.trim().is_empty() {
            return Err(PopenError::ProcessSpawnFailed {
                command: options.command.clone(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty command"),
            });
        }

        let fifo = FifoLocation::from_config(config);
        let mut stdin_pair = HandlePair::new(closer.clone(), fifo.clone());
        let mut stdout_pair = HandlePair::new(closer.clone(), fifo.clone());
        let mut stderr_pair = HandlePair::new(closer, fifo);

        let _launch = LAUNCH_LOCK.lock();

        stdin_pair.create_pipe(true, false, false)?;
        stdout_pair.create_pipe(false, true, options.asynchronous)?;
        stderr_pair.create_pipe(false, true, options.asynchronous)?;

        let mut command = Command::new(&config.shell);
        command.arg("-c").arg(&options.command);
        if let Some(ref vars) = options.environment {
            command.env_clear();
            command.envs(vars.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        if let Some(ref dir) = options.working_dir {
            command.current_dir(dir);
        }
        command
            .stdin(child_stdio(stdin_pair.read(), StreamKind::Stdin)?)
            .stdout(child_stdio(stdout_pair.write(), StreamKind::Stdout)?)
            .stderr(child_stdio(stderr_pair.write(), StreamKind::Stderr)?);

        if options.show_window {
            debug!("show_window has no effect on this platform");
        }

        let child = command
            .spawn()
            .map_err(|source| PopenError::ProcessSpawnFailed {
                command: options.command.clone(),
                source,
            })?;

        // Reads see end of stream only once the parent holds no child end
        log_close(stdin_pair.close_read(), StreamKind::Stdin);
        log_close(stdout_pair.close_write(), StreamKind::Stdout);
        log_close(stderr_pair.close_write(), StreamKind::Stderr);
        drop(_launch);

        let pid = child.id();
        info!(pid, command = %options.command, "Spawned child process");

        Ok(Self {
            pid,
            command: options.command.clone(),
            mode: options.mode,
            asynchronous: options.asynchronous,
            child: Some(child),
            exit_status: None,
            stdin_pair,
            stdout_pair,
            stderr_pair,
            stdout_async: None,
            stderr_async: None,
            open_stream_count: 0,
            open_streams: [false; 3],
            stream_refs: None,
            torn_down: false,
        })
    }

    /// Record the external stream references; three streams are now open
    pub fn attach_external_streams(&mut self, refs: StreamRefs) -> PopenResult<()> {
        if self.stream_refs.is_some() {
            return Err(PopenError::InvalidState(format!(
                "streams already attached to process {}",
                self.pid
            )));
        }
        self.stream_refs = Some(refs);
        self.open_stream_count = OPEN_STREAM_COUNT;
        self.open_streams = [true; 3];
        Ok(())
    }

    /// Bind non-blocking read state to the stdout and stderr read ends
    ///
    /// Only valid once, before any read, on a record created in
    /// asynchronous mode.
    pub fn enable_async(&mut self) -> PopenResult<()> {
        if self.stdout_async.is_some() || self.stderr_async.is_some() {
            return Err(PopenError::InvalidState(
                "asynchronous reads already enabled".to_string(),
            ));
        }
        if !self.asynchronous {
            return Err(PopenError::InvalidState(
                "pipes were not created for asynchronous reads".to_string(),
            ));
        }
        if self.stdout_pair.read().is_none() || self.stderr_pair.read().is_none() {
            return Err(PopenError::InvalidState(
                "output read endpoints were already transferred".to_string(),
            ));
        }

        if let (Some(stdout), Some(stderr)) =
            (self.stdout_pair.forget_read(), self.stderr_pair.forget_read())
        {
            self.stdout_async = Some(AsyncReadState::new(StreamKind::Stdout, stdout));
            self.stderr_async = Some(AsyncReadState::new(StreamKind::Stderr, stderr));
        }
        Ok(())
    }

    /// Move the parent-side endpoint of a stream out of its pair
    pub fn take_parent_endpoint(&mut self, kind: StreamKind) -> Option<PipeEndpoint> {
        match kind {
            StreamKind::Stdin => self.stdin_pair.forget_write(),
            StreamKind::Stdout => self.stdout_pair.forget_read(),
            StreamKind::Stderr => self.stderr_pair.forget_read(),
        }
    }

    /// Poll one output stream without blocking
    pub fn poll_stream(&mut self, kind: StreamKind) -> PopenResult<Chunk> {
        let index = stream_index(kind);
        let state = match kind {
            StreamKind::Stdin => {
                return Err(PopenError::InvalidStreamHandle(
                    "stdin cannot be read".to_string(),
                ))
            }
            StreamKind::Stdout => self.stdout_async.as_mut(),
            StreamKind::Stderr => self.stderr_async.as_mut(),
        };

        match state {
            Some(state) => Ok(state.poll()),
            None if !self.asynchronous => Err(PopenError::InvalidState(format!(
                "{} of process {} was not opened for asynchronous reads",
                kind, self.pid
            ))),
            None if self.stream_refs.is_some() && !self.open_streams[index] => {
                Err(PopenError::InvalidStreamHandle(format!(
                    "{} of process {} is already closed",
                    kind, self.pid
                )))
            }
            None => Err(PopenError::InvalidState(format!(
                "asynchronous reads not enabled for process {}",
                self.pid
            ))),
        }
    }

    /// An external stream was closed
    ///
    /// Returns true iff it was the last open stream, at which point the
    /// record is ready for teardown by its owner.
    pub fn notify_stream_closed(&mut self, kind: StreamKind) -> PopenResult<bool> {
        if self.torn_down {
            return Err(PopenError::InvalidState(format!(
                "process {} record already torn down",
                self.pid
            )));
        }
        let index = stream_index(kind);
        if !self.open_streams[index] {
            return Err(PopenError::InvalidState(format!(
                "{} of process {} is not open",
                kind, self.pid
            )));
        }
        self.open_streams[index] = false;

        // The stream owned no descriptor in asynchronous mode; its read end
        // lives in the read state
        match kind {
            StreamKind::Stdout => drop(self.stdout_async.take()),
            StreamKind::Stderr => drop(self.stderr_async.take()),
            StreamKind::Stdin => {}
        }

        self.open_stream_count = self.open_stream_count.saturating_sub(1);
        debug!(
            pid = self.pid,
            stream = %kind,
            remaining = self.open_stream_count,
            "External stream closed"
        );
        Ok(self.open_stream_count == 0)
    }

    /// Release every remaining OS resource, exactly once
    ///
    /// Pending reads are cancelled before their buffers and endpoints are
    /// released. Returns the child, still unreaped, for its owner to reap.
    pub fn teardown(&mut self) -> Option<Child> {
        if self.torn_down {
            return None;
        }
        self.torn_down = true;

        self.stdout_async.take();
        self.stderr_async.take();

        log_close(self.stdin_pair.close_write(), StreamKind::Stdin);
        log_close(self.stdin_pair.close_read(), StreamKind::Stdin);
        log_close(self.stdout_pair.close_read(), StreamKind::Stdout);
        log_close(self.stdout_pair.close_write(), StreamKind::Stdout);
        log_close(self.stderr_pair.close_read(), StreamKind::Stderr);
        log_close(self.stderr_pair.close_write(), StreamKind::Stderr);

        debug!(pid = self.pid, "Process record torn down");
        self.child.take()
    }

    /// Exit status without blocking; cached once known
    ///
    /// The child is left a zombie so its pid stays reserved while the record
    /// is live. Reaping happens once the record is torn down.
    pub fn try_wait(&mut self) -> PopenResult<Option<ProcessStatus>> {
        if let Some(status) = self.exit_status {
            return Ok(Some(status));
        }
        if self.child.is_none() {
            return Ok(None);
        }
        let pid = self.pid;
        let flags = WaitPidFlag::WEXITED | WaitPidFlag::WNOHANG | WaitPidFlag::WNOWAIT;
        let status = loop {
            match waitid(Id::Pid(unistd::Pid::from_raw(pid as i32)), flags) {
                Ok(status) => break status,
                Err(Errno::EINTR) => continue,
                Err(errno) => {
                    return Err(PopenError::WaitFailed {
                        pid,
                        source: io::Error::from(errno),
                    })
                }
            }
        };
        let status = ProcessStatus::from_wait_status(pid, status);
        if status.is_some() {
            self.exit_status = status;
        }
        Ok(status)
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    #[inline]
    pub fn mode(&self) -> StreamMode {
        self.mode
    }

    #[inline]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    #[inline]
    pub fn open_stream_count(&self) -> u32 {
        self.open_stream_count
    }

    pub fn stream_refs(&self) -> Option<StreamRefs> {
        self.stream_refs
    }

    #[inline]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn exit_status(&self) -> Option<ProcessStatus> {
        self.exit_status
    }

    /// Read state of an output stream, if it has one
    pub fn read_state(&self, kind: StreamKind) -> Option<ReadState> {
        self.async_state(kind).map(AsyncReadState::state)
    }

    /// Read failure recorded for an output stream
    pub fn read_failure(&self, kind: StreamKind) -> Option<&PopenError> {
        self.async_state(kind).and_then(AsyncReadState::failure)
    }

    fn async_state(&self, kind: StreamKind) -> Option<&AsyncReadState> {
        match kind {
            StreamKind::Stdin => None,
            StreamKind::Stdout => self.stdout_async.as_ref(),
            StreamKind::Stderr => self.stderr_async.as_ref(),
        }
    }
}

impl Drop for ProcessRecord {
    fn drop(&mut self) {
        if let Some(mut child) = self.teardown() {
            if let Ok(None) = child.try_wait() {
                warn!(
                    pid = self.pid,
                    "Dropping record of a running process; it will not be reaped"
                );
            }
        }
    }
}

#[inline]
fn stream_index(kind: StreamKind) -> usize {
    match kind {
        StreamKind::Stdin => 0,
        StreamKind::Stdout => 1,
        StreamKind::Stderr => 2,
    }
}

fn child_stdio(endpoint: Option<&PipeEndpoint>, kind: StreamKind) -> PopenResult<Stdio> {
    let endpoint = endpoint.ok_or_else(|| {
        PopenError::InvalidState(format!("child {} endpoint missing", kind))
    })?;
    // std moves the duplicate onto the child's standard descriptor
    let file = endpoint.try_clone_file().map_err(PopenError::pipe)?;
    Ok(Stdio::from(file))
}

fn log_close(result: io::Result<()>, kind: StreamKind) {
    if let Err(e) = result {
        warn!(stream = %kind, error = %e, "Failed to close pipe endpoint");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::StreamRef;
    use crate::pipe::CountingCloser;
    use std::sync::Arc;

    fn refs() -> StreamRefs {
        StreamRefs {
            stdin: StreamRef::new(1, StreamKind::Stdin),
            stdout: StreamRef::new(2, StreamKind::Stdout),
            stderr: StreamRef::new(3, StreamKind::Stderr),
        }
    }

    fn config(dir: &std::path::Path) -> PopenConfig {
        PopenConfig::default().with_fifo_dir(dir)
    }

    #[test]
    fn test_create_closes_child_ends() {
        let dir = tempfile::tempdir().unwrap();
        let closer = Arc::new(CountingCloser::new());
        let record = ProcessRecord::create(
            &LaunchOptions::new("true"),
            &config(dir.path()),
            closer.clone(),
        )
        .unwrap();

        assert!(record.pid() > 0);
        // One inheritable original per pipe, then the three child-only ends
        assert_eq!(closer.count(), 6);
        assert!(record.stdin_pair.read().is_none());
        assert!(record.stdout_pair.write().is_none());
        assert!(record.stderr_pair.write().is_none());
    }

    #[test]
    fn test_empty_command_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let err = ProcessRecord::create(
            &LaunchOptions::new("   "),
            &config(dir.path()),
            Arc::new(CountingCloser::new()),
        )
        .unwrap_err();
        assert!(matches!(err, PopenError::ProcessSpawnFailed { .. }));
    }

    #[test]
    fn test_spawn_failure_releases_pipes() {
        let dir = tempfile::tempdir().unwrap();
        let closer = Arc::new(CountingCloser::new());
        let config = config(dir.path()).with_shell("/nonexistent/shell");
        let err =
            ProcessRecord::create(&LaunchOptions::new("true"), &config, closer.clone()).unwrap_err();

        assert!(matches!(err, PopenError::ProcessSpawnFailed { .. }));
        assert!(err.os_error_code().is_some());
        // 3 duplication closes plus both ends of all three pipes
        assert_eq!(closer.count(), 9);
    }

    #[test]
    fn test_reference_count_reaches_zero_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut record = ProcessRecord::create(
            &LaunchOptions::new("true").asynchronous(true),
            &config(dir.path()),
            Arc::new(CountingCloser::new()),
        )
        .unwrap();
        record.enable_async().unwrap();
        record.attach_external_streams(refs()).unwrap();
        assert_eq!(record.open_stream_count(), 3);

        assert!(!record.notify_stream_closed(StreamKind::Stderr).unwrap());
        assert!(record.notify_stream_closed(StreamKind::Stderr).is_err());
        assert!(!record.notify_stream_closed(StreamKind::Stdin).unwrap());
        assert!(record.notify_stream_closed(StreamKind::Stdout).unwrap());
        assert_eq!(record.open_stream_count(), 0);

        let mut child = record.teardown().unwrap();
        assert!(record.teardown().is_none());
        child.wait().unwrap();
        assert!(record.notify_stream_closed(StreamKind::Stdout).is_err());
    }

    #[test]
    fn test_enable_async_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut sync_record = ProcessRecord::create(
            &LaunchOptions::new("true"),
            &config(dir.path()),
            Arc::new(CountingCloser::new()),
        )
        .unwrap();
        assert!(sync_record.enable_async().is_err());
        assert!(matches!(
            sync_record.poll_stream(StreamKind::Stdout),
            Err(PopenError::InvalidState(_))
        ));

        let mut async_record = ProcessRecord::create(
            &LaunchOptions::new("true").asynchronous(true),
            &config(dir.path()),
            Arc::new(CountingCloser::new()),
        )
        .unwrap();
        async_record.enable_async().unwrap();
        assert!(async_record.enable_async().is_err());
        assert!(matches!(
            async_record.poll_stream(StreamKind::Stdin),
            Err(PopenError::InvalidStreamHandle(_))
        ));
        assert_eq!(
            async_record.read_state(StreamKind::Stdout),
            Some(ReadState::Idle)
        );
    }
}
