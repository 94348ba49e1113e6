/*!
 * Output Drain
 *
 * Polls a child's stdout and stderr together until both close, so neither
 * pipe fills up while the other is being read. Input for the child can be
 * fed to its stdin in the same loop.
 */

use crate::core::config::PopenConfig;
use crate::core::errors::{PopenError, PopenResult};
use crate::core::limits::DEFAULT_DRAIN_POLL_INTERVAL;
use crate::core::types::{Chunk, StreamKind};
use crate::process::{ChildOutput, ChildStdin};
use bytes::{Buf, Bytes};
use std::io::{self, Write};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Receives output as it is drained
pub trait OutputHandler {
    fn on_stdout(&mut self, data: &[u8]);
    fn on_stderr(&mut self, data: &[u8]);

    /// Both streams reached end of output
    fn on_finished(&mut self) {}
}

/// Everything a child wrote, kept in full
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CapturedOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

impl OutputHandler for CapturedOutput {
    fn on_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
    }

    fn on_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
    }
}

/// Child stdin fed from a buffer as the pipe accepts data
struct InputFeed {
    stdin: Option<ChildStdin>,
    input: Bytes,
}

impl InputFeed {
    fn new(stdin: ChildStdin, input: Bytes) -> PopenResult<Self> {
        stdin.set_nonblocking(true).map_err(|source| PopenError::WriteFailed {
            stream: StreamKind::Stdin,
            source,
        })?;
        Ok(Self {
            stdin: Some(stdin),
            input,
        })
    }

    /// Write whatever fits without blocking; stdin is closed once the input
    /// is used up or the child stops reading
    fn feed(&mut self) -> PopenResult<bool> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Ok(false);
        };
        if self.input.is_empty() {
            self.finish();
            return Ok(true);
        }
        match stdin.write(&self.input) {
            Ok(written) => {
                self.input.advance(written);
                if self.input.is_empty() {
                    self.finish();
                }
                Ok(written > 0)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(false)
            }
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                debug!(
                    pid = stdin.pid(),
                    unwritten = self.input.len(),
                    "Child closed its input early"
                );
                self.input.clear();
                self.finish();
                Ok(true)
            }
            Err(source) => Err(PopenError::WriteFailed {
                stream: StreamKind::Stdin,
                source,
            }),
        }
    }

    fn finish(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            let pid = stdin.pid();
            if let Err(e) = stdin.close() {
                warn!(pid, error = %e, "Failed to close child stdin");
            }
        }
    }
}

/// Alternating poller over both output streams
#[derive(Debug, Clone, Copy)]
pub struct OutputDrain {
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl OutputDrain {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            timeout: None,
        }
    }

    pub fn from_config(config: &PopenConfig) -> Self {
        Self::new(config.drain_poll_interval())
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Drain both streams to end of output
    ///
    /// Sleeps only after a round in which neither stream produced data.
    /// Both streams must have been opened for asynchronous reads.
    pub fn drain<H: OutputHandler>(
        &self,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
    ) -> PopenResult<()> {
        self.drain_feeding(stdout, stderr, handler, None)
    }

    /// Drain both streams while writing `input` to the child's stdin
    ///
    /// Stdin is switched to non-blocking writes and closed once all of
    /// `input` is written, so the child sees end of input. A child that
    /// exits without reading everything is not an error.
    pub fn drain_with_input<H: OutputHandler>(
        &self,
        stdin: ChildStdin,
        input: Bytes,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
    ) -> PopenResult<()> {
        let mut feed = InputFeed::new(stdin, input)?;
        self.drain_feeding(stdout, stderr, handler, Some(&mut feed))
    }

    fn drain_feeding<H: OutputHandler>(
        &self,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
        mut feed: Option<&mut InputFeed>,
    ) -> PopenResult<()> {
        let start = Instant::now();
        let mut open = [true, true];
        while open[0] || open[1] {
            let progressed = Self::round(stdout, stderr, handler, &mut open, feed.as_deref_mut())?;
            if !(open[0] || open[1]) {
                break;
            }
            self.check_timeout(stdout, start)?;
            if !progressed {
                std::thread::sleep(self.poll_interval);
            }
        }
        if let Some(feed) = feed {
            feed.finish();
        }
        handler.on_finished();
        debug!(
            pid = stdout.pid(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Output drained"
        );
        Ok(())
    }

    /// Like [`OutputDrain::drain`], sleeping on the tokio timer
    pub async fn drain_async<H: OutputHandler>(
        &self,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
    ) -> PopenResult<()> {
        self.drain_async_feeding(stdout, stderr, handler, None).await
    }

    /// Like [`OutputDrain::drain_with_input`], sleeping on the tokio timer
    pub async fn drain_async_with_input<H: OutputHandler>(
        &self,
        stdin: ChildStdin,
        input: Bytes,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
    ) -> PopenResult<()> {
        let mut feed = InputFeed::new(stdin, input)?;
        self.drain_async_feeding(stdout, stderr, handler, Some(&mut feed))
            .await
    }

    async fn drain_async_feeding<H: OutputHandler>(
        &self,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
        mut feed: Option<&mut InputFeed>,
    ) -> PopenResult<()> {
        let start = Instant::now();
        let mut open = [true, true];
        while open[0] || open[1] {
            let progressed = Self::round(stdout, stderr, handler, &mut open, feed.as_deref_mut())?;
            if !(open[0] || open[1]) {
                break;
            }
            self.check_timeout(stdout, start)?;
            if !progressed {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        if let Some(feed) = feed {
            feed.finish();
        }
        handler.on_finished();
        Ok(())
    }

    /// Collect all output of both streams
    pub fn capture(
        &self,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
    ) -> PopenResult<CapturedOutput> {
        let mut captured = CapturedOutput::default();
        self.drain(stdout, stderr, &mut captured)?;
        Ok(captured)
    }

    /// Collect all output while feeding `input` to the child
    pub fn capture_with_input(
        &self,
        stdin: ChildStdin,
        input: Bytes,
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
    ) -> PopenResult<CapturedOutput> {
        let mut captured = CapturedOutput::default();
        self.drain_with_input(stdin, input, stdout, stderr, &mut captured)?;
        Ok(captured)
    }

    fn round<H: OutputHandler>(
        stdout: &mut ChildOutput,
        stderr: &mut ChildOutput,
        handler: &mut H,
        open: &mut [bool; 2],
        feed: Option<&mut InputFeed>,
    ) -> PopenResult<bool> {
        let mut progressed = match feed {
            Some(feed) => feed.feed()?,
            None => false,
        };
        if open[0] {
            match stdout.poll()? {
                Chunk::Data(bytes) => {
                    handler.on_stdout(&bytes);
                    progressed = true;
                }
                Chunk::TryAgain => {}
                Chunk::Closed => open[0] = false,
            }
        }
        if open[1] {
            match stderr.poll()? {
                Chunk::Data(bytes) => {
                    handler.on_stderr(&bytes);
                    progressed = true;
                }
                Chunk::TryAgain => {}
                Chunk::Closed => open[1] = false,
            }
        }
        Ok(progressed)
    }

    fn check_timeout(&self, stdout: &ChildOutput, start: Instant) -> PopenResult<()> {
        match self.timeout {
            Some(limit) if start.elapsed() >= limit => Err(PopenError::Timeout {
                pid: stdout.pid(),
                elapsed_ms: start.elapsed().as_millis() as u64,
            }),
            _ => Ok(()),
        }
    }
}

impl Default for OutputDrain {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_POLL_INTERVAL)
    }
}
