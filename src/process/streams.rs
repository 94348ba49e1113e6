/*!
 * External Streams
 *
 * The parent-side stdin, stdout and stderr handed to callers. Each one
 * reports its close to the registry exactly once, whether closed explicitly
 * or dropped.
 */

use super::registry::ProcessRegistry;
use crate::core::errors::{PopenError, PopenResult};
use crate::core::types::{Chunk, Pid, StreamKind, StreamMode, StreamRef};
use crate::io::strip_carriage_returns;
use crate::pipe::PipeEndpoint;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use std::fmt;
use std::io::{self, Read, Write};
use std::os::unix::fs::FileTypeExt;
use std::time::Duration;
use tracing::{trace, warn};

/// Back-reference from a stream to its record's registry
pub(crate) struct StreamLink {
    stream: StreamRef,
    pid: Pid,
    registry: ProcessRegistry,
    armed: bool,
    notified: bool,
}

impl StreamLink {
    pub(crate) fn new(stream: StreamRef, pid: Pid, registry: ProcessRegistry) -> Self {
        Self {
            stream,
            pid,
            registry,
            armed: false,
            notified: false,
        }
    }

    /// Start reporting closes; only once the record is registered
    pub(crate) fn arm(&mut self) {
        self.armed = true;
    }

    fn release(&mut self) {
        if !self.armed || self.notified {
            return;
        }
        self.notified = true;
        match self.registry.notify_stream_closed(self.stream) {
            Ok(last) => trace!(stream = %self.stream, last, "Stream close reported"),
            Err(e) => warn!(stream = %self.stream, error = %e, "Failed to report stream close"),
        }
    }
}

fn wrap_endpoint(endpoint: Option<PipeEndpoint>, kind: StreamKind) -> PopenResult<Option<PipeEndpoint>> {
    let endpoint = match endpoint {
        Some(endpoint) => endpoint,
        None => return Ok(None),
    };
    let metadata = endpoint
        .metadata()
        .map_err(|source| PopenError::StreamWrapFailed { stream: kind, source })?;
    if !metadata.file_type().is_fifo() {
        return Err(PopenError::StreamWrapFailed {
            stream: kind,
            source: io::Error::new(io::ErrorKind::InvalidInput, "descriptor is not a pipe"),
        });
    }
    Ok(Some(endpoint))
}

/// Write side of the child's standard input
pub struct ChildStdin {
    endpoint: Option<PipeEndpoint>,
    link: StreamLink,
}

impl ChildStdin {
    pub(crate) fn wrap(endpoint: Option<PipeEndpoint>, link: StreamLink) -> PopenResult<Self> {
        let endpoint = wrap_endpoint(endpoint, StreamKind::Stdin)?;
        if endpoint.is_none() {
            return Err(PopenError::InvalidState(
                "stdin write endpoint missing".to_string(),
            ));
        }
        Ok(Self { endpoint, link })
    }

    pub(crate) fn link_mut(&mut self) -> &mut StreamLink {
        &mut self.link
    }

    pub fn stream_ref(&self) -> StreamRef {
        self.link.stream
    }

    pub fn pid(&self) -> Pid {
        self.link.pid
    }

    /// Switch writes between blocking and `WouldBlock` on a full pipe
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.endpoint
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin closed"))?
            .set_nonblocking(nonblocking)
    }

    /// Close the pipe so the child sees end of input
    pub fn close(mut self) -> io::Result<()> {
        let result = self.endpoint.take().map_or(Ok(()), PipeEndpoint::close);
        self.link.release();
        result
    }

    fn endpoint_mut(&mut self) -> io::Result<&mut PipeEndpoint> {
        self.endpoint
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stdin closed"))
    }
}

impl Write for ChildStdin {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.endpoint_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.endpoint_mut()?.flush()
    }
}

impl Drop for ChildStdin {
    fn drop(&mut self) {
        // Close before reporting, so the record never outlives the descriptor
        drop(self.endpoint.take());
        self.link.release();
    }
}

impl fmt::Debug for ChildStdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildStdin")
            .field("stream", &self.link.stream)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

/// Read side of the child's stdout or stderr
///
/// In synchronous mode it owns the pipe's read end and reads block. In
/// asynchronous mode the read end belongs to the record's read state and
/// data comes through [`ChildOutput::poll`]; `Read` then reports
/// `WouldBlock` whenever nothing is available.
pub struct ChildOutput {
    kind: StreamKind,
    endpoint: Option<PipeEndpoint>,
    mode: StreamMode,
    asynchronous: bool,
    stash: Bytes,
    link: StreamLink,
}

impl ChildOutput {
    pub(crate) fn wrap(
        kind: StreamKind,
        endpoint: Option<PipeEndpoint>,
        mode: StreamMode,
        asynchronous: bool,
        link: StreamLink,
    ) -> PopenResult<Self> {
        let endpoint = wrap_endpoint(endpoint, kind)?;
        if endpoint.is_none() && !asynchronous {
            return Err(PopenError::InvalidState(format!(
                "{} read endpoint missing",
                kind
            )));
        }
        Ok(Self {
            kind,
            endpoint,
            mode,
            asynchronous,
            stash: Bytes::new(),
            link,
        })
    }

    pub(crate) fn link_mut(&mut self) -> &mut StreamLink {
        &mut self.link
    }

    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn stream_ref(&self) -> StreamRef {
        self.link.stream
    }

    pub fn pid(&self) -> Pid {
        self.link.pid
    }

    #[inline]
    pub fn is_asynchronous(&self) -> bool {
        self.asynchronous
    }

    /// Poll for output without blocking
    ///
    /// Carriage returns are already stripped. Once `Closed` is returned
    /// every later poll returns `Closed` as well.
    pub fn poll(&mut self) -> PopenResult<Chunk> {
        if !self.asynchronous {
            return Err(PopenError::InvalidState(format!(
                "{} of process {} was not opened for asynchronous reads",
                self.kind, self.link.pid
            )));
        }
        if !self.stash.is_empty() {
            return Ok(Chunk::Data(std::mem::take(&mut self.stash)));
        }
        self.link.registry.poll(self.link.stream)
    }

    /// Close the stream, reporting it to the registry
    pub fn close(mut self) -> io::Result<()> {
        let result = self.endpoint.take().map_or(Ok(()), PipeEndpoint::close);
        self.link.release();
        result
    }

    /// Adapt an asynchronous stream into a `futures` stream of chunks,
    /// sleeping `interval` between empty polls
    pub fn into_stream(mut self, interval: Duration) -> impl Stream<Item = PopenResult<Bytes>> {
        try_stream! {
            loop {
                match self.poll()? {
                    Chunk::Data(bytes) => yield bytes,
                    Chunk::TryAgain => tokio::time::sleep(interval).await,
                    Chunk::Closed => break,
                }
            }
        }
    }

    fn read_polled(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut data = match self.poll() {
            Ok(Chunk::Data(bytes)) => bytes,
            Ok(Chunk::TryAgain) => return Err(io::ErrorKind::WouldBlock.into()),
            Ok(Chunk::Closed) => return Ok(0),
            Err(e) => return Err(io::Error::new(io::ErrorKind::Other, e)),
        };
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        self.stash = data.split_off(n);
        Ok(n)
    }

    fn read_blocking(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let text = self.mode == StreamMode::Text;
        let endpoint = self
            .endpoint
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "stream closed"))?;
        loop {
            let n = endpoint.read(buf)?;
            if n == 0 || !text {
                return Ok(n);
            }
            let kept = strip_carriage_returns(&mut buf[..n]);
            if kept > 0 {
                return Ok(kept);
            }
        }
    }
}

impl Read for ChildOutput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.asynchronous {
            self.read_polled(buf)
        } else {
            self.read_blocking(buf)
        }
    }
}

impl Drop for ChildOutput {
    fn drop(&mut self) {
        drop(self.endpoint.take());
        self.link.release();
    }
}

impl fmt::Debug for ChildOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChildOutput")
            .field("stream", &self.link.stream)
            .field("asynchronous", &self.asynchronous)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
