/*!
 * Pipe Endpoints
 *
 * RAII owner of one pipe file descriptor. Every close goes through an
 * injectable closer so the number of real OS closes can be observed.
 */

use log::error;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Closes pipe descriptors on behalf of endpoints
pub trait HandleCloser: Send + Sync + fmt::Debug {
    fn close(&self, fd: OwnedFd) -> io::Result<()>;
}

/// Closes descriptors with `close(2)`, reporting the error instead of
/// swallowing it like `OwnedFd`'s drop does
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCloser;

impl HandleCloser for SystemCloser {
    fn close(&self, fd: OwnedFd) -> io::Result<()> {
        nix::unistd::close(fd.into_raw_fd()).map_err(io::Error::from)
    }
}

/// Closer that counts every close it performs before delegating
#[derive(Debug, Default)]
pub struct CountingCloser {
    inner: SystemCloser,
    closes: AtomicUsize,
}

impl CountingCloser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of descriptors closed so far
    pub fn count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl HandleCloser for CountingCloser {
    fn close(&self, fd: OwnedFd) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close(fd)
    }
}

/// Shared closer handle
pub type Closer = Arc<dyn HandleCloser>;

/// One exclusively owned pipe endpoint
///
/// Closed through its closer on drop unless ownership was moved out with
/// [`PipeEndpoint::into_owned_fd`].
pub struct PipeEndpoint {
    file: Option<File>,
    closer: Closer,
}

impl PipeEndpoint {
    pub fn new(fd: OwnedFd, closer: Closer) -> Self {
        Self {
            file: Some(File::from(fd)),
            closer,
        }
    }

    #[inline]
    pub fn raw_fd(&self) -> RawFd {
        self.file.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
    }

    pub fn closer(&self) -> &Closer {
        &self.closer
    }

    /// Duplicate into a new close-on-exec descriptor owned by the caller
    pub fn try_clone_file(&self) -> io::Result<File> {
        self.file()?.try_clone()
    }

    /// Duplicate into a new close-on-exec endpoint sharing this closer
    pub fn duplicate(&self) -> io::Result<PipeEndpoint> {
        let fd = self.file()?.as_fd().try_clone_to_owned()?;
        Ok(PipeEndpoint::new(fd, Arc::clone(&self.closer)))
    }

    /// Borrow the descriptor for readiness checks and flag changes
    pub fn borrow_fd(&self) -> io::Result<BorrowedFd<'_>> {
        self.file().map(|f| f.as_fd())
    }

    /// Metadata of the open descriptor, used to check its file type
    pub fn metadata(&self) -> io::Result<std::fs::Metadata> {
        self.file()?.metadata()
    }

    /// Switch `O_NONBLOCK` on or off for this descriptor
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let fd = self.file()?.as_raw_fd();
        let mut flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(fd, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Move the descriptor out without closing it
    pub fn into_owned_fd(mut self) -> Option<OwnedFd> {
        self.file.take().map(OwnedFd::from)
    }

    /// Close now, reporting the OS error if any
    pub fn close(mut self) -> io::Result<()> {
        self.release()
    }

    fn release(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => self.closer.close(OwnedFd::from(file)),
            None => Ok(()),
        }
    }

    fn file(&self) -> io::Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint released"))
    }

    fn file_mut(&mut self) -> io::Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "endpoint released"))
    }
}

impl Read for PipeEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file_mut()?.read(buf)
    }
}

impl Write for PipeEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file_mut()?.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file_mut()?.flush()
    }
}

impl fmt::Debug for PipeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeEndpoint")
            .field("fd", &self.raw_fd())
            .finish()
    }
}

impl Drop for PipeEndpoint {
    fn drop(&mut self) {
        let fd = self.raw_fd();
        if let Err(e) = self.release() {
            error!("Failed to close pipe endpoint fd {}: {}", fd, e);
        }
    }
}
