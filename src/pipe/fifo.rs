/*!
 * Named FIFOs
 * Uniquely named, single-use FIFOs backing asynchronous pipes
 */

use crate::core::config::PopenConfig;
use log::{debug, warn};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide serial; names must stay unique across registries
static NAMED_PIPE_SERIAL: AtomicU64 = AtomicU64::new(1);

/// Directory and name prefix for asynchronous pipe FIFOs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FifoLocation {
    dir: PathBuf,
    prefix: String,
}

impl FifoLocation {
    pub fn new(dir: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            prefix: prefix.into(),
        }
    }

    pub fn from_config(config: &PopenConfig) -> Self {
        Self::new(config.fifo_dir.clone(), config.fifo_prefix.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Next unused path: `<prefix>.<pid>.<serial>`
    pub fn next_path(&self) -> PathBuf {
        let serial = NAMED_PIPE_SERIAL.fetch_add(1, Ordering::SeqCst);
        self.dir
            .join(format!("{}.{}.{}", self.prefix, std::process::id(), serial))
    }
}

impl Default for FifoLocation {
    fn default() -> Self {
        Self::from_config(&PopenConfig::default())
    }
}

/// Create a FIFO at `path` and open both ends
///
/// The read end is non-blocking; the write end is a plain blocking
/// descriptor so a child can write to it without knowing. Both ends are
/// close-on-exec. The path is unlinked before returning, so the pipe has
/// exactly one reader and one writer.
pub fn open_fifo_pair(path: &Path) -> io::Result<(OwnedFd, OwnedFd)> {
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR)?;

    let opened: io::Result<(OwnedFd, OwnedFd)> = (|| {
        // Opening the read end first lets the write open complete immediately
        let read = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)?;
        let write = OpenOptions::new().write(true).open(path)?;
        Ok((OwnedFd::from(read), OwnedFd::from(write)))
    })();

    if let Err(e) = std::fs::remove_file(path) {
        warn!("Failed to unlink FIFO {}: {}", path.display(), e);
    }

    let pair = opened?;
    debug!("Opened asynchronous pipe via FIFO {}", path.display());
    Ok(pair)
}
