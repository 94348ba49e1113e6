/*!
 * Configuration
 * Launcher settings with serde support and environment overrides
 */

use super::limits::{
    DEFAULT_DRAIN_POLL_INTERVAL, DEFAULT_SHELL, DEFAULT_WAIT_POLL_INTERVAL, FIFO_NAME_PREFIX,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Launcher configuration
///
/// Environment variables read by [`PopenConfig::from_env`]:
/// - POPEN_SHELL: shell used to run command strings (default: /bin/sh)
/// - POPEN_FIFO_DIR: directory for asynchronous pipe FIFOs (default: system temp dir)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct PopenConfig {
    pub shell: PathBuf,
    pub fifo_dir: PathBuf,
    pub fifo_prefix: String,
    pub wait_poll_interval_ms: u64,
    pub drain_poll_interval_ms: u64,
}

impl Default for PopenConfig {
    fn default() -> Self {
        Self {
            shell: PathBuf::from(DEFAULT_SHELL),
            fifo_dir: std::env::temp_dir(),
            fifo_prefix: FIFO_NAME_PREFIX.to_string(),
            wait_poll_interval_ms: DEFAULT_WAIT_POLL_INTERVAL.as_millis() as u64,
            drain_poll_interval_ms: DEFAULT_DRAIN_POLL_INTERVAL.as_millis() as u64,
        }
    }
}

impl PopenConfig {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(shell) = std::env::var("POPEN_SHELL") {
            if !shell.trim().is_empty() {
                config.shell = PathBuf::from(shell);
            }
        }
        if let Ok(dir) = std::env::var("POPEN_FIFO_DIR") {
            if !dir.trim().is_empty() {
                config.fifo_dir = PathBuf::from(dir);
            }
        }
        config
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = dir.into();
        self
    }

    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    #[inline]
    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms.max(1))
    }

    #[inline]
    pub fn drain_poll_interval(&self) -> Duration {
        Duration::from_millis(self.drain_poll_interval_ms.max(1))
    }
}
