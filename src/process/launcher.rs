/*!
 * Process Launcher
 * Launches a shell command with all three standard streams piped
 */

use super::options::LaunchOptions;
use super::record::ProcessRecord;
use super::registry::ProcessRegistry;
use super::status::ProcessStatus;
use super::streams::{ChildOutput, ChildStdin, StreamLink};
use crate::core::config::PopenConfig;
use crate::core::errors::PopenResult;
use crate::core::types::{Pid, StreamKind, StreamRefs};
use crate::pipe::{Closer, SystemCloser};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// The three external streams of a launched child
#[derive(Debug)]
pub struct LaunchedProcess {
    pub stdin: ChildStdin,
    pub stdout: ChildOutput,
    pub stderr: ChildOutput,
    pub pid: Pid,
}

impl LaunchedProcess {
    pub fn stream_refs(&self) -> StreamRefs {
        StreamRefs {
            stdin: self.stdin.stream_ref(),
            stdout: self.stdout.stream_ref(),
            stderr: self.stderr.stream_ref(),
        }
    }
}

/// Launches children and tracks them in a registry
#[derive(Clone, Debug)]
pub struct ProcessLauncher {
    registry: ProcessRegistry,
    config: Arc<PopenConfig>,
    closer: Closer,
}

impl ProcessLauncher {
    /// Launcher with default configuration and its own registry
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> ProcessLauncherBuilder {
        ProcessLauncherBuilder::new()
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    pub fn config(&self) -> &PopenConfig {
        &self.config
    }

    /// Spawn `options.command` and expose its standard streams
    ///
    /// On any failure every pipe created so far is closed and, if the child
    /// was already running, it is handed to the registry for reaping.
    #[tracing::instrument(
        skip(self, options),
        fields(command = %options.command, asynchronous = options.asynchronous)
    )]
    pub fn launch(&self, options: &LaunchOptions) -> PopenResult<LaunchedProcess> {
        let mut record = ProcessRecord::create(options, &self.config, Arc::clone(&self.closer))?;
        let pid = record.pid();
        let refs = self.registry.allocate_stream_refs();

        if options.asynchronous {
            if let Err(e) = record.enable_async() {
                self.abandon(record);
                return Err(e);
            }
        }

        let streams = self.wrap_streams(&mut record, refs, options);
        let (mut stdin, mut stdout, mut stderr) = match streams {
            Ok(streams) => streams,
            Err(e) => {
                self.abandon(record);
                return Err(e);
            }
        };

        if let Err(e) = record.attach_external_streams(refs) {
            self.abandon(record);
            return Err(e);
        }
        self.registry.insert(record)?;

        stdin.link_mut().arm();
        stdout.link_mut().arm();
        stderr.link_mut().arm();

        info!(pid, "Launched process");
        Ok(LaunchedProcess {
            stdin,
            stdout,
            stderr,
            pid,
        })
    }

    fn wrap_streams(
        &self,
        record: &mut ProcessRecord,
        refs: StreamRefs,
        options: &LaunchOptions,
    ) -> PopenResult<(ChildStdin, ChildOutput, ChildOutput)> {
        let pid = record.pid();
        let link = |kind: StreamKind| StreamLink::new(refs.get(kind), pid, self.registry.clone());

        let stdin = ChildStdin::wrap(
            record.take_parent_endpoint(StreamKind::Stdin),
            link(StreamKind::Stdin),
        )?;
        let stdout = ChildOutput::wrap(
            StreamKind::Stdout,
            record.take_parent_endpoint(StreamKind::Stdout),
            options.mode,
            options.asynchronous,
            link(StreamKind::Stdout),
        )?;
        let stderr = ChildOutput::wrap(
            StreamKind::Stderr,
            record.take_parent_endpoint(StreamKind::Stderr),
            options.mode,
            options.asynchronous,
            link(StreamKind::Stderr),
        )?;
        Ok((stdin, stdout, stderr))
    }

    fn abandon(&self, mut record: ProcessRecord) {
        let pid = record.pid();
        warn!(pid, "Launch failed after spawn, releasing process record");
        if let Some(child) = record.teardown() {
            self.registry.adopt(pid, child);
        }
    }

    /// Exit status without blocking
    pub fn try_wait(&self, pid: Pid) -> PopenResult<Option<ProcessStatus>> {
        self.registry.try_wait(pid)
    }

    /// Block until the child exits, bounded by `timeout` if given
    pub fn wait(&self, pid: Pid, timeout: Option<Duration>) -> PopenResult<ProcessStatus> {
        self.registry.wait(pid, timeout)
    }

    pub async fn wait_async(
        &self,
        pid: Pid,
        timeout: Option<Duration>,
    ) -> PopenResult<ProcessStatus> {
        self.registry.wait_async(pid, timeout).await
    }

    pub fn reap_orphans(&self) -> usize {
        self.registry.reap_orphans()
    }
}

impl Default for ProcessLauncher {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for ProcessLauncher
pub struct ProcessLauncherBuilder {
    config: Option<PopenConfig>,
    closer: Option<Closer>,
    registry: Option<ProcessRegistry>,
}

impl ProcessLauncherBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            closer: None,
            registry: None,
        }
    }

    pub fn with_config(mut self, config: PopenConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Route every pipe close through `closer`
    pub fn with_closer(mut self, closer: Closer) -> Self {
        self.closer = Some(closer);
        self
    }

    /// Share an existing registry
    pub fn with_registry(mut self, registry: ProcessRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> ProcessLauncher {
        let config = self.config.unwrap_or_default();
        let registry = self.registry.unwrap_or_else(|| {
            ProcessRegistry::new().with_wait_poll_interval(config.wait_poll_interval())
        });
        let closer = self.closer.unwrap_or_else(|| Arc::new(SystemCloser));

        info!(
            shell = %config.shell.display(),
            fifo_dir = %config.fifo_dir.display(),
            "Process launcher initialized"
        );
        ProcessLauncher {
            registry,
            config: Arc::new(config),
            closer,
        }
    }
}

impl Default for ProcessLauncherBuilder {
    fn default() -> Self {
        Self::new()
    }
}
