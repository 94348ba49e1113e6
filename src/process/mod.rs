/*!
 * Process Module
 * Launching, stream ownership and status of piped child processes
 */

pub mod launcher;
pub mod options;
pub mod record;
pub mod registry;
pub mod status;
pub mod streams;

// Re-export for convenience
pub use launcher::{LaunchedProcess, ProcessLauncher, ProcessLauncherBuilder};
pub use options::LaunchOptions;
pub use record::ProcessRecord;
pub use registry::{LiveProcess, ProcessRegistry};
pub use status::ProcessStatus;
pub use streams::{ChildOutput, ChildStdin};
