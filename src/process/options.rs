/*!
 * Launch Options
 * What to run and how its standard streams are exposed
 */

use crate::core::types::StreamMode;
use std::path::PathBuf;

/// Parameters of a single launch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOptions {
    /// Command line including arguments, interpreted by the shell
    pub command: String,
    pub mode: StreamMode,
    /// Initial window visibility; there is no window station on Unix, so
    /// this is recorded but has no effect
    pub show_window: bool,
    /// Non-blocking stdout/stderr reads through `poll`
    pub asynchronous: bool,
    /// Explicit environment; `None` inherits the caller's
    pub environment: Option<Vec<(String, String)>>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchOptions {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            mode: StreamMode::Text,
            show_window: false,
            asynchronous: false,
            environment: None,
            working_dir: None,
        }
    }

    pub fn asynchronous(mut self, asynchronous: bool) -> Self {
        self.asynchronous = asynchronous;
        self
    }

    pub fn with_mode(mut self, mode: StreamMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_show_window(mut self, show_window: bool) -> Self {
        self.show_window = show_window;
        self
    }

    pub fn with_environment<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}
