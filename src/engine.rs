//! Execution engine abstraction.
//!
//! The execution engine is an external program (Playwright by default) that
//! runs every test file in a workspace and writes a JSON report. testrelay
//! only launches it, feeds it secrets through its environment and waits for
//! it to exit.
//!
//! ```text
//!   ExecutionEngine::run(workspace, secrets)
//!        │
//!        ├── spawn child above <workspace> with env + secrets
//!        ├── forward stdout/stderr (redacted) to the log
//!        └── wait ──► ExecResult { exit_code }
//!
//!   ExecutionEngine::report_path(workspace) ──► <workspace>/results.json
//!
//! Engines report test files relative to the directory they start in.
//! Starting above the workspace keeps the discriminator in those paths,
//! which is what [`crate::correlate`] joins on.
//! ```
//!
//! The exit code is the engine's verdict on the run. Distinguishing "tests
//! failed" from "engine could not start" is left to the structured report,
//! see [`crate::correlate`].
//!
//! The engine is never retried here; retries are an engine parameter
//! (`engine.retries`).

pub mod process;
pub mod report;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::secrets::SecretsBundle;

pub use process::ProcessEngine;
pub use report::ExecutionReport;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that prevent the engine from producing an exit code.
///
/// A nonzero exit code is NOT an error; it is returned in [`ExecResult`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The engine command line is empty or cannot be parsed.
    #[error("invalid engine command: {0}")]
    InvalidCommand(String),

    /// The engine process could not be started.
    #[error("failed to start engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine did not finish in time and was killed.
    #[error("engine timed out after {0}s")]
    Timeout(u64),

    /// I/O error while supervising the engine.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A fully resolved engine invocation.
///
/// # Example
///
/// ```
/// use testrelay::engine::Command;
///
/// let cmd = Command::new("npx")
///     .args(["playwright", "test"])
///     .arg("--retries=1")
///     .working_dir("/tmp/run-1")
///     .env("CI", "1")
///     .timeout(600);
///
/// assert_eq!(cmd.program, "npx");
/// assert_eq!(cmd.to_shell_string(), "npx playwright test --retries=1");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory for the child.
    pub working_dir: Option<PathBuf>,

    /// Environment added on top of the inherited one.
    pub env: Vec<(String, String)>,

    /// Maximum execution time in seconds.
    pub timeout_secs: Option<u64>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout_secs: None,
        }
    }

    /// Parses a shell-words command line such as `npx playwright test`.
    pub fn parse(command_line: &str) -> EngineResult<Self> {
        let mut parts = shell_words::split(command_line)
            .map_err(|e| EngineError::InvalidCommand(e.to_string()))?
            .into_iter();
        let program = parts
            .next()
            .ok_or_else(|| EngineError::InvalidCommand("empty command".to_string()))?;
        Ok(Self::new(program).args(parts))
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Sets the execution timeout in seconds.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Returns the configured timeout as a [`Duration`].
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Renders the command for logs. Environment values are not included.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }
}

/// Outcome of one engine invocation.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code of the engine, `-1` if it was terminated by a signal.
    pub exit_code: i32,

    /// Wall-clock time the engine ran.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the engine exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An external test execution engine.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Runs every test in `workspace` and blocks until the engine exits.
    ///
    /// `secrets` are added to the inherited environment of the child.
    async fn run(&self, workspace: &Path, secrets: &SecretsBundle) -> EngineResult<ExecResult>;

    /// Where the engine leaves its JSON report for a run in `workspace`.
    fn report_path(&self, workspace: &Path) -> PathBuf;

    /// Name for logging.
    fn name(&self) -> &str {
        "engine"
    }
}

/// Escape a string for use in a shell command.
fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars().all(|c| {
            c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | '=' | ':' | '@')
        })
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}
