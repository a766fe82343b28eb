//! Run orchestration.
//!
//! The [`Orchestrator`] drives one run through a fixed sequence of stages.
//! Every stage finishes before the next one starts.
//!
//! # Architecture
//!
//! ```text
//!   TestSource          RunWorkspace          SecretsSource       ExecutionEngine
//!       │                    │                      │                    │
//!       │ fetch()            │                      │                    │
//!       ▼                    │                      │                    │
//!  TestSnapshot ────────────►│ materialize()        │                    │
//!                            ▼                      │                    │
//!                     PathIdentityMap               │ load()             │
//!                            │                      ▼                    │
//!                            │               SecretsBundle ─────────────►│ run()
//!                            │                                           ▼
//!                            │                                  exit code + report
//!                            │                                           │
//!                            └──────────────► Correlator ◄───────────────┘
//!                                                 │
//!                                          Vec<ResultRecord>
//!                                                 │
//!   TestSource ◄──── submit() ────────────────────┘
//! ```
//!
//! # State Machine
//!
//! ```text
//! Idle → Fetching → Materializing ─┬─► NoTestsAvailable ───────────────────────┐
//!                                  └─► SecretsLoading → Executing → Correlating │
//!                                                     → Reporting ──────────────┤
//!                                                                               ▼
//!                                             CleaningUp → Succeeded | Failed
//! ```
//!
//! Fetching, workspace and engine failures are fatal and surface as
//! [`RunError`]. Secrets, correlation and submission failures are logged
//! and the run carries on. Cleanup runs on every path.
//!
//! # Example
//!
//! ```no_run
//! use testrelay::config::load_config;
//! use testrelay::engine::ProcessEngine;
//! use testrelay::orchestrator::{Orchestrator, RunOptions};
//! use testrelay::secrets::EnvSecrets;
//! use testrelay::source::HttpSource;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = load_config(std::path::Path::new("testrelay.toml"))?;
//!     config.apply_env();
//!     let resolved = config.validate()?;
//!
//!     let orchestrator = Orchestrator::new(
//!         HttpSource::new(&resolved)?,
//!         EnvSecrets::new(&config.secrets.prefix),
//!         ProcessEngine::new(config.engine.clone(), config.secrets.override_env),
//!         RunOptions::from_config(&config, &resolved),
//!     );
//!
//!     let outcome = orchestrator.run().await?;
//!     std::process::exit(outcome.exit_code());
//! }
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::config::{Config, ResolvedSource};
use crate::correlate::{Correlation, Correlator, load_report};
use crate::engine::{EngineError, ExecResult, ExecutionEngine};
use crate::secrets::{SecretsBundle, SecretsSource};
use crate::source::{
    ResultRecord, RunSubmission, SourceError, SubmissionStatus, TestSnapshot, TestSource,
};
use crate::workspace::{Discriminator, PathIdentityMap, RunWorkspace, WorkspaceError};

/// Stage of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Fetching,
    Materializing,
    NoTestsAvailable,
    SecretsLoading,
    Executing,
    Correlating,
    Reporting,
    CleaningUp,
    Succeeded,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::Fetching => "fetching",
            RunState::Materializing => "materializing",
            RunState::NoTestsAvailable => "no-tests-available",
            RunState::SecretsLoading => "secrets-loading",
            RunState::Executing => "executing",
            RunState::Correlating => "correlating",
            RunState::Reporting => "reporting",
            RunState::CleaningUp => "cleaning-up",
            RunState::Succeeded => "succeeded",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Cause of a fatal run error.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Workspace(#[from] WorkspaceError),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A fatal error, tagged with the stage it happened in.
///
/// The workspace has already been cleaned up when this is returned.
#[derive(Debug, thiserror::Error)]
#[error("run failed while {state}: {source}")]
pub struct RunError {
    pub state: RunState,
    #[source]
    pub source: StageError,
}

impl RunError {
    fn new(state: RunState, source: impl Into<StageError>) -> Self {
        Self {
            state,
            source: source.into(),
        }
    }
}

/// Result of the best-effort submission stage.
///
/// Kept apart from the run's pass/fail status: a failed submission never
/// changes the exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The source acknowledged the results.
    Submitted { created: usize },

    /// Submission was attempted and failed.
    Failed(String),

    /// Submission is turned off for this run.
    Disabled,

    /// The run ended before there was anything to submit.
    NotAttempted,
}

impl fmt::Display for SubmissionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubmissionOutcome::Submitted { created } => write!(f, "submitted ({} created)", created),
            SubmissionOutcome::Failed(reason) => write!(f, "failed: {}", reason),
            SubmissionOutcome::Disabled => f.write_str("disabled"),
            SubmissionOutcome::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// Summary of a completed run.
///
/// # Exit Codes
///
/// | Code | Meaning |
/// |------|---------|
/// | 0 | The engine exited 0, or there was nothing to run |
/// | n | The engine's own nonzero exit code |
/// | 1 | The engine was killed by a signal |
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub discriminator: Discriminator,

    /// [`RunState::Succeeded`] or [`RunState::Failed`].
    pub state: RunState,

    /// Engine exit code; `None` if the engine never ran.
    pub engine_exit_code: Option<i32>,

    /// Test files handed to the engine.
    pub executed: usize,

    pub skipped_no_source: usize,

    pub rejected: usize,

    /// Report suites that could not be mapped to a test.
    pub unmatched: usize,

    pub records: Vec<ResultRecord>,

    pub submission: SubmissionOutcome,

    pub started_at: DateTime<Utc>,

    pub finished_at: DateTime<Utc>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.state == RunState::Succeeded
    }

    pub fn passed(&self) -> usize {
        self.records.iter().filter(|r| r.passed).count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.passed()
    }

    /// Process exit code for this run.
    pub fn exit_code(&self) -> i32 {
        match self.engine_exit_code {
            None | Some(0) => 0,
            Some(code) if code > 0 => code,
            Some(_) => 1,
        }
    }
}

/// Per-run settings that are not owned by a collaborator.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub tenant_id: String,
    pub site_id: String,

    /// Parent directory of the run workspace.
    pub base_dir: PathBuf,

    /// Use this discriminator instead of generating one.
    pub discriminator: Option<Discriminator>,

    pub keep_workspace: bool,

    /// Post results back to the source.
    pub submit: bool,
}

impl RunOptions {
    pub fn new(tenant_id: impl Into<String>, site_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            site_id: site_id.into(),
            base_dir: std::env::temp_dir(),
            discriminator: None,
            keep_workspace: false,
            submit: true,
        }
    }

    pub fn from_config(config: &Config, resolved: &ResolvedSource) -> Self {
        Self {
            base_dir: config.workspace_base_dir(),
            keep_workspace: config.workspace.keep,
            submit: config.source.submit_results,
            ..Self::new(&resolved.tenant_id, &resolved.site_id)
        }
    }
}

/// State owned by one run.
///
/// Created per run and threaded through every stage, so independent runs in
/// one process share nothing.
pub struct RunContext {
    discriminator: Discriminator,
    state: RunState,
    started_at: DateTime<Utc>,
    workspace: Option<RunWorkspace>,
    map: PathIdentityMap,
    secrets: SecretsBundle,
    teardowns: usize,
}

impl RunContext {
    pub fn new(discriminator: Discriminator) -> Self {
        Self {
            discriminator,
            state: RunState::Idle,
            started_at: Utc::now(),
            workspace: None,
            map: PathIdentityMap::default(),
            secrets: SecretsBundle::default(),
            teardowns: 0,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// How many times a workspace was torn down. At most 1.
    pub fn teardowns(&self) -> usize {
        self.teardowns
    }

    fn enter(&mut self, next: RunState) {
        debug!(run = %self.discriminator, from = %self.state, to = %next, "Run state transition");
        self.state = next;
    }

    /// Removes the workspace, if one was created. Safe to call repeatedly.
    fn cleanup(&mut self) {
        let Some(mut workspace) = self.workspace.take() else {
            return;
        };
        self.teardowns += 1;
        match workspace.destroy() {
            Ok(true) => debug!(run = %self.discriminator, "Workspace removed"),
            Ok(false) => {}
            Err(e) => error!(run = %self.discriminator, "Failed to remove workspace: {}", e),
        }
    }

    fn outcome(&self, engine_exit_code: Option<i32>) -> RunOutcome {
        RunOutcome {
            discriminator: self.discriminator.clone(),
            state: RunState::Succeeded,
            engine_exit_code,
            executed: 0,
            skipped_no_source: 0,
            rejected: 0,
            unmatched: 0,
            records: Vec::new(),
            submission: SubmissionOutcome::NotAttempted,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Sequences one run across a test source, a secrets source and an engine.
///
/// # Type Parameters
///
/// - `S`: the test source
/// - `K`: the secrets source
/// - `E`: the execution engine
pub struct Orchestrator<S, K, E> {
    source: S,
    secrets: K,
    engine: E,
    options: RunOptions,
}

impl<S, K, E> Orchestrator<S, K, E>
where
    S: TestSource,
    K: SecretsSource,
    E: ExecutionEngine,
{
    pub fn new(source: S, secrets: K, engine: E, options: RunOptions) -> Self {
        Self {
            source,
            secrets,
            engine,
            options,
        }
    }

    /// Executes a full run and cleans up after it.
    ///
    /// # Errors
    ///
    /// Returns [`RunError`] if fetching, workspace preparation or the engine
    /// fails. The workspace is removed before returning either way.
    pub async fn run(&self) -> Result<RunOutcome, RunError> {
        let discriminator = self
            .options
            .discriminator
            .clone()
            .unwrap_or_else(Discriminator::generate);
        let mut ctx = RunContext::new(discriminator);
        self.run_with_context(&mut ctx).await
    }

    /// Like [`Orchestrator::run`], recording progress in a caller-owned
    /// context. The context's discriminator names the workspace.
    pub async fn run_with_context(&self, ctx: &mut RunContext) -> Result<RunOutcome, RunError> {
        info!(
            run = %ctx.discriminator,
            tenant = %self.options.tenant_id,
            site = %self.options.site_id,
            "Starting run"
        );

        let result = self.drive(ctx).await;

        ctx.enter(RunState::CleaningUp);
        ctx.cleanup();

        match result {
            Ok(mut outcome) => {
                outcome.state = if outcome.exit_code() == 0 {
                    RunState::Succeeded
                } else {
                    RunState::Failed
                };
                outcome.finished_at = Utc::now();
                ctx.enter(outcome.state);
                info!(run = %ctx.discriminator, status = %outcome.state, "Run finished");
                Ok(outcome)
            }
            Err(e) => {
                ctx.enter(RunState::Failed);
                error!(run = %ctx.discriminator, "{}", e);
                Err(e)
            }
        }
    }

    async fn drive(&self, ctx: &mut RunContext) -> Result<RunOutcome, RunError> {
        ctx.enter(RunState::Fetching);
        let snapshot = self.fetch().await?;

        ctx.enter(RunState::Materializing);
        let workspace = RunWorkspace::create(&self.options.base_dir, &ctx.discriminator)
            .map_err(|e| RunError::new(RunState::Materializing, e))?
            .keep_on_destroy(self.options.keep_workspace);
        let root = workspace.root().to_path_buf();
        let materialized = ctx
            .workspace
            .insert(workspace)
            .materialize(&snapshot.tests)
            .await
            .map_err(|e| RunError::new(RunState::Materializing, e))?;
        ctx.map = materialized.map;

        if materialized.written == 0 {
            ctx.enter(RunState::NoTestsAvailable);
            info!(
                skipped_no_source = materialized.skipped_no_source,
                rejected = materialized.rejected,
                "No executable tests, nothing to run"
            );
            return Ok(RunOutcome {
                skipped_no_source: materialized.skipped_no_source,
                rejected: materialized.rejected,
                ..ctx.outcome(None)
            });
        }

        ctx.enter(RunState::SecretsLoading);
        ctx.secrets = self.load_secrets().await;

        ctx.enter(RunState::Executing);
        let exec = self.execute(&root, &ctx.secrets).await?;

        ctx.enter(RunState::Correlating);
        let correlation = self.correlate(&root, ctx).await;

        ctx.enter(RunState::Reporting);
        let submission = self.report(ctx, &exec, &correlation.records).await;

        Ok(RunOutcome {
            executed: materialized.written,
            skipped_no_source: materialized.skipped_no_source,
            rejected: materialized.rejected,
            unmatched: correlation.unmatched_suites,
            records: correlation.records,
            submission,
            ..ctx.outcome(Some(exec.exit_code))
        })
    }

    async fn fetch(&self) -> Result<TestSnapshot, RunError> {
        let snapshot = self
            .source
            .fetch()
            .await
            .map_err(|e| RunError::new(RunState::Fetching, e))?;

        info!(
            source = self.source.name(),
            site = snapshot.site_name.as_deref().unwrap_or(&snapshot.site_id),
            tests = snapshot.tests.len(),
            "Fetched test definitions"
        );
        Ok(snapshot)
    }

    async fn load_secrets(&self) -> SecretsBundle {
        match self.secrets.load().await {
            Ok(bundle) => {
                if bundle.is_empty() {
                    warn!("No secrets found, running without them");
                } else {
                    info!(count = bundle.len(), "Loaded secrets");
                }
                bundle
            }
            Err(e) => {
                warn!("Failed to load secrets, running without them: {}", e);
                SecretsBundle::default()
            }
        }
    }

    async fn execute(&self, root: &Path, secrets: &SecretsBundle) -> Result<ExecResult, RunError> {
        info!(engine = self.engine.name(), "Executing tests");
        self.engine
            .run(root, secrets)
            .await
            .map_err(|e| RunError::new(RunState::Executing, e))
    }

    async fn correlate(&self, root: &Path, ctx: &RunContext) -> Correlation {
        let report_path = self.engine.report_path(root);
        let report = match load_report(&report_path).await {
            Ok(Some(report)) => report,
            Ok(None) => {
                warn!(path = %report_path.display(), "Engine wrote no report, no results to correlate");
                return Correlation::default();
            }
            Err(e) => {
                warn!("Skipping correlation: {}", e);
                return Correlation::default();
            }
        };

        let correlation = Correlator::new(root, &ctx.discriminator, &ctx.map).correlate(&report);
        info!(
            records = correlation.records.len(),
            unmatched_suites = correlation.unmatched_suites,
            "Correlated results"
        );
        correlation
    }

    async fn report(
        &self,
        ctx: &RunContext,
        exec: &ExecResult,
        records: &[ResultRecord],
    ) -> SubmissionOutcome {
        if !self.options.submit {
            info!("Result submission disabled");
            return SubmissionOutcome::Disabled;
        }

        let submission = RunSubmission {
            tenant_id: self.options.tenant_id.clone(),
            site_id: self.options.site_id.clone(),
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            status: if exec.success() {
                SubmissionStatus::Passed
            } else {
                SubmissionStatus::Failed
            },
            results: records.to_vec(),
        };

        match self.source.submit(&submission).await {
            Ok(ack) => {
                info!(created = ack.created_count, "Submitted results");
                SubmissionOutcome::Submitted {
                    created: ack.created_count,
                }
            }
            Err(e) => {
                warn!("Failed to submit results: {}", e);
                SubmissionOutcome::Failed(e.to_string())
            }
        }
    }
}
