//! Local process implementation of [`ExecutionEngine`].
//!
//! The configured command runs as a child process. Its working directory is
//! `engine.working_dir`, or the directory holding the workspace, so the paths
//! the engine reports still name the workspace. The child inherits the parent environment; on top of
//! it go `engine.env`, the `path_hints`, and finally the run's secrets.
//! A secret never replaces an inherited variable unless
//! `secrets.override_env` is set.
//!
//! # Example Configuration
//!
//! ```toml
//! [engine]
//! command = "npx playwright test"
//! args = ["{workspace}", "--reporter=json", "--retries={retries}"]
//! working_dir = "/srv/e2e"
//! timeout_secs = 1800
//! path_hints = ["/opt/runner/node_modules"]
//! ```

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use super::{Command, EngineError, EngineResult, ExecResult, ExecutionEngine};
use crate::config::EngineConfig;
use crate::secrets::SecretsBundle;

/// Environment variable carrying the workspace path to the engine.
pub const WORKSPACE_ENV: &str = "TESTRELAY_WORKSPACE";

/// A line of engine output.
#[derive(Debug, Clone)]
enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Runs the engine as a local child process.
pub struct ProcessEngine {
    config: EngineConfig,
    override_env: bool,
}

impl ProcessEngine {
    /// Creates an engine from its configuration.
    ///
    /// `override_env` lets secrets replace inherited variables of the same
    /// name.
    pub fn new(config: EngineConfig, override_env: bool) -> Self {
        Self {
            config,
            override_env,
        }
    }

    /// Resolves the command line for a run in `workspace`.
    ///
    /// Secrets are not part of the returned command.
    pub fn command_for(&self, workspace: &Path) -> EngineResult<Command> {
        let mut cmd = Command::parse(&self.config.command)?
            .args(self.config.args.iter().map(|arg| self.expand(arg, workspace)))
            .working_dir(self.working_dir_for(workspace))
            .timeout(self.config.timeout_secs)
            .env(WORKSPACE_ENV, workspace.to_string_lossy().into_owned());

        let mut env: Vec<_> = self.config.env.iter().collect();
        env.sort();
        for (key, value) in env {
            cmd = cmd.env(key, self.expand(value, workspace));
        }

        if let Some(joined) = self.joined_path_hints() {
            cmd = cmd.env(&self.config.path_var, joined);
        }

        Ok(cmd)
    }

    /// Directory the engine starts in for a run in `workspace`.
    pub fn working_dir_for(&self, workspace: &Path) -> PathBuf {
        match self.config.expanded_working_dir() {
            Some(dir) => dir,
            None => workspace.parent().unwrap_or(workspace).to_path_buf(),
        }
    }

    fn expand(&self, value: &str, workspace: &Path) -> String {
        value
            .replace("{workspace}", &workspace.to_string_lossy())
            .replace("{retries}", &self.config.retries.to_string())
    }

    /// Prepends `path_hints` to the current value of `path_var`.
    fn joined_path_hints(&self) -> Option<String> {
        if self.config.path_hints.is_empty() {
            return None;
        }

        let mut paths: Vec<PathBuf> = self.config.path_hints.clone();
        if let Some(existing) = std::env::var_os(&self.config.path_var) {
            paths.extend(std::env::split_paths(&existing));
        }

        match std::env::join_paths(paths) {
            Ok(joined) => Some(os_to_string(joined)),
            Err(e) => {
                warn!("Ignoring engine path hints: {}", e);
                None
            }
        }
    }

    /// Secrets that will actually be injected.
    fn secret_env<'a>(&self, secrets: &'a SecretsBundle) -> Vec<(&'a str, &'a str)> {
        secrets
            .iter()
            .filter(|(key, _)| {
                let shadowed = !self.override_env && std::env::var_os(key).is_some();
                if shadowed {
                    debug!(key, "Secret not injected: variable already set in environment");
                }
                !shadowed
            })
            .collect()
    }
}

fn os_to_string(value: OsString) -> String {
    value.to_string_lossy().into_owned()
}

/// Logs engine output until both pipes close.
async fn forward_output(
    mut lines: impl Stream<Item = OutputLine> + Unpin,
    secrets: &SecretsBundle,
    stream_output: bool,
) {
    while let Some(line) = lines.next().await {
        match line {
            OutputLine::Stdout(s) if stream_output => info!(target: "engine", "{}", secrets.redact(&s)),
            OutputLine::Stderr(s) if stream_output => warn!(target: "engine", "{}", secrets.redact(&s)),
            OutputLine::Stdout(s) | OutputLine::Stderr(s) => {
                debug!(target: "engine", "{}", secrets.redact(&s))
            }
        }
    }
}

#[async_trait]
impl ExecutionEngine for ProcessEngine {
    async fn run(&self, workspace: &Path, secrets: &SecretsBundle) -> EngineResult<ExecResult> {
        let cmd = self.command_for(workspace)?;
        let injected = self.secret_env(secrets);

        info!(
            secrets = injected.len(),
            "Starting engine: {}",
            cmd.to_shell_string()
        );

        let mut process = tokio::process::Command::new(&cmd.program);
        process.args(&cmd.args);
        if let Some(dir) = &cmd.working_dir {
            process.current_dir(dir);
        }
        for (key, value) in &cmd.env {
            process.env(key, value);
        }
        for (key, value) in &injected {
            process.env(key, value);
        }
        process.stdin(Stdio::null());
        process.stdout(Stdio::piped());
        process.stderr(Stdio::piped());
        process.kill_on_drop(true);

        let start = Instant::now();
        let mut child = process.spawn().map_err(|source| EngineError::Spawn {
            program: cmd.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("engine stdout not captured"))
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            EngineError::Io(std::io::Error::other("engine stderr not captured"))
        })?;

        let stdout_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stdout).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stdout(line.unwrap_or_default()));
        let stderr_stream = tokio_stream::wrappers::LinesStream::new(BufReader::new(stderr).lines())
            .map(|line: Result<String, std::io::Error>| OutputLine::Stderr(line.unwrap_or_default()));

        // Merge stdout and stderr streams
        let combined = stream::select(stdout_stream, stderr_stream);

        let supervise = async {
            forward_output(combined, secrets, self.config.stream_output).await;
            child.wait().await
        };

        let status = match cmd.timeout_duration() {
            Some(limit) => match tokio::time::timeout(limit, supervise).await {
                Ok(status) => status?,
                Err(_) => {
                    if let Err(e) = child.kill().await {
                        warn!("Failed to kill timed out engine: {}", e);
                    }
                    return Err(EngineError::Timeout(limit.as_secs()));
                }
            },
            None => supervise.await?,
        };

        let result = ExecResult {
            exit_code: status.code().unwrap_or(-1),
            duration: start.elapsed(),
        };

        info!(
            exit_code = result.exit_code,
            "Engine finished in {:.1}s",
            result.duration.as_secs_f64()
        );

        Ok(result)
    }

    fn report_path(&self, workspace: &Path) -> PathBuf {
        let report_file = self.expand(&self.config.report_file.to_string_lossy(), workspace);
        self.working_dir_for(workspace).join(report_file)
    }

    fn name(&self) -> &str {
        "process"
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::secrets::StaticSecrets;
    use crate::secrets::SecretsSource;

    fn sh_engine(script: &str) -> ProcessEngine {
        ProcessEngine::new(
            EngineConfig {
                command: "sh -c".to_string(),
                args: vec![script.to_string()],
                timeout_secs: 30,
                env: HashMap::new(),
                ..EngineConfig::default()
            },
            false,
        )
    }

    #[test]
    fn test_command_for_expands_placeholders() {
        let engine = ProcessEngine::new(
            EngineConfig {
                retries: 2,
                ..EngineConfig::default()
            },
            false,
        );
        let workspace = Path::new("/tmp/runs/run-1");
        let cmd = engine.command_for(workspace).unwrap();

        assert_eq!(cmd.program, "npx");
        assert_eq!(
            cmd.args,
            vec!["playwright", "test", "/tmp/runs/run-1", "--reporter=json", "--retries=2"]
        );
        // Started above the workspace so reported paths keep the run's directory
        assert_eq!(cmd.working_dir.as_deref(), Some(Path::new("/tmp/runs")));
        assert!(cmd.env.contains(&(WORKSPACE_ENV.to_string(), "/tmp/runs/run-1".to_string())));
        assert!(cmd.env.contains(&(
            "PLAYWRIGHT_JSON_OUTPUT_NAME".to_string(),
            "/tmp/runs/run-1/results.json".to_string()
        )));
        assert_eq!(
            engine.report_path(workspace),
            PathBuf::from("/tmp/runs/run-1/results.json")
        );
    }

    #[test]
    fn test_configured_working_dir_anchors_report() {
        let engine = ProcessEngine::new(
            EngineConfig {
                working_dir: Some("/srv/e2e".to_string()),
                report_file: PathBuf::from("out/report.json"),
                ..EngineConfig::default()
            },
            false,
        );
        let workspace = Path::new("/tmp/runs/run-1");

        let cmd = engine.command_for(workspace).unwrap();
        assert_eq!(cmd.working_dir.as_deref(), Some(Path::new("/srv/e2e")));
        assert_eq!(
            engine.report_path(workspace),
            PathBuf::from("/srv/e2e/out/report.json")
        );
    }

    #[test]
    fn test_command_for_joins_path_hints() {
        let engine = ProcessEngine::new(
            EngineConfig {
                path_hints: vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")],
                path_var: "TESTRELAY_TEST_UNSET_PATH_VAR".to_string(),
                ..EngineConfig::default()
            },
            false,
        );
        let cmd = engine.command_for(Path::new("/tmp/w")).unwrap();
        let value = cmd
            .env
            .iter()
            .find(|(k, _)| k == "TESTRELAY_TEST_UNSET_PATH_VAR")
            .map(|(_, v)| v.clone())
            .unwrap();
        let parts: Vec<PathBuf> = std::env::split_paths(&value).collect();
        assert_eq!(parts, vec![PathBuf::from("/opt/a"), PathBuf::from("/opt/b")]);
    }

    #[test]
    fn test_secrets_do_not_shadow_inherited_env() {
        // PATH is always present in the test environment
        let bundle = SecretsBundle::from_prefixed("", vec![("PATH", "evil"), ("LOGIN", "x")]);

        let engine = sh_engine("true");
        let keys: Vec<_> = engine.secret_env(&bundle).into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["LOGIN"]);

        let overriding = ProcessEngine::new(EngineConfig::default(), true);
        assert_eq!(overriding.secret_env(&bundle).len(), 2);
    }

    /// A workspace directory inside a fresh base, as the workspace manager lays it out.
    fn run_dir() -> (tempfile::TempDir, PathBuf) {
        let base = tempfile::TempDir::new().unwrap();
        let workspace = base.path().join("run-1");
        std::fs::create_dir(&workspace).unwrap();
        (base, workspace)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code_and_injects_secrets() {
        let (_base, workspace) = run_dir();
        let secrets = StaticSecrets::new(vec![("TESTRELAY_TEST_SECRET", "s3cret")])
            .load()
            .await
            .unwrap();

        let engine = sh_engine(
            r#"printf '%s' "$TESTRELAY_TEST_SECRET" > "$TESTRELAY_WORKSPACE/seen.txt"; exit 3"#,
        );
        let result = engine.run(&workspace, &secrets).await.unwrap();

        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(
            std::fs::read_to_string(workspace.join("seen.txt")).unwrap(),
            "s3cret"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_starts_above_workspace() {
        let (base, workspace) = run_dir();
        let engine = sh_engine(
            r#"test -d run-1 || exit 7; echo '{"suites":[]}' > "$TESTRELAY_WORKSPACE/results.json""#,
        );
        let result = engine.run(&workspace, &SecretsBundle::default()).await.unwrap();

        assert!(result.success());
        assert_eq!(engine.report_path(&workspace), workspace.join("results.json"));
        assert!(engine.report_path(&workspace).exists());
        assert_eq!(std::fs::read_dir(base.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_run_missing_program_is_spawn_error() {
        let (_base, workspace) = run_dir();
        let engine = ProcessEngine::new(
            EngineConfig {
                command: "testrelay-definitely-not-installed".to_string(),
                args: Vec::new(),
                ..EngineConfig::default()
            },
            false,
        );

        assert!(matches!(
            engine.run(&workspace, &SecretsBundle::default()).await,
            Err(EngineError::Spawn { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_times_out() {
        let (_base, workspace) = run_dir();
        let engine = ProcessEngine::new(
            EngineConfig {
                command: "sh -c".to_string(),
                args: vec!["sleep 5".to_string()],
                timeout_secs: 1,
                ..EngineConfig::default()
            },
            false,
        );

        assert!(matches!(
            engine.run(&workspace, &SecretsBundle::default()).await,
            Err(EngineError::Timeout(1))
        ));
    }
}
