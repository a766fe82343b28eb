//! Configuration schema definitions for testrelay.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. Every field has a default so a run can be driven
//! purely from environment variables and CLI flags.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── SourceConfig           - Remote test source (URL, token, tenant/site)
//! ├── EngineConfig           - External execution engine invocation
//! ├── WorkspaceConfig        - Where per-run workspaces are allocated
//! ├── SecretsConfig          - Secret discovery (prefix, optional file)
//! └── ReportConfig           - Local report output
//! ```

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Placeholder replaced in a redacted configuration.
pub const REDACTED: &str = "[REDACTED]";

/// Root configuration structure for testrelay.
///
/// # TOML Structure
///
/// ```toml
/// [source]
/// api_url = "https://tests.example.com"
/// tenant_id = "acme"
/// site_id = "storefront"
///
/// [engine]
/// command = "npx playwright test"
/// retries = 1
///
/// [secrets]
/// prefix = "TESTRELAY_SECRET_"
/// ```
///
/// # Example
///
/// ```
/// use testrelay::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [source]
///     tenant_id = "acme"
///     site_id = "storefront"
/// "#).unwrap();
/// assert_eq!(config.engine.report_file, std::path::PathBuf::from("{workspace}/results.json"));
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Remote test source settings.
    #[serde(default)]
    pub source: SourceConfig,

    /// Execution engine settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Workspace allocation settings.
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Secret discovery settings.
    #[serde(default)]
    pub secrets: SecretsConfig,

    /// Local report output settings.
    #[serde(default)]
    pub report: ReportConfig,
}

/// Remote test source settings.
///
/// The four identifiers (`api_url`, `api_token`, `tenant_id`, `site_id`)
/// are required for a run; they are optional here so they can be supplied
/// by environment variables or CLI flags instead of the file.
///
/// # Example
///
/// ```toml
/// [source]
/// api_url = "https://tests.example.com"
/// tenant_id = "acme"
/// site_id = "storefront"
/// timeout_secs = 30
/// submit_results = true
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SourceConfig {
    /// Base URL of the test source API.
    pub api_url: Option<String>,

    /// Bearer token for the test source API.
    ///
    /// Prefer `TESTRELAY_API_TOKEN` over writing the token to a file.
    pub api_token: Option<String>,

    /// Tenant owning the site.
    pub tenant_id: Option<String>,

    /// Site whose tests are fetched.
    pub site_id: Option<String>,

    /// HTTP request timeout in seconds.
    ///
    /// Default: 30
    #[serde(default = "default_source_timeout")]
    pub timeout_secs: u64,

    /// Whether results are submitted back after a run.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub submit_results: bool,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            api_url: None,
            api_token: None,
            tenant_id: None,
            site_id: None,
            timeout_secs: default_source_timeout(),
            submit_results: true,
        }
    }
}

fn default_source_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Execution engine settings.
///
/// The engine is any program that runs a directory of test files and
/// writes a JSON report of suites, specs and attempts. The defaults target
/// Playwright.
///
/// The engine runs in `working_dir`, which defaults to the directory holding
/// the workspace. Engines report files relative to where they were started,
/// so running from above the workspace keeps the run's discriminator in
/// every reported path.
///
/// # Placeholders
///
/// Arguments may contain:
///
/// | Placeholder | Replaced with |
/// |-------------|---------------|
/// | `{workspace}` | Absolute path of the run workspace |
/// | `{retries}` | The configured `retries` value |
///
/// `report_file` and `engine.env` values accept `{workspace}` as well.
///
/// # Example
///
/// ```toml
/// [engine]
/// command = "npx playwright test"
/// args = ["{workspace}", "--reporter=json", "--retries={retries}"]
/// working_dir = "~/checkout/e2e"
/// report_file = "{workspace}/results.json"
/// retries = 2
/// path_hints = ["/opt/runner/node_modules"]
///
/// [engine.env]
/// PLAYWRIGHT_JSON_OUTPUT_NAME = "{workspace}/results.json"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Program and leading arguments, split with shell-words rules.
    ///
    /// Default: `npx playwright test`
    #[serde(default = "default_engine_command")]
    pub command: String,

    /// Additional arguments appended after `command`.
    #[serde(default = "default_engine_args")]
    pub args: Vec<String>,

    /// Directory the engine is started in. `~` and variables are expanded.
    ///
    /// Default: the parent of the run workspace
    pub working_dir: Option<String>,

    /// Report location, relative to the engine's working directory.
    ///
    /// Default: `{workspace}/results.json`
    #[serde(default = "default_report_file")]
    pub report_file: PathBuf,

    /// Retry count handed to the engine. testrelay never retries itself.
    ///
    /// Default: 0
    #[serde(default)]
    pub retries: u32,

    /// Kill the engine after this many seconds.
    ///
    /// Default: 1800 (30 minutes)
    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    /// Forward engine output to the log as it is produced.
    ///
    /// Default: true
    #[serde(default = "default_true")]
    pub stream_output: bool,

    /// Directories the engine needs to resolve its own runtime dependencies.
    #[serde(default)]
    pub path_hints: Vec<PathBuf>,

    /// Variable that `path_hints` are joined onto.
    ///
    /// Default: `NODE_PATH`
    #[serde(default = "default_path_var")]
    pub path_var: String,

    /// Extra, non-secret environment variables for the engine.
    #[serde(default = "default_engine_env")]
    pub env: HashMap<String, String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command: default_engine_command(),
            args: default_engine_args(),
            working_dir: None,
            report_file: default_report_file(),
            retries: 0,
            timeout_secs: default_engine_timeout(),
            stream_output: true,
            path_hints: Vec::new(),
            path_var: default_path_var(),
            env: default_engine_env(),
        }
    }
}

fn default_engine_command() -> String {
    "npx playwright test".to_string()
}

fn default_engine_args() -> Vec<String> {
    vec![
        "{workspace}".to_string(),
        "--reporter=json".to_string(),
        "--retries={retries}".to_string(),
    ]
}

fn default_report_file() -> PathBuf {
    PathBuf::from("{workspace}/results.json")
}

fn default_engine_timeout() -> u64 {
    1800
}

fn default_engine_env() -> HashMap<String, String> {
    HashMap::from([(
        "PLAYWRIGHT_JSON_OUTPUT_NAME".to_string(),
        "{workspace}/results.json".to_string(),
    )])
}

fn default_path_var() -> String {
    "NODE_PATH".to_string()
}

/// Workspace allocation settings.
///
/// # Example
///
/// ```toml
/// [workspace]
/// base_dir = "~/.cache/testrelay/runs"
/// keep = false
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WorkspaceConfig {
    /// Parent directory for run workspaces.
    ///
    /// `~` and environment variables are expanded. Defaults to the system
    /// temporary directory.
    pub base_dir: Option<String>,

    /// Leave the workspace on disk after the run.
    ///
    /// Default: false
    #[serde(default)]
    pub keep: bool,
}

/// Secret discovery settings.
///
/// Only keys starting with `prefix` are visible to a run. The prefix is
/// stripped before the secret is handed to the engine, so
/// `TESTRELAY_SECRET_LOGIN_PASSWORD` reaches the engine as `LOGIN_PASSWORD`.
///
/// # Example
///
/// ```toml
/// [secrets]
/// prefix = "TESTRELAY_SECRET_"
/// file = "~/.config/testrelay/secrets.env"
/// override_env = false
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    /// Key prefix that marks a variable as a secret.
    ///
    /// Default: `TESTRELAY_SECRET_`
    #[serde(default = "default_secret_prefix")]
    pub prefix: String,

    /// Optional dotenv-style file read in addition to the environment.
    pub file: Option<String>,

    /// Let secrets replace variables already present in the environment.
    ///
    /// Default: false
    #[serde(default)]
    pub override_env: bool,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            prefix: default_secret_prefix(),
            file: None,
            override_env: false,
        }
    }
}

fn default_secret_prefix() -> String {
    "TESTRELAY_SECRET_".to_string()
}

/// Local report output settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Write a JUnit XML report of correlated results to this path.
    pub junit: Option<PathBuf>,
}
