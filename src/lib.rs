//! testrelay: runs remotely authored tests and reports their results back.
//!
//! A run fetches test definitions from a remote source, writes them into a
//! fresh workspace, launches an external execution engine against it, maps
//! the engine's report back to test ids and submits the results.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Source**: fetches test definitions and accepts results ([`source`])
//! - **Workspace**: per-run directory and path-to-test map ([`workspace`])
//! - **Secrets**: environment-scoped values for the engine ([`secrets`])
//! - **Engine**: the external test runner ([`engine`])
//! - **Correlation**: engine report back to test ids ([`correlate`])
//! - **Orchestrator**: sequences one run and always cleans up ([`orchestrator`])
//! - **Report**: console summary and JUnit XML ([`report`])
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
//!     let config = load_config(std::path::Path::new("testrelay.toml"))?;
//!     let resolved = config.validate()?;
//!     let orchestrator = Orchestrator::new(
//!         HttpSource::new(&resolved)?,
//!         EnvSecrets::new(&config.secrets.prefix),
//!         ProcessEngine::new(config.engine.clone(), config.secrets.override_env),
//!         RunOptions::from_config(&config, &resolved),
//!     );
//!     let outcome = orchestrator.run().await?;
//!     println!("{} records", outcome.records.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod correlate;
pub mod engine;
pub mod orchestrator;
pub mod report;
pub mod secrets;
pub mod source;
pub mod workspace;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use engine::{ExecutionEngine, ProcessEngine};
pub use orchestrator::{Orchestrator, RunError, RunOptions, RunOutcome, RunState, SubmissionOutcome};
pub use secrets::{SecretsBundle, SecretsSource};
pub use source::{HttpSource, TestSource};
pub use workspace::{Discriminator, RunWorkspace};
