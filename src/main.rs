//! testrelay CLI - runs remotely authored tests and reports results back.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use testrelay::config::{self, Config};
use testrelay::engine::ProcessEngine;
use testrelay::orchestrator::{Orchestrator, RunOptions};
use testrelay::report;
use testrelay::secrets::{EnvSecrets, FileSecrets, LayeredSecrets, SecretsSource};
use testrelay::source::HttpSource;
use testrelay::workspace::Discriminator;

const DEFAULT_CONFIG: &str = "testrelay.toml";

#[derive(Parser)]
#[command(name = "testrelay")]
#[command(about = "Run remotely authored tests and report results back", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path [default: testrelay.toml, optional]
    #[arg(short, long, env = "TESTRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, execute and report one run
    Run {
        /// Tenant identifier
        #[arg(long)]
        tenant: Option<String>,

        /// Site identifier
        #[arg(long)]
        site: Option<String>,

        /// Base URL of the test source API
        #[arg(long)]
        api_url: Option<String>,

        /// Use this run id as the workspace discriminator
        #[arg(long)]
        run_id: Option<String>,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,

        /// Do not submit results to the test source
        #[arg(long)]
        no_submit: bool,

        /// Leave the workspace on disk after the run
        #[arg(long)]
        keep_workspace: bool,
    },

    /// Print the resolved configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_layered_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            tenant,
            site,
            api_url,
            run_id,
            junit,
            no_submit,
            keep_workspace,
        } => {
            let overrides = RunOverrides {
                tenant,
                site,
                api_url,
                run_id,
                junit,
                no_submit,
                keep_workspace,
            };
            run(config, overrides).await
        }
        Commands::Config => show_config(&config).await,
    }
}

/// File (if any) plus environment overrides.
fn load_layered_config(explicit: Option<&Path>) -> Result<Config> {
    let (path, required) = match explicit {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG), false),
    };

    let mut config = config::load_or_default(path, required)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;
    if path.exists() {
        info!("Loaded configuration from {}", path.display());
    }

    config.apply_env();
    Ok(config)
}

struct RunOverrides {
    tenant: Option<String>,
    site: Option<String>,
    api_url: Option<String>,
    run_id: Option<String>,
    junit: Option<PathBuf>,
    no_submit: bool,
    keep_workspace: bool,
}

impl RunOverrides {
    fn apply(&self, config: &mut Config) {
        if let Some(tenant) = &self.tenant {
            config.source.tenant_id = Some(tenant.clone());
        }
        if let Some(site) = &self.site {
            config.source.site_id = Some(site.clone());
        }
        if let Some(url) = &self.api_url {
            config.source.api_url = Some(url.clone());
        }
        if let Some(junit) = &self.junit {
            config.report.junit = Some(junit.clone());
        }
        if self.no_submit {
            config.source.submit_results = false;
        }
        if self.keep_workspace {
            config.workspace.keep = true;
        }
    }
}

fn secrets_source(config: &Config) -> LayeredSecrets {
    let mut layered = LayeredSecrets::new();
    if let Some(file) = config.secrets_file() {
        layered = layered.with_source(FileSecrets::new(file, &config.secrets.prefix));
    }
    // Environment wins over the file
    layered.with_source(EnvSecrets::new(&config.secrets.prefix))
}

async fn run(mut config: Config, overrides: RunOverrides) -> Result<()> {
    overrides.apply(&mut config);

    let resolved = config.validate().context("Invalid configuration")?;
    let discriminator = overrides
        .run_id
        .as_deref()
        .map(Discriminator::new)
        .transpose()
        .context("Invalid --run-id")?;

    let source = HttpSource::new(&resolved).context("Failed to set up test source")?;
    let engine = ProcessEngine::new(config.engine.clone(), config.secrets.override_env);
    let options = RunOptions {
        discriminator,
        ..RunOptions::from_config(&config, &resolved)
    };

    let orchestrator = Orchestrator::new(source, secrets_source(&config), engine, options);
    let outcome = orchestrator.run().await?;

    report::print_summary(&outcome);

    if let Some(path) = &config.report.junit
        && let Err(e) = report::write_junit(path, &outcome)
    {
        warn!("Failed to write JUnit report: {:#}", e);
    }

    let code = outcome.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

async fn show_config(config: &Config) -> Result<()> {
    let rendered =
        toml::to_string_pretty(&config.redacted()).context("Failed to render configuration")?;
    println!("{}", rendered.trim_end());

    if let Err(e) = config.validate() {
        println!();
        println!("# Not ready to run: {}", e);
    }

    match secrets_source(config).load().await {
        Ok(bundle) if bundle.is_empty() => {
            println!();
            println!("# No secrets found (prefix {})", config.secrets.prefix);
        }
        Ok(bundle) => {
            println!();
            println!("# Secrets passed to the engine:");
            for key in bundle.keys() {
                println!("#   {} = {}", key, config::REDACTED);
            }
        }
        Err(e) => warn!("Failed to load secrets: {}", e),
    }

    Ok(())
}
