//! Configuration loading and schema definitions for testrelay.
//!
//! Configuration is resolved in layers, lowest precedence first:
//!
//! 1. Built-in defaults (see [`schema`])
//! 2. An optional TOML file
//! 3. `TESTRELAY_*` environment variables ([`Config::apply_env`])
//! 4. CLI flags, applied by the binary
//!
//! [`Config::validate`] then checks that everything a run needs is present
//! before any side effect happens.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

/// Environment variable overriding `source.api_url`.
pub const ENV_API_URL: &str = "TESTRELAY_API_URL";
/// Environment variable overriding `source.api_token`.
pub const ENV_API_TOKEN: &str = "TESTRELAY_API_TOKEN";
/// Environment variable overriding `source.tenant_id`.
pub const ENV_TENANT_ID: &str = "TESTRELAY_TENANT_ID";
/// Environment variable overriding `source.site_id`.
pub const ENV_SITE_ID: &str = "TESTRELAY_SITE_ID";

/// Result type for configuration validation.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while validating a resolved configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required setting was not provided by any layer.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A setting was provided but cannot be used.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Loads testrelay configuration from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains invalid TOML, or
/// doesn't match the schema.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    Ok(config)
}

/// Loads testrelay configuration from a TOML string.
///
/// # Example
///
/// ```
/// use testrelay::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [engine]
///     retries = 2
/// "#)?;
///
/// assert_eq!(config.engine.retries, 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).context("Failed to parse config")?;

    Ok(config)
}

/// Loads the config file if present, falling back to defaults.
///
/// A missing file is only tolerated when `required` is false, which the
/// binary uses for its default path.
pub fn load_or_default(path: &Path, required: bool) -> Result<Config> {
    if !required && !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

/// Fully validated source settings needed to start a run.
#[derive(Debug, Clone)]
pub struct ResolvedSource {
    pub api_url: String,
    pub api_token: String,
    pub tenant_id: String,
    pub site_id: String,
    pub timeout: Duration,
}

impl Config {
    /// Applies `TESTRELAY_*` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Applies overrides using `lookup` in place of the process environment.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = non_empty(ENV_API_URL) {
            self.source.api_url = Some(v);
        }
        if let Some(v) = non_empty(ENV_API_TOKEN) {
            self.source.api_token = Some(v);
        }
        if let Some(v) = non_empty(ENV_TENANT_ID) {
            self.source.tenant_id = Some(v);
        }
        if let Some(v) = non_empty(ENV_SITE_ID) {
            self.source.site_id = Some(v);
        }
    }

    /// Checks that every setting a run depends on is present and usable.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Missing`] names the first absent identifier or
    /// credential; [`ConfigError::Invalid`] reports an unusable value.
    pub fn validate(&self) -> ConfigResult<ResolvedSource> {
        let required = |value: &Option<String>, field: &'static str| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .ok_or(ConfigError::Missing(field))
        };

        let api_url = required(&self.source.api_url, "source.api_url")?;
        let api_token = required(&self.source.api_token, "source.api_token")?;
        let tenant_id = required(&self.source.tenant_id, "source.tenant_id")?;
        let site_id = required(&self.source.site_id, "source.site_id")?;

        if !(api_url.starts_with("http://") || api_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                field: "source.api_url",
                reason: format!("expected an http(s) URL, got '{}'", api_url),
            });
        }

        shell_words::split(&self.engine.command).map_err(|e| ConfigError::Invalid {
            field: "engine.command",
            reason: e.to_string(),
        })?;

        if self.engine.report_file.is_absolute() {
            return Err(ConfigError::Invalid {
                field: "engine.report_file",
                reason: "must be relative to the engine working directory or start with {workspace}"
                    .to_string(),
            });
        }

        Ok(ResolvedSource {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token,
            tenant_id,
            site_id,
            timeout: Duration::from_secs(self.source.timeout_secs),
        })
    }

    /// Returns a copy safe to print: the API token is replaced by a marker.
    pub fn redacted(&self) -> Config {
        let mut copy = self.clone();
        if copy.source.api_token.is_some() {
            copy.source.api_token = Some(REDACTED.to_string());
        }
        copy
    }

    /// Parent directory for run workspaces, with `~` and variables expanded.
    pub fn workspace_base_dir(&self) -> PathBuf {
        match &self.workspace.base_dir {
            Some(dir) => expand_path(dir),
            None => std::env::temp_dir(),
        }
    }

    /// Secrets file location, with `~` and variables expanded.
    pub fn secrets_file(&self) -> Option<PathBuf> {
        self.secrets.file.as_deref().map(expand_path)
    }
}

impl EngineConfig {
    /// Configured engine working directory, with `~` and variables expanded.
    pub fn expanded_working_dir(&self) -> Option<PathBuf> {
        self.working_dir.as_deref().map(expand_path)
    }
}

fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(e) => {
            tracing::warn!("Could not expand path '{}': {}", raw, e);
            PathBuf::from(raw)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> Config {
        load_config_str(
            r#"
            [source]
            api_url = "https://tests.example.com/"
            api_token = "tok-123"
            tenant_id = "acme"
            site_id = "storefront"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_from_empty_file() {
        let config = load_config_str("").unwrap();
        assert_eq!(config.source.timeout_secs, 30);
        assert!(config.source.submit_results);
        assert_eq!(config.engine.command, "npx playwright test");
        assert_eq!(config.engine.retries, 0);
        assert!(config.engine.expanded_working_dir().is_none());
        assert_eq!(config.secrets.prefix, "TESTRELAY_SECRET_");
        assert!(!config.workspace.keep);
        assert!(config.report.junit.is_none());
    }

    #[test]
    fn test_validate_complete() {
        let resolved = complete().validate().unwrap();
        assert_eq!(resolved.api_url, "https://tests.example.com");
        assert_eq!(resolved.tenant_id, "acme");
        assert_eq!(resolved.site_id, "storefront");
    }

    #[test]
    fn test_validate_missing_tenant() {
        let mut config = complete();
        config.source.tenant_id = Some("   ".to_string());
        match config.validate() {
            Err(ConfigError::Missing(field)) => assert_eq!(field, "source.tenant_id"),
            other => panic!("expected missing tenant, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_absolute_report_file() {
        let mut config = complete();
        config.engine.report_file = PathBuf::from("/tmp/results.json");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "engine.report_file",
                ..
            })
        ));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = complete();
        config.apply_env_from(|key| match key {
            ENV_SITE_ID => Some("checkout".to_string()),
            ENV_API_TOKEN => Some(String::new()),
            _ => None,
        });
        assert_eq!(config.source.site_id.as_deref(), Some("checkout"));
        // Empty values do not clobber configured ones
        assert_eq!(config.source.api_token.as_deref(), Some("tok-123"));
    }

    #[test]
    fn test_redacted_hides_token() {
        let config = complete();
        let printed = toml::to_string(&config.redacted()).unwrap();
        assert!(!printed.contains("tok-123"));
        assert!(printed.contains(REDACTED));
    }

    #[test]
    fn test_load_or_default_tolerates_missing_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("testrelay.toml");
        assert!(load_or_default(&path, false).is_ok());
        assert!(load_or_default(&path, true).is_err());
    }
}
