//! Secret discovery and injection.
//!
//! Secrets are plain key/value pairs that reach the execution engine only
//! through its environment; they are never written into the workspace.
//! A key is visible only if it carries the configured prefix, which is
//! stripped before injection:
//!
//! ```text
//! TESTRELAY_SECRET_LOGIN_PASSWORD=hunter2   ──►   LOGIN_PASSWORD=hunter2
//! HOME=/root                                ──►   (invisible)
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

/// Result type for secret loading.
pub type SecretsResult<T> = Result<T, SecretsError>;

/// Errors raised while loading secrets.
#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    /// A secrets file could not be read.
    #[error("cannot read secrets file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A secrets file line is not `KEY=VALUE`.
    #[error("malformed line {line} in secrets file '{path}'")]
    Malformed { path: PathBuf, line: usize },
}

/// Immutable set of secrets assembled once per run.
///
/// `Debug` never prints values.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretsBundle {
    values: BTreeMap<String, String>,
}

impl SecretsBundle {
    /// Builds a bundle from variables carrying `prefix`, stripping it.
    ///
    /// Variables without the prefix, or whose name is only the prefix, are
    /// ignored.
    pub fn from_prefixed<I, K, V>(prefix: &str, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let values = vars
            .into_iter()
            .filter_map(|(key, value)| {
                let name = key.as_ref().strip_prefix(prefix)?;
                if name.is_empty() {
                    return None;
                }
                Some((name.to_string(), value.into()))
            })
            .collect();
        Self { values }
    }

    /// Returns the secret named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Iterates over `(name, value)` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Secret names, without values.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Combines two bundles; entries in `other` win.
    pub fn merged(mut self, other: SecretsBundle) -> Self {
        self.values.extend(other.values);
        self
    }

    /// Replaces every secret value in `text` with `[REDACTED:<name>]`.
    ///
    /// Text is scanned once, left to right, so markers are never rewritten
    /// by a later secret. Where several values match at the same position
    /// the longest wins.
    pub fn redact(&self, text: &str) -> String {
        let mut entries: Vec<_> = self.values.iter().filter(|(_, v)| !v.is_empty()).collect();
        entries.sort_by(|a, b| b.1.len().cmp(&a.1.len()));

        let mut result = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            match entries.iter().find(|(_, value)| rest.starts_with(value.as_str())) {
                Some((name, value)) => {
                    result.push_str("[REDACTED:");
                    result.push_str(name);
                    result.push(']');
                    rest = &rest[value.len()..];
                }
                None => {
                    result.push(c);
                    rest = &rest[c.len_utf8()..];
                }
            }
        }
        result
    }
}

impl fmt::Debug for SecretsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.values.keys()).finish()
    }
}

/// A source of secrets for one run.
#[async_trait]
pub trait SecretsSource: Send + Sync {
    /// Loads the secrets visible to this run.
    async fn load(&self) -> SecretsResult<SecretsBundle>;
}

/// Reads prefixed secrets from the process environment.
pub struct EnvSecrets {
    prefix: String,
}

impl EnvSecrets {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl SecretsSource for EnvSecrets {
    async fn load(&self) -> SecretsResult<SecretsBundle> {
        Ok(SecretsBundle::from_prefixed(&self.prefix, std::env::vars()))
    }
}

/// Reads prefixed secrets from a dotenv-style file.
///
/// Accepts `KEY=VALUE` lines, an optional leading `export `, and values
/// wrapped in matching single or double quotes. Blank lines and `#`
/// comments are ignored.
pub struct FileSecrets {
    path: PathBuf,
    prefix: String,
}

impl FileSecrets {
    pub fn new(path: impl Into<PathBuf>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }
}

fn parse_env_file(path: &Path, content: &str) -> SecretsResult<Vec<(String, String)>> {
    let mut pairs = Vec::new();
    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Err(SecretsError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
            });
        };
        let value = value.trim();
        let value = ['"', '\'']
            .iter()
            .find_map(|q| {
                value
                    .strip_prefix(*q)
                    .and_then(|v| v.strip_suffix(*q))
            })
            .unwrap_or(value);
        pairs.push((key.trim().to_string(), value.to_string()));
    }
    Ok(pairs)
}

#[async_trait]
impl SecretsSource for FileSecrets {
    async fn load(&self) -> SecretsResult<SecretsBundle> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| SecretsError::Read {
                path: self.path.clone(),
                source,
            })?;
        let pairs = parse_env_file(&self.path, &content)?;
        Ok(SecretsBundle::from_prefixed(&self.prefix, pairs))
    }
}

/// A fixed set of secrets, already stripped of any prefix.
#[derive(Default)]
pub struct StaticSecrets {
    bundle: SecretsBundle,
}

impl StaticSecrets {
    pub fn new<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        Self {
            bundle: SecretsBundle::from_prefixed("", pairs),
        }
    }
}

#[async_trait]
impl SecretsSource for StaticSecrets {
    async fn load(&self) -> SecretsResult<SecretsBundle> {
        Ok(self.bundle.clone())
    }
}

/// Combines several sources; later sources override earlier ones.
#[derive(Default)]
pub struct LayeredSecrets {
    sources: Vec<Box<dyn SecretsSource>>,
}

impl LayeredSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source on top of the existing ones.
    pub fn with_source<S: SecretsSource + 'static>(mut self, source: S) -> Self {
        self.sources.push(Box::new(source));
        self
    }
}

#[async_trait]
impl SecretsSource for LayeredSecrets {
    async fn load(&self) -> SecretsResult<SecretsBundle> {
        let mut bundle = SecretsBundle::default();
        for source in &self.sources {
            bundle = bundle.merged(source.load().await?);
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_filters_and_strips() {
        let bundle = SecretsBundle::from_prefixed(
            "TR_",
            vec![
                ("TR_LOGIN_PASSWORD", "hunter2"),
                ("TR_", "ignored"),
                ("HOME", "/root"),
                ("XTR_OTHER", "nope"),
            ],
        );

        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle.get("LOGIN_PASSWORD"), Some("hunter2"));
        assert!(bundle.get("HOME").is_none());
    }

    #[test]
    fn test_redact_prefers_longer_values() {
        let bundle = StaticSecrets::new(vec![("SHORT", "abc"), ("LONG", "abcdef")]).bundle;
        assert_eq!(
            bundle.redact("token=abcdef and abc"),
            "token=[REDACTED:LONG] and [REDACTED:SHORT]"
        );
    }

    #[test]
    fn test_redact_leaves_markers_intact() {
        let bundle = StaticSecrets::new(vec![
            ("LOGIN_PASSWORD", "hunter2"),
            ("REGION", "RED"),
            ("FLAG", "A"),
        ])
        .bundle;
        assert_eq!(
            bundle.redact("pw hunter2 in RED zone A"),
            "pw [REDACTED:LOGIN_PASSWORD] in [REDACTED:REGION] zone [REDACTED:FLAG]"
        );
    }

    #[test]
    fn test_debug_hides_values() {
        let bundle = StaticSecrets::new(vec![("API_KEY", "super-secret")]).bundle;
        let printed = format!("{:?}", bundle);
        assert!(printed.contains("API_KEY"));
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_parse_env_file() {
        let content = "# comment\n\nexport TR_A=1\nTR_B = \"two words\"\nTR_C='x=y'\n";
        let pairs = parse_env_file(Path::new("s.env"), content).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("TR_A".to_string(), "1".to_string()),
                ("TR_B".to_string(), "two words".to_string()),
                ("TR_C".to_string(), "x=y".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_env_file_malformed() {
        let err = parse_env_file(Path::new("s.env"), "TR_A=1\nnot a pair\n").unwrap_err();
        assert!(matches!(err, SecretsError::Malformed { line: 2, .. }));
    }

    #[tokio::test]
    async fn test_file_secrets_missing_file() {
        let source = FileSecrets::new("/nonexistent/secrets.env", "TR_");
        assert!(matches!(
            source.load().await,
            Err(SecretsError::Read { .. })
        ));
    }

    #[tokio::test]
    async fn test_layered_later_wins() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("secrets.env");
        std::fs::write(&path, "TR_TOKEN=from-file\nTR_ONLY_FILE=1\n").unwrap();

        let layered = LayeredSecrets::new()
            .with_source(FileSecrets::new(&path, "TR_"))
            .with_source(StaticSecrets::new(vec![("TOKEN", "from-static")]));

        let bundle = layered.load().await.unwrap();
        assert_eq!(bundle.get("TOKEN"), Some("from-static"));
        assert_eq!(bundle.get("ONLY_FILE"), Some("1"));
    }
}
