//! Per-run workspace lifecycle.
//!
//! A [`RunWorkspace`] is an exclusively owned directory named after the
//! run's [`Discriminator`]. Test definitions are materialized into it and a
//! [`PathIdentityMap`] records which definition produced which file. The
//! directory is removed when the run ends, whichever way it ends:
//! [`RunWorkspace::destroy`] is idempotent and `Drop` calls it as a backstop.
//!
//! ```text
//! <base_dir>/
//! └── run-20260101120000-1a2b3c4d/      <- discriminator
//!     ├── tests/checkout.spec.ts        -> "t-1"
//!     └── tests/search/basic.spec.ts    -> "t-2"
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::source::TestDefinition;

/// Result type for workspace operations.
pub type WorkspaceResult<T> = Result<T, WorkspaceError>;

/// Errors raised by workspace operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    /// The workspace directory could not be allocated.
    #[error("failed to create workspace at '{path}': {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Two definitions target the same file.
    #[error("tests '{first}' and '{second}' both materialize to '{path}'")]
    DuplicatePath {
        path: PathBuf,
        first: String,
        second: String,
    },

    /// A discriminator cannot be embedded in a path.
    #[error("invalid run discriminator '{0}'")]
    InvalidDiscriminator(String),

    /// The workspace tree could not be removed.
    #[error("failed to remove workspace at '{path}': {source}")]
    Destroy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Unique per-run token embedded in the workspace path.
///
/// The same value is handed to the workspace and to the correlator, which
/// uses it to find workspace-relative paths inside engine output.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Discriminator(String);

impl Discriminator {
    /// Generates `run-<UTC timestamp>-<8 hex chars>`.
    pub fn generate() -> Self {
        let nonce = uuid::Uuid::new_v4().simple().to_string();
        Self(format!(
            "run-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &nonce[..8]
        ))
    }

    /// Wraps a caller supplied token.
    ///
    /// # Errors
    ///
    /// Rejects empty tokens and tokens that are not a single plain path
    /// segment.
    pub fn new(value: impl Into<String>) -> WorkspaceResult<Self> {
        let value = value.into();
        let valid = !value.is_empty()
            && value != "."
            && value != ".."
            && value
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(value))
        } else {
            Err(WorkspaceError::InvalidDiscriminator(value))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Discriminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps absolute materialized file paths to the originating test id.
///
/// Written once during materialization, read once during correlation.
#[derive(Debug, Clone, Default)]
pub struct PathIdentityMap {
    entries: HashMap<PathBuf, String>,
}

impl PathIdentityMap {
    fn insert(&mut self, path: PathBuf, test_id: String) {
        self.entries.insert(path, test_id);
    }

    /// Returns the test id materialized at `path`.
    pub fn get(&self, path: &Path) -> Option<&str> {
        self.entries.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.entries.iter().map(|(p, id)| (p.as_path(), id.as_str()))
    }
}

/// Outcome of [`RunWorkspace::materialize`].
#[derive(Debug, Default)]
pub struct Materialized {
    /// Files written.
    pub written: usize,

    /// Definitions without source code.
    pub skipped_no_source: usize,

    /// Definitions with an unusable path or whose file could not be written.
    pub rejected: usize,

    pub map: PathIdentityMap,
}

/// An exclusively owned directory holding one run's test files.
pub struct RunWorkspace {
    root: PathBuf,
    discriminator: Discriminator,
    keep: bool,
    destroyed: bool,
}

impl RunWorkspace {
    /// Allocates `<base_dir>/<discriminator>`.
    ///
    /// `base_dir` is created if needed and canonicalized so every path the
    /// workspace hands out is absolute. The run directory itself must not
    /// exist yet: a second run reusing a discriminator fails here instead of
    /// sharing files.
    pub fn create(base_dir: &Path, discriminator: &Discriminator) -> WorkspaceResult<Self> {
        let create_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| WorkspaceError::Create { path, source }
        };

        std::fs::create_dir_all(base_dir).map_err(create_err(base_dir))?;
        let base = std::fs::canonicalize(base_dir).map_err(create_err(base_dir))?;
        let root = base.join(discriminator.as_str());
        std::fs::create_dir(&root).map_err(create_err(&root))?;

        debug!(path = %root.display(), "Created workspace");

        Ok(Self {
            root,
            discriminator: discriminator.clone(),
            keep: false,
            destroyed: false,
        })
    }

    /// Leaves the directory on disk when the workspace is destroyed.
    pub fn keep_on_destroy(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// Writes every executable definition into the workspace.
    ///
    /// Definitions without source code are counted and logged. A definition
    /// with an unusable path, or whose file cannot be written, is logged and
    /// skipped without aborting the batch.
    ///
    /// # Errors
    ///
    /// [`WorkspaceError::DuplicatePath`] if two executable definitions target
    /// the same relative path. This is checked before anything is written.
    pub async fn materialize(&self, defs: &[TestDefinition]) -> WorkspaceResult<Materialized> {
        let mut result = Materialized::default();
        let mut planned: Vec<(PathBuf, &TestDefinition, &str)> = Vec::new();
        let mut claimed: HashMap<PathBuf, &str> = HashMap::new();

        for def in defs {
            let Some(source) = def.source_code.as_deref().filter(|_| def.is_executable()) else {
                info!(test_id = %def.id, title = %def.title, "Skipping test without source code");
                result.skipped_no_source += 1;
                continue;
            };

            let Some(relative) = normalize_relative(&def.target_relative_path) else {
                warn!(
                    test_id = %def.id,
                    path = %def.target_relative_path.display(),
                    "Skipping test with unusable target path"
                );
                result.rejected += 1;
                continue;
            };

            if let Some(first) = claimed.insert(relative.clone(), &def.id) {
                return Err(WorkspaceError::DuplicatePath {
                    path: relative,
                    first: first.to_string(),
                    second: def.id.clone(),
                });
            }

            planned.push((relative, def, source));
        }

        for (relative, def, source) in planned {
            let path = self.root.join(&relative);
            match write_test_file(&path, strip_code_fences(source)).await {
                Ok(()) => {
                    debug!(test_id = %def.id, path = %path.display(), "Materialized test");
                    result.map.insert(path, def.id.clone());
                    result.written += 1;
                }
                Err(e) => {
                    warn!(test_id = %def.id, path = %path.display(), "Failed to write test file: {}", e);
                    result.rejected += 1;
                }
            }
        }

        info!(
            written = result.written,
            skipped_no_source = result.skipped_no_source,
            rejected = result.rejected,
            "Materialized tests into {}",
            self.root.display()
        );

        Ok(result)
    }

    /// Removes the workspace tree.
    ///
    /// Returns `Ok(true)` if this call removed the directory and `Ok(false)`
    /// if there was nothing to do (already destroyed, already gone, or kept).
    pub fn destroy(&mut self) -> WorkspaceResult<bool> {
        if self.destroyed {
            return Ok(false);
        }
        self.destroyed = true;

        if self.keep {
            info!("Keeping workspace at {}", self.root.display());
            return Ok(false);
        }

        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {
                debug!(path = %self.root.display(), "Removed workspace");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(WorkspaceError::Destroy {
                path: self.root.clone(),
                source,
            }),
        }
    }
}

impl Drop for RunWorkspace {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            tracing::error!("Failed to clean up workspace on drop: {}", e);
        }
    }
}

/// Converts a declared target path into a clean relative path.
///
/// Returns `None` for empty, absolute, or parent-escaping paths.
pub(crate) fn normalize_relative(path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    (!clean.as_os_str().is_empty()).then_some(clean)
}

/// Writes one test file. A failed write leaves no file behind.
async fn write_test_file(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if let Err(e) = tokio::fs::write(path, content).await {
        discard_partial(path).await;
        return Err(e);
    }
    Ok(())
}

/// Removes whatever a failed write left at `path`. Only plain files go.
async fn discard_partial(path: &Path) {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_file() => {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), "Failed to remove partial test file: {}", e);
            }
        }
        _ => {}
    }
}

static FENCE_PATTERNS: OnceLock<Result<(Regex, Regex), regex::Error>> = OnceLock::new();

fn fence_patterns() -> Option<&'static (Regex, Regex)> {
    FENCE_PATTERNS
        .get_or_init(|| {
            Ok((
                // Opening fence with optional info string, e.g. "```ts"
                Regex::new(r"\A\s*```[^\n]*\n")?,
                // Closing fence on its own line at the very end
                Regex::new(r"(?m)^```[ \t\r\n]*\z")?,
            ))
        })
        .as_ref()
        .ok()
}

/// Removes a surrounding markdown code fence from generated source.
///
/// Text that is not fenced is returned unchanged.
pub fn strip_code_fences(text: &str) -> &str {
    let Some((open, close)) = fence_patterns() else {
        return text;
    };

    let mut body = text;
    if let Some(m) = open.find(body) {
        body = &body[m.end()..];
    }
    if let Some(m) = close.find(body) {
        body = &body[..m.start()];
    }
    body
}
