//! Correlation of engine results with test identities.
//!
//! The engine reports file paths relative to however it was invoked, which
//! need not match the absolute paths the workspace wrote. Both sides do share
//! the run's [`Discriminator`], so the join works like this:
//!
//! ```text
//! reported:  /private/var/folders/x/run-20260101-1a2b3c4d/tests/a/b.spec.ts
//!                                   └──── discriminator ────┘└─ suffix ─┘
//! rebuilt:   <workspace root>/tests/a/b.spec.ts  ──► PathIdentityMap ──► "t-1"
//! ```
//!
//! Suites whose path does not contain the discriminator, or whose rebuilt
//! path is not in the map, are dropped with a warning. Nothing is guessed.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::engine::report::{ExecutionReport, ReportSuite};
use crate::source::ResultRecord;
use crate::workspace::{Discriminator, PathIdentityMap, normalize_relative};

/// Result type for report loading.
pub type CorrelateResult<T> = Result<T, CorrelateError>;

/// Errors reading the engine report.
#[derive(Debug, thiserror::Error)]
pub enum CorrelateError {
    #[error("failed to read engine report '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse engine report '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Reads the engine report at `path`.
///
/// Returns `Ok(None)` if the engine did not write one.
pub async fn load_report(path: &Path) -> CorrelateResult<Option<ExecutionReport>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(CorrelateError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    ExecutionReport::from_json(&content)
        .map(Some)
        .map_err(|source| CorrelateError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

/// Records produced from one report, plus what had to be dropped.
#[derive(Debug, Default)]
pub struct Correlation {
    pub records: Vec<ResultRecord>,

    /// Suites with specs whose file could not be mapped to a test.
    pub unmatched_suites: usize,

    /// Specs in matched suites that had no attempts.
    pub specs_without_attempts: usize,
}

/// Maps engine suites back to test ids for one run.
pub struct Correlator<'a> {
    root: &'a Path,
    discriminator: &'a Discriminator,
    map: &'a PathIdentityMap,
}

impl<'a> Correlator<'a> {
    /// `root` must be the workspace root the map was built against.
    pub fn new(root: &'a Path, discriminator: &'a Discriminator, map: &'a PathIdentityMap) -> Self {
        Self {
            root,
            discriminator,
            map,
        }
    }

    /// Returns the workspace-relative part of an engine-reported path.
    ///
    /// The discriminator must appear as a whole path segment. If it appears
    /// more than once, the first occurrence wins; [`Correlator::resolve`]
    /// tries every occurrence.
    pub fn workspace_suffix(&self, reported: &str) -> Option<PathBuf> {
        self.candidate_suffixes(reported).into_iter().next()
    }

    /// Every suffix following a whole-segment occurrence of the
    /// discriminator, leftmost first.
    fn candidate_suffixes(&self, reported: &str) -> Vec<PathBuf> {
        let normalized = reported.replace('\\', "/");
        let token = self.discriminator.as_str();

        normalized
            .match_indices(token)
            .filter_map(|(idx, _)| {
                let at_segment_start = idx == 0 || normalized[..idx].ends_with('/');
                let rest = &normalized[idx + token.len()..];
                (at_segment_start && rest.starts_with('/')).then_some(rest)
            })
            .filter_map(|rest| normalize_relative(Path::new(rest.trim_start_matches('/'))))
            .collect()
    }

    /// Resolves an engine-reported file to the test id materialized there.
    ///
    /// The discriminator may also occur in the engine's own path prefix, so
    /// each occurrence is tried until the rebuilt path is in the map.
    pub fn resolve(&self, reported: &str) -> Option<&'a str> {
        self.candidate_suffixes(reported)
            .into_iter()
            .find_map(|suffix| self.map.get(&self.root.join(suffix)))
    }

    /// Produces one record per spec in every matched suite.
    pub fn correlate(&self, report: &ExecutionReport) -> Correlation {
        let mut correlation = Correlation::default();
        for suite in &report.suites {
            self.visit(suite, None, &mut correlation);
        }

        debug!(
            records = correlation.records.len(),
            unmatched_suites = correlation.unmatched_suites,
            "Correlated engine report"
        );
        correlation
    }

    fn visit(&self, suite: &ReportSuite, inherited: Option<&str>, out: &mut Correlation) {
        let file = suite.file.as_deref().or(inherited);

        if !suite.specs.is_empty() {
            match file.and_then(|f| self.resolve(f)) {
                Some(test_id) => self.collect(suite, test_id, out),
                None => {
                    warn!(
                        suite = %suite.title,
                        file = file.unwrap_or("<none>"),
                        discriminator = %self.discriminator,
                        "Dropping results for suite that does not map to a test"
                    );
                    out.unmatched_suites += 1;
                }
            }
        }

        for child in &suite.suites {
            self.visit(child, file, out);
        }
    }

    fn collect(&self, suite: &ReportSuite, test_id: &str, out: &mut Correlation) {
        for spec in &suite.specs {
            let Some(verdict) = spec.verdict() else {
                warn!(test_id, spec = %spec.title, "Spec has no attempts, skipping");
                out.specs_without_attempts += 1;
                continue;
            };

            out.records.push(ResultRecord {
                test_id: test_id.to_string(),
                passed: verdict.passed,
                duration_ms: verdict.duration_ms,
                error_message: verdict.error_message,
                title: spec.title.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TestDefinition;
    use crate::workspace::RunWorkspace;
    use tempfile::TempDir;

    async fn workspace_with(defs: &[TestDefinition]) -> (TempDir, RunWorkspace, PathIdentityMap) {
        let base = TempDir::new().unwrap();
        let ws = RunWorkspace::create(base.path(), &Discriminator::generate()).unwrap();
        let map = ws.materialize(defs).await.unwrap().map;
        (base, ws, map)
    }

    fn report(json: &str) -> ExecutionReport {
        ExecutionReport::from_json(json).unwrap()
    }

    #[tokio::test]
    async fn test_suffix_ignores_foreign_prefix() {
        let (_base, ws, map) =
            workspace_with(&[TestDefinition::new("t-1", "tests/a/b.spec", "x")]).await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);
        let disc = ws.discriminator().as_str();

        for reported in [
            format!("/completely/different/root/{}/tests/a/b.spec", disc),
            format!("{}/tests/a/b.spec", disc),
            format!("C:\\agent\\_work\\{}\\tests\\a\\b.spec", disc),
            format!("{}/tests/./a/b.spec", ws.root().display()),
        ] {
            assert_eq!(correlator.resolve(&reported), Some("t-1"), "{}", reported);
        }
    }

    #[tokio::test]
    async fn test_suffix_requires_whole_segment() {
        let (_base, ws, map) = workspace_with(&[TestDefinition::new("t-1", "a.spec", "x")]).await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);
        let disc = ws.discriminator().as_str();

        assert!(correlator.resolve("tests/a.spec").is_none());
        assert!(correlator.resolve(&format!("/x/pre{}/a.spec", disc)).is_none());
        assert!(correlator.resolve(&format!("/x/{}extra/a.spec", disc)).is_none());
        assert!(correlator.resolve(&format!("/x/{}", disc)).is_none());
        assert!(correlator.resolve(&format!("/x/{}/../a.spec", disc)).is_none());
    }

    #[tokio::test]
    async fn test_token_repeated_in_prefix_still_resolves() {
        let base = TempDir::new().unwrap();
        let disc = Discriminator::new("nightly").unwrap();
        let ws = RunWorkspace::create(base.path(), &disc).unwrap();
        let map = ws
            .materialize(&[TestDefinition::new("t-1", "tests/a/b.spec", "x")])
            .await
            .unwrap()
            .map;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);

        let reported = "/builds/nightly/checkout/nightly/tests/a/b.spec";
        assert_eq!(correlator.resolve(reported), Some("t-1"));
        assert_eq!(
            correlator.workspace_suffix(reported),
            Some(PathBuf::from("checkout/nightly/tests/a/b.spec"))
        );
        assert!(correlator.resolve("/builds/nightly/checkout/tests/a/b.spec").is_none());
    }

    #[tokio::test]
    async fn test_last_attempt_is_authoritative() {
        let (_base, ws, map) =
            workspace_with(&[TestDefinition::new("t-1", "tests/flaky.spec.ts", "x")]).await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);

        let json = format!(
            r#"{{"suites": [{{
                "title": "flaky.spec.ts",
                "file": "/elsewhere/{}/tests/flaky.spec.ts",
                "specs": [{{"title": "retries", "tests": [{{"results": [
                    {{"status": "failed", "duration": 100, "error": {{"message": "first try"}}}},
                    {{"status": "passed", "duration": 80}}
                ]}}]}}]
            }}]}}"#,
            ws.discriminator()
        );

        let correlation = correlator.correlate(&report(&json));
        assert_eq!(correlation.records.len(), 1);
        let record = &correlation.records[0];
        assert_eq!(record.test_id, "t-1");
        assert!(record.passed);
        assert_eq!(record.duration_ms, 80);
        assert!(record.error_message.is_none());
    }

    #[tokio::test]
    async fn test_failing_project_fails_the_record() {
        let (_base, ws, map) =
            workspace_with(&[TestDefinition::new("t-1", "tests/cart.spec.ts", "x")]).await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);

        let json = format!(
            r#"{{"suites": [{{
                "title": "cart.spec.ts",
                "file": "{}/tests/cart.spec.ts",
                "specs": [{{"title": "adds item", "tests": [
                    {{"projectName": "chromium", "results": [{{"status": "failed", "duration": 3, "error": "button hidden"}}]}},
                    {{"projectName": "firefox", "results": [{{"status": "passed", "duration": 4}}]}}
                ]}}]
            }}]}}"#,
            ws.discriminator()
        );

        let correlation = correlator.correlate(&report(&json));
        assert_eq!(correlation.records.len(), 1);
        let record = &correlation.records[0];
        assert!(!record.passed);
        assert_eq!(record.duration_ms, 7);
        assert_eq!(record.error_message.as_deref(), Some("button hidden"));
    }

    #[tokio::test]
    async fn test_failure_carries_error_and_unmatched_are_dropped() {
        let (_base, ws, map) = workspace_with(&[
            TestDefinition::new("t-1", "a.spec.ts", "x"),
            TestDefinition::new("t-2", "b.spec.ts", "y"),
        ])
        .await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);
        let disc = ws.discriminator();

        let json = format!(
            r#"{{"suites": [
                {{"title": "a", "file": "{disc}/a.spec.ts", "specs": [
                    {{"title": "one", "tests": [{{"results": [{{"status": "failed", "duration": 5, "error": "boom"}}]}}]}},
                    {{"title": "two", "tests": [{{"results": []}}]}}
                ]}},
                {{"title": "ghost", "file": "{disc}/ghost.spec.ts", "specs": [
                    {{"title": "g", "tests": [{{"results": [{{"status": "passed"}}]}}]}}
                ]}},
                {{"title": "nodisc", "file": "b.spec.ts", "specs": [
                    {{"title": "b", "tests": [{{"results": [{{"status": "passed"}}]}}]}}
                ]}}
            ]}}"#
        );

        let correlation = correlator.correlate(&report(&json));
        assert_eq!(correlation.records.len(), 1);
        assert_eq!(correlation.unmatched_suites, 2);
        assert_eq!(correlation.specs_without_attempts, 1);

        let record = &correlation.records[0];
        assert_eq!(record.test_id, "t-1");
        assert!(!record.passed);
        assert_eq!(record.error_message.as_deref(), Some("boom"));
        assert_eq!(record.title, "one");
    }

    #[tokio::test]
    async fn test_nested_suites_inherit_file() {
        let (_base, ws, map) =
            workspace_with(&[TestDefinition::new("t-9", "nested.spec.ts", "x")]).await;
        let correlator = Correlator::new(ws.root(), ws.discriminator(), &map);

        let json = format!(
            r#"{{"suites": [{{
                "title": "nested.spec.ts",
                "file": "/r/{}/nested.spec.ts",
                "specs": [],
                "suites": [{{
                    "title": "describe block",
                    "specs": [
                        {{"title": "x", "tests": [{{"results": [{{"status": "passed"}}]}}]}},
                        {{"title": "y", "tests": [{{"results": [{{"status": "skipped"}}]}}]}}
                    ]
                }}]
            }}]}}"#,
            ws.discriminator()
        );

        let correlation = correlator.correlate(&report(&json));
        assert_eq!(correlation.records.len(), 2);
        assert!(correlation.records.iter().all(|r| r.test_id == "t-9"));
        assert_eq!(correlation.unmatched_suites, 0);
    }

    #[tokio::test]
    async fn test_load_report_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(load_report(&dir.path().join("results.json")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_report_invalid_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_report(&path).await,
            Err(CorrelateError::Parse { .. })
        ));
    }
}
