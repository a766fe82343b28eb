//! Remote test source: the system of record for test definitions.
//!
//! A [`TestSource`] hands out a versioned snapshot of the tests authored for
//! one tenant/site and accepts a [`RunSubmission`] describing how they fared.
//! The wire types in this module mirror the remote API's JSON (camelCase).
//!
//! ```text
//!   fetch()  ──► TestSnapshot { tests: Vec<TestDefinition> }
//!   submit(RunSubmission { results: Vec<ResultRecord> }) ──► SubmissionAck
//! ```

pub mod http;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use http::HttpSource;

/// Result type for test source operations.
pub type SourceResult<T> = Result<T, SourceError>;

/// Errors talking to the remote test source.
///
/// During fetch every variant is fatal to the run. During submission the
/// orchestrator downgrades them to a warning.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The request never produced a response (DNS, connect, timeout).
    #[error("test source unreachable: {0}")]
    Unreachable(String),

    /// The source answered with a non-success status.
    #[error("test source rejected request with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The response body did not match the expected schema.
    #[error("invalid response from test source: {0}")]
    InvalidResponse(String),
}

/// One remotely authored test.
///
/// Immutable once fetched. A definition without `source_code` is not yet
/// executable and is skipped, never treated as an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    /// Stable remote identifier.
    pub id: String,

    /// Human readable title.
    #[serde(default)]
    pub title: String,

    /// Generated runnable source, absent until the test has been generated.
    #[serde(default)]
    pub source_code: Option<String>,

    /// Placement inside the workspace, and the join key for correlation.
    #[serde(alias = "targetPath")]
    pub target_relative_path: PathBuf,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub status: Option<String>,
}

impl TestDefinition {
    /// Creates an executable definition.
    pub fn new(
        id: impl Into<String>,
        target_relative_path: impl Into<PathBuf>,
        source_code: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            source_code: Some(source_code.into()),
            target_relative_path: target_relative_path.into(),
            tags: Vec::new(),
            status: None,
        }
    }

    /// Creates a definition that has no source code yet.
    pub fn pending(id: impl Into<String>, target_relative_path: impl Into<PathBuf>) -> Self {
        Self {
            source_code: None,
            ..Self::new(id, target_relative_path, "")
        }
    }

    /// Returns `true` if the definition carries non-blank source code.
    pub fn is_executable(&self) -> bool {
        self.source_code
            .as_deref()
            .is_some_and(|code| !code.trim().is_empty())
    }
}

/// A snapshot of all tests for one tenant/site.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSnapshot {
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default)]
    pub site_id: String,

    #[serde(default)]
    pub site_name: Option<String>,

    #[serde(default)]
    pub total_count: usize,

    #[serde(default)]
    pub tests: Vec<TestDefinition>,
}

/// The correlated outcome of one spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub test_id: String,

    pub passed: bool,

    pub duration_ms: u64,

    /// Only set when `passed` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Spec title as reported by the engine, kept for local reports.
    #[serde(skip)]
    pub title: String,
}

/// Overall status reported for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubmissionStatus {
    Passed,
    Failed,
}

/// The results payload posted back to the test source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSubmission {
    pub tenant_id: String,
    pub site_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: SubmissionStatus,
    pub results: Vec<ResultRecord>,
}

/// Acknowledgement of a submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAck {
    #[serde(default, alias = "created", alias = "count")]
    pub created_count: usize,
}

/// A remote source of test definitions.
///
/// Implementations are bound to a single tenant/site when constructed.
#[async_trait]
pub trait TestSource: Send + Sync {
    /// Retrieves the current snapshot of test definitions.
    async fn fetch(&self) -> SourceResult<TestSnapshot>;

    /// Posts a run's results back to the source.
    async fn submit(&self, submission: &RunSubmission) -> SourceResult<SubmissionAck>;

    /// Name for logging.
    fn name(&self) -> &str {
        "test-source"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_deserializes_remote_payload() {
        let json = r#"{
            "tenantId": "acme",
            "siteId": "storefront",
            "siteName": "Storefront",
            "totalCount": 2,
            "tests": [
                {
                    "id": "t-1",
                    "title": "checkout works",
                    "sourceCode": "test('x', () => {});",
                    "targetRelativePath": "tests/checkout.spec.ts",
                    "tags": ["smoke"],
                    "status": "ready"
                },
                {
                    "id": "t-2",
                    "title": "search works",
                    "sourceCode": null,
                    "targetPath": "tests/search.spec.ts"
                }
            ]
        }"#;

        let snapshot: TestSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.total_count, 2);
        assert_eq!(snapshot.tests.len(), 2);
        assert!(snapshot.tests[0].is_executable());
        assert!(!snapshot.tests[1].is_executable());
        assert_eq!(
            snapshot.tests[1].target_relative_path,
            PathBuf::from("tests/search.spec.ts")
        );
    }

    #[test]
    fn test_blank_source_is_not_executable() {
        let mut def = TestDefinition::new("t-1", "a.spec.ts", "  \n");
        assert!(!def.is_executable());
        def.source_code = None;
        assert!(!def.is_executable());
    }

    #[test]
    fn test_submission_serializes_camel_case() {
        let now = Utc::now();
        let submission = RunSubmission {
            tenant_id: "acme".into(),
            site_id: "storefront".into(),
            started_at: now,
            finished_at: now,
            status: SubmissionStatus::Failed,
            results: vec![
                ResultRecord {
                    test_id: "t-1".into(),
                    passed: true,
                    duration_ms: 12,
                    error_message: None,
                    title: "ok".into(),
                },
                ResultRecord {
                    test_id: "t-2".into(),
                    passed: false,
                    duration_ms: 40,
                    error_message: Some("boom".into()),
                    title: "bad".into(),
                },
            ],
        };

        let value = serde_json::to_value(&submission).unwrap();
        assert_eq!(value["tenantId"], "acme");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["results"][0]["durationMs"], 12);
        assert!(value["results"][0].get("errorMessage").is_none());
        assert!(value["results"][0].get("title").is_none());
        assert_eq!(value["results"][1]["errorMessage"], "boom");
    }

    #[test]
    fn test_ack_accepts_created_alias() {
        let ack: SubmissionAck = serde_json::from_str(r#"{"created": 3}"#).unwrap();
        assert_eq!(ack.created_count, 3);
        let ack: SubmissionAck = serde_json::from_str(r#"{"createdCount": 5}"#).unwrap();
        assert_eq!(ack.created_count, 5);
    }
}
