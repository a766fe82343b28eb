//! Schema of the engine's JSON report.
//!
//! Only the fields needed for correlation are modeled; everything else in
//! the document is ignored. The shape matches Playwright's JSON reporter:
//!
//! ```json
//! {
//!   "suites": [{
//!     "title": "checkout.spec.ts",
//!     "file": "/tmp/run-20260101120000-1a2b3c4d/tests/checkout.spec.ts",
//!     "specs": [{
//!       "title": "pays with card",
//!       "tests": [{ "results": [
//!         { "status": "failed", "duration": 812, "error": { "message": "timeout" } },
//!         { "status": "passed", "duration": 640 }
//!       ]}]
//!     }],
//!     "suites": []
//!   }]
//! }
//! ```

use serde::Deserialize;

/// Attempt status the engine uses for a passing test.
pub const SUCCESS_STATUS: &str = "passed";

/// Root of the engine report.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecutionReport {
    #[serde(default)]
    pub suites: Vec<ReportSuite>,
}

impl ExecutionReport {
    /// Parses a report document.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// A suite, usually one per test file. Suites may nest.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportSuite {
    #[serde(default)]
    pub title: String,

    /// File the suite came from, as the engine saw it.
    #[serde(default)]
    pub file: Option<String>,

    #[serde(default)]
    pub specs: Vec<ReportSpec>,

    #[serde(default)]
    pub suites: Vec<ReportSuite>,
}

/// One test case inside a suite.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportSpec {
    #[serde(default)]
    pub title: String,

    /// One entry per engine project the case ran under.
    #[serde(default)]
    pub tests: Vec<ReportTest>,
}

impl ReportSpec {
    /// Final attempt of each project that recorded one.
    pub fn final_attempts(&self) -> Vec<&AttemptResult> {
        self.tests.iter().filter_map(ReportTest::last_attempt).collect()
    }

    /// Folds the final attempt of every project into one verdict.
    ///
    /// Passes only if every project's final attempt passed. The error is the
    /// first failing project's, if it reported one. Duration is summed across
    /// projects.
    pub fn verdict(&self) -> Option<SpecVerdict> {
        let attempts = self.final_attempts();
        if attempts.is_empty() {
            return None;
        }

        let failure = attempts.iter().find(|a| !a.passed());
        Some(SpecVerdict {
            passed: failure.is_none(),
            duration_ms: attempts.iter().map(|a| a.duration_ms()).sum(),
            error_message: failure.and_then(|a| a.error_message()),
        })
    }
}

/// Combined outcome of a spec across engine projects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecVerdict {
    pub passed: bool,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

/// The spec as run under one engine project, e.g. `chromium`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReportTest {
    /// Attempts in execution order; retries append.
    #[serde(default)]
    pub results: Vec<AttemptResult>,
}

impl ReportTest {
    /// The authoritative attempt for this project: the last one recorded.
    pub fn last_attempt(&self) -> Option<&AttemptResult> {
        self.results.last()
    }
}

/// One execution attempt.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttemptResult {
    #[serde(default)]
    pub status: String,

    /// Milliseconds.
    #[serde(default)]
    pub duration: f64,

    #[serde(default)]
    pub error: Option<AttemptError>,

    #[serde(default)]
    pub errors: Vec<AttemptError>,
}

impl AttemptResult {
    pub fn passed(&self) -> bool {
        self.status == SUCCESS_STATUS
    }

    pub fn duration_ms(&self) -> u64 {
        if self.duration.is_finite() && self.duration > 0.0 {
            self.duration.round() as u64
        } else {
            0
        }
    }

    /// First available error message.
    pub fn error_message(&self) -> Option<String> {
        self.error
            .iter()
            .chain(self.errors.iter())
            .find_map(AttemptError::message)
    }
}

/// Error detail; engines emit either a bare string or an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AttemptError {
    Text(String),
    Detailed {
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        value: Option<String>,
    },
}

impl AttemptError {
    pub fn message(&self) -> Option<String> {
        match self {
            AttemptError::Text(s) => Some(s.clone()),
            AttemptError::Detailed { message, value } => message.clone().or_else(|| value.clone()),
        }
        .filter(|m| !m.trim().is_empty())
    }
}
