//! HTTP implementation of [`TestSource`].
//!
//! # Endpoints
//!
//! | Operation | Request |
//! |-----------|---------|
//! | fetch | `GET {api_url}/api/tests?tenantId=..&siteId=..` |
//! | submit | `POST {api_url}/api/results` with a JSON [`RunSubmission`] |
//!
//! Both requests carry `Authorization: Bearer <token>`.

use async_trait::async_trait;
use reqwest::{Client, Response};
use tracing::debug;

use super::{RunSubmission, SourceError, SourceResult, SubmissionAck, TestSnapshot, TestSource};
use crate::config::ResolvedSource;

/// Test source backed by the remote HTTP API.
pub struct HttpSource {
    client: Client,
    api_url: String,
    api_token: String,
    tenant_id: String,
    site_id: String,
}

impl HttpSource {
    /// Builds a client bound to the tenant/site in `settings`.
    pub fn new(settings: &ResolvedSource) -> SourceResult<Self> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("testrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SourceError::Unreachable(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_url: settings.api_url.trim_end_matches('/').to_string(),
            api_token: settings.api_token.clone(),
            tenant_id: settings.tenant_id.clone(),
            site_id: settings.site_id.clone(),
        })
    }

    fn tests_url(&self) -> String {
        format!("{}/api/tests", self.api_url)
    }

    fn results_url(&self) -> String {
        format!("{}/api/results", self.api_url)
    }
}

/// Turns a non-2xx response into [`SourceError::Rejected`].
async fn check_status(response: Response) -> SourceResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SourceError::Rejected {
        status: status.as_u16(),
        body: truncate(&body, 512),
    })
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[async_trait]
impl TestSource for HttpSource {
    async fn fetch(&self) -> SourceResult<TestSnapshot> {
        debug!(url = %self.tests_url(), tenant = %self.tenant_id, site = %self.site_id, "Fetching tests");

        let response = self
            .client
            .get(self.tests_url())
            .bearer_auth(&self.api_token)
            .query(&[("tenantId", &self.tenant_id), ("siteId", &self.site_id)])
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        check_status(response)
            .await?
            .json::<TestSnapshot>()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }

    async fn submit(&self, submission: &RunSubmission) -> SourceResult<SubmissionAck> {
        debug!(
            url = %self.results_url(),
            records = submission.results.len(),
            "Submitting results"
        );

        let response = self
            .client
            .post(self.results_url())
            .bearer_auth(&self.api_token)
            .json(submission)
            .send()
            .await
            .map_err(|e| SourceError::Unreachable(e.to_string()))?;

        let response = check_status(response).await?;
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::InvalidResponse(e.to_string()))?;

        // Some deployments answer 201 with an empty body
        if body.trim().is_empty() {
            return Ok(SubmissionAck {
                created_count: submission.results.len(),
            });
        }

        serde_json::from_str(&body).map_err(|e| SourceError::InvalidResponse(e.to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}
