//! Azure AI Content Understanding backend for [`OcrService`].
//!
//! Uses the `prebuilt-documentAnalyzer`: `POST …/analyzers/{id}:analyze` with
//! `{"url": …}` returns an operation id, and `GET …/analyzerResults/{id}`
//! reports `NotStarted` / `Running` / `Succeeded` / `Failed`. A successful
//! result carries one markdown string per entry in `result.contents`.

use super::ocr::{OcrPayload, OcrService, PollResponse, RemoteStatus};
use crate::error::ScanError;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_API_VERSION: &str = "2025-05-01-preview";
pub const DEFAULT_ANALYZER: &str = "prebuilt-documentAnalyzer";

/// Content Understanding client.
pub struct AzureContentUnderstanding {
    endpoint: String,
    api_key: String,
    api_version: String,
    analyzer_id: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for AzureContentUnderstanding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureContentUnderstanding")
            .field("endpoint", &self.endpoint)
            .field("api_key", &"<redacted>")
            .field("api_version", &self.api_version)
            .field("analyzer_id", &self.analyzer_id)
            .finish()
    }
}

impl AzureContentUnderstanding {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        client: reqwest::Client,
    ) -> Result<Self, ScanError> {
        let endpoint = endpoint.into().trim().trim_end_matches('/').to_string();
        let api_key = api_key.into();
        if endpoint.is_empty() {
            return Err(ScanError::MissingSetting {
                name: "AZURE_CU_ENDPOINT".into(),
                hint: "Set it to the Content Understanding resource endpoint.".into(),
            });
        }
        if api_key.trim().is_empty() {
            return Err(ScanError::MissingSetting {
                name: "AZURE_CU_API_KEY".into(),
                hint: "Set it to a key of the Content Understanding resource.".into(),
            });
        }
        Ok(Self {
            endpoint,
            api_key,
            api_version: DEFAULT_API_VERSION.to_string(),
            analyzer_id: DEFAULT_ANALYZER.to_string(),
            client,
        })
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    pub fn with_analyzer(mut self, analyzer_id: impl Into<String>) -> Self {
        self.analyzer_id = analyzer_id.into();
        self
    }

    fn analyze_url(&self) -> String {
        format!(
            "{}/contentunderstanding/analyzers/{}:analyze?api-version={}",
            self.endpoint, self.analyzer_id, self.api_version
        )
    }

    fn analyzers_url(&self) -> String {
        format!(
            "{}/contentunderstanding/analyzers?api-version={}",
            self.endpoint, self.api_version
        )
    }

    fn result_url(&self, job_id: &str) -> String {
        format!(
            "{}/contentunderstanding/analyzerResults/{}?api-version={}",
            self.endpoint, job_id, self.api_version
        )
    }
}

#[derive(Deserialize)]
struct SubmitResponse {
    id: Option<String>,
}

#[async_trait]
impl OcrService for AzureContentUnderstanding {
    fn name(&self) -> &str {
        "azure-content-understanding"
    }

    async fn submit(&self, source_url: &str) -> Result<String, ScanError> {
        let resp = self
            .client
            .post(self.analyze_url())
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .json(&serde_json::json!({ "url": source_url }))
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::ocr_status(status.as_u16(), &body));
        }
        let body: SubmitResponse = resp.json().await.map_err(|e| ScanError::OcrRequest {
            detail: format!("unreadable analyze response: {e}"),
            retryable: false,
        })?;
        body.id.filter(|id| !id.is_empty()).ok_or_else(|| ScanError::OcrRequest {
            detail: "analyze response carried no operation id".into(),
            retryable: false,
        })
    }

    async fn poll(&self, job_id: &str) -> Result<PollResponse, ScanError> {
        let resp = self
            .client
            .get(self.result_url(job_id))
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::ocr_status(status.as_u16(), &body));
        }
        let body: Value = resp.json().await.map_err(|e| ScanError::OcrRequest {
            detail: format!("unreadable result response: {e}"),
            retryable: true,
        })?;
        Ok(parse_result(body))
    }

    /// Lists the resource's analyzers: authenticated, free, and starts nothing.
    async fn check(&self) -> Result<(), ScanError> {
        let resp = self
            .client
            .get(self.analyzers_url())
            .header("Ocp-Apim-Subscription-Key", &self.api_key)
            .send()
            .await
            .map_err(transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ScanError::ocr_status(status.as_u16(), &body));
        }
        debug!("Content Understanding endpoint {} reachable", self.endpoint);
        Ok(())
    }
}

fn transport(e: reqwest::Error) -> ScanError {
    ScanError::OcrRequest {
        detail: e.to_string(),
        retryable: e.is_timeout() || e.is_connect() || e.is_request(),
    }
}

/// Interpret an `analyzerResults` body.
fn parse_result(body: Value) -> PollResponse {
    let status = RemoteStatus::parse(body.get("status").and_then(Value::as_str).unwrap_or(""));
    match status {
        RemoteStatus::Succeeded => {
            let result = body.get("result").cloned().unwrap_or(Value::Null);
            let pages: Vec<String> = result
                .get("contents")
                .and_then(Value::as_array)
                .map(|contents| {
                    contents
                        .iter()
                        .filter_map(|c| c.get("markdown").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            debug!("Analyzer result: {} content entries", pages.len());
            PollResponse::succeeded(OcrPayload { pages, raw: result })
        }
        RemoteStatus::Failed => {
            let detail = match body.get("error") {
                Some(Value::String(s)) => s.clone(),
                Some(err) => {
                    let code = err.get("code").and_then(Value::as_str).unwrap_or("Error");
                    let msg = err.get("message").and_then(Value::as_str).unwrap_or("");
                    format!("{code}: {msg}")
                }
                None => "unknown error".to_string(),
            };
            PollResponse::failed(detail)
        }
        other => PollResponse {
            status: other,
            payload: None,
            error: None,
        },
    }
}
