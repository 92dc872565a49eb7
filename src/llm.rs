use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::types::AnalysisRequest;
use crate::error::DriftError;
use crate::logging::redact_secrets;

/// A language-model service that turns request text into response text.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, input: &str) -> Result<String, DriftError>;
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    input: Vec<Message>,
    text: TextFormat,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct TextFormat {
    format: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    #[serde(rename = "type")]
    format_type: String,
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(default)]
    content: Vec<ContentItem>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentItem {
    #[serde(rename = "output_text")]
    OutputText { text: String },
    #[serde(rename = "refusal")]
    Refusal { refusal: String },
}

fn build_json_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["summary", "findings", "relationships"],
        "properties": {
            "summary": { "type": "string" },
            "findings": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["severity", "files", "message", "suggested_fix"],
                    "properties": {
                        "severity": { "type": "string", "enum": ["info", "warning", "risk"] },
                        "files": { "type": "array", "items": { "type": "string" } },
                        "message": { "type": "string" },
                        "suggested_fix": { "type": ["string", "null"] }
                    }
                }
            },
            "relationships": {
                "type": "array",
                "items": {
                    "type": "object",
                    "additionalProperties": false,
                    "required": ["source", "target", "kind"],
                    "properties": {
                        "source": { "type": "string" },
                        "target": { "type": "string" },
                        "kind": {
                            "type": "string",
                            "enum": ["both", "before-only", "after-only", "removed"]
                        }
                    }
                }
            }
        }
    })
}

/// OpenAI Responses API with a strict JSON schema for the report.
pub struct OpenAiBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl OpenAiBackend {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, system: &str, input: &str) -> Result<String, DriftError> {
        let request = OpenAiRequest {
            model: self.model.clone(),
            input: vec![
                Message {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                Message {
                    role: "user".to_string(),
                    content: input.to_string(),
                },
            ],
            text: TextFormat {
                format: JsonSchemaFormat {
                    format_type: "json_schema".to_string(),
                    name: "drift_review".to_string(),
                    schema: build_json_schema(),
                    strict: true,
                },
            },
        };

        let response = self
            .client
            .post(format!("{}/responses", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body, retry_after));
        }

        let api_response: OpenAiResponse = response.json().await.map_err(|e| {
            DriftError::MalformedBackendResponse(format!("failed to decode OpenAI envelope: {}", e))
        })?;

        let content = api_response
            .output
            .iter()
            .flat_map(|o| o.content.iter())
            .next()
            .ok_or_else(|| {
                DriftError::MalformedBackendResponse("no content in OpenAI response".to_string())
            })?;

        match content {
            ContentItem::OutputText { text } => Ok(text.clone()),
            ContentItem::Refusal { refusal } => Err(DriftError::MalformedBackendResponse(format!(
                "model refused request: {}",
                refusal
            ))),
        }
    }
}

/// Map a non-success HTTP status onto the backend error taxonomy.
pub fn classify_status(status: StatusCode, body: &str, retry_after: Option<Duration>) -> DriftError {
    let detail = format!("{} {}", status, redact_secrets(body.trim()));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => DriftError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => DriftError::RateLimit { retry_after },
        StatusCode::REQUEST_TIMEOUT => DriftError::TransientBackend(detail),
        s if s.is_server_error() => DriftError::TransientBackend(detail),
        _ => DriftError::MalformedBackendResponse(format!("request rejected: {}", detail)),
    }
}

/// Serves a recorded response from disk, for offline runs.
pub struct ReplayBackend {
    path: PathBuf,
}

impl ReplayBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl LlmBackend for ReplayBackend {
    fn name(&self) -> &str {
        "replay"
    }

    async fn complete(&self, _system: &str, _input: &str) -> Result<String, DriftError> {
        tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            DriftError::MalformedBackendResponse(format!(
                "cannot read replay file {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

/// Attempt cap, backoff and per-attempt timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): base * 2^attempt, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Sends analysis requests to a backend, retrying what is worth retrying.
#[derive(Clone)]
pub struct AnalysisClient {
    backend: Arc<dyn LlmBackend>,
    policy: RetryPolicy,
}

impl AnalysisClient {
    pub fn new(backend: Arc<dyn LlmBackend>, policy: RetryPolicy) -> Self {
        Self { backend, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Send `request` until it succeeds, fails permanently, or the attempt
    /// cap is reached. Every attempt sends the same text.
    pub async fn send(&self, request: &AnalysisRequest) -> Result<String, DriftError> {
        let body = request.body();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!(attempt, bytes = body.len(), backend = self.backend.name(), "sending analysis request");

            let outcome = match tokio::time::timeout(
                self.policy.timeout,
                self.backend.complete(&request.system, &body),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(DriftError::TransientBackend(format!(
                    "no response within {:?}",
                    self.policy.timeout
                ))),
            };

            let err = match outcome {
                Ok(text) => {
                    info!(attempt, "analysis response received");
                    return Ok(text);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                warn!(attempt, error = %err, "analysis request failed");
                return Err(err);
            }

            let delay = match &err {
                DriftError::RateLimit {
                    retry_after: Some(after),
                } => (*after).min(self.policy.backoff_max),
                _ => self.policy.backoff(attempt - 1),
            };
            warn!(attempt, max_attempts, error = %err, ?delay, "retrying analysis request");
            tokio::time::sleep(delay).await;
        }
    }
}
