//! Gemini `generateContent` client.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use mls_shared::{GeminiConfig, MlsError, Result};

use crate::{SummaryRequest, Summarizer, build_prompt};

/// Header carrying the API key, kept out of the request URL.
const API_KEY_HEADER: &str = "x-goog-api-key";

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^```(?:json)?\s*(.*?)\s*```$").expect("valid regex")
});

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationParams,
}

#[derive(Debug, Serialize, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationParams {
    temperature: f64,
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    finish_reason: Option<String>,
}

impl GenerateContentResponse {
    fn text(&self) -> Option<String> {
        let content = self.candidates.first()?.content.as_ref()?;
        let text: String = content
            .parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect();
        (!text.trim().is_empty()).then_some(text)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// [`Summarizer`] backed by the Gemini REST API.
pub struct GeminiSummarizer {
    http: reqwest::Client,
    endpoint: Url,
    api_key: String,
    model: String,
    temperature: f64,
}

impl GeminiSummarizer {
    /// Build a client from config. The API key is passed in explicitly.
    pub fn new(config: &GeminiConfig, api_key: impl Into<String>) -> Result<Self> {
        let endpoint = generate_content_url(&config.base_url, &config.model)?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| MlsError::config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.into(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    async fn send(&self, prompt: String) -> Result<String> {
        let body = GenerateContentRequest {
            contents: vec![Content {
                parts: vec![Part { text: Some(prompt) }],
            }],
            generation_config: GenerationParams {
                temperature: self.temperature,
                response_mime_type: "application/json",
            },
        };

        let response = self
            .http
            .post(self.endpoint.clone())
            .header(API_KEY_HEADER, &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MlsError::transient(format!("request to Gemini failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let parsed: GenerateContentResponse = response
            .json()
            .await
            .map_err(|e| MlsError::transient(format!("failed to read Gemini response: {e}")))?;

        parsed.text().ok_or_else(|| {
            let reason = parsed
                .candidates
                .first()
                .and_then(|c| c.finish_reason.as_deref())
                .unwrap_or("no candidates");
            MlsError::external(format!("Gemini returned no text ({reason})"))
        })
    }
}

#[async_trait]
impl Summarizer for GeminiSummarizer {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(node = %request.node_id, model = %self.model))]
    async fn summarize(&self, request: &SummaryRequest) -> Result<Value> {
        let prompt = build_prompt(request);
        debug!(prompt_len = prompt.len(), "calling Gemini");

        let text = self.send(prompt).await?;
        parse_annotation(&text)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// `{base}/models/{model}:generateContent`.
pub fn generate_content_url(base_url: &str, model: &str) -> Result<Url> {
    let raw = format!(
        "{}/models/{model}:generateContent",
        base_url.trim_end_matches('/')
    );
    Url::parse(&raw).map_err(|e| MlsError::config(format!("invalid Gemini URL '{raw}': {e}")))
}

/// Map a non-success HTTP status to an error. Rate limits and server errors
/// are retryable.
fn status_error(status: StatusCode, body: &str) -> MlsError {
    let detail: String = body.chars().take(500).collect();
    if status == StatusCode::TOO_MANY_REQUESTS {
        MlsError::transient(format!("Gemini rate limit (429): {detail}"))
    } else if status.is_server_error() {
        MlsError::transient(format!("Gemini server error ({status}): {detail}"))
    } else {
        MlsError::external(format!("Gemini request rejected ({status}): {detail}"))
    }
}

/// Strip an optional Markdown code fence from a model reply.
pub fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    FENCE_RE
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str())
}

/// Parse a model reply into an annotation object.
///
/// Replies shaped `{"level": ..., "summary": {...}}` are unwrapped to the
/// inner `summary` object.
pub fn parse_annotation(text: &str) -> Result<Value> {
    let body = strip_code_fence(text);
    let value: Value = serde_json::from_str(body)
        .map_err(|e| MlsError::external(format!("model reply is not valid JSON: {e}")))?;

    match value {
        Value::Object(mut map) => match map.remove("summary") {
            Some(inner @ Value::Object(_)) => Ok(inner),
            Some(other) => {
                map.insert("summary".into(), other);
                Ok(Value::Object(map))
            }
            None => Ok(Value::Object(map)),
        },
        other => Err(MlsError::external(format!(
            "model reply is not a JSON object: {}",
            type_name(&other)
        ))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{RetryPolicy, with_retry};
    use mls_shared::Span;
    use serde_json::json;
    use std::sync::Arc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const MODEL_PATH: &str = "/models/test-model:generateContent";

    fn summarizer(server: &MockServer) -> GeminiSummarizer {
        let config = GeminiConfig {
            model: "test-model".into(),
            base_url: server.uri(),
            timeout_secs: 5,
            ..GeminiConfig::default()
        };
        GeminiSummarizer::new(&config, "test-key").expect("build client")
    }

    fn request() -> SummaryRequest {
        SummaryRequest {
            node_id: "section-1.1".into(),
            title: "Homage".into(),
            span: Span::new(1, 5),
            excerpt: Some("root verse 1".into()),
            parent_id: Some("chapter-1".into()),
            parent_title: Some("Opening".into()),
            commentary: Arc::from("commentary"),
            outline_json: Arc::from("[]"),
        }
    }

    fn reply(text: &str) -> serde_json::Value {
        json!({
            "candidates": [{
                "content": {"parts": [{"text": text}], "role": "model"},
                "finishReason": "STOP"
            }]
        })
    }

    #[test]
    fn strips_json_fences() {
        assert_eq!(strip_code_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("```\n{\"a\":1}```"), "{\"a\":1}");
        assert_eq!(strip_code_fence("  {\"a\":1} "), "{\"a\":1}");
    }

    #[test]
    fn unwraps_level_summary_envelope() {
        let value = parse_annotation(r#"{"level": "1.1", "summary": {"content_summary": "x"}}"#)
            .unwrap();
        assert_eq!(value, json!({"content_summary": "x"}));

        let value = parse_annotation(r#"{"content_summary": "y"}"#).unwrap();
        assert_eq!(value, json!({"content_summary": "y"}));
    }

    #[test]
    fn rejects_non_object_replies() {
        let err = parse_annotation("[1, 2]").unwrap_err();
        assert!(!err.is_retryable());
        assert!(parse_annotation("not json").is_err());
    }

    #[test]
    fn url_joins_base_and_model() {
        let url = generate_content_url("https://example.com/v1beta/", "gemini-2.0-flash").unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
    }

    #[tokio::test]
    async fn summarize_parses_fenced_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(MODEL_PATH))
            .and(header(API_KEY_HEADER, "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(reply(
                "```json\n{\"level\": \"1.1\", \"summary\": {\"content_summary\": \"homage\"}}\n```",
            )))
            .expect(1)
            .mount(&server)
            .await;

        let value = summarizer(&server).summarize(&request()).await.unwrap();
        assert_eq!(value, json!({"content_summary": "homage"}));
    }

    #[tokio::test]
    async fn rate_limit_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("quota"))
            .mount(&server)
            .await;

        let err = summarizer(&server).summarize(&request()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn client_error_is_not_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = summarizer(&server).summarize(&request()).await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn empty_candidates_fail() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let err = summarizer(&server).summarize(&request()).await.unwrap_err();
        assert!(err.to_string().contains("no text"));
    }

    #[tokio::test]
    async fn retry_recovers_from_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(reply(r#"{"content_summary": "ok"}"#)),
            )
            .mount(&server)
            .await;

        let client = summarizer(&server);
        let req = request();
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let value = with_retry(&policy, "section-1.1", || client.summarize(&req))
            .await
            .unwrap();
        assert_eq!(value, json!({"content_summary": "ok"}));
        assert_eq!(server.received_requests().await.unwrap().len(), 2);
    }
}
