//! Gemini API key backend (Generative Language API, `generateContent`).

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::{Value, json};
use tracing::{debug, warn};

use super::{BackendError, BackendErrorKind, ModelBackend};
use crate::config::Config;
use crate::core::conversation::{Conversation, Message, ToolCall};
use crate::core::startup::{StartupError, resolve_url};
use crate::tools::ToolDefinition;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

const MAX_RETRY_DELAY: Duration = Duration::from_secs(8);

#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub timeout: Duration,
    /// Extra attempts on timeouts, 429 and 5xx.
    pub max_retries: u32,
    /// First backoff delay; doubles per attempt.
    pub retry_base_delay: Duration,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            temperature: 0.0,
            max_output_tokens: 2048,
            timeout: Duration::from_secs(60),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }

    /// Builds the backend settings from config plus `GEMINI_BASE_URL`.
    ///
    /// # Errors
    /// Returns an error if the base URL override is not a valid URL.
    pub fn from_config(config: &Config, api_key: impl Into<String>) -> Result<Self, StartupError> {
        let base_url = resolve_url(
            "Gemini",
            std::env::var("GEMINI_BASE_URL").ok(),
            config.gemini.base_url.as_deref(),
            DEFAULT_BASE_URL,
        )?;

        Ok(Self {
            base_url,
            temperature: config.temperature,
            max_output_tokens: config.max_tokens,
            timeout: config.request_timeout(),
            max_retries: config.max_retries,
            ..Self::new(api_key, config.model.clone())
        })
    }
}

pub struct GeminiClient {
    config: GeminiConfig,
    http: reqwest::Client,
}

/// One failed HTTP attempt and whether another one is worth making.
struct AttemptError {
    error: BackendError,
    retryable: bool,
}

impl GeminiClient {
    /// # Errors
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: GeminiConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("build Gemini HTTP client")?;
        Ok(Self { config, http })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn send_once(&self, body: &Value) -> Result<Value, AttemptError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url, self.config.model
        );

        let response = self
            .http
            .post(&url)
            .headers(build_headers(&self.config.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;

        if !status.is_success() {
            return Err(http_status_error(status, &text));
        }

        serde_json::from_str(&text).map_err(|e| AttemptError {
            error: BackendError::protocol(format!("Failed to decode Gemini response: {e}"))
                .with_details(text.clone()),
            retryable: false,
        })
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(MAX_RETRY_DELAY)
    }
}

impl ModelBackend for GeminiClient {
    async fn generate(
        &self,
        conversation: &Conversation,
        tools: &[ToolDefinition],
    ) -> Result<Message, BackendError> {
        let body = build_request(
            conversation,
            tools,
            self.config.temperature,
            self.config.max_output_tokens,
        );

        let mut attempt = 0;
        loop {
            match self.send_once(&body).await {
                Ok(response) => return parse_response(&response),
                Err(failure) if failure.retryable && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt,
                        max_retries = self.config.max_retries,
                        kind = %failure.error.kind,
                        delay_ms = delay.as_millis() as u64,
                        "Gemini request failed, retrying: {}",
                        failure.error
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }
}

fn build_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-goog-api-key",
        HeaderValue::from_str(api_key).unwrap_or_else(|_| HeaderValue::from_static("")),
    );
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers
}

fn classify_reqwest_error(e: &reqwest::Error) -> AttemptError {
    let (error, retryable) = if e.is_timeout() {
        (BackendError::timeout(format!("Request timed out: {e}")), true)
    } else if e.is_connect() {
        (BackendError::timeout(format!("Connection failed: {e}")), true)
    } else {
        (BackendError::protocol(format!("Network error: {e}")), false)
    };
    AttemptError { error, retryable }
}

fn http_status_error(status: StatusCode, body: &str) -> AttemptError {
    let api_message = serde_json::from_str::<Value>(body).ok().and_then(|json| {
        json.get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .map(String::from)
    });
    let message = match api_message {
        Some(msg) => format!("HTTP {}: {msg}", status.as_u16()),
        None => format!("HTTP {}", status.as_u16()),
    };

    let kind = match status {
        StatusCode::TOO_MANY_REQUESTS => BackendErrorKind::RateLimit,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BackendErrorKind::Timeout,
        _ => BackendErrorKind::Protocol,
    };
    let retryable = kind != BackendErrorKind::Protocol || status.is_server_error();

    let mut error = BackendError::new(kind, message);
    if !body.is_empty() {
        error = error.with_details(body);
    }
    AttemptError { error, retryable }
}

/// Builds a `generateContent` body.
///
/// The system slot becomes `systemInstruction`. Consecutive tool results are
/// grouped into one `user` turn of `functionResponse` parts, named after the
/// call they answer.
pub fn build_request(
    conversation: &Conversation,
    tools: &[ToolDefinition],
    temperature: f32,
    max_output_tokens: u32,
) -> Value {
    let mut system = None;
    let mut contents: Vec<Value> = Vec::new();
    let mut in_tool_group = false;

    for message in conversation.messages() {
        match message {
            Message::System { content } => {
                system = Some(content.as_str());
                continue;
            }
            Message::Human { content } => {
                contents.push(json!({"role": "user", "parts": [{"text": content}]}));
            }
            Message::Assistant {
                content,
                tool_calls,
            } => {
                let mut parts = Vec::new();
                if let Some(text) = content.as_deref().filter(|t| !t.is_empty()) {
                    parts.push(json!({"text": text}));
                }
                for call in tool_calls {
                    parts.push(json!({"functionCall": {"name": call.name, "args": call.args}}));
                }
                if !parts.is_empty() {
                    contents.push(json!({"role": "model", "parts": parts}));
                }
            }
            Message::ToolResult { call_id, content } => {
                let name = conversation.tool_name_for(call_id).unwrap_or("unknown_tool");
                let part = json!({
                    "functionResponse": {
                        "name": name,
                        "response": {"content": content}
                    }
                });
                if in_tool_group
                    && let Some(parts) = contents
                        .last_mut()
                        .and_then(|c| c.get_mut("parts"))
                        .and_then(Value::as_array_mut)
                {
                    parts.push(part);
                } else {
                    contents.push(json!({"role": "user", "parts": [part]}));
                }
                in_tool_group = true;
                continue;
            }
        }
        in_tool_group = false;
    }

    let mut request = json!({
        "contents": contents,
        "generationConfig": {
            "temperature": temperature,
            "maxOutputTokens": max_output_tokens,
        },
    });

    if let Some(prompt) = system.filter(|p| !p.trim().is_empty()) {
        request["systemInstruction"] = json!({"parts": [{"text": prompt}]});
    }

    if !tools.is_empty() {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.input_schema,
                })
            })
            .collect();
        request["tools"] = json!([{"functionDeclarations": declarations}]);
    }

    request
}

/// Decodes the first candidate into an assistant message.
///
/// # Errors
/// Returns a protocol error when there is no usable candidate.
pub fn parse_response(response: &Value) -> Result<Message, BackendError> {
    let Some(candidate) = response
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
    else {
        let reason = response
            .pointer("/promptFeedback/blockReason")
            .and_then(Value::as_str)
            .unwrap_or("no candidates");
        return Err(BackendError::protocol(format!(
            "Gemini returned no answer ({reason})"
        )));
    };

    let parts = candidate
        .pointer("/content/parts")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    let mut text = String::new();
    let mut tool_calls = Vec::new();
    for part in parts {
        if let Some(t) = part.get("text").and_then(Value::as_str) {
            text.push_str(t);
        } else if let Some(call) = part.get("functionCall") {
            let Some(name) = call.get("name").and_then(Value::as_str) else {
                return Err(BackendError::protocol("functionCall without a name"));
            };
            let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall::new(
                uuid::Uuid::new_v4().to_string(),
                name,
                args,
            ));
        }
    }

    if text.is_empty() && tool_calls.is_empty() {
        let finish = candidate
            .get("finishReason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(BackendError::protocol(format!(
            "Gemini returned an empty answer (finishReason {finish})"
        )));
    }

    debug!(tool_calls = tool_calls.len(), text_len = text.len(), "Gemini response decoded");
    Ok(Message::assistant_calls(
        (!text.is_empty()).then_some(text),
        tool_calls,
    ))
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn client(server: &MockServer, max_retries: u32) -> GeminiClient {
        let config = GeminiConfig {
            base_url: server.uri(),
            max_retries,
            retry_base_delay: Duration::from_millis(1),
            timeout: Duration::from_millis(300),
            ..GeminiConfig::new("test-key", "gemini-test")
        };
        GeminiClient::new(config).unwrap()
    }

    fn conversation() -> Conversation {
        Conversation::from_messages(vec![Message::system("sys"), Message::human("hi")])
    }

    fn text_reply(text: &str) -> Value {
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})
    }

    #[test]
    fn test_build_request_maps_roles_and_groups_results() {
        let conversation = Conversation::from_messages(vec![
            Message::system("be terse"),
            Message::human("read both"),
            Message::assistant_calls(
                Some("on it".into()),
                vec![
                    ToolCall::new("a", "read_file", json!({"path": "x"})),
                    ToolCall::new("b", "list_files", json!({})),
                ],
            ),
            Message::tool_result("a", "X"),
            Message::tool_result("b", "Y"),
        ]);
        let tools = vec![ToolDefinition::new("read_file", "read", json!({"type": "object"}))];

        let body = build_request(&conversation, &tools, 0.0, 2048);

        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "be terse");
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][1]["functionCall"]["name"], "read_file");
        assert_eq!(contents[2]["role"], "user");
        let responses = contents[2]["parts"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[1]["functionResponse"]["name"], "list_files");
        assert_eq!(responses[1]["functionResponse"]["response"]["content"], "Y");
        assert_eq!(body["tools"][0]["functionDeclarations"][0]["name"], "read_file");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
    }

    #[test]
    fn test_parse_function_calls_get_ids() {
        let response = json!({"candidates": [{"content": {"parts": [
            {"functionCall": {"name": "list_files", "args": {"path": "."}}},
            {"functionCall": {"name": "run_tests"}}
        ]}}]});
        let message = parse_response(&response).unwrap();
        let calls = message.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(calls[1].args, json!({}));
    }

    #[test]
    fn test_parse_blocked_prompt_is_protocol_error() {
        let err = parse_response(&json!({"promptFeedback": {"blockReason": "SAFETY"}})).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Protocol);
        assert!(err.message.contains("SAFETY"));
    }

    #[tokio::test]
    async fn test_generate_sends_key_and_decodes_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/gemini-test:generateContent"))
            .and(header("x-goog-api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("hello")))
            .expect(1)
            .mount(&server)
            .await;

        let message = client(&server, 0)
            .generate(&conversation(), &[])
            .await
            .unwrap();
        assert_eq!(message, Message::assistant_text("hello"));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(text_reply("third time")))
            .expect(1)
            .mount(&server)
            .await;

        let message = client(&server, 3)
            .generate(&conversation(), &[])
            .await
            .unwrap();
        assert_eq!(message, Message::assistant_text("third time"));
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up_after_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"code": 429, "message": "Resource has been exhausted"}
            })))
            .expect(3)
            .mount(&server)
            .await;

        let err = client(&server, 2)
            .generate(&conversation(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::RateLimit);
        assert_eq!(err.message, "HTTP 429: Resource has been exhausted");
    }

    #[tokio::test]
    async fn test_bad_request_and_bad_json_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server, 3)
            .generate(&conversation(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_slow_backend_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(text_reply("late"))
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;

        let err = client(&server, 0)
            .generate(&conversation(), &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Timeout);
    }
}
