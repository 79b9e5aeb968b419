//! OpenAI-compatible chat completions backend.
//!
//! Works with any endpoint exposing `POST {base_url}/chat/completions`.
//! HTTP failures are classified for the resilient client:
//!
//! | response                    | kind            |
//! |-----------------------------|-----------------|
//! | 429                         | rate limited    |
//! | 5xx, timeout, connect error | transient       |
//! | 401, 403                    | auth            |
//! | other 4xx                   | invalid request |

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use patcher_core::resilience::{
    BackendError, BackendRequest, BackendResponse, Message, ReasoningBackend, TokenUsage,
};

use crate::config::ChatConfig;
use crate::error::ConfigError;
use crate::pricing;

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Reasoning backend speaking the chat completions protocol.
pub struct ChatBackend {
    config: ChatConfig,
    http: reqwest::Client,
}

impl ChatBackend {
    pub fn new(config: ChatConfig) -> Result<Self, ConfigError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("repo-patcher/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ChatConfig::from_env()?)
    }

    pub fn config(&self) -> &ChatConfig {
        &self.config
    }

    fn body<'a>(&'a self, request: &'a BackendRequest) -> ChatRequest<'a> {
        let response_format = request.schema.as_ref().map(|schema| {
            json!({
                "type": "json_schema",
                "json_schema": { "name": schema.name, "schema": schema.schema, "strict": false }
            })
        });
        ChatRequest {
            model: request.model.as_deref().unwrap_or(&self.config.model),
            messages: &request.messages,
            temperature: request.temperature.unwrap_or(self.config.temperature),
            max_tokens: request.max_tokens.unwrap_or(self.config.max_tokens),
            response_format,
        }
    }
}

/// Seconds form of `Retry-After`; HTTP-date values are ignored.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn classify_status(status: u16, body: &str, retry: Option<Duration>) -> BackendError {
    let message = format!("HTTP {status}: {}", truncate(body, 300));
    match status {
        429 => BackendError::rate_limited(message, retry),
        401 | 403 => BackendError::auth(message),
        500..=599 => BackendError::transient(message),
        _ => BackendError::invalid_request(message),
    }
}

fn classify_transport(err: &reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::transient(err.to_string())
    } else {
        BackendError::invalid_request(err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[async_trait]
impl ReasoningBackend for ChatBackend {
    async fn send(&self, request: &BackendRequest) -> Result<BackendResponse, BackendError> {
        let body = self.body(request);
        debug!(model = body.model, messages = body.messages.len(), "sending chat completion");

        let response = self
            .http
            .post(self.config.completions_url())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        if !status.is_success() {
            let retry = retry_after(response.headers());
            let text = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "backend returned an error");
            return Err(classify_status(status.as_u16(), &text, retry));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| BackendError::transient(format!("unreadable response body: {e}")))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| BackendError::transient("response carried no choices"))?;

        let usage = parsed
            .usage
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default();
        let model = if parsed.model.is_empty() {
            body.model.to_string()
        } else {
            parsed.model
        };
        let cost = pricing::cost_of(&model, &usage);

        let mut out = BackendResponse::text(content).with_cost(cost);
        out.usage = usage;
        out.model = model;
        Ok(out)
    }

    fn name(&self) -> &str {
        "chat-completions"
    }
}
