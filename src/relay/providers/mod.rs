//! Provider adapters.
//!
//! One adapter per upstream channel type, dispatched on the channel's
//! discriminator. The dispatcher only sees the narrow capability set:
//! the channel in use, a non-streaming chat call returning the unified
//! response plus usage, and a streaming call returning the upstream
//! byte stream with a per-dialect usage folder.

pub mod anthropic;
pub mod gemini;
pub mod midjourney;
pub mod openai;

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use crate::db::{self, Channel};

use super::types::{ChatCompletionRequest, ChatCompletionResponse, Usage};

/// Upstream failure as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status_code: u16,
    pub kind: String,
    pub message: String,
    /// Routing hint: may another channel succeed where this one failed?
    pub retryable: bool,
}

impl ApiError {
    pub fn from_status(status: u16, body: &str) -> Self {
        let message = extract_upstream_message(body).unwrap_or_else(|| body.chars().take(512).collect());
        Self {
            status_code: status,
            kind: "upstream_error".to_string(),
            message,
            retryable: should_retry_status(status),
        }
    }

    pub fn from_reqwest(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self {
                status_code: 504,
                kind: "timeout".to_string(),
                message: "upstream request timed out".to_string(),
                retryable: true,
            }
        } else if e.is_connect() {
            Self {
                status_code: 502,
                kind: "connect_error".to_string(),
                message: format!("connection failed: {}", e),
                retryable: true,
            }
        } else {
            Self {
                status_code: 502,
                kind: "request_error".to_string(),
                message: format!("request error: {}", e),
                retryable: true,
            }
        }
    }

    pub fn local(message: impl Into<String>) -> Self {
        Self {
            status_code: 500,
            kind: "adapter_error".to_string(),
            message: message.into(),
            retryable: false,
        }
    }
}

/// Retry only on throttling, request timeout and server errors; other
/// 4xx mean the request itself is at fault.
pub fn should_retry_status(status: u16) -> bool {
    status == 429 || status == 408 || (500..=599).contains(&status)
}

/// Pull a human-readable message out of a provider error body.
fn extract_upstream_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .map(|m| m.to_string())
        .or_else(|| error.as_str().map(|m| m.to_string()))
}

/// SSE `data:` line prefix strip.
pub fn parse_sse_data(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("data:")?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete SSE lines from a byte buffer; line breaks may split
/// across reads.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };
        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        lines.push(String::from_utf8_lossy(&line).to_string());
    }
    lines
}

pub type ApiResult<T> = Result<T, ApiError>;

/// A live upstream SSE stream plus the folder that accumulates usage
/// from its frames.
pub struct UpstreamStream {
    pub response: reqwest::Response,
    pub fold_usage: fn(&str, &mut Usage),
}

/// Uniform capability surface over upstream providers.
pub enum ProviderAdapter {
    OpenAI(openai::OpenAIAdapter),
    Anthropic(anthropic::AnthropicAdapter),
    Gemini(gemini::GeminiAdapter),
    Midjourney(midjourney::MidjourneyAdapter),
}

impl ProviderAdapter {
    /// Build the adapter for a channel's type. Vertex AI channels speak
    /// the Gemini dialect.
    pub fn for_channel(channel: Arc<Channel>) -> Self {
        match channel.channel_type {
            db::channel_type::ANTHROPIC => {
                ProviderAdapter::Anthropic(anthropic::AnthropicAdapter::new(channel))
            }
            db::channel_type::GEMINI | db::channel_type::VERTEX_AI => {
                ProviderAdapter::Gemini(gemini::GeminiAdapter::new(channel))
            }
            db::channel_type::MIDJOURNEY => {
                ProviderAdapter::Midjourney(midjourney::MidjourneyAdapter::new(channel))
            }
            _ => ProviderAdapter::OpenAI(openai::OpenAIAdapter::new(channel)),
        }
    }

    pub fn channel(&self) -> &Arc<Channel> {
        match self {
            ProviderAdapter::OpenAI(a) => &a.channel,
            ProviderAdapter::Anthropic(a) => &a.channel,
            ProviderAdapter::Gemini(a) => &a.channel,
            ProviderAdapter::Midjourney(a) => &a.channel,
        }
    }

    /// Model name sent upstream after the channel's mapping.
    pub fn upstream_model(&self, model: &str) -> String {
        self.channel()
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> ApiResult<(ChatCompletionResponse, Usage)> {
        match self {
            ProviderAdapter::OpenAI(a) => a.chat(request).await,
            ProviderAdapter::Anthropic(a) => a.chat(request).await,
            ProviderAdapter::Gemini(a) => a.chat(request).await,
            ProviderAdapter::Midjourney(_) => {
                Err(ApiError::local("midjourney channels do not serve chat"))
            }
        }
    }

    pub async fn chat_stream(&self, request: &ChatCompletionRequest) -> ApiResult<UpstreamStream> {
        match self {
            ProviderAdapter::OpenAI(a) => a.chat_stream(request).await,
            ProviderAdapter::Anthropic(a) => a.chat_stream(request).await,
            ProviderAdapter::Gemini(a) => a.chat_stream(request).await,
            ProviderAdapter::Midjourney(_) => {
                Err(ApiError::local("midjourney channels do not serve chat"))
            }
        }
    }
}

pub fn default_client() -> ApiResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ApiError::local(format!("failed to create HTTP client: {}", e)))
}

pub fn streaming_client() -> ApiResult<Client> {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(|e| ApiError::local(format!("failed to create HTTP client: {}", e)))
}

/// Shared send path: POST the body, map transport errors, convert
/// non-2xx statuses into [`ApiError`].
pub async fn post_json(
    client: &Client,
    url: &str,
    headers: reqwest::header::HeaderMap,
    body: &serde_json::Value,
) -> ApiResult<reqwest::Response> {
    let response = client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(ApiError::from_reqwest)?;

    let status = response.status().as_u16();
    if !(200..300).contains(&status) {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::from_status(status, &body));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(should_retry_status(429));
        assert!(should_retry_status(408));
        assert!(should_retry_status(500));
        assert!(should_retry_status(503));
        assert!(!should_retry_status(400));
        assert!(!should_retry_status(401));
        assert!(!should_retry_status(404));
    }

    #[test]
    fn upstream_message_extraction() {
        let err = ApiError::from_status(429, r#"{"error":{"message":"rate limited","type":"rate_limit"}}"#);
        assert_eq!(err.message, "rate limited");
        assert!(err.retryable);

        let err = ApiError::from_status(400, "plain text failure");
        assert_eq!(err.message, "plain text failure");
        assert!(!err.retryable);
    }

    #[test]
    fn sse_line_draining_handles_partials() {
        let mut buffer = Vec::new();
        assert!(drain_sse_lines(&mut buffer, b"data: {\"id\":").is_empty());
        let lines = drain_sse_lines(&mut buffer, b"1}\r\ndata: [DONE]\n");
        assert_eq!(lines, vec!["data: {\"id\":1}", "data: [DONE]"]);
        assert!(buffer.is_empty());

        assert_eq!(parse_sse_data("data: x"), Some("x"));
        assert_eq!(parse_sse_data("event: ping"), None);
        assert!(is_sse_done(" [DONE] "));
    }
}
