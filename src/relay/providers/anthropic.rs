//! Anthropic (Claude) upstream adapter and dialect translation.
//!
//! Translation runs in both directions: inbound Claude-dialect payloads
//! normalize to the unified request, and unified responses render back
//! into the Claude message shape for callers on that dialect.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::db::Channel;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, MessageContent,
    ResponseMessage, Usage, ROLE_ASSISTANT, ROLE_SYSTEM,
};

use super::{
    default_client, parse_sse_data, post_json, streaming_client, ApiError, ApiResult,
    UpstreamStream,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: i64 = 4096;

pub struct AnthropicAdapter {
    pub channel: Arc<Channel>,
}

impl AnthropicAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.channel.base_url.trim_end_matches('/'))
    }

    fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.channel.api_key)
                .map_err(|_| ApiError::local("invalid api key"))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
        Ok(headers)
    }

    fn body(&self, request: &ChatCompletionRequest, stream: bool) -> Value {
        let mapped = self
            .channel
            .model_mapping
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| request.model.clone());

        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            if message.role == ROLE_SYSTEM {
                system_parts.push(message.content.plain_text());
            } else {
                messages.push(json!({
                    "role": message.role,
                    "content": serde_json::to_value(&message.content).unwrap_or(Value::Null),
                }));
            }
        }

        let max_tokens = request
            .extra
            .get("max_tokens")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = json!({
            "model": mapped,
            "messages": messages,
            "max_tokens": max_tokens,
        });
        if !system_parts.is_empty() {
            body["system"] = Value::String(system_parts.join("\n"));
        }
        if let Some(temperature) = request.extra.get("temperature") {
            body["temperature"] = temperature.clone();
        }
        if stream {
            body["stream"] = Value::Bool(true);
        }
        body
    }

    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> ApiResult<(ChatCompletionResponse, Usage)> {
        let client = default_client()?;
        let body = self.body(request, false);
        let response = post_json(&client, &self.url(), self.headers()?, &body).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ApiError::local(format!("invalid upstream response: {}", e)))?;
        let unified = response_from_claude(&payload);
        let usage = unified.usage.unwrap_or_default();
        Ok((unified, usage))
    }

    pub async fn chat_stream(&self, request: &ChatCompletionRequest) -> ApiResult<UpstreamStream> {
        let client = streaming_client()?;
        let body = self.body(request, true);
        let response = post_json(&client, &self.url(), self.headers()?, &body).await?;
        Ok(UpstreamStream { response, fold_usage })
    }
}

/// Accumulate usage from Claude SSE frames. `message_start` carries
/// input tokens, `message_delta` the cumulative output count.
pub fn fold_usage(line: &str, usage: &mut Usage) {
    let Some(data) = parse_sse_data(line) else {
        return;
    };
    let Ok(frame) = serde_json::from_str::<Value>(data) else {
        return;
    };
    let input = frame
        .pointer("/message/usage/input_tokens")
        .or_else(|| frame.pointer("/usage/input_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let output = frame
        .pointer("/message/usage/output_tokens")
        .or_else(|| frame.pointer("/usage/output_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.merge(&Usage { prompt_tokens: input, completion_tokens: output, total_tokens: 0 });
}

fn finish_reason_from_claude(stop_reason: Option<&str>) -> Option<String> {
    stop_reason.map(|r| {
        match r {
            "end_turn" | "stop_sequence" => "stop",
            "max_tokens" => "length",
            "tool_use" => "tool_calls",
            other => other,
        }
        .to_string()
    })
}

fn stop_reason_to_claude(finish_reason: Option<&str>) -> &'static str {
    match finish_reason {
        Some("length") => "max_tokens",
        Some("tool_calls") => "tool_use",
        _ => "end_turn",
    }
}

/// Claude message response -> unified response.
pub fn response_from_claude(payload: &Value) -> ChatCompletionResponse {
    let text = payload
        .get("content")
        .and_then(|c| c.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter(|p| p.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = Usage::new(
        payload.pointer("/usage/input_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
        payload.pointer("/usage/output_tokens").and_then(|v| v.as_i64()).unwrap_or(0),
    );

    ChatCompletionResponse {
        id: payload.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: payload.get("model").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: ROLE_ASSISTANT.to_string(),
                content: Some(text),
                tool_calls: None,
            },
            finish_reason: finish_reason_from_claude(
                payload.get("stop_reason").and_then(|v| v.as_str()),
            ),
        }],
        usage: Some(usage),
        extra: Default::default(),
    }
}

/// Inbound Claude-dialect payload -> unified request.
pub fn request_from_claude_payload(payload: &Value) -> RelayResult<ChatCompletionRequest> {
    let model = payload
        .get("model")
        .and_then(|v| v.as_str())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| RelayError::BadRequest("missing 'model' field".to_string()))?;

    let mut messages: Vec<ChatMessage> = Vec::new();
    if let Some(system) = payload.get("system") {
        let text = match system {
            Value::String(s) => s.clone(),
            other => serde_json::from_value::<MessageContent>(other.clone())
                .map(|c| c.plain_text())
                .unwrap_or_default(),
        };
        if !text.is_empty() {
            messages.push(ChatMessage::system(text));
        }
    }

    let raw_messages = payload
        .get("messages")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RelayError::BadRequest("missing 'messages' field".to_string()))?;
    for raw in raw_messages {
        let message: ChatMessage = serde_json::from_value(raw.clone())
            .map_err(|e| RelayError::BadRequest(format!("invalid message: {}", e)))?;
        messages.push(message);
    }

    let mut extra = serde_json::Map::new();
    for key in ["max_tokens", "temperature", "top_p", "stop_sequences"] {
        if let Some(v) = payload.get(key) {
            extra.insert(key.to_string(), v.clone());
        }
    }

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream: payload.get("stream").and_then(|v| v.as_bool()).unwrap_or(false),
        tools: None,
        enable_search: false,
        extra,
    })
}

/// Unified response -> Claude message shape for Claude-dialect callers.
pub fn response_to_claude(response: &ChatCompletionResponse) -> Value {
    let choice = response.choices.first();
    let text = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let usage = response.usage.unwrap_or_default();

    json!({
        "id": response.id,
        "type": "message",
        "role": "assistant",
        "model": response.model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": stop_reason_to_claude(
            choice.and_then(|c| c.finish_reason.as_deref()),
        ),
        "stop_sequence": null,
        "usage": {
            "input_tokens": usage.prompt_tokens,
            "output_tokens": usage.completion_tokens,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(Arc::new(Channel {
            id: 2,
            channel_type: db::channel_type::ANTHROPIC,
            base_url: "https://api.anthropic.com".to_string(),
            api_key: "key".to_string(),
            ..Default::default()
        }))
    }

    #[test]
    fn body_hoists_system_messages() {
        let request = ChatCompletionRequest {
            model: "claude-3-5-haiku".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hi")],
            ..Default::default()
        };
        let body = adapter().body(&request, false);
        assert_eq!(body["system"], "be brief");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn claude_payload_roundtrip() {
        let payload = json!({
            "model": "claude-3-5-haiku",
            "system": "stay factual",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hello"}],
            "stream": true,
        });
        let request = request_from_claude_payload(&payload).unwrap();
        assert_eq!(request.model, "claude-3-5-haiku");
        assert!(request.stream);
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, ROLE_SYSTEM);
        assert_eq!(request.extra.get("max_tokens").unwrap().as_i64(), Some(100));

        assert!(request_from_claude_payload(&json!({"messages": []})).is_err());
    }

    #[test]
    fn claude_response_translation() {
        let payload = json!({
            "id": "msg_1",
            "model": "claude-3-5-haiku",
            "content": [{"type": "text", "text": "hi "}, {"type": "text", "text": "there"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 9, "output_tokens": 4},
        });
        let unified = response_from_claude(&payload);
        assert_eq!(unified.choices[0].message.content.as_deref(), Some("hi there"));
        assert_eq!(unified.choices[0].finish_reason.as_deref(), Some("stop"));
        assert_eq!(unified.usage.unwrap().prompt_tokens, 9);

        let back = response_to_claude(&unified);
        assert_eq!(back["content"][0]["text"], "hi there");
        assert_eq!(back["stop_reason"], "end_turn");
        assert_eq!(back["usage"]["output_tokens"], 4);
    }

    #[test]
    fn stream_usage_folds_across_events() {
        let mut usage = Usage::default();
        fold_usage(
            r#"data: {"type":"message_start","message":{"usage":{"input_tokens":25,"output_tokens":1}}}"#,
            &mut usage,
        );
        fold_usage(
            r#"data: {"type":"message_delta","usage":{"output_tokens":17}}"#,
            &mut usage,
        );
        assert_eq!(usage.prompt_tokens, 25);
        assert_eq!(usage.completion_tokens, 17);
    }
}
