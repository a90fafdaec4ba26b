//! Google Gemini upstream adapter and dialect translation.
//!
//! Serves both Gemini and Vertex AI channel types; the wire dialect is
//! the same `generateContent` surface.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use crate::db::Channel;
use crate::relay::error::{RelayError, RelayResult};
use crate::relay::types::{
    ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Choice, MessageContent,
    ResponseMessage, Usage, ROLE_ASSISTANT, ROLE_SYSTEM, ROLE_USER,
};

use super::{
    default_client, parse_sse_data, post_json, streaming_client, ApiError, ApiResult,
    UpstreamStream,
};

pub struct GeminiAdapter {
    pub channel: Arc<Channel>,
}

impl GeminiAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn url(&self, model: &str, stream: bool) -> String {
        let action = if stream {
            "streamGenerateContent?alt=sse"
        } else {
            "generateContent"
        };
        format!(
            "{}/v1beta/models/{}:{}",
            self.channel.base_url.trim_end_matches('/'),
            model,
            action
        )
    }

    fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-goog-api-key",
            HeaderValue::from_str(&self.channel.api_key)
                .map_err(|_| ApiError::local("invalid api key"))?,
        );
        Ok(headers)
    }

    fn mapped_model(&self, request: &ChatCompletionRequest) -> String {
        self.channel
            .model_mapping
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| request.model.clone())
    }

    fn body(&self, request: &ChatCompletionRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        for message in &request.messages {
            if message.role == ROLE_SYSTEM {
                system_parts.push(json!({"text": message.content.plain_text()}));
                continue;
            }
            let role = if message.role == ROLE_ASSISTANT { "model" } else { "user" };
            contents.push(json!({
                "role": role,
                "parts": [{"text": message.content.plain_text()}],
            }));
        }

        let mut body = json!({"contents": contents});
        if !system_parts.is_empty() {
            body["systemInstruction"] = json!({"parts": system_parts});
        }

        let mut generation_config = serde_json::Map::new();
        if let Some(max_tokens) = request.extra.get("max_tokens") {
            generation_config.insert("maxOutputTokens".to_string(), max_tokens.clone());
        }
        if let Some(temperature) = request.extra.get("temperature") {
            generation_config.insert("temperature".to_string(), temperature.clone());
        }
        if !generation_config.is_empty() {
            body["generationConfig"] = Value::Object(generation_config);
        }
        body
    }

    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> ApiResult<(ChatCompletionResponse, Usage)> {
        let client = default_client()?;
        let url = self.url(&self.mapped_model(request), false);
        let response = post_json(&client, &url, self.headers()?, &self.body(request)).await?;
        let payload: Value = response
            .json()
            .await
            .map_err(|e| ApiError::local(format!("invalid upstream response: {}", e)))?;
        let unified = response_from_gemini(&payload, &request.model);
        let usage = unified.usage.unwrap_or_default();
        Ok((unified, usage))
    }

    pub async fn chat_stream(&self, request: &ChatCompletionRequest) -> ApiResult<UpstreamStream> {
        let client = streaming_client()?;
        let url = self.url(&self.mapped_model(request), true);
        let response = post_json(&client, &url, self.headers()?, &self.body(request)).await?;
        Ok(UpstreamStream { response, fold_usage })
    }
}

/// Accumulate usage from Gemini SSE frames; `usageMetadata` counts are
/// cumulative.
pub fn fold_usage(line: &str, usage: &mut Usage) {
    let Some(data) = parse_sse_data(line) else {
        return;
    };
    let Ok(frame) = serde_json::from_str::<Value>(data) else {
        return;
    };
    let prompt = frame
        .pointer("/usageMetadata/promptTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let completion = frame
        .pointer("/usageMetadata/candidatesTokenCount")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    usage.merge(&Usage { prompt_tokens: prompt, completion_tokens: completion, total_tokens: 0 });
}

fn finish_reason_from_gemini(reason: Option<&str>) -> Option<String> {
    reason.map(|r| {
        match r {
            "STOP" => "stop",
            "MAX_TOKENS" => "length",
            other => other,
        }
        .to_string()
    })
}

fn finish_reason_to_gemini(reason: Option<&str>) -> &'static str {
    match reason {
        Some("length") => "MAX_TOKENS",
        _ => "STOP",
    }
}

/// Gemini response -> unified response.
pub fn response_from_gemini(payload: &Value, model: &str) -> ChatCompletionResponse {
    let text = payload
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let usage = Usage::new(
        payload
            .pointer("/usageMetadata/promptTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        payload
            .pointer("/usageMetadata/candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    );

    ChatCompletionResponse {
        id: format!("gemini-{}", uuid::Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: ROLE_ASSISTANT.to_string(),
                content: Some(text),
                tool_calls: None,
            },
            finish_reason: finish_reason_from_gemini(
                payload.pointer("/candidates/0/finishReason").and_then(|v| v.as_str()),
            ),
        }],
        usage: Some(usage),
        extra: Default::default(),
    }
}

/// Inbound Gemini-dialect payload -> unified request. The model arrives
/// in the URL path, not the payload.
pub fn request_from_gemini_payload(
    payload: &Value,
    model: &str,
    stream: bool,
) -> RelayResult<ChatCompletionRequest> {
    let contents = payload
        .get("contents")
        .and_then(|v| v.as_array())
        .ok_or_else(|| RelayError::BadRequest("missing 'contents' field".to_string()))?;

    let mut messages = Vec::new();
    if let Some(parts) = payload.pointer("/systemInstruction/parts").and_then(|v| v.as_array()) {
        let text = parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n");
        if !text.is_empty() {
            messages.push(ChatMessage::system(text));
        }
    }

    for content in contents {
        let role = match content.get("role").and_then(|r| r.as_str()) {
            Some("model") => ROLE_ASSISTANT,
            _ => ROLE_USER,
        };
        let text = content
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        messages.push(ChatMessage {
            role: role.to_string(),
            content: MessageContent::Text(text),
            ..Default::default()
        });
    }

    let mut extra = serde_json::Map::new();
    if let Some(max_tokens) = payload.pointer("/generationConfig/maxOutputTokens") {
        extra.insert("max_tokens".to_string(), max_tokens.clone());
    }
    if let Some(temperature) = payload.pointer("/generationConfig/temperature") {
        extra.insert("temperature".to_string(), temperature.clone());
    }

    Ok(ChatCompletionRequest {
        model: model.to_string(),
        messages,
        stream,
        tools: None,
        enable_search: false,
        extra,
    })
}

/// Unified response -> Gemini response shape for Gemini-dialect callers.
pub fn response_to_gemini(response: &ChatCompletionResponse) -> Value {
    let choice = response.choices.first();
    let text = choice
        .and_then(|c| c.message.content.clone())
        .unwrap_or_default();
    let usage = response.usage.unwrap_or_default();

    json!({
        "candidates": [{
            "content": {"parts": [{"text": text}], "role": "model"},
            "finishReason": finish_reason_to_gemini(
                choice.and_then(|c| c.finish_reason.as_deref()),
            ),
            "index": 0,
        }],
        "usageMetadata": {
            "promptTokenCount": usage.prompt_tokens,
            "candidatesTokenCount": usage.completion_tokens,
            "totalTokenCount": usage.total_tokens,
        },
        "modelVersion": response.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new(Arc::new(Channel {
            id: 3,
            channel_type: db::channel_type::GEMINI,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            api_key: "key".to_string(),
            ..Default::default()
        }))
    }

    #[test]
    fn url_selects_stream_action() {
        let a = adapter();
        assert!(a.url("gemini-2.0-flash", false).ends_with("models/gemini-2.0-flash:generateContent"));
        assert!(a.url("gemini-2.0-flash", true).contains("streamGenerateContent?alt=sse"));
    }

    #[test]
    fn body_splits_system_and_turns() {
        let request = ChatCompletionRequest {
            model: "gemini-2.0-flash".to_string(),
            messages: vec![
                ChatMessage::system("short answers"),
                ChatMessage::user("hello"),
                ChatMessage {
                    role: ROLE_ASSISTANT.to_string(),
                    content: MessageContent::Text("hi".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let body = adapter().body(&request);
        assert_eq!(body["systemInstruction"]["parts"][0]["text"], "short answers");
        assert_eq!(body["contents"][0]["role"], "user");
        assert_eq!(body["contents"][1]["role"], "model");
    }

    #[test]
    fn gemini_payload_roundtrip() {
        let payload = json!({
            "contents": [{"role": "user", "parts": [{"text": "hello"}]}],
            "systemInstruction": {"parts": [{"text": "be kind"}]},
            "generationConfig": {"maxOutputTokens": 256},
        });
        let request = request_from_gemini_payload(&payload, "gemini-2.0-flash", true).unwrap();
        assert_eq!(request.model, "gemini-2.0-flash");
        assert!(request.stream);
        assert_eq!(request.messages[0].role, ROLE_SYSTEM);
        assert_eq!(request.extra.get("max_tokens").unwrap().as_i64(), Some(256));

        assert!(request_from_gemini_payload(&json!({}), "m", false).is_err());
    }

    #[test]
    fn gemini_response_translation() {
        let payload = json!({
            "candidates": [{
                "content": {"parts": [{"text": "answer"}], "role": "model"},
                "finishReason": "STOP",
            }],
            "usageMetadata": {"promptTokenCount": 7, "candidatesTokenCount": 3},
        });
        let unified = response_from_gemini(&payload, "gemini-2.0-flash");
        assert_eq!(unified.choices[0].message.content.as_deref(), Some("answer"));
        assert_eq!(unified.choices[0].finish_reason.as_deref(), Some("stop"));

        let back = response_to_gemini(&unified);
        assert_eq!(back["candidates"][0]["content"]["parts"][0]["text"], "answer");
        assert_eq!(back["usageMetadata"]["promptTokenCount"], 7);
        assert_eq!(back["candidates"][0]["finishReason"], "STOP");
    }
}
