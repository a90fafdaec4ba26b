//! Unified chat types.
//!
//! Every dialect is normalized to these shapes before dispatch; provider
//! adapters translate back out to the upstream's wire format. Unknown
//! request fields ride through the flattened `extra` maps untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const ROLE_SYSTEM: &str = "system";
pub const ROLE_USER: &str = "user";
pub const ROLE_ASSISTANT: &str = "assistant";

/// `message.content` is either a plain string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Concatenated text of all textual parts. Non-text parts (images)
    /// contribute nothing.
    pub fn plain_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter(|p| p.part_type == "text")
                .filter_map(|p| p.text.as_deref())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            MessageContent::Text(s) => s.is_empty(),
            MessageContent::Parts(parts) => parts.is_empty(),
        }
    }
}

/// One entry of a structured content list (text or image).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<Value>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self { part_type: "text".to_string(), text: Some(text.into()), image_url: None }
    }
}

/// Tolerate `content: null` (assistant tool-call messages) by mapping
/// it to empty text.
fn content_or_empty<'de, D>(deserializer: D) -> Result<MessageContent, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Option::<MessageContent>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default, deserialize_with = "content_or_empty")]
    pub content: MessageContent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: ROLE_SYSTEM.to_string(), content: MessageContent::Text(content.into()), ..Default::default() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: ROLE_USER.to_string(), content: MessageContent::Text(content.into()), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDef,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: String,
    pub function: FunctionCall,
}

/// The normalized inbound request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    /// Caller opt-in for search augmentation.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub enable_search: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Choice {
    pub index: i64,
    pub message: ResponseMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

impl Usage {
    pub fn new(prompt: i64, completion: i64) -> Self {
        Self { prompt_tokens: prompt, completion_tokens: completion, total_tokens: prompt + completion }
    }

    /// Later observations win field-by-field; streaming deltas report
    /// cumulative counts.
    pub fn merge(&mut self, other: &Usage) {
        if other.prompt_tokens > 0 {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens > 0 {
            self.completion_tokens = other.completion_tokens;
        }
        self.total_tokens = self.prompt_tokens + self.completion_tokens;
    }
}

/// The normalized upstream response (non-streaming).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub object: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Rough token estimate used when an upstream omits usage
/// (~3.5 chars per token).
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}

/// Estimate the prompt token count of a request from its message text.
pub fn estimate_prompt_tokens(request: &ChatCompletionRequest) -> i64 {
    let mut total = 0;
    for message in &request.messages {
        total += estimate_tokens(&message.content.plain_text());
        // Fixed per-message overhead for role framing.
        total += 4;
    }
    total.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_deserializes_both_shapes() {
        let text: MessageContent = serde_json::from_str("\"hello\"").unwrap();
        assert_eq!(text.plain_text(), "hello");

        let parts: MessageContent = serde_json::from_str(
            r#"[{"type":"text","text":"a"},{"type":"image_url","image_url":{"url":"http://x"}},{"type":"text","text":"b"}]"#,
        )
        .unwrap();
        assert_eq!(parts.plain_text(), "a\nb");
    }

    #[test]
    fn unknown_request_fields_survive_roundtrip() {
        let raw = r#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}],"temperature":0.7,"top_p":0.9}"#;
        let req: ChatCompletionRequest = serde_json::from_str(raw).unwrap();
        assert_eq!(req.extra.get("temperature").unwrap().as_f64().unwrap(), 0.7);

        let back = serde_json::to_value(&req).unwrap();
        assert_eq!(back.get("top_p").unwrap().as_f64().unwrap(), 0.9);
        assert!(back.get("stream").is_none());
    }

    #[test]
    fn null_content_parses_as_empty_text() {
        let raw = r#"{"role":"assistant","content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"f","arguments":"{}"}}]}"#;
        let message: ChatMessage = serde_json::from_str(raw).unwrap();
        assert!(message.content.is_empty());
        assert_eq!(message.tool_calls.unwrap()[0].function.name, "f");
    }

    #[test]
    fn usage_merge_keeps_cumulative_counts() {
        let mut usage = Usage::new(100, 0);
        usage.merge(&Usage { prompt_tokens: 0, completion_tokens: 5, total_tokens: 0 });
        usage.merge(&Usage { prompt_tokens: 0, completion_tokens: 12, total_tokens: 0 });
        assert_eq!(usage.prompt_tokens, 100);
        assert_eq!(usage.completion_tokens, 12);
        assert_eq!(usage.total_tokens, 112);
    }

    #[test]
    fn prompt_estimate_is_positive() {
        let req = ChatCompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("")],
            ..Default::default()
        };
        assert!(estimate_prompt_tokens(&req) >= 1);
    }
}
