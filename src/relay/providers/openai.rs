//! OpenAI-compatible upstream adapter.
//!
//! The unified request is already OpenAI-shaped, so the translation is
//! limited to model mapping and stripping gateway-only fields.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use crate::db::Channel;
use crate::relay::types::{ChatCompletionRequest, ChatCompletionResponse, Usage};

use super::{
    default_client, parse_sse_data, post_json, streaming_client, ApiError, ApiResult,
    UpstreamStream,
};

pub struct OpenAIAdapter {
    pub channel: Arc<Channel>,
}

impl OpenAIAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.channel.base_url.trim_end_matches('/')
        )
    }

    fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let bearer = format!("Bearer {}", self.channel.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&bearer).map_err(|_| ApiError::local("invalid api key"))?,
        );
        Ok(headers)
    }

    fn body(&self, request: &ChatCompletionRequest, stream: bool) -> ApiResult<Value> {
        let mut body = serde_json::to_value(request)
            .map_err(|e| ApiError::local(format!("request serialization failed: {}", e)))?;
        let obj = body
            .as_object_mut()
            .ok_or_else(|| ApiError::local("request is not an object"))?;

        let mapped = self
            .channel
            .model_mapping
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| request.model.clone());
        obj.insert("model".to_string(), Value::String(mapped));
        obj.remove("enable_search");
        if stream {
            obj.insert("stream".to_string(), Value::Bool(true));
            // Ask compatible upstreams to close the stream with usage.
            obj.insert(
                "stream_options".to_string(),
                serde_json::json!({"include_usage": true}),
            );
        } else {
            obj.remove("stream");
        }
        Ok(body)
    }

    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
    ) -> ApiResult<(ChatCompletionResponse, Usage)> {
        let client = default_client()?;
        let body = self.body(request, false)?;
        let response = post_json(&client, &self.url(), self.headers()?, &body).await?;

        let payload: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ApiError::local(format!("invalid upstream response: {}", e)))?;
        let usage = payload.usage.unwrap_or_default();
        Ok((payload, usage))
    }

    pub async fn chat_stream(&self, request: &ChatCompletionRequest) -> ApiResult<UpstreamStream> {
        let client = streaming_client()?;
        let body = self.body(request, true)?;
        let response = post_json(&client, &self.url(), self.headers()?, &body).await?;
        Ok(UpstreamStream { response, fold_usage })
    }
}

/// Accumulate usage from OpenAI SSE frames; the final frame of a
/// `stream_options.include_usage` stream carries the totals.
pub fn fold_usage(line: &str, usage: &mut Usage) {
    let Some(data) = parse_sse_data(line) else {
        return;
    };
    if super::is_sse_done(data) {
        return;
    }
    let Ok(frame) = serde_json::from_str::<Value>(data) else {
        return;
    };
    if let Some(frame_usage) = frame.get("usage") {
        if let Ok(parsed) = serde_json::from_value::<Usage>(frame_usage.clone()) {
            usage.merge(&parsed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::relay::types::ChatMessage;

    fn adapter(mapping: &[(&str, &str)]) -> OpenAIAdapter {
        let mut channel = Channel {
            id: 1,
            channel_type: db::channel_type::OPENAI,
            base_url: "https://api.openai.com".to_string(),
            api_key: "key".to_string(),
            ..Default::default()
        };
        for (from, to) in mapping {
            channel.model_mapping.insert(from.to_string(), to.to_string());
        }
        OpenAIAdapter::new(Arc::new(channel))
    }

    fn request() -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![ChatMessage::user("hi")],
            enable_search: true,
            ..Default::default()
        }
    }

    #[test]
    fn body_maps_model_and_strips_gateway_fields() {
        let adapter = adapter(&[("gpt-4o", "gpt-4o-2024-08-06")]);
        let body = adapter.body(&request(), false).unwrap();
        assert_eq!(body["model"], "gpt-4o-2024-08-06");
        assert!(body.get("enable_search").is_none());
        assert!(body.get("stream").is_none());

        let body = adapter.body(&request(), true).unwrap();
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn usage_folds_from_the_final_frame() {
        let mut usage = Usage::default();
        fold_usage(r#"data: {"choices":[{"delta":{"content":"x"}}]}"#, &mut usage);
        assert_eq!(usage.total_tokens, 0);
        fold_usage(
            r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":34,"total_tokens":46}}"#,
            &mut usage,
        );
        fold_usage("data: [DONE]", &mut usage);
        assert_eq!(usage.prompt_tokens, 12);
        assert_eq!(usage.completion_tokens, 34);
    }
}
