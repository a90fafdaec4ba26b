//! Midjourney proxy upstream adapter.
//!
//! Midjourney channels speak the mj-proxy surface instead of chat:
//! task submission plus polling. Responses pass through verbatim; the
//! gateway only injects the upstream secret and meters the submit.

use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::Value;

use crate::db::Channel;

use super::{default_client, ApiError, ApiResult};

pub struct MidjourneyAdapter {
    pub channel: Arc<Channel>,
}

impl MidjourneyAdapter {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn headers(&self) -> ApiResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "mj-api-secret",
            HeaderValue::from_str(&self.channel.api_key)
                .map_err(|_| ApiError::local("invalid api key"))?,
        );
        Ok(headers)
    }

    /// Submit a task (`imagine`, `change`, ...) to the upstream proxy.
    pub async fn submit(&self, action: &str, body: &Value) -> ApiResult<Value> {
        let url = format!(
            "{}/mj/submit/{}",
            self.channel.base_url.trim_end_matches('/'),
            action
        );
        let client = default_client()?;
        let response = super::post_json(&client, &url, self.headers()?, body).await?;
        response
            .json()
            .await
            .map_err(|e| ApiError::local(format!("invalid upstream response: {}", e)))
    }

    /// Poll a submitted task.
    pub async fn fetch(&self, task_id: &str) -> ApiResult<Value> {
        let url = format!(
            "{}/mj/task/{}/fetch",
            self.channel.base_url.trim_end_matches('/'),
            task_id
        );
        let client = default_client()?;
        let response = client
            .get(&url)
            .headers(self.headers()?)
            .send()
            .await
            .map_err(ApiError::from_reqwest)?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::local(format!("invalid upstream response: {}", e)))
    }
}

/// The model name Midjourney submissions are billed under.
pub fn billing_model(mode: &str) -> String {
    format!("mj-{}", mode)
}
