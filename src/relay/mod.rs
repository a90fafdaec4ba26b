//! Relay dispatch engine.
//!
//! Handles request forwarding to upstream LLM providers behind the
//! OpenAI, Claude, Gemini and Midjourney surfaces.
//!
//! ```text
//! Request -> auth -> dispatch -> (route -> prepare -> send) -> response
//!              |                    ^                  |
//!              v                    +----- retry ------+
//!         RelayContext          (budget, deadline, skip set)
//! ```
//!
//! Per attempt: pick a channel from the group index, apply rewrites,
//! reserve quota, send. A retryable upstream failure refunds the hold,
//! cools the channel down on 429, excludes it from re-routing and loops
//! until the budget or the wall-clock deadline runs out. Only the
//! terminal error reaches the client, serialized in the arrival dialect.

pub mod auth;
pub mod channels;
pub mod context;
pub mod error;
pub mod models;
pub mod providers;
pub mod quota;
pub mod rewrite;
pub mod token_cache;
pub mod types;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::Value;

use crate::{config, logger};

use context::{Dialect, RelayContext};
use error::RelayError;
use providers::{ApiError, ProviderAdapter, UpstreamStream};
use quota::Quota;
use types::{estimate_prompt_tokens, estimate_tokens, ChatCompletionRequest, ChatCompletionResponse, Usage};

/// Best client-IP guess: proxy headers first, then the peer address.
pub(crate) fn client_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    addr.ip().to_string()
}

fn to_relay_error(e: ApiError) -> RelayError {
    if e.retryable {
        RelayError::UpstreamRetryable { status: e.status_code, message: e.message }
    } else {
        RelayError::UpstreamFatal { status: e.status_code, message: e.message }
    }
}

/// Fill in missing usage numbers from estimates so billing never sees
/// zeros for a delivered response.
fn normalize_usage(
    mut usage: Usage,
    prompt_estimate: i64,
    response: Option<&ChatCompletionResponse>,
) -> Usage {
    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_estimate;
    }
    if usage.completion_tokens == 0 {
        if let Some(response) = response {
            let text: String = response
                .choices
                .iter()
                .filter_map(|c| c.message.content.as_deref())
                .collect();
            usage.completion_tokens = estimate_tokens(&text);
        }
    }
    usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
    usage
}

fn render_success(dialect: Dialect, response: &ChatCompletionResponse) -> Response {
    match dialect {
        Dialect::OpenAI => Json(response).into_response(),
        Dialect::Claude => Json(providers::anthropic::response_to_claude(response)).into_response(),
        Dialect::Gemini => Json(providers::gemini::response_to_gemini(response)).into_response(),
        Dialect::Midjourney => Json(response).into_response(),
    }
}

/// The per-request state machine.
pub async fn dispatch_chat(mut ctx: RelayContext, mut request: ChatCompletionRequest) -> Response {
    let settings = config::load();

    if request.model.is_empty() {
        return RelayError::BadRequest("missing 'model' field".to_string())
            .into_dialect_response(ctx.dialect);
    }
    if request.messages.is_empty() {
        return RelayError::BadRequest("messages must not be empty".to_string())
            .into_dialect_response(ctx.dialect);
    }

    // Alias substitution; billing stays on the caller-facing name.
    ctx.original_model = request.model.clone();
    match settings.model_alias.get(&request.model) {
        Some(target) => {
            ctx.new_model = target.clone();
            ctx.billing_original_model = true;
        }
        None => ctx.new_model = request.model.clone(),
    }

    if let Some(allowed) = &ctx.token_setting.models {
        if !allowed.iter().any(|m| m == &ctx.original_model) {
            return RelayError::Forbidden(format!(
                "model {} is not allowed for this key",
                ctx.original_model
            ))
            .into_dialect_response(ctx.dialect);
        }
    }

    let deadline = ctx.request_start + Duration::from_secs(settings.retry_timeout_secs);
    // A pinned channel gets exactly one attempt.
    let mut retry_budget = if ctx.specific_channel_id.is_some() { 0 } else { settings.retry_times };
    let mut search_applied = false;
    let mut last_error: Option<RelayError> = None;

    loop {
        // ROUTE
        let routed = channels::next(
            &ctx.token_group,
            ctx.token_backup_group.as_deref(),
            &ctx.new_model,
            &ctx.skip_channel_ids,
            ctx.specific_channel_id,
            ctx.specific_channel_id_ignore,
        );
        let channel = match routed {
            Ok(channel) => channel,
            Err(route_err) => {
                // Mid-retry exhaustion surfaces the upstream error that
                // got us here, not the routing miss.
                let err = last_error.unwrap_or(route_err);
                return err.into_dialect_response(ctx.dialect);
            }
        };

        if last_error.is_some() {
            logger::info(
                "relay",
                &format!(
                    "retrying on channel #{}({}) with budget {}",
                    channel.id, channel.name, retry_budget
                ),
            );
        }

        // PREPARE
        if !search_applied && (channel.enable_search || request.enable_search) {
            rewrite::apply_search(&ctx, &channel, &mut request).await;
            search_applied = true;
        }
        let mut attempt_request = request.clone();
        attempt_request.model = ctx.new_model.clone();
        rewrite::apply_system_prompt(&channel, &mut attempt_request);

        let prompt_tokens = estimate_prompt_tokens(&attempt_request);
        let mut quota = Quota::new(&ctx, ctx.billing_model(), prompt_tokens);
        if let Err(e) = quota.pre_consume() {
            // Quota errors never retry and need no refund.
            return e.into_dialect_response(ctx.dialect);
        }

        // SEND
        let adapter = ProviderAdapter::for_channel(channel.clone());
        let failure = if request.stream {
            match adapter.chat_stream(&attempt_request).await {
                Ok(upstream) => {
                    quota.set_first_response_time();
                    return stream_response(ctx, quota, upstream, prompt_tokens);
                }
                Err(e) => e,
            }
        } else {
            match adapter.chat(&attempt_request).await {
                Ok((mut response, usage)) => {
                    quota.set_first_response_time();
                    let usage = normalize_usage(usage, prompt_tokens, Some(&response));
                    quota.consume(&ctx, &usage, false);
                    response.model = ctx.original_model.clone();
                    return render_success(ctx.dialect, &response);
                }
                Err(e) => e,
            }
        };

        // SEND -> RETRY
        quota.undo();
        if failure.status_code == 429 {
            channels::set_cooldown(channel.id, &ctx.new_model);
        }
        ctx.skip_channel(channel.id);
        logger::error(
            "relay",
            &format!(
                "channel #{}({}) failed with status {}: {}",
                channel.id, channel.name, failure.status_code, failure.message
            ),
        );

        let err = to_relay_error(failure);
        if !err.is_retryable() || retry_budget == 0 {
            return err.into_dialect_response(ctx.dialect);
        }
        if Instant::now() >= deadline {
            return RelayError::RetryTimeout.into_dialect_response(ctx.dialect);
        }
        retry_budget -= 1;
        last_error = Some(err);
    }
}

struct StreamState {
    upstream: reqwest::Response,
    fold_usage: fn(&str, &mut Usage),
    buffer: Vec<u8>,
    usage: Usage,
    data_chars: usize,
    prompt_estimate: i64,
    quota: Option<Quota>,
    ctx: RelayContext,
}

impl StreamState {
    fn finalize(&mut self) {
        let Some(mut quota) = self.quota.take() else {
            return;
        };
        let mut usage = self.usage;
        if usage.prompt_tokens == 0 {
            usage.prompt_tokens = self.prompt_estimate;
        }
        if usage.completion_tokens == 0 && self.data_chars > 0 {
            usage.completion_tokens = (self.data_chars as f64 / 3.5).round() as i64;
        }
        usage.total_tokens = usage.prompt_tokens + usage.completion_tokens;
        quota.consume(&self.ctx, &usage, true);
    }
}

/// Forward upstream SSE bytes verbatim while folding usage out of the
/// frames; commit quota when the stream ends. Dropping the body
/// mid-stream (client disconnect) refunds through the reservation's
/// drop path instead.
fn stream_response(
    ctx: RelayContext,
    quota: Quota,
    upstream: UpstreamStream,
    prompt_estimate: i64,
) -> Response {
    let state = StreamState {
        upstream: upstream.response,
        fold_usage: upstream.fold_usage,
        buffer: Vec::new(),
        usage: Usage::default(),
        data_chars: 0,
        prompt_estimate,
        quota: Some(quota),
        ctx,
    };

    let stream = futures_util::stream::unfold(state, |mut state| async move {
        match state.upstream.chunk().await {
            Ok(Some(bytes)) => {
                for line in providers::drain_sse_lines(&mut state.buffer, &bytes) {
                    if let Some(data) = providers::parse_sse_data(&line) {
                        if !providers::is_sse_done(data) {
                            state.data_chars += data.chars().count();
                        }
                    }
                    (state.fold_usage)(&line, &mut state.usage);
                }
                Some((Ok::<Bytes, std::io::Error>(bytes), state))
            }
            Ok(None) => {
                state.finalize();
                None
            }
            Err(e) => {
                logger::error("relay", &format!("stream read failed: {}", e));
                state.finalize();
                None
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ============================================================================
// Chat entry points, one per dialect
// ============================================================================

/// OpenAI-compatible chat completions.
///
/// Route: POST /v1/chat/completions
pub async fn chat_completions(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let ctx = match auth::authenticate(Dialect::OpenAI, &headers, None, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::OpenAI),
    };
    let request: ChatCompletionRequest = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return RelayError::BadRequest(format!("invalid request: {}", e))
                .into_dialect_response(Dialect::OpenAI)
        }
    };
    dispatch_chat(ctx, request).await
}

/// Claude messages endpoint.
///
/// Route: POST /claude/v1/messages
pub async fn claude_messages(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let ctx = match auth::authenticate(Dialect::Claude, &headers, None, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::Claude),
    };
    let request = match providers::anthropic::request_from_claude_payload(&payload) {
        Ok(r) => r,
        Err(e) => return e.into_dialect_response(Dialect::Claude),
    };
    dispatch_chat(ctx, request).await
}

/// Gemini generate endpoint; the model and action ride in the path
/// (`models/<model>:generateContent`).
///
/// Route: POST /gemini/v1beta/models/{model_action}
pub async fn gemini_generate(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model_action): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let query_key = query.get("key").map(|k| k.as_str());
    let ctx = match auth::authenticate(Dialect::Gemini, &headers, query_key, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::Gemini),
    };

    let (model, action) = match model_action.split_once(':') {
        Some((model, action)) if !model.is_empty() => (model, action),
        _ => {
            return RelayError::BadRequest("expected models/<model>:<action>".to_string())
                .into_dialect_response(Dialect::Gemini)
        }
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        other => {
            return RelayError::BadRequest(format!("unsupported action '{}'", other))
                .into_dialect_response(Dialect::Gemini)
        }
    };

    let request = match providers::gemini::request_from_gemini_payload(&payload, model, stream) {
        Ok(r) => r,
        Err(e) => return e.into_dialect_response(Dialect::Gemini),
    };
    dispatch_chat(ctx, request).await
}

// ============================================================================
// Midjourney entry points
// ============================================================================

fn mj_route(ctx: &RelayContext, model: &str) -> Result<ProviderAdapter, RelayError> {
    let channel = channels::next(
        &ctx.token_group,
        ctx.token_backup_group.as_deref(),
        model,
        &ctx.skip_channel_ids,
        ctx.specific_channel_id,
        ctx.specific_channel_id_ignore,
    )?;
    Ok(ProviderAdapter::for_channel(channel))
}

/// Submit a Midjourney task.
///
/// Route: POST /mj/{mode}/submit/{action}
pub async fn mj_submit(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((mode, action)): Path<(String, String)>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let mut ctx = match auth::authenticate(Dialect::Midjourney, &headers, None, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    let mode = match auth::validate_mj_mode(&mode) {
        Ok(mode) => mode,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    ctx.mj_mode = Some(mode.clone());

    let model = providers::midjourney::billing_model(&mode);
    ctx.original_model = model.clone();
    ctx.new_model = model.clone();

    let adapter = match mj_route(&ctx, &model) {
        Ok(a) => a,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    let ProviderAdapter::Midjourney(mj) = &adapter else {
        return RelayError::ChannelNotFound(format!("channel for {} is not a midjourney channel", model))
            .into_dialect_response(Dialect::Midjourney);
    };

    // Flat per-submit rate: one prompt token at the model's input price.
    let mut quota = Quota::new(&ctx, &model, 1);
    if let Err(e) = quota.pre_consume() {
        return e.into_dialect_response(Dialect::Midjourney);
    }

    match mj.submit(&action, &payload).await {
        Ok(body) => {
            quota.set_first_response_time();
            quota.consume(&ctx, &Usage::new(1, 0), false);
            Json(body).into_response()
        }
        Err(e) => {
            quota.undo();
            to_relay_error(e).into_dialect_response(Dialect::Midjourney)
        }
    }
}

/// Poll a Midjourney task.
///
/// Route: GET /mj/{mode}/task/{id}/fetch
pub async fn mj_fetch(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((mode, task_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let mut ctx = match auth::authenticate(Dialect::Midjourney, &headers, None, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    let mode = match auth::validate_mj_mode(&mode) {
        Ok(mode) => mode,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    ctx.mj_mode = Some(mode.clone());

    let model = providers::midjourney::billing_model(&mode);
    let adapter = match mj_route(&ctx, &model) {
        Ok(a) => a,
        Err(e) => return e.into_dialect_response(Dialect::Midjourney),
    };
    let ProviderAdapter::Midjourney(mj) = &adapter else {
        return RelayError::ChannelNotFound(format!("channel for {} is not a midjourney channel", model))
            .into_dialect_response(Dialect::Midjourney);
    };

    match mj.fetch(&task_id).await {
        Ok(body) => Json(body).into_response(),
        Err(e) => to_relay_error(e).into_dialect_response(Dialect::Midjourney),
    }
}

// ============================================================================
// Model listing entry points
// ============================================================================

/// Authenticate when a credential is present; anonymous otherwise.
async fn optional_auth(
    dialect: Dialect,
    headers: &HeaderMap,
    query_key: Option<&str>,
    ip: &str,
) -> Result<Option<RelayContext>, RelayError> {
    if auth::extract_credential(dialect, headers, query_key).is_none() {
        return Ok(None);
    }
    auth::authenticate(dialect, headers, query_key, ip).await.map(Some)
}

/// OpenAI model listing.
///
/// Route: GET /v1/models
pub async fn list_models_openai(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    match optional_auth(Dialect::OpenAI, &headers, None, &ip).await {
        Ok(ctx) => Json(models::list_openai(ctx.as_ref())).into_response(),
        Err(e) => e.into_dialect_response(Dialect::OpenAI),
    }
}

/// Single model retrieve.
///
/// Route: GET /v1/models/{model}
pub async fn retrieve_model_openai(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(model): Path<String>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    match optional_auth(Dialect::OpenAI, &headers, None, &ip).await {
        Ok(_) => Json(models::retrieve_openai(&model)).into_response(),
        Err(e) => e.into_dialect_response(Dialect::OpenAI),
    }
}

/// Claude model listing.
///
/// Route: GET /claude/v1/models
pub async fn list_models_claude(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    match optional_auth(Dialect::Claude, &headers, None, &ip).await {
        Ok(ctx) => Json(models::list_claude(ctx.as_ref())).into_response(),
        Err(e) => e.into_dialect_response(Dialect::Claude),
    }
}

/// Gemini model listing.
///
/// Route: GET /gemini/v1beta/models
pub async fn list_models_gemini(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    let ip = client_ip(&headers, &addr);
    let query_key = query.get("key").map(|k| k.as_str());
    match optional_auth(Dialect::Gemini, &headers, query_key, &ip).await {
        Ok(ctx) => Json(models::list_gemini(ctx.as_ref())).into_response(),
        Err(e) => e.into_dialect_response(Dialect::Gemini),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_ip_prefers_proxy_headers() {
        let addr: SocketAddr = "203.0.113.9:443".parse().unwrap();

        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "10.1.2.3, 172.16.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, &addr), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "10.9.9.9".parse().unwrap());
        assert_eq!(client_ip(&headers, &addr), "10.9.9.9");

        assert_eq!(client_ip(&HeaderMap::new(), &addr), "203.0.113.9");
    }

    #[test]
    fn usage_normalization_backfills_estimates() {
        let response = ChatCompletionResponse {
            choices: vec![types::Choice {
                index: 0,
                message: types::ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some("a".repeat(35)),
                    tool_calls: None,
                },
                finish_reason: None,
            }],
            ..Default::default()
        };

        let usage = normalize_usage(Usage::default(), 120, Some(&response));
        assert_eq!(usage.prompt_tokens, 120);
        assert_eq!(usage.completion_tokens, 10);
        assert_eq!(usage.total_tokens, 130);

        // Reported usage wins over estimates.
        let usage = normalize_usage(Usage::new(50, 7), 120, Some(&response));
        assert_eq!(usage.prompt_tokens, 50);
        assert_eq!(usage.completion_tokens, 7);
    }

    #[test]
    fn api_errors_map_to_retry_classes() {
        let retryable = ApiError::from_status(503, "overloaded");
        assert!(to_relay_error(retryable).is_retryable());

        let fatal = ApiError::from_status(400, "bad body");
        assert!(!to_relay_error(fatal).is_retryable());
    }
}
