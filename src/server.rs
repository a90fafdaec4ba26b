//! HTTP surface assembly.
//!
//! Relay routes (one set per dialect), model listing, and the admin API.
//! Admin replies use the `{success, message, data?}` envelope at HTTP
//! 200 even on logical failure; relay errors use each dialect's native
//! error shape.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::error::{AppError, AppResult};
use crate::relay::context::Dialect;
use crate::relay::error::RelayError;
use crate::{config, db, logger, pricing, relay};

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "version": env!("CARGO_PKG_VERSION")}))
}

fn ok_with(data: impl serde::Serialize) -> Response {
    Json(json!({"success": true, "message": "", "data": data})).into_response()
}

fn ok_empty() -> Response {
    Json(json!({"success": true, "message": ""})).into_response()
}

/// Resolve the admin-surface caller from its bearer access token.
fn require_user(headers: &HeaderMap) -> AppResult<db::User> {
    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing access token".to_string()))?;
    db::validate_access_token(bearer)?
        .ok_or_else(|| AppError::Unauthorized("invalid access token".to_string()))
}

fn require_admin(headers: &HeaderMap) -> AppResult<db::User> {
    let user = require_user(headers)?;
    if user.role < db::ROLE_ADMIN {
        return Err(AppError::Unauthorized("admin role required".to_string()));
    }
    Ok(user)
}

fn generate_key() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(48)
        .map(char::from)
        .collect()
}

fn validate_token_group(group: &str, user_group: &str) -> AppResult<()> {
    let ratio = db::get_group_by_symbol(group)?
        .ok_or_else(|| AppError::BadRequest("invalid token group".to_string()))?;
    if !ratio.public && user_group != group {
        return Err(AppError::BadRequest(
            "the current user may not use this group".to_string(),
        ));
    }
    Ok(())
}

fn validate_token_setting(setting: &db::TokenSetting) -> AppResult<()> {
    if setting.heartbeat.enabled
        && !(30..=90).contains(&setting.heartbeat.timeout_seconds)
    {
        return Err(AppError::BadRequest(
            "heartbeat timeout seconds must be between 30 and 90".to_string(),
        ));
    }

    if let Some(models) = &setting.models {
        let mut seen = std::collections::HashSet::new();
        for model in models {
            if model.is_empty() {
                return Err(AppError::BadRequest("model names must not be empty".to_string()));
            }
            if !seen.insert(model) {
                return Err(AppError::BadRequest(
                    "the model list contains duplicates".to_string(),
                ));
            }
        }
    }

    if let Some(subnet) = setting.subnet.as_deref() {
        if !subnet.is_empty() && !relay::auth::is_valid_subnet(subnet) {
            return Err(AppError::BadRequest("invalid subnet format".to_string()));
        }
    }
    Ok(())
}

/// `setting.models` must stay inside the models the user's group exposes.
fn validate_setting_models_available(
    setting: &db::TokenSetting,
    user_group: &str,
) -> AppResult<()> {
    let Some(models) = &setting.models else {
        return Ok(());
    };
    if models.is_empty() {
        return Ok(());
    }
    let available = relay::channels::get_group_models(user_group);
    for model in models {
        if !available.contains(model) {
            return Err(AppError::BadRequest(format!(
                "model {} is not in the available model list",
                model
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Token CRUD
// ============================================================================

async fn list_tokens(headers: HeaderMap, Query(paging): Query<db::Paging>) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    match db::get_user_tokens_list(user.id, &paging) {
        Ok(tokens) => ok_with(tokens),
        Err(e) => AppError::from(e).into_response(),
    }
}

async fn get_token(headers: HeaderMap, Path(id): Path<i64>) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    match db::get_token_by_ids(id, user.id) {
        Ok(Some(token)) => ok_with(token),
        Ok(None) => AppError::NotFound("token not found".to_string()).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

fn add_token_inner(user: &db::User, mut token: db::Token) -> AppResult<()> {
    if token.name.chars().count() > 30 {
        return Err(AppError::BadRequest("token name is too long".to_string()));
    }
    if !token.group.is_empty() {
        validate_token_group(&token.group, &user.group)?;
    }
    validate_token_setting(&token.setting)?;
    validate_setting_models_available(&token.setting, &user.group)?;

    let now = chrono::Utc::now().timestamp();
    token.id = 0;
    token.user_id = user.id;
    token.key = generate_key();
    token.status = db::TOKEN_STATUS_ENABLED;
    token.created_time = now;
    token.accessed_time = now;
    db::insert_token(&token)?;
    Ok(())
}

async fn add_token(headers: HeaderMap, Json(token): Json<db::Token>) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    match add_token_inner(&user, token) {
        Ok(()) => ok_empty(),
        Err(e) => e.into_response(),
    }
}

#[derive(Deserialize)]
struct UpdateQuery {
    status_only: Option<String>,
}

fn update_token_inner(
    user: &db::User,
    token: db::Token,
    status_only: bool,
) -> AppResult<db::Token> {
    if token.name.chars().count() > 30 {
        return Err(AppError::BadRequest("token name is too long".to_string()));
    }
    validate_token_setting(&token.setting)?;

    let mut clean = db::get_token_by_ids(token.id, user.id)?
        .ok_or_else(|| AppError::NotFound("token not found".to_string()))?;

    // Re-enabling requires the blocking cause to be cured first.
    if token.status == db::TOKEN_STATUS_ENABLED {
        let now = chrono::Utc::now().timestamp();
        if clean.status == db::TOKEN_STATUS_EXPIRED
            && clean.expired_time != db::TOKEN_NEVER_EXPIRES
            && clean.expired_time <= now
        {
            return Err(AppError::BadRequest(
                "the token has expired; extend the expiry or make it never expire first"
                    .to_string(),
            ));
        }
        if clean.status == db::TOKEN_STATUS_EXHAUSTED
            && clean.remain_quota <= 0
            && !clean.unlimited_quota
        {
            return Err(AppError::BadRequest(
                "the token quota is used up; raise the quota or make it unlimited first"
                    .to_string(),
            ));
        }
    }

    if clean.group != token.group && !token.group.is_empty() {
        validate_token_group(&token.group, &user.group)?;
    }
    validate_setting_models_available(&token.setting, &user.group)?;

    if status_only {
        clean.status = token.status;
    } else {
        clean.name = token.name;
        clean.status = token.status;
        clean.expired_time = token.expired_time;
        clean.remain_quota = token.remain_quota;
        clean.unlimited_quota = token.unlimited_quota;
        clean.group = token.group;
        clean.backup_group = token.backup_group;
        clean.setting = token.setting;
    }
    db::update_token(&clean)?;
    relay::token_cache::purge_token(&clean.key);
    Ok(clean)
}

async fn update_token(
    headers: HeaderMap,
    Query(query): Query<UpdateQuery>,
    Json(token): Json<db::Token>,
) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let status_only = query.status_only.map_or(false, |s| !s.is_empty());
    match update_token_inner(&user, token, status_only) {
        Ok(clean) => ok_with(clean),
        Err(e) => e.into_response(),
    }
}

async fn delete_token(headers: HeaderMap, Path(id): Path<i64>) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    let key = db::get_token_by_ids(id, user.id)
        .ok()
        .flatten()
        .map(|t| t.key);
    match db::delete_token(id, user.id) {
        Ok(true) => {
            if let Some(key) = key {
                relay::token_cache::purge_token(&key);
            }
            ok_empty()
        }
        Ok(false) => AppError::NotFound("token not found".to_string()).into_response(),
        Err(e) => AppError::from(e).into_response(),
    }
}

// ============================================================================
// Admin utility surfaces
// ============================================================================

async fn api_available_models(headers: HeaderMap) -> Response {
    let user = match require_user(&headers) {
        Ok(user) => user,
        Err(e) => return e.into_response(),
    };
    ok_with(relay::models::available_models(Some(&user.group)))
}

async fn api_model_owners(headers: HeaderMap) -> Response {
    if let Err(e) = require_user(&headers) {
        return e.into_response();
    }
    ok_with(pricing::all_owners())
}

async fn api_prices(headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    ok_with(pricing::all_prices())
}

async fn api_logs(headers: HeaderMap, Query(query): Query<logger::LogQuery>) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    ok_with(logger::query_logs(&query))
}

#[derive(Deserialize)]
struct PruneQuery {
    before_time: i64,
}

async fn api_logs_prune(headers: HeaderMap, Query(query): Query<PruneQuery>) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    ok_with(logger::prune_logs(query.before_time))
}

/// Whole pricing catalog in the OpenAI list shape (admin scope, raw).
async fn api_model_catalog(headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    Json(relay::models::list_catalog()).into_response()
}

async fn api_ledger(headers: HeaderMap, Query(paging): Query<db::Paging>) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    let size = paging.size.unwrap_or(50).clamp(1, 200);
    let page = paging.page.unwrap_or(1).max(1);
    match db::recent_ledger(size, (page - 1) * size) {
        Ok(rows) => ok_with(rows),
        Err(e) => AppError::from(e).into_response(),
    }
}

/// Rebuild the channel index and pricing catalog after admin mutation.
async fn api_refresh(headers: HeaderMap) -> Response {
    if let Err(e) = require_admin(&headers) {
        return e.into_response();
    }
    relay::channels::rebuild();
    pricing::reload();
    config::reload();
    ok_empty()
}

/// Admin relay probe: bypasses normal selection, so the key must pin a
/// channel (`#N`).
async fn api_channel_test(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let ip = relay::client_ip(&headers, &addr);
    let ctx = match relay::auth::authenticate(Dialect::OpenAI, &headers, None, &ip).await {
        Ok(ctx) => ctx,
        Err(e) => return e.into_dialect_response(Dialect::OpenAI),
    };
    if ctx.specific_channel_id.is_none() {
        return RelayError::Forbidden("a channel must be specified".to_string())
            .into_dialect_response(Dialect::OpenAI);
    }
    let request = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return RelayError::BadRequest(format!("invalid request: {}", e))
                .into_dialect_response(Dialect::OpenAI)
        }
    };
    relay::dispatch_chat(ctx, request).await
}

/// Build the full application router.
pub fn router() -> Router {
    Router::new()
        // Relay, one surface per dialect.
        .route("/v1/chat/completions", post(relay::chat_completions))
        .route("/v1/models", get(relay::list_models_openai))
        .route("/v1/models/:model", get(relay::retrieve_model_openai))
        .route("/claude/v1/messages", post(relay::claude_messages))
        .route("/claude/v1/models", get(relay::list_models_claude))
        .route("/gemini/v1beta/models", get(relay::list_models_gemini))
        .route("/gemini/v1beta/models/:model_action", post(relay::gemini_generate))
        .route("/mj/:mode/submit/:action", post(relay::mj_submit))
        .route("/mj/:mode/task/:task_id/fetch", get(relay::mj_fetch))
        // Admin surface.
        .route("/api/token", get(list_tokens).post(add_token).put(update_token))
        .route("/api/token/:id", get(get_token).delete(delete_token))
        .route("/api/available_models", get(api_available_models))
        .route("/api/ownedby", get(api_model_owners))
        .route("/api/prices", get(api_prices))
        .route("/api/models", get(api_model_catalog))
        .route("/api/logs", get(api_logs).delete(api_logs_prune))
        .route("/api/ledger", get(api_ledger))
        .route("/api/refresh", post(api_refresh))
        .route("/api/channel/test", post(api_channel_test))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin_user() -> db::User {
        db::User {
            id: 1,
            username: "admin".to_string(),
            role: db::ROLE_ADMIN,
            status: db::USER_STATUS_ENABLED,
            group: "default".to_string(),
            access_token: "tok".to_string(),
        }
    }

    #[test]
    fn generated_keys_are_48_alphanumeric() {
        let key = generate_key();
        assert_eq!(key.len(), 48);
        assert!(key.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(key, generate_key());
    }

    #[test]
    fn setting_validation_covers_heartbeat_models_subnet() {
        let mut setting = db::TokenSetting::default();
        assert!(validate_token_setting(&setting).is_ok());

        setting.heartbeat.enabled = true;
        setting.heartbeat.timeout_seconds = 29;
        assert!(validate_token_setting(&setting).is_err());
        setting.heartbeat.timeout_seconds = 30;
        assert!(validate_token_setting(&setting).is_ok());

        setting.models = Some(vec!["a".to_string(), "a".to_string()]);
        assert!(validate_token_setting(&setting).is_err());
        setting.models = Some(vec!["a".to_string(), "".to_string()]);
        assert!(validate_token_setting(&setting).is_err());
        setting.models = Some(vec!["a".to_string(), "b".to_string()]);
        assert!(validate_token_setting(&setting).is_ok());

        setting.subnet = Some("10.0.0.0/33".to_string());
        assert!(validate_token_setting(&setting).is_err());
        setting.subnet = Some("10.0.0.0/8".to_string());
        assert!(validate_token_setting(&setting).is_ok());
    }

    #[test]
    fn token_add_and_update_lifecycle() {
        let _guard = db::test_support::lock();
        let _dir = db::test_support::fresh_db();
        let user_id = db::test_support::seed_user(db::ROLE_ADMIN, "default");
        let mut user = admin_user();
        user.id = user_id;

        let token = db::Token {
            name: "ci".to_string(),
            remain_quota: 500,
            expired_time: db::TOKEN_NEVER_EXPIRES,
            group: "default".to_string(),
            ..Default::default()
        };
        add_token_inner(&user, token).unwrap();

        let tokens = db::get_user_tokens_list(user_id, &db::Paging::default()).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].key.len(), 48);
        assert_eq!(tokens[0].status, db::TOKEN_STATUS_ENABLED);

        // Long names rejected.
        let long = db::Token { name: "x".repeat(31), ..Default::default() };
        assert!(add_token_inner(&user, long).is_err());

        // Exhausted tokens cannot be re-enabled until cured.
        let mut stored = tokens[0].clone();
        stored.status = db::TOKEN_STATUS_EXHAUSTED;
        stored.remain_quota = 0;
        db::update_token(&stored).unwrap();

        let mut enable = stored.clone();
        enable.status = db::TOKEN_STATUS_ENABLED;
        assert!(update_token_inner(&user, enable.clone(), true).is_err());

        // Cure the quota, then enabling succeeds.
        stored.remain_quota = 100;
        db::update_token(&stored).unwrap();
        let updated = update_token_inner(&user, enable, true).unwrap();
        assert_eq!(updated.status, db::TOKEN_STATUS_ENABLED);
    }

    #[test]
    fn group_validation_requires_public_or_own_group() {
        let _guard = db::test_support::lock();
        let _dir = db::test_support::fresh_db();
        db::upsert_user_group(&db::UserGroup {
            symbol: "vip".to_string(),
            name: "VIP".to_string(),
            public: false,
            ratio: 1.0,
        })
        .unwrap();

        assert!(validate_token_group("default", "default").is_ok());
        assert!(validate_token_group("vip", "default").is_err());
        assert!(validate_token_group("vip", "vip").is_ok());
        assert!(validate_token_group("missing", "default").is_err());
    }
}
