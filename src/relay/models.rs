//! Model listing.
//!
//! Enumerates the models a caller may invoke, scoped by token group and
//! `setting.models`, in the output shape of the dialect the request
//! arrived on. Anonymous listings expose the union of models over the
//! public groups only.

use serde_json::{json, Value};

use crate::db::{self, channel_type};
use crate::pricing;

use super::channels;
use super::context::RelayContext;

/// OpenAI model objects use a fixed creation stamp.
const MODEL_CREATED: i64 = 1677649963;

/// Apply the `setting.models` constraint: `None` passes everything
/// through, an explicit empty set passes nothing, otherwise intersect.
pub fn filter_token_models(group_models: Vec<String>, allowed: Option<&Vec<String>>) -> Vec<String> {
    match allowed {
        None => group_models,
        Some(allowed) => group_models
            .into_iter()
            .filter(|m| allowed.iter().any(|a| a == m))
            .collect(),
    }
}

/// Models visible to an authenticated caller.
pub fn models_for_context(ctx: &RelayContext) -> Vec<String> {
    let group_models = channels::get_group_models(&ctx.token_group);
    let mut models = filter_token_models(group_models, ctx.token_setting.models.as_ref());
    models.sort();
    models
}

/// Union of models over all public groups (anonymous listing).
pub fn public_models() -> Vec<String> {
    let public_groups = db::public_group_symbols().unwrap_or_default();
    let mut models: Vec<String> = channels::get_models_groups()
        .into_iter()
        .filter(|(_, groups)| groups.iter().any(|g| public_groups.contains(g)))
        .map(|(model, _)| model)
        .collect();
    models.sort();
    models
}

fn owned_by(model: &str) -> Option<String> {
    pricing::owner_name(pricing::get_price(model).channel_type)
}

fn openai_model_object(model: &str) -> Value {
    json!({
        "id": model,
        "object": "model",
        "created": MODEL_CREATED,
        "owned_by": owned_by(model),
    })
}

/// Sort by owner (nulls first), then id, matching the catalog listing
/// order clients rely on.
fn sort_by_owner(models: &mut [(Option<String>, String)]) {
    models.sort_by(|a, b| match (&a.0, &b.0) {
        (None, None) => a.1.cmp(&b.1),
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y).then_with(|| a.1.cmp(&b.1)),
    });
}

fn openai_list(models: Vec<String>) -> Value {
    let mut keyed: Vec<(Option<String>, String)> =
        models.into_iter().map(|m| (owned_by(&m), m)).collect();
    sort_by_owner(&mut keyed);
    let data: Vec<Value> = keyed.iter().map(|(_, m)| openai_model_object(m)).collect();
    json!({"object": "list", "data": data})
}

/// OpenAI-shape listing for an optional caller (anonymous = public).
pub fn list_openai(ctx: Option<&RelayContext>) -> Value {
    let models = match ctx {
        Some(ctx) => models_for_context(ctx),
        None => public_models(),
    };
    openai_list(models)
}

/// Claude-shape listing, filtered to Anthropic-owned models.
pub fn list_claude(ctx: Option<&RelayContext>) -> Value {
    let models = match ctx {
        Some(ctx) => models_for_context(ctx),
        None => public_models(),
    };
    let data: Vec<Value> = models
        .into_iter()
        .filter(|m| pricing::get_price(m).channel_type == channel_type::ANTHROPIC)
        .map(|m| json!({"id": m, "type": "model"}))
        .collect();
    json!({"data": data})
}

fn gemini_display_name(model: &str) -> String {
    model
        .replace('-', " ")
        .split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Gemini-shape listing, filtered to Gemini/Vertex-owned models.
pub fn list_gemini(ctx: Option<&RelayContext>) -> Value {
    let models = match ctx {
        Some(ctx) => models_for_context(ctx),
        None => public_models(),
    };
    let data: Vec<Value> = models
        .into_iter()
        .filter(|m| {
            let t = pricing::get_price(m).channel_type;
            t == channel_type::GEMINI || t == channel_type::VERTEX_AI
        })
        .map(|m| {
            json!({
                "name": format!("models/{}", m),
                "display_name": gemini_display_name(&m),
                "supported_generation_methods": ["generateContent"],
            })
        })
        .collect();
    json!({"models": data})
}

/// Single-model retrieve. Unknown models get the OpenAI not-found error
/// at HTTP 200, as the catalog surface does.
pub fn retrieve_openai(model: &str) -> Value {
    if pricing::has_price(model) {
        openai_model_object(model)
    } else {
        json!({
            "error": {
                "message": format!("The model '{}' does not exist", model),
                "type": "invalid_request_error",
                "param": "model",
                "code": "model_not_found",
            }
        })
    }
}

/// Whole pricing catalog in the OpenAI list shape (admin scope).
pub fn list_catalog() -> Value {
    let models: Vec<String> = pricing::all_prices().into_keys().collect();
    openai_list(models)
}

/// Per-model availability map for the admin surface:
/// model -> groups exposing it, owner and price.
pub fn available_models(group: Option<&str>) -> Value {
    let mut public_groups = db::public_group_symbols().unwrap_or_default();
    if let Some(group) = group {
        if !group.is_empty() && !public_groups.iter().any(|g| g == group) {
            public_groups.push(group.to_string());
        }
    }

    let mut out = serde_json::Map::new();
    for (model, groups) in channels::get_models_groups() {
        let visible: Vec<&String> =
            public_groups.iter().filter(|g| groups.contains(*g)).collect();
        if visible.is_empty() {
            continue;
        }
        let price = pricing::get_price(&model);
        out.insert(
            model.clone(),
            json!({
                "groups": visible,
                "owned_by": owned_by(&model),
                "price": price,
            }),
        );
    }
    Value::Object(out)
}
