//! Pricing catalog and model-owner registry.
//!
//! Read-only during relay. The catalog maps a model name to the channel
//! type that owns it plus input/output rates (quota units per token);
//! the owner registry maps a channel type to a display name for model
//! listings. Both are immutable snapshots swapped on admin reload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::db;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Price {
    pub channel_type: i64,
    pub input: f64,
    pub output: f64,
}

impl Price {
    pub fn is_billable(&self) -> bool {
        self.input > 0.0 || self.output > 0.0
    }
}

#[derive(Debug, Default)]
struct Catalog {
    prices: HashMap<String, Price>,
    owners: HashMap<i64, String>,
}

static CATALOG: Lazy<RwLock<Arc<Catalog>>> = Lazy::new(|| RwLock::new(Arc::new(Catalog::default())));

fn snapshot() -> Arc<Catalog> {
    CATALOG.read().unwrap().clone()
}

/// Reload prices and owners from the repository, seeding the owner
/// registry with the built-in channel types when the table is empty.
pub fn reload() {
    let mut catalog = Catalog::default();

    match db::load_model_prices() {
        Ok(rows) => {
            for (model, channel_type, input, output) in rows {
                catalog.prices.insert(model, Price { channel_type, input, output });
            }
        }
        Err(e) => crate::logger::error("pricing", &format!("failed to load prices: {}", e)),
    }

    match db::load_model_owners() {
        Ok(rows) if !rows.is_empty() => {
            catalog.owners = rows.into_iter().collect();
        }
        _ => {
            catalog.owners = default_owners();
        }
    }

    *CATALOG.write().unwrap() = Arc::new(catalog);
}

fn default_owners() -> HashMap<i64, String> {
    HashMap::from([
        (db::channel_type::OPENAI, "OpenAI".to_string()),
        (db::channel_type::ANTHROPIC, "Anthropic".to_string()),
        (db::channel_type::GEMINI, "Google Gemini".to_string()),
        (db::channel_type::VERTEX_AI, "Google Vertex AI".to_string()),
        (db::channel_type::MIDJOURNEY, "Midjourney".to_string()),
    ])
}

/// Price for a model; unknown models get a zero-rate OpenAI-typed entry.
pub fn get_price(model: &str) -> Price {
    snapshot().prices.get(model).cloned().unwrap_or(Price {
        channel_type: db::channel_type::OPENAI,
        input: 0.0,
        output: 0.0,
    })
}

/// All known prices (admin catalog listing).
pub fn all_prices() -> HashMap<String, Price> {
    snapshot().prices.clone()
}

/// Whether the catalog knows this model at all.
pub fn has_price(model: &str) -> bool {
    snapshot().prices.contains_key(model)
}

/// Owner display name for a channel type, if registered.
pub fn owner_name(channel_type: i64) -> Option<String> {
    snapshot().owners.get(&channel_type).cloned()
}

/// The whole owner registry (admin surface).
pub fn all_owners() -> HashMap<i64, String> {
    snapshot().owners.clone()
}

/// Actual cost of a request in quota units.
pub fn completion_cost(prompt_tokens: i64, completion_tokens: i64, price: &Price) -> i64 {
    let cost = prompt_tokens as f64 * price.input + completion_tokens as f64 * price.output;
    cost.ceil() as i64
}
