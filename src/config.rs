use std::{fs, path::PathBuf, sync::RwLock};

use once_cell::sync::Lazy;

/// Gateway settings.
///
/// Loaded once at startup from `config.toml` in the platform data dir,
/// then patched with `RELAYHUB_*` environment overrides. The admin
/// surface may replace the cached value via [`store`].
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Settings {
    /// Listen address for the HTTP server.
    pub bind: String,
    /// Retry budget after the initial attempt.
    pub retry_times: u32,
    /// Wall-clock deadline for the whole retry loop, in seconds.
    pub retry_timeout_secs: u64,
    /// Global model aliases applied before channel selection
    /// (requested name -> routed name).
    pub model_alias: std::collections::HashMap<String, String>,
    /// Search augmentation settings.
    pub search: SearchConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:3000".to_string(),
            retry_times: 3,
            retry_timeout_secs: 60,
            model_alias: Default::default(),
            search: SearchConfig::default(),
        }
    }
}

/// Search augmentation endpoints. Augmentation is active only when both
/// the SearXNG base URL and the probe endpoint are configured.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug)]
#[serde(default)]
pub struct SearchConfig {
    /// Chat-completions URL of the probe model.
    pub ai_url: Option<String>,
    /// Bearer key for the probe endpoint.
    pub ai_key: Option<String>,
    /// Probe model name; also the model the probe usage is billed under.
    pub ai_model: String,
    /// SearXNG base URL.
    pub searxng: Option<String>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            ai_url: None,
            ai_key: None,
            ai_model: "gpt-4o-mini".to_string(),
            searxng: None,
        }
    }
}

impl SearchConfig {
    pub fn is_enabled(&self) -> bool {
        self.searxng.as_deref().map_or(false, |s| !s.is_empty())
            && self.ai_url.as_deref().map_or(false, |s| !s.is_empty())
    }
}

fn config_path() -> PathBuf {
    let mut p = dirs::data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("relayhub");
    fs::create_dir_all(&p).ok();
    p.push("config.toml");
    p
}

fn read_settings() -> Settings {
    let mut settings = fs::read_to_string(config_path())
        .ok()
        .and_then(|raw| toml::from_str::<Settings>(&raw).ok())
        .unwrap_or_default();
    apply_env_overrides(&mut settings);
    settings
}

fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(v) = std::env::var("RELAYHUB_BIND") {
        if !v.is_empty() {
            settings.bind = v;
        }
    }
    if let Ok(v) = std::env::var("RELAYHUB_RETRY_TIMES") {
        if let Ok(n) = v.parse() {
            settings.retry_times = n;
        }
    }
    if let Ok(v) = std::env::var("RELAYHUB_RETRY_TIMEOUT") {
        if let Ok(n) = v.parse() {
            settings.retry_timeout_secs = n;
        }
    }
    if let Ok(v) = std::env::var("RELAYHUB_SEARCH_AI_URL") {
        settings.search.ai_url = Some(v);
    }
    if let Ok(v) = std::env::var("RELAYHUB_SEARCH_AI_KEY") {
        settings.search.ai_key = Some(v);
    }
    if let Ok(v) = std::env::var("RELAYHUB_SEARCH_AI_MODEL") {
        if !v.is_empty() {
            settings.search.ai_model = v;
        }
    }
    if let Ok(v) = std::env::var("RELAYHUB_SEARXNG_URL") {
        settings.search.searxng = Some(v);
    }
}

static SETTINGS: Lazy<RwLock<Settings>> = Lazy::new(|| RwLock::new(read_settings()));

/// Current settings snapshot.
pub fn load() -> Settings {
    SETTINGS.read().unwrap().clone()
}

/// Replace the cached settings (admin reload, tests).
pub fn store(settings: Settings) {
    *SETTINGS.write().unwrap() = settings;
}

/// Re-read the config file and env, replacing the cache.
pub fn reload() -> Settings {
    let settings = read_settings();
    store(settings.clone());
    settings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.retry_times, 3);
        assert_eq!(s.retry_timeout_secs, 60);
        assert!(!s.search.is_enabled());
    }

    #[test]
    fn search_needs_both_endpoints() {
        let mut s = SearchConfig::default();
        s.searxng = Some("http://127.0.0.1:8888".to_string());
        assert!(!s.is_enabled());
        s.ai_url = Some("http://127.0.0.1:3000/v1/chat/completions".to_string());
        assert!(s.is_enabled());
    }

    #[test]
    fn toml_roundtrip_keeps_aliases() {
        let mut s = Settings::default();
        s.model_alias
            .insert("gpt-4o".to_string(), "gpt-4o-2024-08-06".to_string());
        let raw = toml::to_string(&s).unwrap();
        let back: Settings = toml::from_str(&raw).unwrap();
        assert_eq!(back.model_alias.get("gpt-4o").unwrap(), "gpt-4o-2024-08-06");
    }
}
