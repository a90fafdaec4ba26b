//! Per-request relay context.
//!
//! The dispatcher threads one explicit struct through the whole request
//! instead of a dynamic key/value map, so every consumer names the field
//! it reads and a missing value is a compile error.

use std::time::Instant;

use crate::db::TokenSetting;

/// The wire dialect a request arrived in. Terminal errors are always
/// serialized in this dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    OpenAI,
    Claude,
    Gemini,
    Midjourney,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAI => "openai",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
            Dialect::Midjourney => "midjourney",
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything the dispatcher knows about one authenticated request.
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub dialect: Dialect,
    pub token_id: i64,
    pub user_id: i64,
    pub token_name: String,
    pub token_group: String,
    pub token_backup_group: Option<String>,
    /// Canonical decoded setting; serialized only at storage boundaries.
    pub token_setting: TokenSetting,
    pub token_unlimited_quota: bool,
    pub is_admin: bool,
    /// `#N` key suffix: force this channel.
    pub specific_channel_id: Option<i64>,
    /// `#N#ignore`: skip the model-availability check for the pin.
    pub specific_channel_id_ignore: bool,
    /// `#!N` plus every channel already tried this request.
    pub skip_channel_ids: Vec<i64>,
    /// Model name as the caller sent it.
    pub original_model: String,
    /// Model after alias substitution; what channels are matched on.
    pub new_model: String,
    /// Bill under the caller-facing name rather than the routed one.
    pub billing_original_model: bool,
    /// Midjourney speed mode, when the request came in on that dialect.
    pub mj_mode: Option<String>,
    pub request_start: Instant,
    pub client_ip: String,
}

impl RelayContext {
    /// The model name ledger entries are written under.
    pub fn billing_model(&self) -> &str {
        if self.billing_original_model {
            &self.original_model
        } else {
            &self.new_model
        }
    }

    /// Record a failed channel so re-routing cannot pick it again.
    pub fn skip_channel(&mut self, channel_id: i64) {
        if !self.skip_channel_ids.contains(&channel_id) {
            self.skip_channel_ids.push(channel_id);
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skip_channel_deduplicates() {
        let mut ctx = test_support::context(1, 1);
        ctx.skip_channel(7);
        ctx.skip_channel(7);
        ctx.skip_channel(9);
        assert_eq!(ctx.skip_channel_ids, vec![7, 9]);
    }

    #[test]
    fn billing_model_honors_alias_flag() {
        let mut ctx = test_support::context(1, 1);
        ctx.original_model = "gpt-4o".to_string();
        ctx.new_model = "gpt-4o-2024-08-06".to_string();
        assert_eq!(ctx.billing_model(), "gpt-4o-2024-08-06");
        ctx.billing_original_model = true;
        assert_eq!(ctx.billing_model(), "gpt-4o");
    }
}
