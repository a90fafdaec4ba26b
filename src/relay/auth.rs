//! Token and subnet validation.
//!
//! Extracts the bearer credential from the location each dialect uses,
//! parses the key format `<secret>[#[!]<channel_id>[#ignore]]`, enforces
//! token policy (status, expiry, quota, subnet) and publishes the
//! [`RelayContext`] consumed by the dispatcher. The only write on this
//! path is a fire-and-forget `accessed_time` bump.

use std::time::Instant;

use axum::http::HeaderMap;

use crate::db;

use super::context::{Dialect, RelayContext};
use super::error::{RelayError, RelayResult};
use super::token_cache;

const MIN_KEY_LEN: usize = 48;

/// Admin-only channel selector parsed from the key suffix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSelector {
    /// `#N`: force channel N; `ignore` disables the availability check.
    Pin { channel_id: i64, ignore: bool },
    /// `#!N`: never route to channel N.
    Skip { channel_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedKey {
    pub secret: String,
    pub selector: Option<ChannelSelector>,
}

/// Strip transport prefixes and split the selector suffix.
pub fn parse_key(raw: &str) -> RelayResult<ParsedKey> {
    let key = raw.trim();
    let key = key.strip_prefix("Bearer ").unwrap_or(key);
    let key = key.strip_prefix("sk-").unwrap_or(key);

    if key.len() < MIN_KEY_LEN {
        return Err(RelayError::AuthInvalid("key is too short".to_string()));
    }

    let mut parts = key.split('#');
    let secret = parts.next().unwrap_or_default().to_string();
    if secret.len() < MIN_KEY_LEN {
        return Err(RelayError::AuthInvalid("key is too short".to_string()));
    }

    let selector = match parts.next() {
        None => None,
        Some(raw_selector) => {
            let tail = parts.next();
            if parts.next().is_some() {
                return Err(RelayError::AuthInvalid("malformed channel selector".to_string()));
            }
            Some(parse_selector(raw_selector, tail)?)
        }
    };

    Ok(ParsedKey { secret, selector })
}

fn parse_selector(raw: &str, tail: Option<&str>) -> RelayResult<ChannelSelector> {
    if let Some(negated) = raw.strip_prefix('!') {
        if tail.is_some() {
            return Err(RelayError::Forbidden(
                "'ignore' is only valid with a pinned channel".to_string(),
            ));
        }
        let channel_id = negated.parse::<i64>().unwrap_or(0);
        if channel_id <= 0 {
            return Err(RelayError::Forbidden("invalid channel id".to_string()));
        }
        return Ok(ChannelSelector::Skip { channel_id });
    }

    let channel_id = raw.parse::<i64>().unwrap_or(0);
    if channel_id <= 0 {
        return Err(RelayError::Forbidden("invalid channel id".to_string()));
    }
    let ignore = match tail {
        None => false,
        Some("ignore") => true,
        Some(_) => {
            return Err(RelayError::AuthInvalid("malformed channel selector".to_string()))
        }
    };
    Ok(ChannelSelector::Pin { channel_id, ignore })
}

/// Parse an IPv4 dotted quad into its 32-bit value.
fn ipv4_to_u32(ip: &str) -> Option<u32> {
    let mut result: u32 = 0;
    let mut count = 0;
    for part in ip.split('.') {
        if count == 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        let num: u32 = part.parse().ok()?;
        if num > 255 {
            return None;
        }
        result = (result << 8) | num;
        count += 1;
    }
    if count == 4 {
        Some(result)
    } else {
        None
    }
}

/// A single IP matches only itself; a CIDR matches by masked compare.
pub fn is_ip_in_subnet(ip: &str, subnet: &str) -> bool {
    let Some((network, mask_len)) = subnet.split_once('/') else {
        return ip == subnet;
    };

    let Ok(mask_len) = mask_len.parse::<u32>() else {
        return false;
    };
    if mask_len > 32 {
        return false;
    }
    let (Some(ip), Some(network)) = (ipv4_to_u32(ip), ipv4_to_u32(network)) else {
        return false;
    };

    let mask: u32 = if mask_len == 0 { 0 } else { u32::MAX << (32 - mask_len) };
    (ip & mask) == (network & mask)
}

/// Syntactic validation for `setting.subnet`: IPv4 address or IPv4 CIDR
/// with mask 0-32.
pub fn is_valid_subnet(subnet: &str) -> bool {
    if subnet.is_empty() {
        return false;
    }
    let (ip, mask) = match subnet.split_once('/') {
        Some((ip, mask)) => (ip, Some(mask)),
        None => (subnet, None),
    };
    if ipv4_to_u32(ip).is_none() {
        return false;
    }
    match mask {
        None => true,
        Some(mask) => matches!(mask.parse::<u32>(), Ok(n) if n <= 32),
    }
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Locate the raw credential for a dialect.
///
/// `query_key` is Gemini's `?key=` parameter, already extracted by the
/// handler.
pub fn extract_credential(
    dialect: Dialect,
    headers: &HeaderMap,
    query_key: Option<&str>,
) -> Option<String> {
    match dialect {
        Dialect::OpenAI => header_value(headers, "authorization").or_else(|| {
            // Realtime websocket upgrades smuggle the key in the
            // subprotocol list.
            if header_value(headers, "upgrade").as_deref() != Some("websocket") {
                return None;
            }
            let protocols = header_value(headers, "sec-websocket-protocol")?;
            protocols.split(',').find_map(|protocol| {
                protocol
                    .trim()
                    .strip_prefix("openai-insecure-api-key.")
                    .map(|key| key.to_string())
            })
        }),
        Dialect::Claude => {
            header_value(headers, "x-api-key").or_else(|| header_value(headers, "authorization"))
        }
        Dialect::Gemini => header_value(headers, "x-goog-api-key")
            .or_else(|| query_key.map(|k| k.to_string()).filter(|k| !k.is_empty()))
            .or_else(|| header_value(headers, "authorization")),
        Dialect::Midjourney => header_value(headers, "mj-api-secret"),
    }
}

/// Validate a Midjourney speed-mode path segment; empty means fast.
/// Returns the mode with the `mj-` prefix stripped.
pub fn validate_mj_mode(mode: &str) -> RelayResult<String> {
    if !mode.is_empty() && !matches!(mode, "mj-fast" | "mj-turbo" | "mj-relax") {
        return Err(RelayError::BadRequest("invalid midjourney mode".to_string()));
    }
    let mode = if mode.is_empty() { "mj-fast" } else { mode };
    Ok(mode.trim_start_matches("mj-").to_string())
}

fn check_token_policy(token: &db::Token) -> RelayResult<()> {
    match token.status {
        db::TOKEN_STATUS_ENABLED => {}
        db::TOKEN_STATUS_DISABLED => return Err(RelayError::TokenDisabled),
        db::TOKEN_STATUS_EXPIRED => return Err(RelayError::TokenExpired),
        db::TOKEN_STATUS_EXHAUSTED => return Err(RelayError::TokenExhausted),
        _ => return Err(RelayError::TokenDisabled),
    }

    // -1 means never expires; 0 is the accepted "unset" placeholder.
    let now = chrono::Utc::now().timestamp();
    if token.expired_time > 0 && token.expired_time <= now {
        let token_id = token.id;
        tokio::task::spawn_blocking(move || {
            let _ = db::update_token_status(token_id, db::TOKEN_STATUS_EXPIRED);
        });
        return Err(RelayError::TokenExpired);
    }

    if !token.unlimited_quota && token.remain_quota <= 0 {
        let token_id = token.id;
        tokio::task::spawn_blocking(move || {
            let _ = db::update_token_status(token_id, db::TOKEN_STATUS_EXHAUSTED);
        });
        return Err(RelayError::TokenExhausted);
    }

    Ok(())
}

/// Full validation pipeline for one request.
pub async fn authenticate(
    dialect: Dialect,
    headers: &HeaderMap,
    query_key: Option<&str>,
    client_ip: &str,
) -> RelayResult<RelayContext> {
    let raw = extract_credential(dialect, headers, query_key)
        .ok_or_else(|| RelayError::AuthInvalid("missing credential".to_string()))?;
    let parsed = parse_key(&raw)?;

    let token = token_cache::get_token(&parsed.secret)
        .await
        .map_err(|e| RelayError::Internal(format!("token lookup failed: {}", e)))?
        .ok_or_else(|| RelayError::AuthInvalid("unknown key".to_string()))?;

    check_token_policy(&token)?;

    if let Some(subnet) = token.setting.subnet.as_deref() {
        if !subnet.is_empty() && !is_ip_in_subnet(client_ip, subnet) {
            return Err(RelayError::SubnetDenied);
        }
    }

    let is_admin = db::is_admin(token.user_id);

    let mut specific_channel_id = None;
    let mut specific_channel_id_ignore = false;
    let mut skip_channel_ids = Vec::new();
    if let Some(selector) = parsed.selector {
        if !is_admin {
            return Err(RelayError::Forbidden(
                "channel selectors require an admin key".to_string(),
            ));
        }
        match selector {
            ChannelSelector::Pin { channel_id, ignore } => {
                specific_channel_id = Some(channel_id);
                specific_channel_id_ignore = ignore;
            }
            ChannelSelector::Skip { channel_id } => skip_channel_ids.push(channel_id),
        }
    }

    let token_group = if token.group.is_empty() {
        token_cache::get_user_group(token.user_id)
            .await
            .unwrap_or_default()
    } else {
        token.group.clone()
    };

    // Best-effort read-path touch; failures are ignored.
    let token_id = token.id;
    tokio::task::spawn_blocking(move || {
        let _ = db::bump_accessed_time(token_id);
    });

    Ok(RelayContext {
        dialect,
        token_id: token.id,
        user_id: token.user_id,
        token_name: token.name.clone(),
        token_group,
        token_backup_group: Some(token.backup_group.clone()).filter(|g| !g.is_empty()),
        token_setting: token.setting.clone(),
        token_unlimited_quota: token.unlimited_quota,
        is_admin,
        specific_channel_id,
        specific_channel_id_ignore,
        skip_channel_ids,
        original_model: String::new(),
        new_model: String::new(),
        billing_original_model: false,
        mj_mode: None,
        request_start: Instant::now(),
        client_ip: client_ip.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret() -> String {
        "A".repeat(48)
    }

    #[test]
    fn parse_key_strips_prefixes() {
        let parsed = parse_key(&format!("Bearer sk-{}", secret())).unwrap();
        assert_eq!(parsed.secret, secret());
        assert!(parsed.selector.is_none());
    }

    #[test]
    fn parse_key_rejects_short_keys() {
        assert!(matches!(parse_key("sk-short"), Err(RelayError::AuthInvalid(_))));
        assert!(matches!(parse_key(&"A".repeat(47)), Err(RelayError::AuthInvalid(_))));
    }

    #[test]
    fn parse_key_selectors() {
        let pinned = parse_key(&format!("{}#7", secret())).unwrap();
        assert_eq!(pinned.selector, Some(ChannelSelector::Pin { channel_id: 7, ignore: false }));

        let ignored = parse_key(&format!("{}#7#ignore", secret())).unwrap();
        assert_eq!(ignored.selector, Some(ChannelSelector::Pin { channel_id: 7, ignore: true }));

        let skipped = parse_key(&format!("{}#!3", secret())).unwrap();
        assert_eq!(skipped.selector, Some(ChannelSelector::Skip { channel_id: 3 }));
    }

    #[test]
    fn parse_key_rejects_bad_selectors() {
        assert!(parse_key(&format!("{}#0", secret())).is_err());
        assert!(parse_key(&format!("{}#abc", secret())).is_err());
        assert!(parse_key(&format!("{}#!3#ignore", secret())).is_err());
        assert!(parse_key(&format!("{}#7#foo", secret())).is_err());
        assert!(parse_key(&format!("{}#7#ignore#x", secret())).is_err());
    }

    #[test]
    fn subnet_exact_match_without_mask() {
        assert!(is_ip_in_subnet("192.168.1.1", "192.168.1.1"));
        assert!(!is_ip_in_subnet("192.168.1.2", "192.168.1.1"));
    }

    #[test]
    fn subnet_cidr_masking() {
        assert!(is_ip_in_subnet("10.1.2.3", "10.0.0.0/8"));
        assert!(!is_ip_in_subnet("192.168.1.1", "10.0.0.0/8"));
        assert!(is_ip_in_subnet("192.168.1.200", "192.168.1.0/24"));
        assert!(!is_ip_in_subnet("192.168.2.1", "192.168.1.0/24"));
        // /0 admits everything; /32 is exact.
        assert!(is_ip_in_subnet("8.8.8.8", "0.0.0.0/0"));
        assert!(is_ip_in_subnet("10.0.0.1", "10.0.0.1/32"));
        assert!(!is_ip_in_subnet("10.0.0.2", "10.0.0.1/32"));
    }

    #[test]
    fn subnet_validation() {
        assert!(is_valid_subnet("10.0.0.0/8"));
        assert!(is_valid_subnet("192.168.1.1"));
        assert!(is_valid_subnet("0.0.0.0/0"));
        assert!(!is_valid_subnet(""));
        assert!(!is_valid_subnet("10.0.0.0/33"));
        assert!(!is_valid_subnet("256.0.0.1"));
        assert!(!is_valid_subnet("10.0.0"));
        assert!(!is_valid_subnet("10.0.0.0/8/8"));
    }

    #[test]
    fn credential_extraction_per_dialect() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc".parse().unwrap());
        assert_eq!(
            extract_credential(Dialect::OpenAI, &headers, None).as_deref(),
            Some("Bearer abc")
        );

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "claude-key".parse().unwrap());
        assert_eq!(
            extract_credential(Dialect::Claude, &headers, None).as_deref(),
            Some("claude-key")
        );

        let headers = HeaderMap::new();
        assert_eq!(
            extract_credential(Dialect::Gemini, &headers, Some("query-key")).as_deref(),
            Some("query-key")
        );

        let mut headers = HeaderMap::new();
        headers.insert("mj-api-secret", "mj-key".parse().unwrap());
        assert_eq!(
            extract_credential(Dialect::Midjourney, &headers, None).as_deref(),
            Some("mj-key")
        );
    }

    #[test]
    fn websocket_protocol_carries_the_key() {
        let mut headers = HeaderMap::new();
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert(
            "sec-websocket-protocol",
            "realtime, openai-insecure-api-key.wskey123".parse().unwrap(),
        );
        assert_eq!(
            extract_credential(Dialect::OpenAI, &headers, None).as_deref(),
            Some("wskey123")
        );
    }

    #[test]
    fn mj_mode_validation() {
        assert_eq!(validate_mj_mode("").unwrap(), "fast");
        assert_eq!(validate_mj_mode("mj-turbo").unwrap(), "turbo");
        assert_eq!(validate_mj_mode("mj-relax").unwrap(), "relax");
        assert!(validate_mj_mode("mj-warp").is_err());
    }

    #[tokio::test]
    async fn authenticate_enforces_policy_and_selectors() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();
        let user_id = crate::db::test_support::seed_user(crate::db::ROLE_COMMON, "default");
        let key = "B".repeat(48);
        crate::db::test_support::seed_token(user_id, &key, 100);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer sk-{}", key).parse().unwrap());
        let ctx = authenticate(Dialect::OpenAI, &headers, None, "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(ctx.user_id, user_id);
        assert_eq!(ctx.token_group, "default");
        assert!(!ctx.is_admin);

        // Selector on a non-admin key fails before any channel work.
        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}#7", key).parse().unwrap());
        let err = authenticate(Dialect::OpenAI, &headers, None, "127.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Forbidden(_)));
    }

    #[tokio::test]
    async fn authenticate_subnet_denied() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();
        let user_id = crate::db::test_support::seed_user(crate::db::ROLE_COMMON, "default");
        let key = "C".repeat(48);
        let token_id = crate::db::test_support::seed_token(user_id, &key, 100);

        let mut token = crate::db::get_token_by_ids(token_id, user_id).unwrap().unwrap();
        token.setting.subnet = Some("10.0.0.0/8".to_string());
        crate::db::update_token(&token).unwrap();
        crate::relay::token_cache::purge_token(&key);

        let mut headers = HeaderMap::new();
        headers.insert("authorization", format!("Bearer {}", key).parse().unwrap());

        let ok = authenticate(Dialect::OpenAI, &headers, None, "10.1.2.3").await;
        assert!(ok.is_ok());

        let denied = authenticate(Dialect::OpenAI, &headers, None, "192.168.1.1")
            .await
            .unwrap_err();
        assert!(matches!(denied, RelayError::SubnetDenied));
    }
}
