//! Token cache.
//!
//! TTL cache of validated token rows keyed by secret, plus the
//! user-id -> group mapping. Misses fall through to the repository under
//! a per-key single-flight lock so concurrent cold lookups issue one
//! query. Admin mutation purges explicitly; everything else ages out.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use crate::db;

const CACHE_TTL: Duration = Duration::from_secs(60);

struct CachedToken {
    token: db::Token,
    inserted_at: Instant,
}

struct CachedGroup {
    group: String,
    inserted_at: Instant,
}

static TOKEN_CACHE: Lazy<DashMap<String, CachedToken>> = Lazy::new(DashMap::new);
static GROUP_CACHE: Lazy<DashMap<i64, CachedGroup>> = Lazy::new(DashMap::new);
static FLIGHTS: Lazy<DashMap<String, Arc<Mutex<()>>>> = Lazy::new(DashMap::new);

fn cached_token(secret: &str) -> Option<db::Token> {
    let entry = TOKEN_CACHE.get(secret)?;
    if entry.inserted_at.elapsed() > CACHE_TTL {
        drop(entry);
        TOKEN_CACHE.remove(secret);
        return None;
    }
    Some(entry.token.clone())
}

/// Look up a token by secret, repository-backed. Misses are not cached.
pub async fn get_token(secret: &str) -> rusqlite::Result<Option<db::Token>> {
    if let Some(token) = cached_token(secret) {
        return Ok(Some(token));
    }

    let flight = FLIGHTS
        .entry(secret.to_string())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone();
    let _guard = flight.lock().await;

    // Another flight may have landed while we waited.
    if let Some(token) = cached_token(secret) {
        return Ok(Some(token));
    }

    let result = db::get_token_by_key(secret);
    if let Ok(Some(ref token)) = result {
        TOKEN_CACHE.insert(
            secret.to_string(),
            CachedToken { token: token.clone(), inserted_at: Instant::now() },
        );
    }
    drop(_guard);
    FLIGHTS.remove(secret);
    result
}

/// Cached user-id -> group lookup; empty string when the user is gone.
pub async fn get_user_group(user_id: i64) -> Option<String> {
    if let Some(entry) = GROUP_CACHE.get(&user_id) {
        if entry.inserted_at.elapsed() <= CACHE_TTL {
            return Some(entry.group.clone());
        }
        drop(entry);
        GROUP_CACHE.remove(&user_id);
    }

    let group = db::get_user_group(user_id).ok().flatten()?;
    GROUP_CACHE.insert(
        user_id,
        CachedGroup { group: group.clone(), inserted_at: Instant::now() },
    );
    Some(group)
}

/// Drop a cached token (admin update/delete).
pub fn purge_token(secret: &str) {
    TOKEN_CACHE.remove(secret);
}

/// Drop a cached group mapping (user group change).
pub fn purge_user_group(user_id: i64) {
    GROUP_CACHE.remove(&user_id);
}

#[cfg(test)]
pub fn clear() {
    TOKEN_CACHE.clear();
    GROUP_CACHE.clear();
    FLIGHTS.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cache_hit_skips_the_repository() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();
        clear();
        let user_id = crate::db::test_support::seed_user(db::ROLE_COMMON, "default");
        let key = "D".repeat(48);
        let token_id = crate::db::test_support::seed_token(user_id, &key, 100);

        let first = get_token(&key).await.unwrap().unwrap();
        assert_eq!(first.id, token_id);

        // Mutate the row behind the cache; a fresh read must still see
        // the cached copy until purge.
        crate::db::update_token_status(token_id, db::TOKEN_STATUS_DISABLED).unwrap();
        let cached = get_token(&key).await.unwrap().unwrap();
        assert_eq!(cached.status, db::TOKEN_STATUS_ENABLED);

        purge_token(&key);
        let fresh = get_token(&key).await.unwrap().unwrap();
        assert_eq!(fresh.status, db::TOKEN_STATUS_DISABLED);
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();
        clear();
        let user_id = crate::db::test_support::seed_user(db::ROLE_COMMON, "default");
        let key = "E".repeat(48);
        crate::db::test_support::seed_token(user_id, &key, 100);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let key = key.clone();
                tokio::spawn(async move { get_token(&key).await.unwrap().is_some() })
            })
            .collect();
        for task in tasks {
            assert!(task.await.unwrap());
        }
    }

    #[tokio::test]
    async fn group_cache_purges_on_demand() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();
        clear();
        let user_id = crate::db::test_support::seed_user(db::ROLE_COMMON, "vip");

        assert_eq!(get_user_group(user_id).await.as_deref(), Some("vip"));
        purge_user_group(user_id);
        assert_eq!(get_user_group(user_id).await.as_deref(), Some("vip"));
        assert_eq!(get_user_group(999_999).await, None);
    }
}
