//! Channel group index.
//!
//! Maps (group, model) to the eligible upstream channels and tracks
//! per-(channel, model) cooldowns. Readers clone an immutable snapshot
//! `Arc` so rebuilds never block the relay path; the cooldown set is a
//! concurrent map consulted at selection time.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use rand::Rng;

use crate::db::{self, Channel};

use super::error::{RelayError, RelayResult};

/// How long a 429'd (channel, model) pair stays out of rotation.
const COOLDOWN_TTL: Duration = Duration::from_secs(60);

#[derive(Default)]
struct IndexSnapshot {
    channels: HashMap<i64, Arc<Channel>>,
    /// Candidate ids per (group, model), ordered by priority desc then id.
    by_group_model: HashMap<(String, String), Vec<i64>>,
    group_models: HashMap<String, BTreeSet<String>>,
    models_groups: HashMap<String, BTreeSet<String>>,
}

static INDEX: Lazy<RwLock<Arc<IndexSnapshot>>> =
    Lazy::new(|| RwLock::new(Arc::new(IndexSnapshot::default())));
static COOLDOWNS: Lazy<DashMap<(i64, String), Instant>> = Lazy::new(DashMap::new);

fn snapshot() -> Arc<IndexSnapshot> {
    INDEX.read().unwrap().clone()
}

fn build_snapshot(channels: Vec<Channel>) -> IndexSnapshot {
    let mut snap = IndexSnapshot::default();
    for channel in channels {
        let channel = Arc::new(channel);
        for group in &channel.groups {
            let group_entry = snap.group_models.entry(group.clone()).or_default();
            for model in &channel.models {
                group_entry.insert(model.clone());
                snap.by_group_model
                    .entry((group.clone(), model.clone()))
                    .or_default()
                    .push(channel.id);
                snap.models_groups
                    .entry(model.clone())
                    .or_default()
                    .insert(group.clone());
            }
        }
        snap.channels.insert(channel.id, channel);
    }

    for ids in snap.by_group_model.values_mut() {
        let channels = &snap.channels;
        ids.sort_by_key(|id| {
            let priority = channels.get(id).map(|c| c.priority).unwrap_or(0);
            (std::cmp::Reverse(priority), *id)
        });
        ids.dedup();
    }

    snap
}

/// Rebuild the snapshot from the repository (startup, admin mutation).
pub fn rebuild() {
    match db::list_enabled_channels() {
        Ok(channels) => {
            let count = channels.len();
            *INDEX.write().unwrap() = Arc::new(build_snapshot(channels));
            crate::logger::info("channels", &format!("index rebuilt with {} channels", count));
        }
        Err(e) => crate::logger::error("channels", &format!("index rebuild failed: {}", e)),
    }
}

/// Install a snapshot directly (tests).
#[cfg(test)]
pub fn install(channels: Vec<Channel>) {
    *INDEX.write().unwrap() = Arc::new(build_snapshot(channels));
}

/// Sorted model names any live channel in `group` supports.
pub fn get_group_models(group: &str) -> Vec<String> {
    snapshot()
        .group_models
        .get(group)
        .map(|set| set.iter().cloned().collect())
        .unwrap_or_default()
}

/// For each model, the set of groups exposing it.
pub fn get_models_groups() -> HashMap<String, BTreeSet<String>> {
    snapshot().models_groups.clone()
}

/// Put a (channel, model) pair on cooldown. Applied on upstream 429 only.
pub fn set_cooldown(channel_id: i64, model: &str) {
    COOLDOWNS.insert((channel_id, model.to_string()), Instant::now() + COOLDOWN_TTL);
    crate::logger::info(
        "channels",
        &format!("cooldown set for channel #{} model {}", channel_id, model),
    );
}

fn in_cooldown(channel_id: i64, model: &str) -> bool {
    let key = (channel_id, model.to_string());
    let expiry = match COOLDOWNS.get(&key) {
        Some(entry) => *entry,
        None => return false,
    };
    if Instant::now() < expiry {
        return true;
    }
    COOLDOWNS.remove(&key);
    false
}

#[cfg(test)]
pub fn cooldown_len() -> usize {
    COOLDOWNS.len()
}

#[cfg(test)]
pub fn clear_cooldowns() {
    COOLDOWNS.clear();
}

fn pick_candidate(snap: &IndexSnapshot, ids: &[i64]) -> Option<Arc<Channel>> {
    let candidates: Vec<&Arc<Channel>> = ids.iter().filter_map(|id| snap.channels.get(id)).collect();
    let first = candidates.first()?;

    // Only the highest priority tier competes; the list is pre-sorted.
    let top_priority = first.priority;
    let tier: Vec<&Arc<Channel>> = candidates
        .into_iter()
        .take_while(|c| c.priority == top_priority)
        .collect();

    if tier.len() == 1 {
        return Some(Arc::clone(tier[0]));
    }

    let total: i64 = tier.iter().map(|c| c.weight.max(1)).sum();
    let mut roll = rand::thread_rng().gen_range(0..total);
    for channel in &tier {
        roll -= channel.weight.max(1);
        if roll < 0 {
            return Some(Arc::clone(channel));
        }
    }
    tier.last().map(|c| Arc::clone(c))
}

fn next_in_group(
    snap: &IndexSnapshot,
    group: &str,
    model: &str,
    skip_ids: &[i64],
) -> Option<Arc<Channel>> {
    let ids = snap.by_group_model.get(&(group.to_string(), model.to_string()))?;
    let eligible: Vec<i64> = ids
        .iter()
        .copied()
        .filter(|id| !skip_ids.contains(id) && !in_cooldown(*id, model))
        .collect();
    pick_candidate(snap, &eligible)
}

/// Select one eligible channel for the request.
///
/// A pinned id wins unconditionally when it supports the model (or the
/// availability check is disabled); otherwise candidates come from the
/// group, then the backup group.
pub fn next(
    group: &str,
    backup_group: Option<&str>,
    model: &str,
    skip_ids: &[i64],
    specific_id: Option<i64>,
    specific_ignore: bool,
) -> RelayResult<Arc<Channel>> {
    let snap = snapshot();

    if let Some(id) = specific_id {
        let channel = snap
            .channels
            .get(&id)
            .ok_or_else(|| RelayError::ChannelNotFound(format!("channel #{}", id)))?;
        if !specific_ignore && !channel.models.iter().any(|m| m == model) {
            return Err(RelayError::ChannelNotFound(format!(
                "channel #{} does not serve {}",
                id, model
            )));
        }
        return Ok(Arc::clone(channel));
    }

    if let Some(channel) = next_in_group(&snap, group, model, skip_ids) {
        return Ok(channel);
    }
    if let Some(backup) = backup_group {
        if let Some(channel) = next_in_group(&snap, backup, model, skip_ids) {
            return Ok(channel);
        }
    }

    Err(RelayError::NoChannel(format!("{}/{}", group, model)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: i64, models: &[&str], priority: i64, weight: i64) -> Channel {
        Channel {
            id,
            name: format!("ch-{}", id),
            channel_type: db::channel_type::OPENAI,
            status: db::CHANNEL_STATUS_ENABLED,
            base_url: "https://api.example.com".to_string(),
            api_key: "upstream-key".to_string(),
            groups: vec!["default".to_string()],
            models: models.iter().map(|s| s.to_string()).collect(),
            priority,
            weight,
            ..Default::default()
        }
    }

    #[test]
    fn group_models_are_sorted_and_deduped() {
        let _guard = crate::db::test_support::lock();
        install(vec![
            channel(1, &["gpt-4o", "gpt-4o-mini"], 0, 1),
            channel(2, &["gpt-4o-mini", "o1"], 0, 1),
        ]);
        assert_eq!(get_group_models("default"), vec!["gpt-4o", "gpt-4o-mini", "o1"]);
        assert!(get_group_models("missing").is_empty());

        let models_groups = get_models_groups();
        assert!(models_groups.get("o1").unwrap().contains("default"));
    }

    #[test]
    fn next_prefers_the_higher_priority_tier() {
        let _guard = crate::db::test_support::lock();
        clear_cooldowns();
        install(vec![
            channel(1, &["gpt-4o-mini"], 0, 1),
            channel(2, &["gpt-4o-mini"], 10, 1),
        ]);
        for _ in 0..10 {
            let picked = next("default", None, "gpt-4o-mini", &[], None, false).unwrap();
            assert_eq!(picked.id, 2);
        }
    }

    #[test]
    fn next_honors_skip_ids_and_falls_back() {
        let _guard = crate::db::test_support::lock();
        clear_cooldowns();
        install(vec![
            channel(1, &["gpt-4o-mini"], 10, 1),
            channel(2, &["gpt-4o-mini"], 0, 1),
        ]);
        let picked = next("default", None, "gpt-4o-mini", &[1], None, false).unwrap();
        assert_eq!(picked.id, 2);

        let err = next("default", None, "gpt-4o-mini", &[1, 2], None, false).unwrap_err();
        assert!(matches!(err, RelayError::NoChannel(_)));
    }

    #[test]
    fn cooldown_suppresses_the_pair_until_expiry() {
        let _guard = crate::db::test_support::lock();
        clear_cooldowns();
        install(vec![
            channel(1, &["gpt-4o-mini", "o1"], 10, 1),
            channel(2, &["gpt-4o-mini"], 0, 1),
        ]);
        set_cooldown(1, "gpt-4o-mini");

        let picked = next("default", None, "gpt-4o-mini", &[], None, false).unwrap();
        assert_eq!(picked.id, 2);
        // The cooldown is per-model, the other model still routes to #1.
        let picked = next("default", None, "o1", &[], None, false).unwrap();
        assert_eq!(picked.id, 1);
        clear_cooldowns();
    }

    #[test]
    fn pinned_channel_checks_model_support() {
        let _guard = crate::db::test_support::lock();
        install(vec![channel(7, &["gpt-4o-mini"], 0, 1)]);

        let picked = next("default", None, "gpt-4o-mini", &[], Some(7), false).unwrap();
        assert_eq!(picked.id, 7);

        let err = next("default", None, "o1", &[], Some(7), false).unwrap_err();
        assert!(matches!(err, RelayError::ChannelNotFound(_)));

        // ignore flag bypasses availability filtering.
        let picked = next("default", None, "o1", &[], Some(7), true).unwrap();
        assert_eq!(picked.id, 7);

        let err = next("default", None, "gpt-4o-mini", &[], Some(99), true).unwrap_err();
        assert!(matches!(err, RelayError::ChannelNotFound(_)));
    }

    #[test]
    fn backup_group_is_tried_after_primary() {
        let _guard = crate::db::test_support::lock();
        clear_cooldowns();
        let mut vip = channel(3, &["gpt-4o-mini"], 0, 1);
        vip.groups = vec!["vip".to_string()];
        install(vec![vip]);

        let err = next("default", None, "gpt-4o-mini", &[], None, false).unwrap_err();
        assert!(matches!(err, RelayError::NoChannel(_)));

        let picked = next("default", Some("vip"), "gpt-4o-mini", &[], None, false).unwrap();
        assert_eq!(picked.id, 3);
    }

    #[test]
    fn rebuild_reads_enabled_channels_from_the_repository() {
        let _guard = crate::db::test_support::lock();
        let _dir = crate::db::test_support::fresh_db();

        let mut enabled = channel(0, &["gpt-4o-mini"], 0, 1);
        enabled.id = 0;
        let id = db::insert_channel(&enabled).unwrap();
        let mut disabled = channel(0, &["o1"], 0, 1);
        disabled.id = 0;
        disabled.status = 0;
        db::insert_channel(&disabled).unwrap();

        rebuild();
        assert_eq!(get_group_models("default"), vec!["gpt-4o-mini"]);
        let picked = next("default", None, "gpt-4o-mini", &[], None, false).unwrap();
        assert_eq!(picked.id, id);
        assert!(next("default", None, "o1", &[], None, false).is_err());
    }

    #[test]
    fn weighted_pick_stays_within_the_top_tier() {
        let _guard = crate::db::test_support::lock();
        clear_cooldowns();
        install(vec![
            channel(1, &["gpt-4o-mini"], 5, 100),
            channel(2, &["gpt-4o-mini"], 5, 1),
            channel(3, &["gpt-4o-mini"], 0, 1000),
        ]);
        for _ in 0..50 {
            let picked = next("default", None, "gpt-4o-mini", &[], None, false).unwrap();
            assert_ne!(picked.id, 3);
        }
    }
}
