//! Quota reservation lifecycle.
//!
//! One [`Quota`] per relay attempt: reserve the worst-case cost before
//! the upstream send, then either commit with the observed usage or
//! refund. A reservation still held when the value drops (client
//! disconnect, dispatcher cancellation) refunds itself from a spawned
//! blocking task, so cancelled requests cannot leak quota.

use std::time::Instant;

use crate::db;
use crate::pricing::{self, Price};

use super::context::RelayContext;
use super::error::{RelayError, RelayResult};
use super::types::Usage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReservationStatus {
    Pending,
    Held,
    Committed,
    Refunded,
}

/// Per-request quota ledger client.
#[derive(Debug)]
pub struct Quota {
    request_id: String,
    user_id: i64,
    token_id: i64,
    model_name: String,
    price: Price,
    group_ratio: f64,
    prompt_tokens: i64,
    reserved: i64,
    unlimited: bool,
    status: ReservationStatus,
    start: Instant,
    first_response_ms: Option<i64>,
}

impl Quota {
    pub fn new(ctx: &RelayContext, model_name: &str, prompt_tokens: i64) -> Self {
        let price = pricing::get_price(model_name);
        let group_ratio = db::get_group_by_symbol(&ctx.token_group)
            .ok()
            .flatten()
            .map(|g| g.ratio)
            .unwrap_or(1.0);

        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: ctx.user_id,
            token_id: ctx.token_id,
            model_name: model_name.to_string(),
            price,
            group_ratio,
            prompt_tokens,
            reserved: 0,
            unlimited: ctx.token_unlimited_quota,
            status: ReservationStatus::Pending,
            start: ctx.request_start,
            first_response_ms: None,
        }
    }

    fn scale(&self, units: f64) -> i64 {
        (units * self.group_ratio).ceil() as i64
    }

    /// Reserve the maximum expected cost: prompt tokens at the input
    /// rate, floored at one unit for billable models. Unlimited tokens
    /// skip the decrement entirely.
    pub fn pre_consume(&mut self) -> RelayResult<()> {
        if self.unlimited || !self.price.is_billable() {
            self.status = ReservationStatus::Held;
            return Ok(());
        }

        let amount = self.scale(self.prompt_tokens as f64 * self.price.input).max(1);
        let reserved = db::pre_consume_token_quota(self.token_id, amount)
            .map_err(|e| RelayError::Internal(format!("quota reservation failed: {}", e)))?;
        if !reserved {
            return Err(RelayError::QuotaExceeded(format!(
                "token quota is insufficient for model {}",
                self.model_name
            )));
        }
        self.reserved = amount;
        self.status = ReservationStatus::Held;
        Ok(())
    }

    /// Record when the first upstream byte arrived.
    pub fn set_first_response_time(&mut self) {
        if self.first_response_ms.is_none() {
            self.first_response_ms = Some(self.start.elapsed().as_millis() as i64);
        }
    }

    /// Replace the hold with the actual cost and write the ledger row.
    pub fn consume(&mut self, ctx: &RelayContext, usage: &Usage, is_stream: bool) {
        if self.status != ReservationStatus::Held {
            return;
        }

        let base = pricing::completion_cost(usage.prompt_tokens, usage.completion_tokens, &self.price);
        let actual = if self.unlimited || !self.price.is_billable() {
            0
        } else {
            (base as f64 * self.group_ratio).ceil() as i64
        };

        // Positive delta refunds the over-reservation, negative charges
        // the shortfall.
        if let Err(e) = db::refund_token_quota(self.token_id, self.reserved - actual) {
            crate::logger::error(
                "quota",
                &format!("settle failed for request {}: {}", self.request_id, e),
            );
        }

        let entry = db::LedgerEntry {
            request_id: self.request_id.clone(),
            user_id: self.user_id,
            token_id: self.token_id,
            model_name: self.model_name.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: actual,
            is_stream,
            first_response_ms: self.first_response_ms,
            created_time: chrono::Utc::now().timestamp(),
        };
        if let Err(e) = db::insert_ledger(&entry) {
            crate::logger::error(
                "quota",
                &format!("ledger write failed for request {}: {}", self.request_id, e),
            );
        }

        crate::logger::info(
            "quota",
            &format!(
                "consumed {} units: user={}, token={}, model={}, tokens={}/{}, stream={}, group={}",
                actual,
                self.user_id,
                self.token_id,
                self.model_name,
                usage.prompt_tokens,
                usage.completion_tokens,
                is_stream,
                ctx.token_group
            ),
        );

        self.status = ReservationStatus::Committed;
    }

    /// Refund the full hold. Idempotent; no-op after commit.
    pub fn undo(&mut self) {
        if self.status != ReservationStatus::Held {
            return;
        }
        if self.reserved > 0 {
            if let Err(e) = db::refund_token_quota(self.token_id, self.reserved) {
                crate::logger::error(
                    "quota",
                    &format!("refund failed for request {}: {}", self.request_id, e),
                );
            }
        }
        self.status = ReservationStatus::Refunded;
    }
}

impl Drop for Quota {
    fn drop(&mut self) {
        if self.status != ReservationStatus::Held || self.reserved == 0 {
            return;
        }
        let token_id = self.token_id;
        let reserved = self.reserved;
        let request_id = self.request_id.clone();
        self.status = ReservationStatus::Refunded;

        // The dispatcher task may be mid-cancellation; refund off-task.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                if db::refund_token_quota(token_id, reserved).is_ok() {
                    crate::logger::info(
                        "quota",
                        &format!("drop-refunded {} units for request {}", reserved, request_id),
                    );
                }
            });
        } else {
            let _ = db::refund_token_quota(token_id, reserved);
        }
    }
}

/// Bill a search-probe call against the caller's token.
pub fn consume_probe(ctx: &RelayContext, model_name: &str, usage: &Usage) -> RelayResult<()> {
    let mut quota = Quota::new(ctx, model_name, 0);
    quota.pre_consume()?;
    quota.consume(ctx, usage, false);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::context::test_support::context;

    fn seeded(quota_units: i64) -> (tempfile::TempDir, RelayContext) {
        let dir = crate::db::test_support::fresh_db();
        let user_id = crate::db::test_support::seed_user(db::ROLE_COMMON, "default");
        let token_id = crate::db::test_support::seed_token(user_id, &"q".repeat(48), quota_units);
        db::upsert_model_price("gpt-4o-mini", db::channel_type::OPENAI, 0.01, 0.03).unwrap();
        pricing::reload();
        (dir, context(token_id, user_id))
    }

    fn remain(ctx: &RelayContext) -> i64 {
        db::token_remain_quota(ctx.token_id).unwrap().unwrap()
    }

    #[test]
    fn commit_settles_to_actual_cost() {
        let _guard = crate::db::test_support::lock();
        let (_dir, ctx) = seeded(1000);

        let mut quota = Quota::new(&ctx, "gpt-4o-mini", 500);
        quota.pre_consume().unwrap();
        // reserved = ceil(500 * 0.01) = 5
        assert_eq!(remain(&ctx), 995);

        quota.consume(&ctx, &Usage::new(500, 100), false);
        // actual = ceil(500*0.01 + 100*0.03) = 8
        assert_eq!(remain(&ctx), 992);

        let ledger = db::recent_ledger(10, 0).unwrap();
        assert_eq!(ledger.len(), 1);
        assert_eq!(ledger[0].quota, 8);
        assert_eq!(ledger[0].completion_tokens, 100);
    }

    #[test]
    fn undo_restores_the_full_hold_idempotently() {
        let _guard = crate::db::test_support::lock();
        let (_dir, ctx) = seeded(1000);

        let mut quota = Quota::new(&ctx, "gpt-4o-mini", 500);
        quota.pre_consume().unwrap();
        assert_eq!(remain(&ctx), 995);

        quota.undo();
        quota.undo();
        assert_eq!(remain(&ctx), 1000);
        assert!(db::recent_ledger(10, 0).unwrap().is_empty());
    }

    #[test]
    fn exhausted_reservation_fails_without_leaking() {
        let _guard = crate::db::test_support::lock();
        let (_dir, ctx) = seeded(3);

        let mut quota = Quota::new(&ctx, "gpt-4o-mini", 500);
        let err = quota.pre_consume().unwrap_err();
        assert!(matches!(err, RelayError::QuotaExceeded(_)));
        assert_eq!(remain(&ctx), 3);

        // A failed reservation has nothing to refund.
        quota.undo();
        assert_eq!(remain(&ctx), 3);
    }

    #[test]
    fn quota_conservation_over_mixed_outcomes() {
        let _guard = crate::db::test_support::lock();
        let (_dir, ctx) = seeded(10_000);
        let mut committed_total = 0;

        for round in 0..6 {
            let mut quota = Quota::new(&ctx, "gpt-4o-mini", 200);
            quota.pre_consume().unwrap();
            if round % 2 == 0 {
                let usage = Usage::new(200, 50 * round);
                quota.consume(&ctx, &usage, false);
                committed_total += ((200.0 * 0.01) + (50.0 * round as f64) * 0.03).ceil() as i64;
            } else {
                quota.undo();
            }
        }

        assert_eq!(remain(&ctx), 10_000 - committed_total);
    }

    #[test]
    fn free_models_hold_and_charge_nothing() {
        let _guard = crate::db::test_support::lock();
        let (_dir, ctx) = seeded(100);

        let mut quota = Quota::new(&ctx, "unpriced-model", 10_000);
        quota.pre_consume().unwrap();
        assert_eq!(remain(&ctx), 100);
        quota.consume(&ctx, &Usage::new(10_000, 10_000), true);
        assert_eq!(remain(&ctx), 100);
        // The ledger still records the call at zero cost.
        assert_eq!(db::recent_ledger(10, 0).unwrap()[0].quota, 0);
    }

    #[test]
    fn group_ratio_scales_cost() {
        let _guard = crate::db::test_support::lock();
        let (_dir, mut ctx) = seeded(1000);
        db::upsert_user_group(&db::UserGroup {
            symbol: "vip".to_string(),
            name: "VIP".to_string(),
            public: true,
            ratio: 2.0,
        })
        .unwrap();
        ctx.token_group = "vip".to_string();

        let mut quota = Quota::new(&ctx, "gpt-4o-mini", 500);
        quota.pre_consume().unwrap();
        // reserved = ceil(500 * 0.01 * 2.0) = 10
        assert_eq!(remain(&ctx), 990);
        quota.undo();
        assert_eq!(remain(&ctx), 1000);
    }
}
