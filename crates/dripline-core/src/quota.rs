//! Quota Ledger - per-user, per-day send accounting
//!
//! Every ledger operation is keyed on a calendar day in the ledger's
//! reference offset (midnight UTC+05:30 by default). Reservations are
//! a single conditional increment in the store; `stats` snapshots are
//! for display only and never back a reserve decision.

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use dripline_common::config::QuotaConfig;
use dripline_common::types::UserId;
use dripline_common::{Error, Result};
use dripline_storage::store::QuotaStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::providers::PlanProvider;

/// Read-only quota snapshot for a (user, day)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaStats {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub used: i32,
    pub limit: i32,
    pub remaining: i32,
    /// Instant the counter resets (start of the next ledger day)
    pub reset_at: DateTime<Utc>,
    pub percent_used: f64,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    plans: Arc<dyn PlanProvider>,
    config: QuotaConfig,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>, plans: Arc<dyn PlanProvider>, config: QuotaConfig) -> Self {
        Self {
            store,
            plans,
            config,
        }
    }

    fn offset(&self) -> Duration {
        Duration::minutes(self.config.reset_utc_offset_minutes as i64)
    }

    /// Calendar day a UTC instant falls on in the ledger's reference
    /// offset
    pub fn ledger_day(&self, at: DateTime<Utc>) -> NaiveDate {
        (at + self.offset()).date_naive()
    }

    /// UTC instant a ledger day begins
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        date.and_time(NaiveTime::MIN).and_utc() - self.offset()
    }

    /// UTC instant the counter for `date` resets
    pub fn reset_at(&self, date: NaiveDate) -> DateTime<Utc> {
        self.day_start(date + Duration::days(1))
    }

    /// Furthest ledger day auto-spread may schedule into, relative to
    /// `now`
    pub fn spread_horizon(&self, now: DateTime<Utc>) -> NaiveDate {
        self.ledger_day(now) + Duration::days(self.config.spread_horizon_days as i64)
    }

    pub async fn stats(&self, user_id: UserId, date: NaiveDate) -> Result<QuotaStats> {
        let limit = self.plans.daily_email_limit(user_id).await?;
        let used = self
            .store
            .get(user_id, date)
            .await?
            .map_or(0, |counter| counter.used);
        let remaining = (limit - used).max(0);
        let percent_used = if limit > 0 {
            (used as f64 / limit as f64) * 100.0
        } else {
            0.0
        };

        Ok(QuotaStats {
            user_id,
            date,
            used,
            limit,
            remaining,
            reset_at: self.reset_at(date),
            percent_used,
        })
    }

    /// Atomically reserve up to `count` sends against (user, date).
    /// With `allow_partial` the grant may fall short of the request;
    /// without it the reservation is all-or-nothing. Returns the
    /// granted count.
    pub async fn reserve(
        &self,
        user_id: UserId,
        date: NaiveDate,
        count: i32,
        allow_partial: bool,
        now: DateTime<Utc>,
    ) -> Result<i32> {
        if date < self.ledger_day(now) {
            return Err(Error::Integrity(format!(
                "Cannot reserve quota for past day {} (today is {})",
                date,
                self.ledger_day(now)
            )));
        }
        if count <= 0 {
            return Ok(0);
        }

        let limit = self.plans.daily_email_limit(user_id).await?;
        let granted = self
            .store
            .try_reserve(user_id, date, count, limit, allow_partial)
            .await?;

        debug!(
            user_id = %user_id,
            %date,
            count,
            granted,
            "quota reservation"
        );
        Ok(granted)
    }

    /// Return reserved capacity, never driving `used` below zero
    pub async fn release(&self, user_id: UserId, date: NaiveDate, count: i32) -> Result<()> {
        if count <= 0 {
            return Ok(());
        }
        self.store.release(user_id, date, count).await
    }

    /// Drop counters older than the retention window
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let cutoff =
            self.ledger_day(now) - Duration::days(self.config.counter_retention_days as i64);
        self.store.purge_before(cutoff).await
    }
}
