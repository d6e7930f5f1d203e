//! Email Job Materializer - turns resolutions into persisted jobs
//!
//! Quota is the gate: each planned send is booked against a ledger
//! day before the job row exists. Restrict withholds overflow;
//! auto-spread pushes it onto subsequent days, bounded by the
//! configured horizon. Jobs past QUEUED are never touched here.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dripline_common::types::{QuotaMode, StepId, UserId};
use dripline_common::{Error, Result};
use dripline_storage::models::{Campaign, CampaignStep, JobStatus, NewEmailJob};
use dripline_storage::store::EmailJobStore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::quota::QuotaLedger;
use crate::resolver::{spacing_offset, PlannedSend, StepResolution};

/// Per-step result of a materialization pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaterializeOutcome {
    pub step_id: StepId,
    /// Jobs created at QUEUED
    pub queued: usize,
    /// Sends withheld for lack of quota (restrict mode, or spread
    /// overflow past the horizon)
    pub restricted: usize,
    /// Sends pushed onto a later ledger day than planned
    pub spread: usize,
    /// The step's scheduled window had elapsed before materialization
    pub overdue: bool,
    /// Latest ledger day any created job is booked under
    pub projected_completion: Option<NaiveDate>,
}

/// A planned send pinned to a ledger day and final send instant
pub(crate) struct DaySlot {
    pub(crate) send: PlannedSend,
    pub(crate) quota_date: NaiveDate,
    pub(crate) scheduled_send_at: DateTime<Utc>,
}

pub(crate) struct DayAssignment {
    pub(crate) granted: Vec<DaySlot>,
    pub(crate) restricted: usize,
    pub(crate) spread: usize,
}

/// Book ordered sends against ledger days under the given policy.
/// Also used by resume to re-reserve quota for re-queued jobs.
pub(crate) async fn assign_days(
    ledger: &QuotaLedger,
    user_id: UserId,
    delay_minutes: f64,
    sends: Vec<PlannedSend>,
    mode: QuotaMode,
    now: DateTime<Utc>,
) -> Result<DayAssignment> {
    let today = ledger.ledger_day(now);
    let target_day =
        |send: &PlannedSend| ledger.ledger_day(send.scheduled_send_at).max(today);

    let mut granted_slots = Vec::with_capacity(sends.len());
    let mut restricted = 0;
    let mut spread = 0;

    match mode {
        QuotaMode::Restrict => {
            // Consecutive runs of sends share a target day; book each
            // run with a partial grant and withhold the rest.
            let mut i = 0;
            while i < sends.len() {
                let day = target_day(&sends[i]);
                let mut j = i;
                while j < sends.len() && target_day(&sends[j]) == day {
                    j += 1;
                }
                let granted = ledger
                    .reserve(user_id, day, (j - i) as i32, true, now)
                    .await? as usize;
                for send in &sends[i..i + granted] {
                    granted_slots.push(DaySlot {
                        send: send.clone(),
                        quota_date: day,
                        scheduled_send_at: send.scheduled_send_at,
                    });
                }
                restricted += (j - i) - granted;
                i = j;
            }
        }
        QuotaMode::AutoSpread => {
            let horizon = ledger.spread_horizon(now);
            let mut queue: VecDeque<PlannedSend> = sends.into();
            let mut day = today;

            while let Some(front) = queue.front() {
                let front_day = target_day(front);
                if front_day > day {
                    day = front_day;
                }
                if day > horizon {
                    restricted += queue.len();
                    break;
                }

                let candidates = queue
                    .iter()
                    .take_while(|send| target_day(send) <= day)
                    .count();
                let granted = ledger
                    .reserve(user_id, day, candidates as i32, true, now)
                    .await? as usize;

                let mut pushed_slot = 0;
                for _ in 0..granted {
                    let Some(send) = queue.pop_front() else {
                        break;
                    };
                    let scheduled_send_at = if target_day(&send) == day {
                        send.scheduled_send_at
                    } else {
                        // Pushed past its planned day: lands at the
                        // start of the granted day, keeping relative
                        // order and spacing
                        spread += 1;
                        let at = ledger.day_start(day) + spacing_offset(pushed_slot, delay_minutes);
                        pushed_slot += 1;
                        at
                    };
                    granted_slots.push(DaySlot {
                        send,
                        quota_date: day,
                        scheduled_send_at,
                    });
                }

                if granted < candidates {
                    // Day exhausted, move on
                    day = day + Duration::days(1);
                }
            }
        }
    }

    Ok(DayAssignment {
        granted: granted_slots,
        restricted,
        spread,
    })
}

#[derive(Clone)]
pub struct Materializer {
    jobs: Arc<dyn EmailJobStore>,
    ledger: QuotaLedger,
}

impl Materializer {
    pub fn new(jobs: Arc<dyn EmailJobStore>, ledger: QuotaLedger) -> Self {
        Self { jobs, ledger }
    }

    /// Persist a step resolution as QUEUED jobs under the given quota
    /// policy. Partial results (restricted/spread counts) are always
    /// returned, never swallowed.
    pub async fn materialize(
        &self,
        campaign: &Campaign,
        step: &CampaignStep,
        resolution: StepResolution,
        mode: QuotaMode,
        now: DateTime<Utc>,
    ) -> Result<MaterializeOutcome> {
        let overdue = resolution.overdue;
        if resolution.sends.is_empty() {
            return Ok(MaterializeOutcome {
                step_id: step.id,
                overdue,
                ..Default::default()
            });
        }

        // Quota exceeded is normally a partial result, but a plan
        // that allows nothing at all is a hard error.
        let today = self.ledger.ledger_day(now);
        let stats = self.ledger.stats(campaign.user_id, today).await?;
        if stats.limit <= 0 {
            return Err(Error::QuotaExhausted {
                user_id: campaign.user_id,
            });
        }

        let assignment = assign_days(
            &self.ledger,
            campaign.user_id,
            step.delay_minutes,
            resolution.sends,
            mode,
            now,
        )
        .await?;

        let projected_completion = assignment.granted.iter().map(|slot| slot.quota_date).max();
        let new_jobs: Vec<NewEmailJob> = assignment
            .granted
            .iter()
            .map(|slot| NewEmailJob {
                org_id: campaign.org_id,
                campaign_id: campaign.id,
                step_id: step.id,
                contact_id: slot.send.contact_id,
                user_id: campaign.user_id,
                status: JobStatus::Queued,
                scheduled_send_at: slot.scheduled_send_at,
                quota_date: slot.quota_date,
            })
            .collect();

        if !new_jobs.is_empty() {
            if let Err(e) = self.jobs.insert_many(new_jobs).await {
                // Give booked capacity back before failing loudly
                let mut by_day: HashMap<NaiveDate, i32> = HashMap::new();
                for slot in &assignment.granted {
                    *by_day.entry(slot.quota_date).or_default() += 1;
                }
                for (day, count) in by_day {
                    if let Err(release_err) =
                        self.ledger.release(campaign.user_id, day, count).await
                    {
                        warn!(
                            campaign_id = %campaign.id,
                            %day,
                            "failed to release quota after insert error: {}",
                            release_err
                        );
                    }
                }
                return Err(e);
            }
        }

        debug!(
            campaign_id = %campaign.id,
            step_id = %step.id,
            queued = assignment.granted.len(),
            restricted = assignment.restricted,
            spread = assignment.spread,
            "materialized step"
        );

        Ok(MaterializeOutcome {
            step_id: step.id,
            queued: assignment.granted.len(),
            restricted: assignment.restricted,
            spread: assignment.spread,
            overdue,
            projected_completion,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticPlans;
    use crate::resolver::{resolve_step, Resolution};
    use crate::testutil::{campaign as make_campaign, step as make_step};
    use chrono::TimeZone;
    use dripline_common::config::QuotaConfig;
    use dripline_common::types::ContactId;
    use dripline_storage::store::QuotaStore;
    use dripline_storage::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;
    use uuid::Uuid;

    fn fixture(limit: i32) -> (Materializer, QuotaLedger, MemoryStore) {
        fixture_with_config(limit, QuotaConfig::default())
    }

    fn fixture_with_config(
        limit: i32,
        config: QuotaConfig,
    ) -> (Materializer, QuotaLedger, MemoryStore) {
        let store = MemoryStore::new();
        let ledger = QuotaLedger::new(
            Arc::new(store.clone()),
            Arc::new(StaticPlans::new(limit)),
            config,
        );
        let materializer = Materializer::new(Arc::new(store.clone()), ledger.clone());
        (materializer, ledger, store)
    }

    fn resolve(
        step: &dripline_storage::models::CampaignStep,
        contacts: &[ContactId],
        now: DateTime<Utc>,
    ) -> StepResolution {
        match resolve_step(step, contacts, &HashSet::new(), &[], None, now).unwrap() {
            Resolution::Ready(r) => r,
            Resolution::Deferred { .. } => panic!("unexpected deferral"),
        }
    }

    fn sorted_contacts(n: usize) -> Vec<ContactId> {
        let mut contacts: Vec<ContactId> = (0..n).map(|_| Uuid::new_v4()).collect();
        contacts.sort();
        contacts
    }

    #[tokio::test]
    async fn test_restrict_mode_queues_up_to_quota() {
        // 3 recipients, delay 1 minute, daily limit 2: two jobs at
        // T+0 and T+1min, one contact restricted, quota used up.
        let (materializer, ledger, _) = fixture(2);
        let campaign = make_campaign();
        let step = make_step(campaign.id, 1, 1.0);
        let contacts = sorted_contacts(3);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();

        let resolution = resolve(&step, &contacts, now);
        let outcome = materializer
            .materialize(&campaign, &step, resolution, QuotaMode::Restrict, now)
            .await
            .unwrap();

        assert_eq!(outcome.queued, 2);
        assert_eq!(outcome.restricted, 1);
        assert_eq!(outcome.spread, 0);

        let jobs = materializer.jobs.list_by_step(step.id).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].scheduled_send_at, now);
        assert_eq!(jobs[1].scheduled_send_at, now + Duration::seconds(60));

        let stats = ledger
            .stats(campaign.user_id, ledger.ledger_day(now))
            .await
            .unwrap();
        assert_eq!(stats.used, 2);
        assert_eq!(stats.remaining, 0);
    }

    #[tokio::test]
    async fn test_auto_spread_pushes_overflow_to_next_day() {
        let (materializer, ledger, _) = fixture(2);
        let campaign = make_campaign();
        let step = make_step(campaign.id, 1, 1.0);
        let contacts = sorted_contacts(3);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();

        let resolution = resolve(&step, &contacts, now);
        let outcome = materializer
            .materialize(&campaign, &step, resolution, QuotaMode::AutoSpread, now)
            .await
            .unwrap();

        assert_eq!(outcome.queued, 3);
        assert_eq!(outcome.restricted, 0);
        assert_eq!(outcome.spread, 1);

        let today = ledger.ledger_day(now);
        let tomorrow = today + Duration::days(1);
        assert_eq!(outcome.projected_completion, Some(tomorrow));

        let jobs = materializer.jobs.list_by_step(step.id).await.unwrap();
        assert_eq!(jobs.len(), 3);
        // Third send lands at the start of the next quota window
        let spilled = jobs
            .iter()
            .find(|j| j.quota_date == tomorrow)
            .expect("one job on the next day");
        assert_eq!(spilled.scheduled_send_at, ledger.day_start(tomorrow));

        let stats = ledger.stats(campaign.user_id, tomorrow).await.unwrap();
        assert_eq!(stats.used, 1);
    }

    #[tokio::test]
    async fn test_auto_spread_respects_horizon() {
        let config = QuotaConfig {
            spread_horizon_days: 1,
            ..QuotaConfig::default()
        };
        let (materializer, _, _) = fixture_with_config(1, config);
        let campaign = make_campaign();
        let step = make_step(campaign.id, 1, 1.0);
        let contacts = sorted_contacts(4);
        let now = Utc.with_ymd_and_hms(2026, 8, 30, 10, 0, 0).unwrap();

        let resolution = resolve(&step, &contacts, now);
        let outcome = materializer
            .materialize(&campaign, &step, resolution, QuotaMode::AutoSpread, now)
            .await
            .unwrap();

        // One today, one tomorrow, the rest cut off at the horizon
        assert_eq!(outcome.queued, 2);
        assert_eq!(outcome.restricted, 2);
    }

    #[tokio::test]
    async fn test_zero_limit_is_hard_quota_error() {
        let (materializer, _, _) = fixture(0);
        let campaign = make_campaign();
        let step = make_step(campaign.id, 1, 1.0);
        let contacts = sorted_contacts(1);
        let now = Utc::now();

        let resolution = resolve(&step, &contacts, now);
        let err = materializer
            .materialize(&campaign, &step, resolution, QuotaMode::Restrict, now)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "QUOTA_EXHAUSTED");
    }

    #[tokio::test]
    async fn test_rematerialization_is_a_noop() {
        let (materializer, _, store) = fixture(10);
        let campaign = make_campaign();
        let step = make_step(campaign.id, 1, 1.0);
        let contacts = sorted_contacts(3);
        let now = Utc::now();

        let resolution = resolve(&step, &contacts, now);
        materializer
            .materialize(&campaign, &step, resolution, QuotaMode::Restrict, now)
            .await
            .unwrap();

        // Second pass resolves against the existing jobs: nothing new
        let existing = materializer.jobs.list_by_step(step.id).await.unwrap();
        let resolution =
            match resolve_step(&step, &contacts, &HashSet::new(), &existing, None, now).unwrap() {
                Resolution::Ready(r) => r,
                Resolution::Deferred { .. } => panic!("unexpected deferral"),
            };
        let outcome = materializer
            .materialize(&campaign, &step, resolution, QuotaMode::Restrict, now)
            .await
            .unwrap();
        assert_eq!(outcome.queued, 0);

        // Quota was not double-booked either
        let counter = QuotaStore::get(
            &store,
            campaign.user_id,
            Utc::now().date_naive() + Duration::days(1),
        )
        .await
        .unwrap();
        assert!(counter.map_or(true, |c| c.used <= 3));
        assert_eq!(
            materializer.jobs.list_by_step(step.id).await.unwrap().len(),
            3
        );
    }
}
