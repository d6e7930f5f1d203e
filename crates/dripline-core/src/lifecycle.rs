//! Campaign State Machine - activate, pause, resume, cancel, complete
//!
//! Transitions on one campaign serialize behind a per-campaign lock;
//! the store-level conditional updates keep concurrent transitions
//! from both winning even across processes. Job mutation during
//! pause/cancel runs in chunks so a large campaign never holds a
//! transaction open for the whole operation.

use chrono::{DateTime, NaiveDate, Utc};
use dripline_common::config::QuotaConfig;
use dripline_common::types::{CampaignId, ContactId, JobId, OrgId, QuotaMode, StepId};
use dripline_common::{Error, Result};
use dripline_storage::models::{Campaign, CampaignStatus, EmailJob};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::materializer::{assign_days, MaterializeOutcome, Materializer};
use crate::progress::ProgressAggregator;
use crate::providers::{ContactListProvider, NotificationSink, PlanProvider, SchedulerEvent};
use crate::quota::QuotaLedger;
use crate::resolver::{self, PlannedSend, Resolution};
use crate::Stores;

/// Jobs cancelled per batch during pause/cancel
const CANCEL_CHUNK: i64 = 500;

/// Result of an activate or resume transition
#[derive(Debug, Clone, Serialize)]
pub struct ActivationReport {
    pub campaign: Campaign,
    pub outcomes: Vec<MaterializeOutcome>,
    /// Steps whose scheduled window had already elapsed; surfaced for
    /// user notification, never silently skipped
    pub overdue_steps: Vec<StepId>,
    /// Cancelled jobs put back in the queue (resume only)
    pub requeued: usize,
    /// Cancelled jobs still withheld for lack of quota (resume only)
    pub requeue_restricted: usize,
}

impl ActivationReport {
    pub fn total_queued(&self) -> usize {
        self.outcomes.iter().map(|o| o.queued).sum::<usize>() + self.requeued
    }

    pub fn total_restricted(&self) -> usize {
        self.outcomes.iter().map(|o| o.restricted).sum::<usize>() + self.requeue_restricted
    }
}

pub struct CampaignLifecycle {
    stores: Stores,
    ledger: QuotaLedger,
    materializer: Materializer,
    contacts: Arc<dyn ContactListProvider>,
    notifications: Arc<dyn NotificationSink>,
    progress: ProgressAggregator,
    locks: Mutex<HashMap<CampaignId, Arc<Mutex<()>>>>,
}

impl CampaignLifecycle {
    pub fn new(
        stores: Stores,
        contacts: Arc<dyn ContactListProvider>,
        plans: Arc<dyn PlanProvider>,
        notifications: Arc<dyn NotificationSink>,
        quota_config: QuotaConfig,
    ) -> Self {
        let ledger = QuotaLedger::new(stores.quota.clone(), plans, quota_config);
        let materializer = Materializer::new(stores.jobs.clone(), ledger.clone());
        let progress = ProgressAggregator::new(stores.clone());
        Self {
            stores,
            ledger,
            materializer,
            contacts,
            notifications,
            progress,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub fn progress(&self) -> &ProgressAggregator {
        &self.progress
    }

    /// Serialize transitions on one campaign within this process
    async fn lock_for(&self, id: CampaignId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(id).or_default().clone()
        };
        lock.lock_owned().await
    }

    async fn get_campaign(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        self.stores
            .campaigns
            .get(org_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))
    }

    fn status_of(campaign: &Campaign) -> Result<CampaignStatus> {
        campaign.status_enum().ok_or_else(|| {
            Error::Integrity(format!(
                "Campaign {} has unknown status '{}'",
                campaign.id, campaign.status
            ))
        })
    }

    /// Progress failures never roll back a transition
    async fn recompute_progress(&self, org_id: OrgId, id: CampaignId) {
        if let Err(e) = self.progress.recompute(org_id, id).await {
            warn!(campaign_id = %id, "progress recompute failed: {}", e);
        }
    }

    /// DRAFT -> ACTIVE. Requires at least one step and one recipient;
    /// materializes every step with no unmet reply dependency.
    pub async fn activate(
        &self,
        org_id: OrgId,
        id: CampaignId,
        mode: QuotaMode,
    ) -> Result<ActivationReport> {
        let _guard = self.lock_for(id).await;
        let now = Utc::now();
        let campaign = self.get_campaign(org_id, id).await?;

        match Self::status_of(&campaign)? {
            CampaignStatus::Draft => {}
            status @ (CampaignStatus::Completed | CampaignStatus::Cancelled) => {
                return Err(Error::Conflict(format!(
                    "Campaign {} is {} and cannot be reactivated",
                    id, status
                )));
            }
            status => {
                return Err(Error::Conflict(format!(
                    "Campaign {} is already {}",
                    id, status
                )));
            }
        }

        let steps = self.stores.steps.list_by_campaign(id).await?;
        if steps.is_empty() {
            return Err(Error::Validation(format!(
                "Campaign {} has no steps to activate",
                id
            )));
        }
        let recipients = self
            .contacts
            .contact_count(campaign.contact_list_id)
            .await?;
        if recipients == 0 {
            return Err(Error::Validation(format!(
                "Campaign {} has no recipients",
                id
            )));
        }

        self.stores
            .campaigns
            .set_totals(id, recipients as i32, steps.len() as i32)
            .await?;
        self.stores.campaigns.set_quota_mode(id, mode).await?;
        let campaign = self
            .stores
            .campaigns
            .transition_status(id, CampaignStatus::Draft, CampaignStatus::Active, now)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!("Campaign {} status changed concurrently", id))
            })?;

        let (outcomes, overdue_steps, _) =
            self.advance_eligible_steps(&campaign, mode, now).await?;

        let report = ActivationReport {
            campaign,
            outcomes,
            overdue_steps,
            requeued: 0,
            requeue_restricted: 0,
        };
        info!(
            campaign_id = %id,
            queued = report.total_queued(),
            restricted = report.total_restricted(),
            "campaign activated"
        );

        self.notifications
            .publish(SchedulerEvent::CampaignActivated {
                campaign_id: id,
                queued: report.total_queued(),
                restricted: report.total_restricted(),
                at: now,
            })
            .await;
        self.publish_overdue(id, &report.overdue_steps, now).await;
        self.recompute_progress(org_id, id).await;
        Ok(report)
    }

    /// ACTIVE -> PAUSED. Sendable jobs are cancelled in chunks and
    /// their quota reservations released; jobs already SENDING finish.
    pub async fn pause(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        let _guard = self.lock_for(id).await;
        let now = Utc::now();
        let campaign = self.get_campaign(org_id, id).await?;

        if Self::status_of(&campaign)? != CampaignStatus::Active {
            return Err(Error::Conflict(format!(
                "Campaign {} is {} and cannot be paused",
                id, campaign.status
            )));
        }

        let campaign = self
            .stores
            .campaigns
            .transition_status(id, CampaignStatus::Active, CampaignStatus::Paused, now)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!("Campaign {} status changed concurrently", id))
            })?;

        let cancelled = self.cancel_sendable_and_release(&campaign).await?;
        info!(campaign_id = %id, cancelled, "campaign paused");

        self.notifications
            .publish(SchedulerEvent::CampaignPaused {
                campaign_id: id,
                cancelled_jobs: cancelled,
                at: now,
            })
            .await;
        self.recompute_progress(org_id, id).await;
        Ok(campaign)
    }

    /// PAUSED -> ACTIVE. Re-queues cancelled jobs with quota
    /// re-reserved at resume time (which may itself restrict or
    /// spread), and materializes steps whose windows elapsed while
    /// paused, flagging them overdue.
    pub async fn resume(
        &self,
        org_id: OrgId,
        id: CampaignId,
        mode: QuotaMode,
    ) -> Result<ActivationReport> {
        let _guard = self.lock_for(id).await;
        let now = Utc::now();
        let campaign = self.get_campaign(org_id, id).await?;

        match Self::status_of(&campaign)? {
            CampaignStatus::Paused => {}
            status @ (CampaignStatus::Completed | CampaignStatus::Cancelled) => {
                return Err(Error::Conflict(format!(
                    "Campaign {} is {} and cannot be resumed",
                    id, status
                )));
            }
            status => {
                return Err(Error::Conflict(format!(
                    "Campaign {} is {} and cannot be resumed",
                    id, status
                )));
            }
        }

        self.stores.campaigns.set_quota_mode(id, mode).await?;
        let campaign = self
            .stores
            .campaigns
            .transition_status(id, CampaignStatus::Paused, CampaignStatus::Active, now)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!("Campaign {} status changed concurrently", id))
            })?;

        let (requeued, requeue_restricted, mut overdue_steps) =
            self.requeue_cancelled_jobs(&campaign, mode, now).await?;

        // Steps never materialized (elapsed schedules, newly eligible
        // reply steps) get their first materialization here
        let (outcomes, overdue_from_advance, _) =
            self.advance_eligible_steps(&campaign, mode, now).await?;
        for step_id in overdue_from_advance {
            if !overdue_steps.contains(&step_id) {
                overdue_steps.push(step_id);
            }
        }

        let report = ActivationReport {
            campaign,
            outcomes,
            overdue_steps,
            requeued,
            requeue_restricted,
        };
        info!(
            campaign_id = %id,
            requeued,
            restricted = report.total_restricted(),
            "campaign resumed"
        );

        self.notifications
            .publish(SchedulerEvent::CampaignResumed {
                campaign_id: id,
                requeued,
                restricted: report.total_restricted(),
                at: now,
            })
            .await;
        self.publish_overdue(id, &report.overdue_steps, now).await;
        self.recompute_progress(org_id, id).await;
        Ok(report)
    }

    /// Any non-terminal state -> CANCELLED. Terminal; in-flight
    /// SENDING jobs are not recalled.
    pub async fn cancel(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        let _guard = self.lock_for(id).await;
        let now = Utc::now();
        let campaign = self.get_campaign(org_id, id).await?;

        let from = Self::status_of(&campaign)?;
        if !from.can_transition_to(CampaignStatus::Cancelled) {
            return Err(Error::Conflict(format!(
                "Campaign {} is {} and cannot be cancelled",
                id, from
            )));
        }

        let campaign = self
            .stores
            .campaigns
            .transition_status(id, from, CampaignStatus::Cancelled, now)
            .await?
            .ok_or_else(|| {
                Error::Conflict(format!("Campaign {} status changed concurrently", id))
            })?;

        let cancelled = self.cancel_sendable_and_release(&campaign).await?;
        info!(campaign_id = %id, cancelled, "campaign cancelled");

        self.notifications
            .publish(SchedulerEvent::CampaignCancelled {
                campaign_id: id,
                cancelled_jobs: cancelled,
                at: now,
            })
            .await;
        self.recompute_progress(org_id, id).await;
        Ok(campaign)
    }

    /// ACTIVE -> COMPLETED once every job has settled and no further
    /// reply step can become eligible. Also advances reply steps whose
    /// targets have since settled. Returns whether the campaign
    /// completed on this call.
    pub async fn check_completion(&self, org_id: OrgId, id: CampaignId) -> Result<bool> {
        let _guard = self.lock_for(id).await;
        let now = Utc::now();
        let Some(campaign) = self.stores.campaigns.get(org_id, id).await? else {
            return Ok(false);
        };
        if campaign.status_enum() != Some(CampaignStatus::Active) {
            return Ok(false);
        }

        let mode = campaign.quota_mode_enum();
        let (outcomes, overdue_steps, deferred) =
            self.advance_eligible_steps(&campaign, mode, now).await?;
        if !outcomes.is_empty() {
            self.publish_overdue(id, &overdue_steps, now).await;
            self.recompute_progress(org_id, id).await;
        }
        if !deferred.is_empty() {
            return Ok(false);
        }
        // Withheld sends have no job rows yet; they re-enter on a
        // later day's sweep and must keep the campaign open
        if outcomes.iter().any(|o| o.restricted > 0) {
            return Ok(false);
        }

        let counts = self.stores.jobs.status_counts_by_campaign(id).await?;
        if counts.unresolved() > 0 {
            return Ok(false);
        }

        let Some(_) = self
            .stores
            .campaigns
            .transition_status(id, CampaignStatus::Active, CampaignStatus::Completed, now)
            .await?
        else {
            return Ok(false);
        };
        info!(campaign_id = %id, "campaign completed");

        self.notifications
            .publish(SchedulerEvent::CampaignCompleted {
                campaign_id: id,
                at: now,
            })
            .await;
        self.recompute_progress(org_id, id).await;
        Ok(true)
    }

    /// Resolve and materialize every step with no unmet dependency,
    /// in ascending step order. Returns (outcomes, overdue step ids,
    /// deferred reply step ids). Idempotent over existing jobs.
    pub async fn advance_eligible_steps(
        &self,
        campaign: &Campaign,
        mode: QuotaMode,
        now: DateTime<Utc>,
    ) -> Result<(Vec<MaterializeOutcome>, Vec<StepId>, Vec<StepId>)> {
        let steps = self.stores.steps.list_by_campaign(campaign.id).await?;
        let contacts = self
            .contacts
            .list_members(campaign.contact_list_id)
            .await?;

        let mut jobs_cache: HashMap<StepId, Vec<EmailJob>> = HashMap::new();
        for step in &steps {
            jobs_cache.insert(step.id, self.stores.jobs.list_by_step(step.id).await?);
        }

        let mut excluded: HashSet<ContactId> = HashSet::new();
        let mut outcomes = Vec::new();
        let mut overdue = Vec::new();
        let mut deferred = Vec::new();

        for step in &steps {
            let existing = jobs_cache.get(&step.id).cloned().unwrap_or_default();
            let target_jobs = step
                .reply_to_step_id
                .map(|target| jobs_cache.get(&target).cloned().unwrap_or_default());

            let resolution = resolver::resolve_step(
                step,
                &contacts,
                &excluded,
                &existing,
                target_jobs.as_deref(),
                now,
            )?;

            match resolution {
                Resolution::Deferred { step_id, .. } => deferred.push(step_id),
                Resolution::Ready(res) => {
                    if !res.sends.is_empty() {
                        if res.overdue {
                            overdue.push(step.id);
                        }
                        let outcome = self
                            .materializer
                            .materialize(campaign, step, res, mode, now)
                            .await?;
                        outcomes.push(outcome);
                    }
                }
            }

            // What happened on this step disqualifies contacts from
            // the ones after it
            excluded.extend(resolver::exclusions_from(&existing));
        }

        Ok((outcomes, overdue, deferred))
    }

    async fn publish_overdue(&self, id: CampaignId, steps: &[StepId], now: DateTime<Utc>) {
        if steps.is_empty() {
            return;
        }
        self.notifications
            .publish(SchedulerEvent::OverdueStepsDetected {
                campaign_id: id,
                step_ids: steps.to_vec(),
                at: now,
            })
            .await;
    }

    /// Cancel all sendable jobs in chunks, releasing each chunk's
    /// quota before taking the next.
    async fn cancel_sendable_and_release(&self, campaign: &Campaign) -> Result<usize> {
        let mut total = 0;
        loop {
            let chunk = self
                .stores
                .jobs
                .cancel_sendable_chunk(campaign.id, CANCEL_CHUNK)
                .await?;
            if chunk.is_empty() {
                break;
            }
            total += chunk.len();

            let mut by_day: HashMap<NaiveDate, i32> = HashMap::new();
            for job in &chunk {
                *by_day.entry(job.quota_date).or_default() += 1;
            }
            for (day, count) in by_day {
                self.ledger.release(campaign.user_id, day, count).await?;
            }
        }
        Ok(total)
    }

    /// Put a paused campaign's cancelled jobs back in the queue,
    /// re-reserving quota step by step under the selected policy.
    /// Returns (requeued, restricted, overdue step ids).
    async fn requeue_cancelled_jobs(
        &self,
        campaign: &Campaign,
        mode: QuotaMode,
        now: DateTime<Utc>,
    ) -> Result<(usize, usize, Vec<StepId>)> {
        let steps = self.stores.steps.list_by_campaign(campaign.id).await?;
        let cancelled = self
            .stores
            .jobs
            .list_cancelled_by_campaign(campaign.id)
            .await?;

        let mut requeued = 0;
        let mut restricted = 0;
        let mut overdue_steps = Vec::new();

        for step in &steps {
            let mut jobs: Vec<&EmailJob> = cancelled
                .iter()
                .filter(|job| job.step_id == step.id)
                .collect();
            if jobs.is_empty() {
                continue;
            }
            jobs.sort_by_key(|job| (job.scheduled_send_at, job.contact_id));

            if jobs.iter().any(|job| job.scheduled_send_at < now) {
                overdue_steps.push(step.id);
            }

            let sends: Vec<PlannedSend> = jobs
                .iter()
                .map(|job| PlannedSend {
                    contact_id: job.contact_id,
                    scheduled_send_at: job.scheduled_send_at,
                })
                .collect();
            let by_contact: HashMap<ContactId, JobId> =
                jobs.iter().map(|job| (job.contact_id, job.id)).collect();

            let assignment = assign_days(
                &self.ledger,
                campaign.user_id,
                step.delay_minutes,
                sends,
                mode,
                now,
            )
            .await?;
            restricted += assignment.restricted;

            for slot in assignment.granted {
                let Some(&job_id) = by_contact.get(&slot.send.contact_id) else {
                    continue;
                };
                let updated = self
                    .stores
                    .jobs
                    .requeue_cancelled(job_id, slot.scheduled_send_at, slot.quota_date)
                    .await?;
                if updated.is_some() {
                    requeued += 1;
                } else {
                    // Job moved under us; hand the booking back
                    self.ledger
                        .release(campaign.user_id, slot.quota_date, 1)
                        .await?;
                }
            }
        }

        Ok((requeued, restricted, overdue_steps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MemorySink, StaticContactDirectory, StaticPlans};
    use crate::testutil::{campaign as make_campaign, step as make_step};
    use dripline_storage::models::JobStatus;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    struct Fixture {
        lifecycle: CampaignLifecycle,
        stores: Stores,
        sink: MemorySink,
        campaign: Campaign,
        contacts: Vec<ContactId>,
    }

    async fn fixture(contact_count: usize, limit: i32, steps: usize) -> Fixture {
        let stores = Stores::in_memory();
        let mut contacts: Vec<ContactId> = (0..contact_count).map(|_| Uuid::new_v4()).collect();
        contacts.sort();

        let campaign = stores.campaigns.insert(make_campaign()).await.unwrap();
        for order in 1..=steps {
            stores
                .steps
                .insert(make_step(campaign.id, order as i32, 1.0))
                .await
                .unwrap();
        }

        let directory =
            StaticContactDirectory::new().with_list(campaign.contact_list_id, contacts.clone());
        let sink = MemorySink::new();
        let lifecycle = CampaignLifecycle::new(
            stores.clone(),
            Arc::new(directory),
            Arc::new(StaticPlans::new(limit)),
            Arc::new(sink.clone()),
            QuotaConfig::default(),
        );

        Fixture {
            lifecycle,
            stores,
            sink,
            campaign,
            contacts,
        }
    }

    async fn settle_all_jobs(stores: &Stores, to: JobStatus) {
        // Drain the queue through the legal path
        loop {
            let claimed = stores.jobs.claim_due(Utc::now(), 100).await.unwrap();
            if claimed.is_empty() {
                break;
            }
            for job in claimed {
                stores
                    .jobs
                    .transition(job.id, to, None, Utc::now())
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_activate_requires_steps() {
        let fx = fixture(3, 10, 0).await;
        let err = fx
            .lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_activate_requires_recipients() {
        let fx = fixture(0, 10, 1).await;
        let err = fx
            .lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_activate_restricts_beyond_quota() {
        let fx = fixture(3, 2, 1).await;
        let report = fx
            .lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();

        assert_eq!(report.total_queued(), 2);
        assert_eq!(report.total_restricted(), 1);
        assert_eq!(report.campaign.status, "active");
        assert!(report.campaign.activated_at.is_some());

        let events = fx.sink.events().await;
        assert!(matches!(
            events[0],
            SchedulerEvent::CampaignActivated {
                queued: 2,
                restricted: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_activate_twice_conflicts() {
        let fx = fixture(2, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();
        let err = fx
            .lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_pause_cancels_and_releases_quota() {
        let fx = fixture(3, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();

        let ledger = fx.lifecycle.ledger();
        let today = ledger.ledger_day(Utc::now());
        let before = ledger.stats(fx.campaign.user_id, today).await.unwrap();
        assert_eq!(before.used, 3);

        let paused = fx
            .lifecycle
            .pause(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap();
        assert_eq!(paused.status, "paused");

        let after = ledger.stats(fx.campaign.user_id, today).await.unwrap();
        assert_eq!(after.used, 0);

        let counts = fx
            .stores
            .jobs
            .status_counts_by_campaign(fx.campaign.id)
            .await
            .unwrap();
        assert_eq!(counts.cancelled, 3);
        assert_eq!(counts.queued, 0);
    }

    #[tokio::test]
    async fn test_pause_resume_round_trip_preserves_jobs() {
        let fx = fixture(3, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();

        let steps = fx
            .stores
            .steps
            .list_by_campaign(fx.campaign.id)
            .await
            .unwrap();
        let before: Vec<EmailJob> = fx.stores.jobs.list_by_step(steps[0].id).await.unwrap();
        let before_ids: Vec<JobId> = before.iter().map(|j| j.id).collect();

        fx.lifecycle
            .pause(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap();
        let report = fx
            .lifecycle
            .resume(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();
        assert_eq!(report.requeued, 3);
        assert_eq!(report.requeue_restricted, 0);

        let after: Vec<EmailJob> = fx.stores.jobs.list_by_step(steps[0].id).await.unwrap();
        let after_ids: Vec<JobId> = after.iter().map(|j| j.id).collect();
        assert_eq!(after_ids, before_ids);
        for (a, b) in after.iter().zip(before.iter()) {
            assert_eq!(a.status, "queued");
            assert_eq!(a.scheduled_send_at, b.scheduled_send_at);
        }

        // Quota re-reserved equivalently
        let ledger = fx.lifecycle.ledger();
        let today = ledger.ledger_day(Utc::now());
        let stats = ledger.stats(fx.campaign.user_id, today).await.unwrap();
        assert_eq!(stats.used, 3);
    }

    #[tokio::test]
    async fn test_resume_flags_elapsed_jobs_overdue() {
        let fx = fixture(2, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();
        fx.lifecycle
            .pause(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap();

        // The first job was scheduled at the activation instant,
        // which is now in the past
        let report = fx
            .lifecycle
            .resume(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();
        assert!(!report.overdue_steps.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_is_terminal() {
        let fx = fixture(2, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();
        let cancelled = fx
            .lifecycle
            .cancel(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap();
        assert_eq!(cancelled.status, "cancelled");
        assert!(cancelled.completed_at.is_some());

        let err = fx
            .lifecycle
            .resume(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
        let err = fx
            .lifecycle
            .cancel(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONFLICT");
    }

    #[tokio::test]
    async fn test_completion_after_all_jobs_settle() {
        let fx = fixture(2, 10, 1).await;
        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();

        // Still queued: not complete
        assert!(!fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());

        settle_all_jobs(&fx.stores, JobStatus::Sent).await;
        assert!(fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());

        let campaign = fx
            .stores
            .campaigns
            .get(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.status, "completed");
        let completed_at = campaign.completed_at.unwrap();

        // Second call is a no-op and completed_at stays put
        assert!(!fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());
        let campaign = fx
            .stores
            .campaigns
            .get(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn test_reply_step_materializes_when_target_settles() {
        let fx = fixture(3, 10, 1).await;
        let steps = fx
            .stores
            .steps
            .list_by_campaign(fx.campaign.id)
            .await
            .unwrap();
        let mut reply = make_step(fx.campaign.id, 2, 1.0);
        reply.reply_to_step_id = Some(steps[0].id);
        reply.reply_filter = Some("sent".to_string());
        let reply = fx.stores.steps.insert(reply).await.unwrap();

        fx.lifecycle
            .activate(fx.campaign.org_id, fx.campaign.id, QuotaMode::Restrict)
            .await
            .unwrap();

        // Reply step deferred while the target is unresolved
        assert!(fx
            .stores
            .jobs
            .list_by_step(reply.id)
            .await
            .unwrap()
            .is_empty());
        assert!(!fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());

        settle_all_jobs(&fx.stores, JobStatus::Sent).await;

        // Target settled: the completion sweep materializes the reply
        // step, so the campaign is not yet complete
        assert!(!fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());
        let reply_jobs = fx.stores.jobs.list_by_step(reply.id).await.unwrap();
        assert_eq!(reply_jobs.len(), 3);

        settle_all_jobs(&fx.stores, JobStatus::Sent).await;
        assert!(fx
            .lifecycle
            .check_completion(fx.campaign.org_id, fx.campaign.id)
            .await
            .unwrap());
    }
}
