//! In-memory store backend.
//!
//! A single mutex guards all tables, which linearizes quota
//! reservations and job claims the same way the Postgres backend's
//! conditional statements do. Used by tests and embedded runs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use dripline_common::types::{CampaignId, JobId, OrgId, QuotaMode, StepId, UserId};
use dripline_common::{Error, Result};

use crate::models::{
    Campaign, CampaignStatus, CampaignStep, EmailJob, JobStatus, JobStatusCounts, NewEmailJob,
    QuotaCounter,
};
use crate::store::{CampaignStore, EmailJobStore, QuotaStore, StepStore};

#[derive(Default)]
struct Inner {
    campaigns: HashMap<CampaignId, Campaign>,
    steps: HashMap<StepId, CampaignStep>,
    jobs: HashMap<JobId, EmailJob>,
    quotas: HashMap<(UserId, NaiveDate), QuotaCounter>,
}

/// In-memory implementation of all store traits
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert(&self, campaign: Campaign) -> Result<Campaign> {
        let mut inner = self.inner.lock().await;
        if inner
            .campaigns
            .values()
            .any(|c| c.org_id == campaign.org_id && c.name == campaign.name)
        {
            return Err(Error::Conflict(format!(
                "Campaign name '{}' already exists in organization",
                campaign.name
            )));
        }
        inner.campaigns.insert(campaign.id, campaign.clone());
        Ok(campaign)
    }

    async fn get(&self, org_id: OrgId, id: CampaignId) -> Result<Option<Campaign>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .campaigns
            .get(&id)
            .filter(|c| c.org_id == org_id)
            .cloned())
    }

    async fn find_by_name(&self, org_id: OrgId, name: &str) -> Result<Option<Campaign>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .campaigns
            .values()
            .find(|c| c.org_id == org_id && c.name == name)
            .cloned())
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let mut inner = self.inner.lock().await;
        let Some(campaign) = inner.campaigns.get_mut(&id) else {
            return Ok(None);
        };
        if campaign.status != from.to_string() {
            return Ok(None);
        }
        campaign.status = to.to_string();
        campaign.updated_at = at;
        if to == CampaignStatus::Active && campaign.activated_at.is_none() {
            campaign.activated_at = Some(at);
        }
        if to.is_terminal() && campaign.completed_at.is_none() {
            campaign.completed_at = Some(at);
        }
        Ok(Some(campaign.clone()))
    }

    async fn set_totals(
        &self,
        id: CampaignId,
        total_recipients: i32,
        total_steps: i32,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.total_recipients = total_recipients;
            campaign.total_steps = total_steps;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_current_step(&self, id: CampaignId, current_step: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.current_step = current_step;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn set_quota_mode(&self, id: CampaignId, mode: QuotaMode) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.quota_mode = mode.to_string();
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn update_counters(&self, id: CampaignId, counts: JobStatusCounts) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(campaign) = inner.campaigns.get_mut(&id) {
            campaign.sent_count = counts.sent as i32;
            campaign.delivered_count = counts.delivered as i32;
            campaign.opened_count = counts.opened as i32;
            campaign.clicked_count = counts.clicked as i32;
            campaign.replied_count = counts.replied as i32;
            campaign.bounced_count = counts.bounced as i32;
            campaign.failed_count = counts.failed as i32;
            campaign.cancelled_count = counts.cancelled as i32;
            campaign.complained_count = counts.complained as i32;
            campaign.unsubscribed_count = counts.unsubscribed as i32;
            campaign.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        let inner = self.inner.lock().await;
        let status = status.to_string();
        Ok(inner
            .campaigns
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn insert(&self, step: CampaignStep) -> Result<CampaignStep> {
        let mut inner = self.inner.lock().await;
        if inner
            .steps
            .values()
            .any(|s| s.campaign_id == step.campaign_id && s.step_order == step.step_order)
        {
            return Err(Error::Conflict(format!(
                "Step order {} already taken in campaign",
                step.step_order
            )));
        }
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn get(&self, campaign_id: CampaignId, id: StepId) -> Result<Option<CampaignStep>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .steps
            .get(&id)
            .filter(|s| s.campaign_id == campaign_id)
            .cloned())
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignStep>> {
        let inner = self.inner.lock().await;
        let mut steps: Vec<CampaignStep> = inner
            .steps
            .values()
            .filter(|s| s.campaign_id == campaign_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }

    async fn update(&self, step: CampaignStep) -> Result<CampaignStep> {
        let mut inner = self.inner.lock().await;
        if !inner.steps.contains_key(&step.id) {
            return Err(Error::NotFound("step".to_string()));
        }
        inner.steps.insert(step.id, step.clone());
        Ok(step)
    }

    async fn delete(&self, campaign_id: CampaignId, id: StepId) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let matches = inner
            .steps
            .get(&id)
            .is_some_and(|s| s.campaign_id == campaign_id);
        if matches {
            inner.steps.remove(&id);
        }
        Ok(matches)
    }

    async fn reorder(&self, campaign_id: CampaignId, order: &[StepId]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        for (idx, step_id) in order.iter().enumerate() {
            match inner.steps.get_mut(step_id) {
                Some(step) if step.campaign_id == campaign_id => {
                    step.step_order = (idx + 1) as i32;
                    step.updated_at = Utc::now();
                }
                _ => {
                    return Err(Error::Validation(format!(
                        "Step {} does not belong to campaign {}",
                        step_id, campaign_id
                    )))
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EmailJobStore for MemoryStore {
    async fn insert_many(&self, jobs: Vec<NewEmailJob>) -> Result<Vec<EmailJob>> {
        let mut inner = self.inner.lock().await;
        for job in &jobs {
            if inner
                .jobs
                .values()
                .any(|j| j.step_id == job.step_id && j.contact_id == job.contact_id)
            {
                return Err(Error::Integrity(format!(
                    "Job already exists for step {} contact {}",
                    job.step_id, job.contact_id
                )));
            }
        }
        let now = Utc::now();
        let mut created = Vec::with_capacity(jobs.len());
        for job in jobs {
            let row = EmailJob {
                id: uuid::Uuid::new_v4(),
                org_id: job.org_id,
                campaign_id: job.campaign_id,
                step_id: job.step_id,
                contact_id: job.contact_id,
                user_id: job.user_id,
                status: job.status.to_string(),
                scheduled_send_at: job.scheduled_send_at,
                quota_date: job.quota_date,
                last_error: None,
                sent_at: None,
                created_at: now,
                updated_at: now,
            };
            inner.jobs.insert(row.id, row.clone());
            created.push(row);
        }
        Ok(created)
    }

    async fn get(&self, id: JobId) -> Result<Option<EmailJob>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<EmailJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<EmailJob> = inner
            .jobs
            .values()
            .filter(|j| j.step_id == step_id)
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_send_at, j.contact_id));
        Ok(jobs)
    }

    async fn list_by_step_paged(
        &self,
        step_id: StepId,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<EmailJob>, i64)> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<EmailJob> = inner
            .jobs
            .values()
            .filter(|j| {
                j.step_id == step_id
                    && status.map_or(true, |s| j.status == s.to_string())
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_send_at, j.contact_id));
        let total = jobs.len() as i64;
        let page = jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect();
        Ok((page, total))
    }

    async fn status_counts_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<JobStatusCounts> {
        let inner = self.inner.lock().await;
        let mut counts = JobStatusCounts::default();
        for job in inner.jobs.values().filter(|j| j.campaign_id == campaign_id) {
            if let Some(status) = job.status_enum() {
                counts.add(status, 1);
            }
        }
        Ok(counts)
    }

    async fn status_counts_by_step(&self, step_id: StepId) -> Result<JobStatusCounts> {
        let inner = self.inner.lock().await;
        let mut counts = JobStatusCounts::default();
        for job in inner.jobs.values().filter(|j| j.step_id == step_id) {
            if let Some(status) = job.status_enum() {
                counts.add(status, 1);
            }
        }
        Ok(counts)
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        let Some(from) = job.status_enum() else {
            return Err(Error::Integrity(format!(
                "Job {} has unknown status '{}'",
                id, job.status
            )));
        };
        if !from.can_transition_to(to) {
            return Ok(None);
        }
        job.status = to.to_string();
        job.updated_at = at;
        if let Some(error) = error {
            job.last_error = Some(error.to_string());
        }
        if to == JobStatus::Sent && job.sent_at.is_none() {
            job.sent_at = Some(at);
        }
        Ok(Some(job.clone()))
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>> {
        let mut inner = self.inner.lock().await;
        let mut due: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Queued.to_string() && j.scheduled_send_at <= now)
            .map(|j| j.id)
            .collect();
        due.sort_by_key(|id| inner.jobs[id].scheduled_send_at);
        due.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(due.len());
        for id in due {
            let job = inner.jobs.get_mut(&id).expect("job present");
            job.status = JobStatus::Sending.to_string();
            job.updated_at = now;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn cancel_sendable_chunk(
        &self,
        campaign_id: CampaignId,
        chunk: i64,
    ) -> Result<Vec<EmailJob>> {
        let mut inner = self.inner.lock().await;
        let mut sendable: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| {
                j.campaign_id == campaign_id
                    && j.status_enum().is_some_and(|s| s.is_sendable())
            })
            .map(|j| j.id)
            .collect();
        sendable.sort();
        sendable.truncate(chunk.max(0) as usize);

        let now = Utc::now();
        let mut cancelled = Vec::with_capacity(sendable.len());
        for id in sendable {
            let job = inner.jobs.get_mut(&id).expect("job present");
            job.status = JobStatus::Cancelled.to_string();
            job.updated_at = now;
            cancelled.push(job.clone());
        }
        Ok(cancelled)
    }

    async fn list_cancelled_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailJob>> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<EmailJob> = inner
            .jobs
            .values()
            .filter(|j| {
                j.campaign_id == campaign_id && j.status == JobStatus::Cancelled.to_string()
            })
            .cloned()
            .collect();
        jobs.sort_by_key(|j| (j.scheduled_send_at, j.contact_id));
        Ok(jobs)
    }

    async fn requeue_cancelled(
        &self,
        id: JobId,
        scheduled_send_at: DateTime<Utc>,
        quota_date: NaiveDate,
    ) -> Result<Option<EmailJob>> {
        let mut inner = self.inner.lock().await;
        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        if job.status != JobStatus::Cancelled.to_string() {
            return Ok(None);
        }
        job.status = JobStatus::Queued.to_string();
        job.scheduled_send_at = scheduled_send_at;
        job.quota_date = quota_date;
        job.updated_at = Utc::now();
        Ok(Some(job.clone()))
    }

    async fn list_sending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .jobs
            .values()
            .filter(|j| j.status == JobStatus::Sending.to_string() && j.updated_at < cutoff)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<QuotaCounter>> {
        let inner = self.inner.lock().await;
        Ok(inner.quotas.get(&(user_id, date)).cloned())
    }

    async fn try_reserve(
        &self,
        user_id: UserId,
        date: NaiveDate,
        count: i32,
        limit: i32,
        allow_partial: bool,
    ) -> Result<i32> {
        let mut inner = self.inner.lock().await;
        let counter = inner
            .quotas
            .entry((user_id, date))
            .or_insert_with(|| QuotaCounter {
                user_id,
                date,
                used: 0,
                limit_value: limit,
                updated_at: Utc::now(),
            });
        counter.limit_value = limit;

        let remaining = (limit - counter.used).max(0);
        let granted = if allow_partial {
            count.min(remaining)
        } else if count <= remaining {
            count
        } else {
            0
        };
        counter.used += granted;
        counter.updated_at = Utc::now();
        Ok(granted)
    }

    async fn release(&self, user_id: UserId, date: NaiveDate, count: i32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(counter) = inner.quotas.get_mut(&(user_id, date)) {
            counter.used = (counter.used - count).max(0);
            counter.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn purge_before(&self, before: NaiveDate) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let stale: Vec<(UserId, NaiveDate)> = inner
            .quotas
            .keys()
            .filter(|(_, date)| *date < before)
            .copied()
            .collect();
        let removed = stale.len() as u64;
        for key in stale {
            inner.quotas.remove(&key);
        }
        Ok(removed)
    }
}
