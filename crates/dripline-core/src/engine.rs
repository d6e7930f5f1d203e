//! Scheduler Engine - the control surface the API layer calls.
//!
//! Owns campaign and step CRUD with its validation rules, delegates
//! lifecycle transitions, and routes engagement events into the
//! recorder. Everything is scoped by organization: a campaign is only
//! visible through its own org id.

use chrono::{DateTime, NaiveDate, Utc};
use dripline_common::types::{
    CampaignId, ContactListId, JobId, OrgId, Page, PageRequest, QuotaMode, StepId, TemplateId,
    UserId,
};
use dripline_common::{Error, Result};
use dripline_storage::models::{
    Campaign, CampaignStatus, CampaignStep, EmailJob, JobStatus, ReplyFilter, TriggerType,
};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use uuid::Uuid;

use crate::dispatch::{EngagementEvent, OutcomeRecorder};
use crate::lifecycle::{ActivationReport, CampaignLifecycle};
use crate::progress::ProgressSnapshot;
use crate::quota::QuotaStats;
use crate::resolver::MIN_DELAY_MINUTES;
use crate::Stores;

fn default_true() -> bool {
    true
}

/// Input for creating a campaign
#[derive(Debug, Clone, Deserialize)]
pub struct CampaignSpec {
    pub user_id: UserId,
    pub name: String,
    pub contact_list_id: ContactListId,
    #[serde(default = "default_true")]
    pub track_opens: bool,
    #[serde(default = "default_true")]
    pub track_clicks: bool,
    #[serde(default = "default_true")]
    pub track_unsubscribes: bool,
    #[serde(default)]
    pub unsubscribe_on_reply: bool,
    #[serde(default = "default_true")]
    pub auto_advance: bool,
}

/// Input for creating or updating a step
#[derive(Debug, Clone, Deserialize)]
pub struct StepSpec {
    pub name: String,
    pub template_id: TemplateId,
    pub trigger_type: TriggerType,
    pub schedule_time: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
    pub delay_minutes: f64,
    pub reply_to_step_id: Option<StepId>,
    pub reply_filter: Option<ReplyFilter>,
}

pub struct Engine {
    stores: Stores,
    lifecycle: Arc<CampaignLifecycle>,
    recorder: OutcomeRecorder,
}

impl Engine {
    pub fn new(stores: Stores, lifecycle: Arc<CampaignLifecycle>) -> Self {
        let recorder = OutcomeRecorder::new(stores.jobs.clone(), lifecycle.ledger().clone());
        Self {
            stores,
            lifecycle,
            recorder,
        }
    }

    // -- campaigns ----------------------------------------------------

    pub async fn create_campaign(&self, org_id: OrgId, spec: CampaignSpec) -> Result<Campaign> {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(Error::Validation("Campaign name cannot be empty".into()));
        }
        if self.stores.campaigns.find_by_name(org_id, name).await?.is_some() {
            return Err(Error::Conflict(format!(
                "A campaign named '{}' already exists",
                name
            )));
        }

        let now = Utc::now();
        let campaign = Campaign {
            id: Uuid::new_v4(),
            org_id,
            user_id: spec.user_id,
            name: name.to_string(),
            contact_list_id: spec.contact_list_id,
            status: CampaignStatus::Draft.to_string(),
            quota_mode: QuotaMode::default().to_string(),
            total_recipients: 0,
            total_steps: 0,
            current_step: 0,
            sent_count: 0,
            delivered_count: 0,
            opened_count: 0,
            clicked_count: 0,
            replied_count: 0,
            bounced_count: 0,
            failed_count: 0,
            cancelled_count: 0,
            complained_count: 0,
            unsubscribed_count: 0,
            track_opens: spec.track_opens,
            track_clicks: spec.track_clicks,
            track_unsubscribes: spec.track_unsubscribes,
            unsubscribe_on_reply: spec.unsubscribe_on_reply,
            auto_advance: spec.auto_advance,
            created_at: now,
            updated_at: now,
            activated_at: None,
            completed_at: None,
        };
        let campaign = self.stores.campaigns.insert(campaign).await?;
        info!(campaign_id = %campaign.id, name, "campaign created");
        Ok(campaign)
    }

    pub async fn get_campaign(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        self.stores
            .campaigns
            .get(org_id, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))
    }

    pub async fn activate(
        &self,
        org_id: OrgId,
        id: CampaignId,
        mode: QuotaMode,
    ) -> Result<ActivationReport> {
        self.lifecycle.activate(org_id, id, mode).await
    }

    pub async fn pause(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        self.lifecycle.pause(org_id, id).await
    }

    pub async fn resume(
        &self,
        org_id: OrgId,
        id: CampaignId,
        mode: QuotaMode,
    ) -> Result<ActivationReport> {
        self.lifecycle.resume(org_id, id, mode).await
    }

    pub async fn cancel(&self, org_id: OrgId, id: CampaignId) -> Result<Campaign> {
        self.lifecycle.cancel(org_id, id).await
    }

    pub async fn get_progress(&self, org_id: OrgId, id: CampaignId) -> Result<ProgressSnapshot> {
        self.lifecycle.progress().recompute(org_id, id).await
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.lifecycle.progress().subscribe()
    }

    // -- steps --------------------------------------------------------

    pub async fn list_steps(&self, org_id: OrgId, campaign_id: CampaignId) -> Result<Vec<CampaignStep>> {
        self.get_campaign(org_id, campaign_id).await?;
        self.stores.steps.list_by_campaign(campaign_id).await
    }

    pub async fn add_step(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
        spec: StepSpec,
    ) -> Result<CampaignStep> {
        let campaign = self.get_campaign(org_id, campaign_id).await?;
        let now = Utc::now();

        // Adding to a running campaign is only allowed for steps that
        // cannot already be in the past
        match campaign.status_enum() {
            Some(CampaignStatus::Draft) => {}
            Some(CampaignStatus::Active) | Some(CampaignStatus::Paused) => {
                let future_schedule = spec.trigger_type == TriggerType::Schedule
                    && spec.schedule_time.map_or(false, |t| t > now);
                if !future_schedule {
                    return Err(Error::Conflict(format!(
                        "Campaign {} is {}; only future scheduled steps can be added",
                        campaign_id, campaign.status
                    )));
                }
            }
            _ => {
                return Err(Error::Conflict(format!(
                    "Campaign {} is {} and cannot be modified",
                    campaign_id, campaign.status
                )));
            }
        }

        let existing = self.stores.steps.list_by_campaign(campaign_id).await?;
        Self::validate_step_spec(&spec, &existing, None)?;

        let step_order = existing.iter().map(|s| s.step_order).max().unwrap_or(0) + 1;
        let step = CampaignStep {
            id: Uuid::new_v4(),
            campaign_id,
            name: spec.name,
            template_id: spec.template_id,
            step_order,
            trigger_type: spec.trigger_type.to_string(),
            schedule_time: spec.schedule_time,
            timezone: spec.timezone,
            delay_minutes: spec.delay_minutes,
            reply_to_step_id: spec.reply_to_step_id,
            reply_filter: spec.reply_filter.map(|f| f.to_string()),
            created_at: now,
            updated_at: now,
        };
        let step = self.stores.steps.insert(step).await?;

        if campaign.status_enum() != Some(CampaignStatus::Draft) {
            self.stores
                .campaigns
                .set_totals(
                    campaign_id,
                    campaign.total_recipients,
                    (existing.len() + 1) as i32,
                )
                .await?;
        }
        Ok(step)
    }

    pub async fn update_step(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
        step_id: StepId,
        spec: StepSpec,
    ) -> Result<CampaignStep> {
        self.get_campaign(org_id, campaign_id).await?;
        let mut step = self
            .stores
            .steps
            .get(campaign_id, step_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;

        let counts = self.stores.jobs.status_counts_by_step(step_id).await?;
        if counts.total() > 0 {
            // Jobs exist: the step is structurally locked, only the
            // presentation fields may change
            let structural_change = spec.trigger_type.to_string() != step.trigger_type
                || spec.schedule_time != step.schedule_time
                || spec.timezone != step.timezone
                || spec.delay_minutes != step.delay_minutes
                || spec.reply_to_step_id != step.reply_to_step_id
                || spec.reply_filter.map(|f| f.to_string()) != step.reply_filter;
            if structural_change {
                return Err(Error::Validation(format!(
                    "Step {} already has jobs; only name and template can change",
                    step_id
                )));
            }
            step.name = spec.name;
            step.template_id = spec.template_id;
        } else {
            let existing = self.stores.steps.list_by_campaign(campaign_id).await?;
            Self::validate_step_spec(&spec, &existing, Some(&step))?;
            step.name = spec.name;
            step.template_id = spec.template_id;
            step.trigger_type = spec.trigger_type.to_string();
            step.schedule_time = spec.schedule_time;
            step.timezone = spec.timezone;
            step.delay_minutes = spec.delay_minutes;
            step.reply_to_step_id = spec.reply_to_step_id;
            step.reply_filter = spec.reply_filter.map(|f| f.to_string());
        }
        step.updated_at = Utc::now();
        self.stores.steps.update(step).await
    }

    pub async fn delete_step(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
        step_id: StepId,
    ) -> Result<()> {
        self.get_campaign(org_id, campaign_id).await?;

        let counts = self.stores.jobs.status_counts_by_step(step_id).await?;
        if counts.total() > 0 {
            return Err(Error::Conflict(format!(
                "Step {} has jobs and cannot be deleted",
                step_id
            )));
        }
        let steps = self.stores.steps.list_by_campaign(campaign_id).await?;
        if steps
            .iter()
            .any(|s| s.reply_to_step_id == Some(step_id))
        {
            return Err(Error::Conflict(format!(
                "Step {} is the target of a reply step and cannot be deleted",
                step_id
            )));
        }

        let deleted = self.stores.steps.delete(campaign_id, step_id).await?;
        if !deleted {
            return Err(Error::NotFound(format!("step {}", step_id)));
        }
        Ok(())
    }

    /// Rewrite the step order of a draft campaign. `order` must be a
    /// permutation of the campaign's step ids, and every reply step
    /// must still come after its target.
    pub async fn reorder_steps(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
        order: Vec<StepId>,
    ) -> Result<Vec<CampaignStep>> {
        let campaign = self.get_campaign(org_id, campaign_id).await?;
        if campaign.status_enum() != Some(CampaignStatus::Draft) {
            return Err(Error::Conflict(format!(
                "Campaign {} is {}; steps can only be reordered in draft",
                campaign_id, campaign.status
            )));
        }

        let steps = self.stores.steps.list_by_campaign(campaign_id).await?;
        let mut current: Vec<StepId> = steps.iter().map(|s| s.id).collect();
        let mut proposed = order.clone();
        current.sort();
        proposed.sort();
        if current != proposed {
            return Err(Error::Validation(
                "Reorder must be a permutation of the campaign's steps".into(),
            ));
        }

        let position = |id: StepId| order.iter().position(|&x| x == id);
        for step in &steps {
            if let Some(target) = step.reply_to_step_id {
                if position(step.id) <= position(target) {
                    return Err(Error::Validation(format!(
                        "Step '{}' must stay after its reply target",
                        step.name
                    )));
                }
            }
        }

        self.stores.steps.reorder(campaign_id, &order).await?;
        self.stores.steps.list_by_campaign(campaign_id).await
    }

    // -- jobs and engagement ------------------------------------------

    pub async fn get_step_emails(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
        step_id: StepId,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Page<EmailJob>> {
        self.get_campaign(org_id, campaign_id).await?;
        self.stores
            .steps
            .get(campaign_id, step_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("step {}", step_id)))?;

        let limit = page.limit.clamp(1, 500);
        let offset = page.offset.max(0);
        let (data, total) = self
            .stores
            .jobs
            .list_by_step_paged(step_id, status, limit, offset)
            .await?;
        Ok(Page {
            data,
            total,
            offset,
            limit,
        })
    }

    pub async fn quota_stats(
        &self,
        user_id: UserId,
        date: Option<NaiveDate>,
    ) -> Result<QuotaStats> {
        let ledger = self.lifecycle.ledger();
        let date = date.unwrap_or_else(|| ledger.ledger_day(Utc::now()));
        ledger.stats(user_id, date).await
    }

    /// Fold an engagement event into a job, honoring the campaign's
    /// tracking switches. Dropped events return Ok(None).
    pub async fn record_engagement(
        &self,
        org_id: OrgId,
        job_id: JobId,
        event: EngagementEvent,
    ) -> Result<Option<EmailJob>> {
        let job = self
            .stores
            .jobs
            .get(job_id)
            .await?
            .filter(|job| job.org_id == org_id)
            .ok_or_else(|| Error::NotFound(format!("email job {}", job_id)))?;
        let campaign = self.get_campaign(org_id, job.campaign_id).await?;

        let event = match event {
            EngagementEvent::Opened if !campaign.track_opens => return Ok(None),
            EngagementEvent::Clicked if !campaign.track_clicks => return Ok(None),
            EngagementEvent::Unsubscribed if !campaign.track_unsubscribes => return Ok(None),
            // A reply acts as an unsubscribe when the campaign says so
            EngagementEvent::Replied if campaign.unsubscribe_on_reply => {
                EngagementEvent::Unsubscribed
            }
            other => other,
        };

        let updated = self
            .recorder
            .record_engagement(job_id, event, Utc::now())
            .await?;
        if updated.is_some() {
            self.lifecycle
                .progress()
                .recompute(org_id, job.campaign_id)
                .await?;
        }
        Ok(updated)
    }

    // -- validation ---------------------------------------------------

    fn validate_step_spec(
        spec: &StepSpec,
        existing: &[CampaignStep],
        updating: Option<&CampaignStep>,
    ) -> Result<()> {
        if spec.name.trim().is_empty() {
            return Err(Error::Validation("Step name cannot be empty".into()));
        }
        if existing
            .iter()
            .any(|s| s.name == spec.name && Some(s.id) != updating.map(|u| u.id))
        {
            return Err(Error::Conflict(format!(
                "A step named '{}' already exists in this campaign",
                spec.name
            )));
        }
        if spec.delay_minutes < MIN_DELAY_MINUTES {
            return Err(Error::Validation(format!(
                "delay_minutes must be at least {} (got {})",
                MIN_DELAY_MINUTES, spec.delay_minutes
            )));
        }

        match spec.trigger_type {
            TriggerType::Schedule => {
                if spec.schedule_time.is_none() {
                    return Err(Error::Validation(
                        "Scheduled steps require schedule_time".into(),
                    ));
                }
            }
            TriggerType::Immediate => {
                if spec.schedule_time.is_some() {
                    return Err(Error::Validation(
                        "Immediate steps cannot carry schedule_time".into(),
                    ));
                }
            }
        }
        if let Some(tz) = &spec.timezone {
            if tz.parse::<chrono_tz::Tz>().is_err() {
                return Err(Error::Validation(format!("Unknown timezone '{}'", tz)));
            }
        }

        match (spec.reply_to_step_id, spec.reply_filter) {
            (Some(target_id), Some(_)) => {
                let own_order = updating.map(|u| u.step_order).unwrap_or(i32::MAX);
                let target = existing
                    .iter()
                    .find(|s| s.id == target_id)
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "Reply target {} is not a step of this campaign",
                            target_id
                        ))
                    })?;
                if target.step_order >= own_order {
                    return Err(Error::Validation(
                        "A reply step must target an earlier step".into(),
                    ));
                }
                if Some(target.id) == updating.map(|u| u.id) {
                    return Err(Error::Validation("A step cannot reply to itself".into()));
                }
            }
            (Some(_), None) => {
                return Err(Error::Validation(
                    "Reply steps require a reply_filter".into(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Validation(
                    "reply_filter is only valid on reply steps".into(),
                ));
            }
            (None, None) => {}
        }
        Ok(())
    }
}
