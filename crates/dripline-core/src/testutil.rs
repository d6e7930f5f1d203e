//! Shared fixtures for unit tests

use chrono::Utc;
use dripline_common::types::{CampaignId, ContactId, QuotaMode, StepId};
use dripline_storage::models::{
    Campaign, CampaignStatus, CampaignStep, EmailJob, JobStatus, TriggerType,
};
use uuid::Uuid;

pub fn campaign() -> Campaign {
    let now = Utc::now();
    Campaign {
        id: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        user_id: Uuid::new_v4(),
        name: "fixture".to_string(),
        contact_list_id: Uuid::new_v4(),
        status: CampaignStatus::Draft.to_string(),
        quota_mode: QuotaMode::Restrict.to_string(),
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
        track_opens: true,
        track_clicks: true,
        track_unsubscribes: true,
        unsubscribe_on_reply: false,
        auto_advance: true,
        created_at: now,
        updated_at: now,
        activated_at: None,
        completed_at: None,
    }
}

pub fn step(campaign_id: CampaignId, order: i32, delay_minutes: f64) -> CampaignStep {
    let now = Utc::now();
    CampaignStep {
        id: Uuid::new_v4(),
        campaign_id,
        name: format!("step-{}", order),
        template_id: Uuid::new_v4(),
        step_order: order,
        trigger_type: TriggerType::Immediate.to_string(),
        schedule_time: None,
        timezone: None,
        delay_minutes,
        reply_to_step_id: None,
        reply_filter: None,
        created_at: now,
        updated_at: now,
    }
}

pub fn job_with_status(step_id: StepId, contact_id: ContactId, status: JobStatus) -> EmailJob {
    let now = Utc::now();
    EmailJob {
        id: Uuid::new_v4(),
        org_id: Uuid::new_v4(),
        campaign_id: Uuid::new_v4(),
        step_id,
        contact_id,
        user_id: Uuid::new_v4(),
        status: status.to_string(),
        scheduled_send_at: now,
        quota_date: now.date_naive(),
        last_error: None,
        sent_at: None,
        created_at: now,
        updated_at: now,
    }
}
