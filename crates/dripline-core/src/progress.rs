//! Progress Aggregator - derives and publishes completion counts
//!
//! Counts are always recomputed from the job set; the per-campaign
//! counter columns are a refreshed cache, never the source of truth.
//! Safe to run concurrently with materialization and dispatch
//! (read-only over job statuses, eventually consistent).

use chrono::{DateTime, Utc};
use dripline_common::types::{CampaignId, OrgId, StepId};
use dripline_common::{Error, Result};
use dripline_storage::models::JobStatusCounts;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::Stores;

/// Per-step slice of a progress snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepProgress {
    pub step_id: StepId,
    pub name: String,
    pub step_order: i32,
    pub counts: JobStatusCounts,
    pub emails_completed: i64,
    pub total_expected: i64,
    /// None when nothing is expected yet ("NA", not divide-by-zero)
    pub progress_percentage: Option<f64>,
}

/// Point-in-time view of a campaign's progress
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub campaign_id: CampaignId,
    pub status: String,
    pub steps: Vec<StepProgress>,
    pub emails_completed: i64,
    pub total_expected: i64,
    pub progress_percentage: Option<f64>,
    pub computed_at: DateTime<Utc>,
}

fn percentage(completed: i64, expected: i64) -> Option<f64> {
    if expected > 0 {
        Some((completed as f64 / expected as f64) * 100.0)
    } else {
        None
    }
}

#[derive(Clone)]
pub struct ProgressAggregator {
    stores: Stores,
    tx: broadcast::Sender<ProgressSnapshot>,
}

impl ProgressAggregator {
    pub fn new(stores: Stores) -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { stores, tx }
    }

    /// Stream of snapshots for real-time consumers
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressSnapshot> {
        self.tx.subscribe()
    }

    /// Recompute a campaign's progress from its job set, refresh the
    /// cached counters, and publish the snapshot.
    pub async fn recompute(
        &self,
        org_id: OrgId,
        campaign_id: CampaignId,
    ) -> Result<ProgressSnapshot> {
        let campaign = self
            .stores
            .campaigns
            .get(org_id, campaign_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", campaign_id)))?;
        let steps = self.stores.steps.list_by_campaign(campaign_id).await?;

        let mut step_progress = Vec::with_capacity(steps.len());
        let mut emails_completed = 0;
        let mut total_expected = 0;
        let mut current_step = steps.len() as i32;
        let mut current_set = false;

        for (idx, step) in steps.iter().enumerate() {
            let counts = self.stores.jobs.status_counts_by_step(step.id).await?;
            // Unmaterialized steps contribute their projected eligible
            // count; unresolved reply steps project 0.
            let expected = if counts.total() > 0 {
                counts.expected()
            } else if step.is_reply_step() {
                0
            } else {
                campaign.total_recipients as i64
            };
            let completed = counts.completed();

            if !current_set && (counts.unresolved() > 0 || counts.total() == 0) {
                current_step = (idx + 1) as i32;
                current_set = true;
            }

            emails_completed += completed;
            total_expected += expected;
            step_progress.push(StepProgress {
                step_id: step.id,
                name: step.name.clone(),
                step_order: step.step_order,
                counts,
                emails_completed: completed,
                total_expected: expected,
                progress_percentage: percentage(completed, expected),
            });
        }

        // Refresh the cached counter columns
        let campaign_counts = self
            .stores
            .jobs
            .status_counts_by_campaign(campaign_id)
            .await?;
        self.stores
            .campaigns
            .update_counters(campaign_id, campaign_counts)
            .await?;
        if !steps.is_empty() {
            self.stores
                .campaigns
                .set_current_step(campaign_id, current_step)
                .await?;
        }

        let snapshot = ProgressSnapshot {
            campaign_id,
            status: campaign.status.clone(),
            steps: step_progress,
            emails_completed,
            total_expected,
            progress_percentage: percentage(emails_completed, total_expected),
            computed_at: Utc::now(),
        };

        debug!(
            campaign_id = %campaign_id,
            emails_completed,
            total_expected,
            "progress recomputed"
        );

        // Nobody listening is fine
        let _ = self.tx.send(snapshot.clone());
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{campaign as make_campaign, step as make_step};
    use dripline_storage::models::{JobStatus, NewEmailJob};
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    async fn seed_jobs(
        stores: &Stores,
        campaign: &dripline_storage::models::Campaign,
        step_id: StepId,
        statuses: &[JobStatus],
    ) {
        let now = Utc::now();
        let jobs = statuses
            .iter()
            .map(|status| NewEmailJob {
                org_id: campaign.org_id,
                campaign_id: campaign.id,
                step_id,
                contact_id: Uuid::new_v4(),
                user_id: campaign.user_id,
                status: *status,
                scheduled_send_at: now,
                quota_date: now.date_naive(),
            })
            .collect();
        stores.jobs.insert_many(jobs).await.unwrap();
    }

    #[tokio::test]
    async fn test_no_expected_reports_na() {
        let stores = Stores::in_memory();
        let mut campaign = make_campaign();
        campaign.total_recipients = 0;
        let campaign = stores.campaigns.insert(campaign).await.unwrap();
        let step = make_step(campaign.id, 1, 1.0);
        stores.steps.insert(step).await.unwrap();

        let aggregator = ProgressAggregator::new(stores);
        let snapshot = aggregator
            .recompute(campaign.org_id, campaign.id)
            .await
            .unwrap();
        assert_eq!(snapshot.total_expected, 0);
        assert_eq!(snapshot.progress_percentage, None);
    }

    #[tokio::test]
    async fn test_all_terminal_reports_exactly_100() {
        let stores = Stores::in_memory();
        let mut campaign = make_campaign();
        campaign.total_recipients = 3;
        let campaign = stores.campaigns.insert(campaign).await.unwrap();
        let step = make_step(campaign.id, 1, 1.0);
        let step = stores.steps.insert(step).await.unwrap();
        seed_jobs(
            &stores,
            &campaign,
            step.id,
            &[JobStatus::Sent, JobStatus::Bounced, JobStatus::Failed],
        )
        .await;

        let aggregator = ProgressAggregator::new(stores);
        let snapshot = aggregator
            .recompute(campaign.org_id, campaign.id)
            .await
            .unwrap();
        assert_eq!(snapshot.emails_completed, 3);
        assert_eq!(snapshot.total_expected, 3);
        assert_eq!(snapshot.progress_percentage, Some(100.0));
    }

    #[tokio::test]
    async fn test_cancelled_jobs_leave_ratio_whole() {
        let stores = Stores::in_memory();
        let mut campaign = make_campaign();
        campaign.total_recipients = 3;
        let campaign = stores.campaigns.insert(campaign).await.unwrap();
        let step = stores
            .steps
            .insert(make_step(campaign.id, 1, 1.0))
            .await
            .unwrap();
        seed_jobs(
            &stores,
            &campaign,
            step.id,
            &[JobStatus::Sent, JobStatus::Sent, JobStatus::Cancelled],
        )
        .await;

        let aggregator = ProgressAggregator::new(stores);
        let snapshot = aggregator
            .recompute(campaign.org_id, campaign.id)
            .await
            .unwrap();
        // Cancelled jobs are withdrawn from both sides
        assert_eq!(snapshot.emails_completed, 2);
        assert_eq!(snapshot.total_expected, 2);
        assert_eq!(snapshot.progress_percentage, Some(100.0));
    }

    #[tokio::test]
    async fn test_unresolved_reply_step_projects_zero() {
        let stores = Stores::in_memory();
        let mut campaign = make_campaign();
        campaign.total_recipients = 4;
        let campaign = stores.campaigns.insert(campaign).await.unwrap();
        let first = stores
            .steps
            .insert(make_step(campaign.id, 1, 1.0))
            .await
            .unwrap();
        let mut reply = make_step(campaign.id, 2, 1.0);
        reply.reply_to_step_id = Some(first.id);
        reply.reply_filter = Some("opened".to_string());
        stores.steps.insert(reply).await.unwrap();

        seed_jobs(&stores, &campaign, first.id, &[JobStatus::Queued, JobStatus::Sent]).await;

        let aggregator = ProgressAggregator::new(stores);
        let snapshot = aggregator
            .recompute(campaign.org_id, campaign.id)
            .await
            .unwrap();
        // First step expects its 2 jobs; the unmaterialized reply
        // step projects 0
        assert_eq!(snapshot.total_expected, 2);
        assert_eq!(snapshot.steps[1].total_expected, 0);
        assert_eq!(snapshot.steps[1].progress_percentage, None);
    }

    #[tokio::test]
    async fn test_snapshot_is_broadcast() {
        let stores = Stores::in_memory();
        let campaign = stores.campaigns.insert(make_campaign()).await.unwrap();
        stores
            .steps
            .insert(make_step(campaign.id, 1, 1.0))
            .await
            .unwrap();

        let aggregator = ProgressAggregator::new(stores);
        let mut rx = aggregator.subscribe();
        aggregator
            .recompute(campaign.org_id, campaign.id)
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received.campaign_id, campaign.id);
    }
}
