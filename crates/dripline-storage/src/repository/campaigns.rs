//! Campaign store, PostgreSQL backend

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_common::types::{CampaignId, OrgId, QuotaMode};
use dripline_common::{Error, Result};
use sqlx::PgPool;

use crate::models::{Campaign, CampaignStatus, JobStatusCounts};
use crate::store::CampaignStore;

#[derive(Clone)]
pub struct PgCampaignStore {
    pool: PgPool,
}

impl PgCampaignStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn insert(&self, campaign: Campaign) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>(
            r#"
            INSERT INTO campaigns (
                id, org_id, user_id, name, contact_list_id, status, quota_mode,
                track_opens, track_clicks, track_unsubscribes,
                unsubscribe_on_reply, auto_advance
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(campaign.id)
        .bind(campaign.org_id)
        .bind(campaign.user_id)
        .bind(&campaign.name)
        .bind(campaign.contact_list_id)
        .bind(&campaign.status)
        .bind(&campaign.quota_mode)
        .bind(campaign.track_opens)
        .bind(campaign.track_clicks)
        .bind(campaign.track_unsubscribes)
        .bind(campaign.unsubscribe_on_reply)
        .bind(campaign.auto_advance)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(format!(
                "Campaign name '{}' already exists in organization",
                campaign.name
            )),
            _ => db_err(e),
        })
    }

    async fn get(&self, org_id: OrgId, id: CampaignId) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1 AND org_id = $2")
            .bind(id)
            .bind(org_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn find_by_name(&self, org_id: OrgId, name: &str) -> Result<Option<Campaign>> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE org_id = $1 AND name = $2")
            .bind(org_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn transition_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>> {
        let activated_at = (to == CampaignStatus::Active).then_some(at);
        let completed_at = to.is_terminal().then_some(at);

        sqlx::query_as::<_, Campaign>(
            r#"
            UPDATE campaigns SET
                status = $3,
                activated_at = COALESCE(activated_at, $4),
                completed_at = COALESCE(completed_at, $5),
                updated_at = $6
            WHERE id = $1 AND status = $2
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(from.to_string())
        .bind(to.to_string())
        .bind(activated_at)
        .bind(completed_at)
        .bind(at)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn set_totals(
        &self,
        id: CampaignId,
        total_recipients: i32,
        total_steps: i32,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                total_recipients = $2,
                total_steps = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(total_recipients)
        .bind(total_steps)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_current_step(&self, id: CampaignId, current_step: i32) -> Result<()> {
        sqlx::query("UPDATE campaigns SET current_step = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(current_step)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn set_quota_mode(&self, id: CampaignId, mode: QuotaMode) -> Result<()> {
        sqlx::query("UPDATE campaigns SET quota_mode = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(mode.to_string())
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_counters(&self, id: CampaignId, counts: JobStatusCounts) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns SET
                sent_count = $2,
                delivered_count = $3,
                opened_count = $4,
                clicked_count = $5,
                replied_count = $6,
                bounced_count = $7,
                failed_count = $8,
                cancelled_count = $9,
                complained_count = $10,
                unsubscribed_count = $11,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(counts.sent as i32)
        .bind(counts.delivered as i32)
        .bind(counts.opened as i32)
        .bind(counts.clicked as i32)
        .bind(counts.replied as i32)
        .bind(counts.bounced as i32)
        .bind(counts.failed as i32)
        .bind(counts.cancelled as i32)
        .bind(counts.complained as i32)
        .bind(counts.unsubscribed as i32)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>> {
        sqlx::query_as::<_, Campaign>(
            "SELECT * FROM campaigns WHERE status = $1 ORDER BY created_at ASC",
        )
        .bind(status.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
