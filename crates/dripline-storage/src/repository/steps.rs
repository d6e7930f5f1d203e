//! Campaign step store, PostgreSQL backend

use async_trait::async_trait;
use dripline_common::types::{CampaignId, StepId};
use dripline_common::{Error, Result};
use sqlx::PgPool;

use crate::models::CampaignStep;
use crate::store::StepStore;

#[derive(Clone)]
pub struct PgStepStore {
    pool: PgPool,
}

impl PgStepStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

#[async_trait]
impl StepStore for PgStepStore {
    async fn insert(&self, step: CampaignStep) -> Result<CampaignStep> {
        sqlx::query_as::<_, CampaignStep>(
            r#"
            INSERT INTO campaign_steps (
                id, campaign_id, name, template_id, step_order, trigger_type,
                schedule_time, timezone, delay_minutes, reply_to_step_id, reply_filter
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(step.id)
        .bind(step.campaign_id)
        .bind(&step.name)
        .bind(step.template_id)
        .bind(step.step_order)
        .bind(&step.trigger_type)
        .bind(step.schedule_time)
        .bind(&step.timezone)
        .bind(step.delay_minutes)
        .bind(step.reply_to_step_id)
        .bind(&step.reply_filter)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(format!(
                "Step order {} already taken in campaign",
                step.step_order
            )),
            _ => db_err(e),
        })
    }

    async fn get(&self, campaign_id: CampaignId, id: StepId) -> Result<Option<CampaignStep>> {
        sqlx::query_as::<_, CampaignStep>(
            "SELECT * FROM campaign_steps WHERE id = $1 AND campaign_id = $2",
        )
        .bind(id)
        .bind(campaign_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignStep>> {
        sqlx::query_as::<_, CampaignStep>(
            "SELECT * FROM campaign_steps WHERE campaign_id = $1 ORDER BY step_order ASC",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn update(&self, step: CampaignStep) -> Result<CampaignStep> {
        sqlx::query_as::<_, CampaignStep>(
            r#"
            UPDATE campaign_steps SET
                name = $3,
                template_id = $4,
                trigger_type = $5,
                schedule_time = $6,
                timezone = $7,
                delay_minutes = $8,
                reply_to_step_id = $9,
                reply_filter = $10,
                updated_at = NOW()
            WHERE id = $1 AND campaign_id = $2
            RETURNING *
            "#,
        )
        .bind(step.id)
        .bind(step.campaign_id)
        .bind(&step.name)
        .bind(step.template_id)
        .bind(&step.trigger_type)
        .bind(step.schedule_time)
        .bind(&step.timezone)
        .bind(step.delay_minutes)
        .bind(step.reply_to_step_id)
        .bind(&step.reply_filter)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| Error::NotFound("step".to_string()))
    }

    async fn delete(&self, campaign_id: CampaignId, id: StepId) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM campaign_steps WHERE id = $1 AND campaign_id = $2")
                .bind(id)
                .bind(campaign_id)
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn reorder(&self, campaign_id: CampaignId, order: &[StepId]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        // Park orders out of the way first so the unique constraint
        // never trips mid-rewrite.
        sqlx::query(
            "UPDATE campaign_steps SET step_order = -step_order WHERE campaign_id = $1",
        )
        .bind(campaign_id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        for (idx, step_id) in order.iter().enumerate() {
            let result = sqlx::query(
                r#"
                UPDATE campaign_steps SET step_order = $3, updated_at = NOW()
                WHERE id = $1 AND campaign_id = $2
                "#,
            )
            .bind(step_id)
            .bind(campaign_id)
            .bind((idx + 1) as i32)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            if result.rows_affected() == 0 {
                return Err(Error::Validation(format!(
                    "Step {} does not belong to campaign {}",
                    step_id, campaign_id
                )));
            }
        }

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }
}
