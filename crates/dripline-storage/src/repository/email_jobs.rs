//! Email job store, PostgreSQL backend

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dripline_common::types::{CampaignId, JobId, StepId};
use dripline_common::{Error, Result};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::models::{EmailJob, JobStatus, JobStatusCounts, NewEmailJob};
use crate::store::EmailJobStore;

#[derive(Clone)]
pub struct PgEmailJobStore {
    pool: PgPool,
}

impl PgEmailJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn db_err(e: sqlx::Error) -> Error {
    Error::Database(e.to_string())
}

fn counts_from_row(row: &sqlx::postgres::PgRow) -> JobStatusCounts {
    let get = |name: &str| row.get::<Option<i64>, _>(name).unwrap_or(0);
    JobStatusCounts {
        pending: get("pending"),
        queued: get("queued"),
        sending: get("sending"),
        sent: get("sent"),
        delivered: get("delivered"),
        opened: get("opened"),
        clicked: get("clicked"),
        replied: get("replied"),
        bounced: get("bounced"),
        failed: get("failed"),
        cancelled: get("cancelled"),
        complained: get("complained"),
        unsubscribed: get("unsubscribed"),
    }
}

const COUNTS_SELECT: &str = r#"
    COUNT(*) FILTER (WHERE status = 'pending') AS pending,
    COUNT(*) FILTER (WHERE status = 'queued') AS queued,
    COUNT(*) FILTER (WHERE status = 'sending') AS sending,
    COUNT(*) FILTER (WHERE status = 'sent') AS sent,
    COUNT(*) FILTER (WHERE status = 'delivered') AS delivered,
    COUNT(*) FILTER (WHERE status = 'opened') AS opened,
    COUNT(*) FILTER (WHERE status = 'clicked') AS clicked,
    COUNT(*) FILTER (WHERE status = 'replied') AS replied,
    COUNT(*) FILTER (WHERE status = 'bounced') AS bounced,
    COUNT(*) FILTER (WHERE status = 'failed') AS failed,
    COUNT(*) FILTER (WHERE status = 'cancelled') AS cancelled,
    COUNT(*) FILTER (WHERE status = 'complained') AS complained,
    COUNT(*) FILTER (WHERE status = 'unsubscribed') AS unsubscribed
"#;

#[async_trait]
impl EmailJobStore for PgEmailJobStore {
    async fn insert_many(&self, jobs: Vec<NewEmailJob>) -> Result<Vec<EmailJob>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut created = Vec::with_capacity(jobs.len());

        for job in jobs {
            let row = sqlx::query_as::<_, EmailJob>(
                r#"
                INSERT INTO email_jobs (
                    id, org_id, campaign_id, step_id, contact_id, user_id,
                    status, scheduled_send_at, quota_date
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(job.org_id)
            .bind(job.campaign_id)
            .bind(job.step_id)
            .bind(job.contact_id)
            .bind(job.user_id)
            .bind(job.status.to_string())
            .bind(job.scheduled_send_at)
            .bind(job.quota_date)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    Error::Integrity(format!(
                        "Job already exists for step {} contact {}",
                        job.step_id, job.contact_id
                    ))
                }
                _ => db_err(e),
            })?;
            created.push(row);
        }

        tx.commit().await.map_err(db_err)?;
        Ok(created)
    }

    async fn get(&self, id: JobId) -> Result<Option<EmailJob>> {
        sqlx::query_as::<_, EmailJob>("SELECT * FROM email_jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)
    }

    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            r#"
            SELECT * FROM email_jobs
            WHERE step_id = $1
            ORDER BY scheduled_send_at ASC, contact_id ASC
            "#,
        )
        .bind(step_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_by_step_paged(
        &self,
        step_id: StepId,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<EmailJob>, i64)> {
        let (jobs, total) = if let Some(status) = status {
            let jobs = sqlx::query_as::<_, EmailJob>(
                r#"
                SELECT * FROM email_jobs
                WHERE step_id = $1 AND status = $2
                ORDER BY scheduled_send_at ASC, contact_id ASC
                LIMIT $3 OFFSET $4
                "#,
            )
            .bind(step_id)
            .bind(status.to_string())
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let total: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM email_jobs WHERE step_id = $1 AND status = $2",
            )
            .bind(step_id)
            .bind(status.to_string())
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
            (jobs, total.0)
        } else {
            let jobs = sqlx::query_as::<_, EmailJob>(
                r#"
                SELECT * FROM email_jobs
                WHERE step_id = $1
                ORDER BY scheduled_send_at ASC, contact_id ASC
                LIMIT $2 OFFSET $3
                "#,
            )
            .bind(step_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

            let total: (i64,) =
                sqlx::query_as("SELECT COUNT(*) FROM email_jobs WHERE step_id = $1")
                    .bind(step_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(db_err)?;
            (jobs, total.0)
        };

        Ok((jobs, total))
    }

    async fn status_counts_by_campaign(
        &self,
        campaign_id: CampaignId,
    ) -> Result<JobStatusCounts> {
        let sql = format!(
            "SELECT {} FROM email_jobs WHERE campaign_id = $1",
            COUNTS_SELECT
        );
        let row = sqlx::query(&sql)
            .bind(campaign_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(counts_from_row(&row))
    }

    async fn status_counts_by_step(&self, step_id: StepId) -> Result<JobStatusCounts> {
        let sql = format!("SELECT {} FROM email_jobs WHERE step_id = $1", COUNTS_SELECT);
        let row = sqlx::query(&sql)
            .bind(step_id)
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(counts_from_row(&row))
    }

    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        // The status precondition lives in the WHERE clause so the
        // check and the write are one statement.
        let predecessors: Vec<String> = JobStatus::legal_predecessors(to)
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let sent_at = (to == JobStatus::Sent).then_some(at);

        sqlx::query_as::<_, EmailJob>(
            r#"
            UPDATE email_jobs SET
                status = $2,
                last_error = COALESCE($3, last_error),
                sent_at = COALESCE(sent_at, $4),
                updated_at = $5
            WHERE id = $1 AND status = ANY($6)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.to_string())
        .bind(error)
        .bind(sent_at)
        .bind(at)
        .bind(&predecessors)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>> {
        // SKIP LOCKED keeps concurrent workers from claiming the same
        // job twice.
        sqlx::query_as::<_, EmailJob>(
            r#"
            UPDATE email_jobs SET
                status = 'sending',
                updated_at = $1
            WHERE id IN (
                SELECT id FROM email_jobs
                WHERE status = 'queued' AND scheduled_send_at <= $1
                ORDER BY scheduled_send_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn cancel_sendable_chunk(
        &self,
        campaign_id: CampaignId,
        chunk: i64,
    ) -> Result<Vec<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            r#"
            UPDATE email_jobs SET
                status = 'cancelled',
                updated_at = NOW()
            WHERE id IN (
                SELECT id FROM email_jobs
                WHERE campaign_id = $1 AND status IN ('pending', 'queued')
                ORDER BY id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(campaign_id)
        .bind(chunk)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_cancelled_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            r#"
            SELECT * FROM email_jobs
            WHERE campaign_id = $1 AND status = 'cancelled'
            ORDER BY scheduled_send_at ASC, contact_id ASC
            "#,
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn requeue_cancelled(
        &self,
        id: JobId,
        scheduled_send_at: DateTime<Utc>,
        quota_date: NaiveDate,
    ) -> Result<Option<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            r#"
            UPDATE email_jobs SET
                status = 'queued',
                scheduled_send_at = $2,
                quota_date = $3,
                updated_at = NOW()
            WHERE id = $1 AND status = 'cancelled'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(scheduled_send_at)
        .bind(quota_date)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)
    }

    async fn list_sending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>> {
        sqlx::query_as::<_, EmailJob>(
            "SELECT * FROM email_jobs WHERE status = 'sending' AND updated_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)
    }
}
