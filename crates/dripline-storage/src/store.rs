//! Store traits the core scheduler operates over.
//!
//! Two implementations ship with this crate: the Postgres
//! repositories in [`crate::repository`] and the in-memory backend in
//! [`crate::memory`] used by tests and embedded runs.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use dripline_common::types::{CampaignId, JobId, OrgId, QuotaMode, StepId, UserId};
use dripline_common::Result;

use crate::models::{
    Campaign, CampaignStatus, CampaignStep, EmailJob, JobStatus, JobStatusCounts, NewEmailJob,
    QuotaCounter,
};

/// Campaign row access
#[async_trait]
pub trait CampaignStore: Send + Sync {
    async fn insert(&self, campaign: Campaign) -> Result<Campaign>;

    async fn get(&self, org_id: OrgId, id: CampaignId) -> Result<Option<Campaign>>;

    /// Name uniqueness within an organization backs the duplicate-name
    /// conflict check.
    async fn find_by_name(&self, org_id: OrgId, name: &str) -> Result<Option<Campaign>>;

    /// Conditional status update: applies only when the current status
    /// is `from`, so concurrent transitions cannot both win. Returns
    /// the updated row, or None if the precondition failed.
    /// `completed_at` is only ever set once.
    async fn transition_status(
        &self,
        id: CampaignId,
        from: CampaignStatus,
        to: CampaignStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<Campaign>>;

    async fn set_totals(
        &self,
        id: CampaignId,
        total_recipients: i32,
        total_steps: i32,
    ) -> Result<()>;

    async fn set_current_step(&self, id: CampaignId, current_step: i32) -> Result<()>;

    /// Record the quota policy chosen at activate/resume so deferred
    /// reply-step materialization can reuse it.
    async fn set_quota_mode(&self, id: CampaignId, mode: QuotaMode) -> Result<()>;

    /// Refresh the cached per-status counters from a recomputation.
    async fn update_counters(&self, id: CampaignId, counts: JobStatusCounts) -> Result<()>;

    /// Campaigns currently in the given status (for worker sweeps)
    async fn list_by_status(&self, status: CampaignStatus) -> Result<Vec<Campaign>>;
}

/// Campaign step access
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn insert(&self, step: CampaignStep) -> Result<CampaignStep>;

    async fn get(&self, campaign_id: CampaignId, id: StepId) -> Result<Option<CampaignStep>>;

    /// Steps of a campaign ordered by step_order ascending
    async fn list_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<CampaignStep>>;

    async fn update(&self, step: CampaignStep) -> Result<CampaignStep>;

    async fn delete(&self, campaign_id: CampaignId, id: StepId) -> Result<bool>;

    /// Rewrite step_order to match the given id sequence (1-based)
    async fn reorder(&self, campaign_id: CampaignId, order: &[StepId]) -> Result<()>;
}

/// Email job access
#[async_trait]
pub trait EmailJobStore: Send + Sync {
    /// Insert a batch of jobs. Fails with an integrity error if any
    /// (step, contact) pair already has a job.
    async fn insert_many(&self, jobs: Vec<NewEmailJob>) -> Result<Vec<EmailJob>>;

    async fn get(&self, id: JobId) -> Result<Option<EmailJob>>;

    /// All jobs for a step (resolver idempotency and reply gating)
    async fn list_by_step(&self, step_id: StepId) -> Result<Vec<EmailJob>>;

    /// Jobs for a step filtered by status, paged, ordered by
    /// scheduled_send_at ascending
    async fn list_by_step_paged(
        &self,
        step_id: StepId,
        status: Option<JobStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<(Vec<EmailJob>, i64)>;

    async fn status_counts_by_campaign(&self, campaign_id: CampaignId)
        -> Result<JobStatusCounts>;

    async fn status_counts_by_step(&self, step_id: StepId) -> Result<JobStatusCounts>;

    /// Conditional transition: applies only if the job's current
    /// status may legally move to `to`. Returns the updated job, or
    /// None when the transition was not applicable (already there, or
    /// illegal). The check and the write are atomic.
    async fn transition(
        &self,
        id: JobId,
        to: JobStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<Option<EmailJob>>;

    /// Atomically claim up to `limit` due QUEUED jobs, moving them to
    /// SENDING. Concurrent workers never claim the same job twice.
    async fn claim_due(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<EmailJob>>;

    /// Cancel up to `chunk` PENDING/QUEUED jobs of a campaign,
    /// returning the cancelled rows so quota can be released. Callers
    /// loop until an empty chunk comes back.
    async fn cancel_sendable_chunk(
        &self,
        campaign_id: CampaignId,
        chunk: i64,
    ) -> Result<Vec<EmailJob>>;

    /// Cancelled jobs of a campaign (pause leftovers eligible for
    /// re-queueing on resume)
    async fn list_cancelled_by_campaign(&self, campaign_id: CampaignId) -> Result<Vec<EmailJob>>;

    /// Re-queue a cancelled job with a fresh schedule and quota day.
    /// Cancelled is terminal in the lattice; this is the one
    /// deliberate exception, only reachable from a paused campaign's
    /// resume path.
    async fn requeue_cancelled(
        &self,
        id: JobId,
        scheduled_send_at: DateTime<Utc>,
        quota_date: NaiveDate,
    ) -> Result<Option<EmailJob>>;

    /// Jobs stuck in SENDING since before `cutoff` (timeout sweep)
    async fn list_sending_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<EmailJob>>;
}

/// Quota counter access.
///
/// `try_reserve` is the linearization point for concurrent
/// reservations: one conditional increment, never read-then-write.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn get(&self, user_id: UserId, date: NaiveDate) -> Result<Option<QuotaCounter>>;

    /// Atomically reserve up to `count` sends against (user, date)
    /// with ceiling `limit`. With `allow_partial` the grant may be
    /// less than requested (down to 0); without it the reservation is
    /// all-or-nothing. Returns the granted count.
    async fn try_reserve(
        &self,
        user_id: UserId,
        date: NaiveDate,
        count: i32,
        limit: i32,
        allow_partial: bool,
    ) -> Result<i32>;

    /// Decrement `used`, never below 0.
    async fn release(&self, user_id: UserId, date: NaiveDate, count: i32) -> Result<()>;

    /// Drop counters older than `before` (periodic cleanup)
    async fn purge_before(&self, before: NaiveDate) -> Result<u64>;
}
