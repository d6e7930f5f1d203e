//! Persisted models for the campaign scheduler

use chrono::{DateTime, NaiveDate, Utc};
use dripline_common::types::{
    CampaignId, ContactId, ContactListId, JobId, OrgId, QuotaMode, StepId, TemplateId, UserId,
};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Campaign status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl CampaignStatus {
    /// Transitions are monotone except the ACTIVE <-> PAUSED pair.
    pub fn can_transition_to(self, to: CampaignStatus) -> bool {
        use CampaignStatus::*;
        match (self, to) {
            (Draft, Active) => true,
            (Active, Paused) => true,
            (Paused, Active) => true,
            (Active, Completed) => true,
            (Draft | Active | Paused, Cancelled) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CampaignStatus::Completed | CampaignStatus::Cancelled)
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CampaignStatus::Draft => write!(f, "draft"),
            CampaignStatus::Active => write!(f, "active"),
            CampaignStatus::Paused => write!(f, "paused"),
            CampaignStatus::Completed => write!(f, "completed"),
            CampaignStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for CampaignStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(CampaignStatus::Draft),
            "active" => Ok(CampaignStatus::Active),
            "paused" => Ok(CampaignStatus::Paused),
            "completed" => Ok(CampaignStatus::Completed),
            "cancelled" => Ok(CampaignStatus::Cancelled),
            _ => Err(format!("Invalid campaign status: {}", s)),
        }
    }
}

/// Campaign model
///
/// Per-status counters are a cache derived from the EmailJob set,
/// never the source of truth.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub org_id: OrgId,
    /// Sending identity the daily quota is charged against
    pub user_id: UserId,
    pub name: String,
    pub contact_list_id: ContactListId,
    pub status: String,
    /// Quota policy selected at the last activate/resume; later
    /// reply-step materialization by the worker reuses it
    pub quota_mode: String,
    pub total_recipients: i32,
    pub total_steps: i32,
    pub current_step: i32,
    pub sent_count: i32,
    pub delivered_count: i32,
    pub opened_count: i32,
    pub clicked_count: i32,
    pub replied_count: i32,
    pub bounced_count: i32,
    pub failed_count: i32,
    pub cancelled_count: i32,
    pub complained_count: i32,
    pub unsubscribed_count: i32,
    pub track_opens: bool,
    pub track_clicks: bool,
    pub track_unsubscribes: bool,
    pub unsubscribe_on_reply: bool,
    pub auto_advance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Set once, immutable afterwards
    pub completed_at: Option<DateTime<Utc>>,
}

impl Campaign {
    pub fn status_enum(&self) -> Option<CampaignStatus> {
        self.status.parse().ok()
    }

    pub fn quota_mode_enum(&self) -> QuotaMode {
        self.quota_mode.parse().unwrap_or_default()
    }
}

/// Step trigger type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Send starting at the activation instant
    Immediate,
    /// Send starting at a declared wall-clock instant
    Schedule,
}

impl std::fmt::Display for TriggerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TriggerType::Immediate => write!(f, "immediate"),
            TriggerType::Schedule => write!(f, "schedule"),
        }
    }
}

impl std::str::FromStr for TriggerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "immediate" => Ok(TriggerType::Immediate),
            "schedule" => Ok(TriggerType::Schedule),
            _ => Err(format!("Invalid trigger type: {}", s)),
        }
    }
}

/// Reply-step audience filter: which outcome on the target step makes
/// a contact eligible for this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyFilter {
    /// Any non-bounced terminal outcome
    Sent,
    /// Reached OPENED (clicked/replied imply opened)
    Opened,
    /// Reached CLICKED (replied implies clicked)
    Clicked,
}

impl std::fmt::Display for ReplyFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyFilter::Sent => write!(f, "sent"),
            ReplyFilter::Opened => write!(f, "opened"),
            ReplyFilter::Clicked => write!(f, "clicked"),
        }
    }
}

impl std::str::FromStr for ReplyFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(ReplyFilter::Sent),
            "opened" => Ok(ReplyFilter::Opened),
            "clicked" => Ok(ReplyFilter::Clicked),
            _ => Err(format!("Invalid reply filter: {}", s)),
        }
    }
}

/// Campaign step model
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct CampaignStep {
    pub id: StepId,
    pub campaign_id: CampaignId,
    pub name: String,
    pub template_id: TemplateId,
    /// Unique within the campaign, defines the total order
    pub step_order: i32,
    pub trigger_type: String,
    /// UTC instant, required iff trigger_type = schedule
    pub schedule_time: Option<DateTime<Utc>>,
    /// IANA zone name used to interpret and display schedule_time
    pub timezone: Option<String>,
    /// Spacing between consecutive sends within the step (>= 0.5)
    pub delay_minutes: f64,
    /// Back-reference to an earlier step in the same campaign
    pub reply_to_step_id: Option<StepId>,
    /// Required iff reply_to_step_id is set
    pub reply_filter: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CampaignStep {
    pub fn trigger_type_enum(&self) -> Option<TriggerType> {
        self.trigger_type.parse().ok()
    }

    pub fn reply_filter_enum(&self) -> Option<ReplyFilter> {
        self.reply_filter.as_deref().and_then(|s| s.parse().ok())
    }

    pub fn is_reply_step(&self) -> bool {
        self.reply_to_step_id.is_some()
    }
}

/// Email job status.
///
/// A flat string in the row, but code operates on the explicit
/// partial order: PENDING < QUEUED < SENDING < terminal band
/// {SENT, BOUNCED, FAILED, CANCELLED, COMPLAINED} < engagement band
/// {DELIVERED, OPENED, CLICKED, REPLIED, UNSUBSCRIBED}. A job never
/// regresses, and engagement is only reachable through SENT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Sending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Failed,
    Cancelled,
    Complained,
    Unsubscribed,
}

impl JobStatus {
    /// Rank in the partial order. Statuses in the same band share a
    /// rank; transitions within a band are only allowed along the
    /// engagement ladder (delivered -> opened -> clicked -> replied).
    pub fn rank(self) -> u8 {
        use JobStatus::*;
        match self {
            Pending => 0,
            Queued => 1,
            Sending => 2,
            Sent | Bounced | Failed | Cancelled | Complained => 3,
            Delivered => 4,
            Opened => 5,
            Clicked => 6,
            Replied | Unsubscribed => 7,
        }
    }

    /// A job that has left the sendable pipeline (quota/progress view)
    pub fn is_terminal(self) -> bool {
        self.rank() >= 3
    }

    /// Still waiting to be handed to the dispatcher
    pub fn is_sendable(self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Queued)
    }

    /// The job actually went out (engagement events layer on top)
    pub fn is_sent_lineage(self) -> bool {
        matches!(
            self,
            JobStatus::Sent
                | JobStatus::Delivered
                | JobStatus::Opened
                | JobStatus::Clicked
                | JobStatus::Replied
                | JobStatus::Unsubscribed
        )
    }

    /// Dead ends that can never gain engagement events
    pub fn is_dead(self) -> bool {
        matches!(
            self,
            JobStatus::Bounced | JobStatus::Failed | JobStatus::Cancelled | JobStatus::Complained
        )
    }

    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(self, to: JobStatus) -> bool {
        use JobStatus::*;
        if self == to {
            return false;
        }
        match (self, to) {
            (Pending, Queued) | (Pending, Cancelled) => true,
            (Queued, Sending) | (Queued, Cancelled) => true,
            (Sending, Sent) | (Sending, Bounced) | (Sending, Failed) => true,
            // Engagement ladder over a sent job
            (Sent, Delivered | Opened | Clicked | Replied | Unsubscribed | Complained) => true,
            (Delivered, Opened | Clicked | Replied | Unsubscribed | Complained) => true,
            (Opened, Clicked | Replied | Unsubscribed) => true,
            (Clicked, Replied | Unsubscribed) => true,
            _ => false,
        }
    }

    /// The statuses from which `to` may legally be reached. Used by
    /// conditional SQL updates so the check and the write are one
    /// statement.
    pub fn legal_predecessors(to: JobStatus) -> Vec<JobStatus> {
        use JobStatus::*;
        [
            Pending,
            Queued,
            Sending,
            Sent,
            Delivered,
            Opened,
            Clicked,
            Replied,
            Bounced,
            Failed,
            Cancelled,
            Complained,
            Unsubscribed,
        ]
        .into_iter()
        .filter(|from| from.can_transition_to(to))
        .collect()
    }

    /// Whether this status satisfies a reply-step audience filter.
    pub fn matches_reply_filter(self, filter: ReplyFilter) -> bool {
        match filter {
            ReplyFilter::Sent => self.is_sent_lineage(),
            ReplyFilter::Opened => matches!(
                self,
                JobStatus::Opened | JobStatus::Clicked | JobStatus::Replied
            ),
            ReplyFilter::Clicked => matches!(self, JobStatus::Clicked | JobStatus::Replied),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Sending => "sending",
            JobStatus::Sent => "sent",
            JobStatus::Delivered => "delivered",
            JobStatus::Opened => "opened",
            JobStatus::Clicked => "clicked",
            JobStatus::Replied => "replied",
            JobStatus::Bounced => "bounced",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
            JobStatus::Complained => "complained",
            JobStatus::Unsubscribed => "unsubscribed",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "queued" => Ok(JobStatus::Queued),
            "sending" => Ok(JobStatus::Sending),
            "sent" => Ok(JobStatus::Sent),
            "delivered" => Ok(JobStatus::Delivered),
            "opened" => Ok(JobStatus::Opened),
            "clicked" => Ok(JobStatus::Clicked),
            "replied" => Ok(JobStatus::Replied),
            "bounced" => Ok(JobStatus::Bounced),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            "complained" => Ok(JobStatus::Complained),
            "unsubscribed" => Ok(JobStatus::Unsubscribed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Email job: one (campaign, step, contact) send. At most one job per
/// (step, contact) pair, enforced by the stores.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct EmailJob {
    pub id: JobId,
    pub org_id: OrgId,
    pub campaign_id: CampaignId,
    pub step_id: StepId,
    pub contact_id: ContactId,
    /// Sending identity whose quota this job consumed
    pub user_id: UserId,
    pub status: String,
    /// UTC instant this job becomes eligible to leave the queue
    pub scheduled_send_at: DateTime<Utc>,
    /// Ledger day the quota reservation was booked under; needed to
    /// release the right counter on cancellation
    pub quota_date: NaiveDate,
    pub last_error: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EmailJob {
    pub fn status_enum(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}

/// Input for creating an email job
#[derive(Debug, Clone)]
pub struct NewEmailJob {
    pub org_id: OrgId,
    pub campaign_id: CampaignId,
    pub step_id: StepId,
    pub contact_id: ContactId,
    pub user_id: UserId,
    pub status: JobStatus,
    pub scheduled_send_at: DateTime<Utc>,
    pub quota_date: NaiveDate,
}

/// Per-user per-day quota counter. Created lazily; one row per
/// (user_id, date).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct QuotaCounter {
    pub user_id: UserId,
    /// Calendar day in the ledger's reference offset
    pub date: NaiveDate,
    pub used: i32,
    pub limit_value: i32,
    pub updated_at: DateTime<Utc>,
}

/// Job counts by status for a campaign or step
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusCounts {
    pub pending: i64,
    pub queued: i64,
    pub sending: i64,
    pub sent: i64,
    pub delivered: i64,
    pub opened: i64,
    pub clicked: i64,
    pub replied: i64,
    pub bounced: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub complained: i64,
    pub unsubscribed: i64,
}

impl JobStatusCounts {
    pub fn add(&mut self, status: JobStatus, n: i64) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Queued => self.queued += n,
            JobStatus::Sending => self.sending += n,
            JobStatus::Sent => self.sent += n,
            JobStatus::Delivered => self.delivered += n,
            JobStatus::Opened => self.opened += n,
            JobStatus::Clicked => self.clicked += n,
            JobStatus::Replied => self.replied += n,
            JobStatus::Bounced => self.bounced += n,
            JobStatus::Failed => self.failed += n,
            JobStatus::Cancelled => self.cancelled += n,
            JobStatus::Complained => self.complained += n,
            JobStatus::Unsubscribed => self.unsubscribed += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending
            + self.queued
            + self.sending
            + self.sent
            + self.delivered
            + self.opened
            + self.clicked
            + self.replied
            + self.bounced
            + self.failed
            + self.cancelled
            + self.complained
            + self.unsubscribed
    }

    /// Jobs that actually went out, regardless of later engagement
    pub fn sent_lineage(&self) -> i64 {
        self.sent + self.delivered + self.opened + self.clicked + self.replied + self.unsubscribed
    }

    /// Jobs done for progress purposes: left the sendable pipeline and
    /// were not withdrawn by cancellation.
    pub fn completed(&self) -> i64 {
        self.sent_lineage() + self.bounced + self.failed + self.complained
    }

    /// Jobs counted toward the expected total (cancelled jobs are
    /// withdrawn from both sides of the ratio)
    pub fn expected(&self) -> i64 {
        self.total() - self.cancelled
    }

    /// Jobs with no further transition possible or plausible
    pub fn unresolved(&self) -> i64 {
        self.pending + self.queued + self.sending
    }
}
