//! Dispatch boundary and outcome recording.
//!
//! The dispatcher hands a rendered email to a transport and reports
//! what happened; the recorder folds that report into the job lattice.
//! Both sides are idempotent against duplicates: an outcome for a job
//! that already settled is dropped, never an error.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dripline_common::config::SmtpConfig;
use dripline_common::types::JobId;
use dripline_common::{Error, Result};
use dripline_storage::models::{EmailJob, JobStatus};
use dripline_storage::store::EmailJobStore;
use lettre::message::{header::ContentType, Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::providers::RenderedEmail;
use crate::quota::QuotaLedger;

/// What happened to one send attempt
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Sent {
        message_id: Option<String>,
    },
    /// The receiving server rejected the address
    Bounced {
        reason: String,
    },
    /// Transport-level failure; `permanent` distinguishes rejections
    /// from infrastructure trouble in logs and error text
    Failed {
        error: String,
        permanent: bool,
    },
}

/// Transport boundary. Implementations must not panic on malformed
/// addresses; report them as outcomes.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, job: &EmailJob, to: &str, email: &RenderedEmail) -> DispatchOutcome;
}

/// Engagement signals arriving from the tracking pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngagementEvent {
    Delivered,
    Opened,
    Clicked,
    Replied,
    Unsubscribed,
    Complained,
}

impl EngagementEvent {
    pub fn as_status(self) -> JobStatus {
        match self {
            EngagementEvent::Delivered => JobStatus::Delivered,
            EngagementEvent::Opened => JobStatus::Opened,
            EngagementEvent::Clicked => JobStatus::Clicked,
            EngagementEvent::Replied => JobStatus::Replied,
            EngagementEvent::Unsubscribed => JobStatus::Unsubscribed,
            EngagementEvent::Complained => JobStatus::Complained,
        }
    }
}

impl std::str::FromStr for EngagementEvent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "delivered" => Ok(EngagementEvent::Delivered),
            "opened" => Ok(EngagementEvent::Opened),
            "clicked" => Ok(EngagementEvent::Clicked),
            "replied" => Ok(EngagementEvent::Replied),
            "unsubscribed" => Ok(EngagementEvent::Unsubscribed),
            "complained" => Ok(EngagementEvent::Complained),
            _ => Err(format!("Invalid engagement event: {}", s)),
        }
    }
}

/// Folds dispatch outcomes and engagement events into the job store.
#[derive(Clone)]
pub struct OutcomeRecorder {
    jobs: Arc<dyn EmailJobStore>,
    ledger: QuotaLedger,
}

impl OutcomeRecorder {
    pub fn new(jobs: Arc<dyn EmailJobStore>, ledger: QuotaLedger) -> Self {
        Self { jobs, ledger }
    }

    /// Record the outcome of a send attempt. Returns the updated job,
    /// or None if the job had already settled (duplicate report).
    pub async fn record_send_outcome(
        &self,
        job: &EmailJob,
        outcome: DispatchOutcome,
        at: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        let (to, error) = match &outcome {
            DispatchOutcome::Sent { message_id } => {
                debug!(job_id = %job.id, ?message_id, "send succeeded");
                (JobStatus::Sent, None)
            }
            DispatchOutcome::Bounced { reason } => {
                info!(job_id = %job.id, reason, "send bounced");
                (JobStatus::Bounced, Some(reason.as_str()))
            }
            DispatchOutcome::Failed { error, permanent } => {
                if *permanent {
                    error!(job_id = %job.id, error, "send failed permanently");
                } else {
                    warn!(job_id = %job.id, error, "send failed");
                }
                (JobStatus::Failed, Some(error.as_str()))
            }
        };

        let updated = self.jobs.transition(job.id, to, error, at).await?;
        if updated.is_none() {
            debug!(job_id = %job.id, status = %to, "outcome ignored, job already settled");
        }
        Ok(updated)
    }

    /// Record an engagement event against a job. Out-of-order or
    /// duplicate events that would regress the lattice are dropped.
    pub async fn record_engagement(
        &self,
        job_id: JobId,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> Result<Option<EmailJob>> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("email job {}", job_id)))?;

        let updated = self
            .jobs
            .transition(job.id, event.as_status(), None, at)
            .await?;
        if updated.is_none() {
            debug!(job_id = %job_id, ?event, "engagement event dropped, would regress status");
        }
        Ok(updated)
    }

    /// Fail jobs stuck in SENDING longer than `timeout` and give their
    /// quota back: the send never produced an outcome, so the
    /// reservation was speculative. Returns how many were failed.
    pub async fn sweep_timeouts(&self, timeout: Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - timeout;
        let stuck = self.jobs.list_sending_before(cutoff).await?;
        let mut failed = 0;

        for job in stuck {
            let updated = self
                .jobs
                .transition(job.id, JobStatus::Failed, Some("send timed out"), now)
                .await?;
            if updated.is_some() {
                failed += 1;
                self.ledger.release(job.user_id, job.quota_date, 1).await?;
                warn!(job_id = %job.id, "timed out in sending, quota released");
            }
        }
        Ok(failed)
    }
}

/// Dispatcher sending over SMTP via lettre.
pub struct SmtpDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpDispatcher {
    pub fn new(config: &SmtpConfig, from: &str) -> Result<Self> {
        let mut builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&config.host)
                .map_err(|e| Error::Config(format!("SMTP relay setup failed: {}", e)))?
        } else if config.use_starttls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| Error::Config(format!("SMTP STARTTLS setup failed: {}", e)))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };
        builder = builder
            .port(config.port)
            .timeout(Some(std::time::Duration::from_secs(config.timeout_secs)));

        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }

        let from = from
            .parse()
            .map_err(|e| Error::Config(format!("Invalid from address '{}': {}", from, e)))?;

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(&self, to: &str, email: &RenderedEmail) -> Result<Message> {
        let to: Mailbox = to
            .parse()
            .map_err(|e| Error::Validation(format!("Invalid recipient address: {}", e)))?;

        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&email.subject);

        let message = match (&email.html_body, &email.text_body) {
            (Some(html), Some(text)) => builder.multipart(MultiPart::alternative_plain_html(
                text.clone(),
                html.clone(),
            )),
            (Some(html), None) => builder
                .header(ContentType::TEXT_HTML)
                .body(html.clone()),
            (None, text) => builder
                .header(ContentType::TEXT_PLAIN)
                .body(text.clone().unwrap_or_default()),
        };
        message.map_err(|e| Error::Validation(format!("Failed to build message: {}", e)))
    }

    /// Bounce heuristics on the SMTP error text
    fn classify(error: &str) -> DispatchOutcome {
        let lower = error.to_lowercase();
        if lower.contains("5.1.1")
            || lower.contains("550")
            || lower.contains("user unknown")
            || lower.contains("no such user")
            || lower.contains("mailbox unavailable")
        {
            DispatchOutcome::Bounced {
                reason: error.to_string(),
            }
        } else if lower.contains("4")
            && (lower.contains("temporar") || lower.contains("try again") || lower.contains("421"))
        {
            DispatchOutcome::Failed {
                error: error.to_string(),
                permanent: false,
            }
        } else {
            DispatchOutcome::Failed {
                error: error.to_string(),
                permanent: true,
            }
        }
    }
}

#[async_trait]
impl Dispatcher for SmtpDispatcher {
    async fn send(&self, job: &EmailJob, to: &str, email: &RenderedEmail) -> DispatchOutcome {
        let message = match self.build_message(to, email) {
            Ok(message) => message,
            Err(e) => {
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                    permanent: true,
                }
            }
        };

        debug!(job_id = %job.id, to, "dispatching over smtp");
        match self.transport.send(message).await {
            Ok(response) => DispatchOutcome::Sent {
                message_id: response.message().next().map(|s| s.to_string()),
            },
            Err(e) => Self::classify(&e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::StaticPlans;
    use crate::testutil::{campaign as make_campaign, step as make_step};
    use crate::Stores;
    use dripline_common::config::QuotaConfig;
    use dripline_common::types::QuotaMode;
    use dripline_storage::models::NewEmailJob;
    use dripline_storage::store::QuotaStore;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    async fn recorder_fixture(limit: i32) -> (Stores, OutcomeRecorder, QuotaLedger) {
        let stores = Stores::in_memory();
        let ledger = QuotaLedger::new(
            stores.quota.clone(),
            Arc::new(StaticPlans::new(limit)),
            QuotaConfig::default(),
        );
        let recorder = OutcomeRecorder::new(stores.jobs.clone(), ledger.clone());
        (stores, recorder, ledger)
    }

    async fn seed_sending_job(stores: &Stores, ledger: &QuotaLedger, at: DateTime<Utc>) -> EmailJob {
        let campaign = stores.campaigns.insert(make_campaign()).await.unwrap();
        let step = stores
            .steps
            .insert(make_step(campaign.id, 1, 1.0))
            .await
            .unwrap();
        let day = ledger.ledger_day(at);
        ledger
            .reserve(campaign.user_id, day, 1, false, at)
            .await
            .unwrap();
        let jobs = stores
            .jobs
            .insert_many(vec![NewEmailJob {
                org_id: campaign.org_id,
                campaign_id: campaign.id,
                step_id: step.id,
                contact_id: Uuid::new_v4(),
                user_id: campaign.user_id,
                status: JobStatus::Queued,
                scheduled_send_at: at,
                quota_date: day,
            }])
            .await
            .unwrap();
        stores
            .jobs
            .transition(jobs[0].id, JobStatus::Sending, None, at)
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_sent_outcome_sets_sent_at() {
        let (stores, recorder, ledger) = recorder_fixture(10).await;
        let now = Utc::now();
        let job = seed_sending_job(&stores, &ledger, now).await;

        let updated = recorder
            .record_send_outcome(&job, DispatchOutcome::Sent { message_id: None }, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "sent");
        assert_eq!(updated.sent_at, Some(now));
    }

    #[tokio::test]
    async fn test_duplicate_outcome_is_dropped() {
        let (stores, recorder, ledger) = recorder_fixture(10).await;
        let now = Utc::now();
        let job = seed_sending_job(&stores, &ledger, now).await;

        recorder
            .record_send_outcome(&job, DispatchOutcome::Sent { message_id: None }, now)
            .await
            .unwrap();
        // A late bounce report for the same attempt cannot regress
        // the sent status
        let second = recorder
            .record_send_outcome(
                &job,
                DispatchOutcome::Bounced {
                    reason: "late report".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        assert!(second.is_none());

        let job = stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, "sent");
    }

    #[tokio::test]
    async fn test_engagement_ladder_and_out_of_order_drop() {
        let (stores, recorder, ledger) = recorder_fixture(10).await;
        let now = Utc::now();
        let job = seed_sending_job(&stores, &ledger, now).await;
        recorder
            .record_send_outcome(&job, DispatchOutcome::Sent { message_id: None }, now)
            .await
            .unwrap();

        let updated = recorder
            .record_engagement(job.id, EngagementEvent::Clicked, now)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, "clicked");

        // A late OPENED after CLICKED would regress; dropped
        let late = recorder
            .record_engagement(job.id, EngagementEvent::Opened, now)
            .await
            .unwrap();
        assert!(late.is_none());
        let job = stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, "clicked");
    }

    #[tokio::test]
    async fn test_engagement_on_failed_job_is_dropped() {
        let (stores, recorder, ledger) = recorder_fixture(10).await;
        let now = Utc::now();
        let job = seed_sending_job(&stores, &ledger, now).await;
        recorder
            .record_send_outcome(
                &job,
                DispatchOutcome::Failed {
                    error: "boom".to_string(),
                    permanent: true,
                },
                now,
            )
            .await
            .unwrap();

        let dropped = recorder
            .record_engagement(job.id, EngagementEvent::Opened, now)
            .await
            .unwrap();
        assert!(dropped.is_none());
    }

    #[tokio::test]
    async fn test_timeout_sweep_fails_job_and_releases_quota() {
        let (stores, recorder, ledger) = recorder_fixture(10).await;
        let started = Utc::now() - Duration::minutes(10);
        let job = seed_sending_job(&stores, &ledger, started).await;

        let now = Utc::now();
        let before = QuotaStore::get(&*stores.quota, job.user_id, job.quota_date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(before.used, 1);

        let failed = recorder
            .sweep_timeouts(Duration::minutes(2), now)
            .await
            .unwrap();
        assert_eq!(failed, 1);

        let job = stores.jobs.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, "failed");
        assert_eq!(job.last_error.as_deref(), Some("send timed out"));

        let after = QuotaStore::get(&*stores.quota, job.user_id, job.quota_date)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.used, 0);

        // Sweep again: nothing left to fail, quota untouched
        let failed = recorder
            .sweep_timeouts(Duration::minutes(2), now)
            .await
            .unwrap();
        assert_eq!(failed, 0);
    }

    #[test]
    fn test_smtp_error_classification() {
        assert!(matches!(
            SmtpDispatcher::classify("550 5.1.1 user unknown"),
            DispatchOutcome::Bounced { .. }
        ));
        assert!(matches!(
            SmtpDispatcher::classify("421 service temporarily unavailable"),
            DispatchOutcome::Failed {
                permanent: false,
                ..
            }
        ));
        assert!(matches!(
            SmtpDispatcher::classify("connection refused"),
            DispatchOutcome::Failed {
                permanent: true,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_quota_mode_preserved_for_deferred_materialization() {
        // quota_mode stored on the campaign row survives for later use
        let stores = Stores::in_memory();
        let campaign = stores.campaigns.insert(make_campaign()).await.unwrap();
        stores
            .campaigns
            .set_quota_mode(campaign.id, QuotaMode::AutoSpread)
            .await
            .unwrap();
        let campaign = stores
            .campaigns
            .get(campaign.org_id, campaign.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(campaign.quota_mode_enum(), QuotaMode::AutoSpread);
    }
}
