//! Delivery Worker - drains the job queue on an interval.
//!
//! Each cycle claims due jobs (atomically, so concurrent workers never
//! double-send), dispatches them with bounded concurrency, then runs
//! the maintenance sweeps: send timeouts, campaign completion, and
//! stale quota counters.

use chrono::{DateTime, Duration, Utc};
use dripline_common::config::WorkerConfig;
use dripline_common::Result;
use dripline_storage::models::EmailJob;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dispatch::{DispatchOutcome, Dispatcher, OutcomeRecorder};
use crate::lifecycle::CampaignLifecycle;
use crate::providers::{ContactListProvider, TemplateProvider};
use crate::quota::QuotaLedger;
use crate::Stores;

/// What one worker cycle did
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub claimed: usize,
    pub sent: usize,
    pub bounced: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub completed_campaigns: usize,
    pub purged_counters: u64,
}

pub struct DeliveryWorker {
    stores: Stores,
    contacts: Arc<dyn ContactListProvider>,
    templates: Arc<dyn TemplateProvider>,
    dispatcher: Arc<dyn Dispatcher>,
    recorder: OutcomeRecorder,
    lifecycle: Arc<CampaignLifecycle>,
    ledger: QuotaLedger,
    config: WorkerConfig,
}

impl DeliveryWorker {
    pub fn new(
        stores: Stores,
        contacts: Arc<dyn ContactListProvider>,
        templates: Arc<dyn TemplateProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        lifecycle: Arc<CampaignLifecycle>,
        config: WorkerConfig,
    ) -> Self {
        let ledger = lifecycle.ledger().clone();
        let recorder = OutcomeRecorder::new(stores.jobs.clone(), ledger.clone());
        Self {
            stores,
            contacts,
            templates,
            dispatcher,
            recorder,
            lifecycle,
            ledger,
            config,
        }
    }

    /// Run cycles until the task is dropped. One failed cycle is
    /// logged and the loop keeps going.
    pub async fn run(self: Arc<Self>) {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            batch_size = self.config.batch_size,
            "delivery worker started"
        );

        loop {
            interval.tick().await;
            match self.run_once(Utc::now()).await {
                Ok(stats) if stats.claimed > 0 || stats.completed_campaigns > 0 => {
                    info!(
                        claimed = stats.claimed,
                        sent = stats.sent,
                        bounced = stats.bounced,
                        failed = stats.failed,
                        completed = stats.completed_campaigns,
                        "worker cycle"
                    );
                }
                Ok(_) => {}
                Err(e) => error!("worker cycle failed: {}", e),
            }
        }
    }

    /// One full cycle at `now`. Exposed so tests and embedded runs can
    /// drive the worker without the timer.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CycleStats> {
        let mut stats = CycleStats::default();

        let claimed = self.stores.jobs.claim_due(now, self.config.batch_size).await?;
        stats.claimed = claimed.len();
        let touched_campaigns: HashSet<_> =
            claimed.iter().map(|job| (job.org_id, job.campaign_id)).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency_limit));
        let mut tasks = JoinSet::new();
        for job in claimed {
            let permit = semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else {
                // Semaphore never closes while we hold it; bail safely
                break;
            };
            let stores = self.stores.clone();
            let contacts = self.contacts.clone();
            let templates = self.templates.clone();
            let dispatcher = self.dispatcher.clone();
            let recorder = self.recorder.clone();
            tasks.spawn(async move {
                let _permit = permit;
                Self::deliver_one(stores, contacts, templates, dispatcher, recorder, job, now)
                    .await
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(outcome)) => match outcome {
                    DispatchOutcome::Sent { .. } => stats.sent += 1,
                    DispatchOutcome::Bounced { .. } => stats.bounced += 1,
                    DispatchOutcome::Failed { .. } => stats.failed += 1,
                },
                Ok(Err(e)) => {
                    stats.failed += 1;
                    error!("delivery task failed: {}", e);
                }
                Err(e) => {
                    stats.failed += 1;
                    error!("delivery task panicked: {}", e);
                }
            }
        }

        stats.timed_out = self
            .recorder
            .sweep_timeouts(Duration::seconds(self.config.send_timeout_secs as i64), now)
            .await?;

        for (org_id, campaign_id) in &touched_campaigns {
            if let Err(e) = self.lifecycle.progress().recompute(*org_id, *campaign_id).await {
                warn!(campaign_id = %campaign_id, "progress recompute failed: {}", e);
            }
        }

        stats.completed_campaigns = self.completion_sweep().await?;

        stats.purged_counters = self.ledger.purge_expired(now).await?;

        Ok(stats)
    }

    /// Advance reply steps and complete campaigns whose jobs have all
    /// settled.
    async fn completion_sweep(&self) -> Result<usize> {
        let active = self
            .stores
            .campaigns
            .list_by_status(dripline_storage::models::CampaignStatus::Active)
            .await?;
        let mut completed = 0;
        for campaign in active {
            match self
                .lifecycle
                .check_completion(campaign.org_id, campaign.id)
                .await
            {
                Ok(true) => completed += 1,
                Ok(false) => {}
                Err(e) => warn!(campaign_id = %campaign.id, "completion check failed: {}", e),
            }
        }
        Ok(completed)
    }

    /// Render and dispatch one claimed job, recording the outcome.
    async fn deliver_one(
        stores: Stores,
        contacts: Arc<dyn ContactListProvider>,
        templates: Arc<dyn TemplateProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        recorder: OutcomeRecorder,
        job: EmailJob,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome> {
        let outcome = Self::attempt(&stores, contacts, templates, dispatcher, &job).await;
        recorder
            .record_send_outcome(&job, outcome.clone(), now)
            .await?;
        Ok(outcome)
    }

    async fn attempt(
        stores: &Stores,
        contacts: Arc<dyn ContactListProvider>,
        templates: Arc<dyn TemplateProvider>,
        dispatcher: Arc<dyn Dispatcher>,
        job: &EmailJob,
    ) -> DispatchOutcome {
        let step = match stores.steps.get(job.campaign_id, job.step_id).await {
            Ok(Some(step)) => step,
            Ok(None) => {
                return DispatchOutcome::Failed {
                    error: format!("step {} no longer exists", job.step_id),
                    permanent: true,
                }
            }
            Err(e) => {
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                    permanent: false,
                }
            }
        };

        let email_address = match contacts.contact_email(job.contact_id).await {
            Ok(Some(address)) => address,
            Ok(None) => {
                return DispatchOutcome::Failed {
                    error: format!("contact {} has no email address", job.contact_id),
                    permanent: true,
                }
            }
            Err(e) => {
                return DispatchOutcome::Failed {
                    error: e.to_string(),
                    permanent: false,
                }
            }
        };

        let rendered = match templates.render(step.template_id, job.contact_id).await {
            Ok(rendered) => rendered,
            Err(e) => {
                return DispatchOutcome::Failed {
                    error: format!("template render failed: {}", e),
                    permanent: true,
                }
            }
        };

        debug!(job_id = %job.id, to = %email_address, "delivering");
        dispatcher.send(job, &email_address, &rendered).await
    }
}
