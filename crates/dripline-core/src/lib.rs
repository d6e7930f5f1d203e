//! Dripline Core - Campaign execution scheduler
//!
//! This crate turns a campaign definition (contact list x ordered
//! steps) into a time-ordered stream of individual email sends while
//! respecting per-user daily quotas, supporting pause/resume without
//! data loss, and reporting incremental progress.

pub mod dispatch;
pub mod engine;
pub mod lifecycle;
pub mod materializer;
pub mod progress;
pub mod providers;
pub mod quota;
pub mod resolver;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use dispatch::{DispatchOutcome, Dispatcher, EngagementEvent, OutcomeRecorder, SmtpDispatcher};
pub use engine::{CampaignSpec, Engine, StepSpec};
pub use lifecycle::{ActivationReport, CampaignLifecycle};
pub use materializer::{MaterializeOutcome, Materializer};
pub use progress::{ProgressAggregator, ProgressSnapshot, StepProgress};
pub use providers::{
    ContactListProvider, NotificationSink, PlanProvider, RenderedEmail, SchedulerEvent,
    TemplateProvider,
};
pub use quota::{QuotaLedger, QuotaStats};
pub use resolver::{PlannedSend, Resolution, StepResolution};
pub use worker::{CycleStats, DeliveryWorker};

use dripline_storage::store::{CampaignStore, EmailJobStore, QuotaStore, StepStore};
use std::sync::Arc;

/// Bundle of the store handles the scheduler operates over. Both the
/// Postgres repositories and the in-memory backend fit behind these.
#[derive(Clone)]
pub struct Stores {
    pub campaigns: Arc<dyn CampaignStore>,
    pub steps: Arc<dyn StepStore>,
    pub jobs: Arc<dyn EmailJobStore>,
    pub quota: Arc<dyn QuotaStore>,
}

impl Stores {
    /// All four stores backed by a single in-memory instance
    pub fn in_memory() -> Self {
        let store = dripline_storage::MemoryStore::new();
        Self {
            campaigns: Arc::new(store.clone()),
            steps: Arc::new(store.clone()),
            jobs: Arc::new(store.clone()),
            quota: Arc::new(store),
        }
    }
}
