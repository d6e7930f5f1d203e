//! Boundary contracts the scheduler consumes.
//!
//! Contact lists, subscription plans, template rendering, and the
//! notification sink live outside this crate; the scheduler only sees
//! these traits. Static implementations are provided for tests and
//! embedded runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dripline_common::types::{CampaignId, ContactId, ContactListId, StepId, TemplateId, UserId};
use dripline_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Rendered email content, produced once per job at actual send time
#[derive(Debug, Clone)]
pub struct RenderedEmail {
    pub subject: String,
    pub html_body: Option<String>,
    pub text_body: Option<String>,
}

/// Source of contact-list membership. Soft-deleted and
/// organization-level unsubscribed contacts are already excluded here.
#[async_trait]
pub trait ContactListProvider: Send + Sync {
    /// Members of the list, order unspecified
    async fn list_members(&self, list_id: ContactListId) -> Result<Vec<ContactId>>;

    async fn contact_count(&self, list_id: ContactListId) -> Result<i64>;

    /// Deliverable address for a contact, if one exists
    async fn contact_email(&self, contact_id: ContactId) -> Result<Option<String>>;
}

/// Source of the per-user daily sending limit (subscription plan)
#[async_trait]
pub trait PlanProvider: Send + Sync {
    async fn daily_email_limit(&self, user_id: UserId) -> Result<i32>;
}

/// Renders template content for a specific contact
#[async_trait]
pub trait TemplateProvider: Send + Sync {
    async fn render(&self, template_id: TemplateId, contact_id: ContactId)
        -> Result<RenderedEmail>;
}

/// Fire-and-forget events emitted on state transitions. Sink failures
/// never roll back a transition, so `publish` is infallible; sinks
/// log their own trouble.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, event: SchedulerEvent);
}

/// Events emitted to the notification sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    CampaignActivated {
        campaign_id: CampaignId,
        queued: usize,
        restricted: usize,
        at: DateTime<Utc>,
    },
    CampaignPaused {
        campaign_id: CampaignId,
        cancelled_jobs: usize,
        at: DateTime<Utc>,
    },
    CampaignResumed {
        campaign_id: CampaignId,
        requeued: usize,
        restricted: usize,
        at: DateTime<Utc>,
    },
    CampaignCompleted {
        campaign_id: CampaignId,
        at: DateTime<Utc>,
    },
    CampaignCancelled {
        campaign_id: CampaignId,
        cancelled_jobs: usize,
        at: DateTime<Utc>,
    },
    OverdueStepsDetected {
        campaign_id: CampaignId,
        step_ids: Vec<StepId>,
        at: DateTime<Utc>,
    },
}

/// Sink that logs events through tracing
#[derive(Debug, Clone, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, event: SchedulerEvent) {
        info!(?event, "scheduler event");
    }
}

/// Sink that collects events in memory, for tests and embedded runs
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<SchedulerEvent>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<SchedulerEvent> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    async fn publish(&self, event: SchedulerEvent) {
        self.events.lock().await.push(event);
    }
}

/// Fixed contact directory backed by maps
#[derive(Clone, Default)]
pub struct StaticContactDirectory {
    lists: HashMap<ContactListId, Vec<ContactId>>,
    emails: HashMap<ContactId, String>,
}

impl StaticContactDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_list(mut self, list_id: ContactListId, contacts: Vec<ContactId>) -> Self {
        for contact in &contacts {
            self.emails
                .entry(*contact)
                .or_insert_with(|| format!("{}@example.test", contact));
        }
        self.lists.insert(list_id, contacts);
        self
    }

    pub fn with_email(mut self, contact_id: ContactId, email: impl Into<String>) -> Self {
        self.emails.insert(contact_id, email.into());
        self
    }
}

#[async_trait]
impl ContactListProvider for StaticContactDirectory {
    async fn list_members(&self, list_id: ContactListId) -> Result<Vec<ContactId>> {
        Ok(self.lists.get(&list_id).cloned().unwrap_or_default())
    }

    async fn contact_count(&self, list_id: ContactListId) -> Result<i64> {
        Ok(self.lists.get(&list_id).map_or(0, |l| l.len() as i64))
    }

    async fn contact_email(&self, contact_id: ContactId) -> Result<Option<String>> {
        Ok(self.emails.get(&contact_id).cloned())
    }
}

/// Plan provider with one limit for everyone, plus per-user overrides
#[derive(Clone)]
pub struct StaticPlans {
    default_limit: i32,
    overrides: HashMap<UserId, i32>,
}

impl StaticPlans {
    pub fn new(default_limit: i32) -> Self {
        Self {
            default_limit,
            overrides: HashMap::new(),
        }
    }

    pub fn with_limit(mut self, user_id: UserId, limit: i32) -> Self {
        self.overrides.insert(user_id, limit);
        self
    }
}

#[async_trait]
impl PlanProvider for StaticPlans {
    async fn daily_email_limit(&self, user_id: UserId) -> Result<i32> {
        Ok(self
            .overrides
            .get(&user_id)
            .copied()
            .unwrap_or(self.default_limit))
    }
}

/// Template provider producing placeholder content
#[derive(Debug, Clone, Default)]
pub struct StaticTemplates;

#[async_trait]
impl TemplateProvider for StaticTemplates {
    async fn render(
        &self,
        template_id: TemplateId,
        contact_id: ContactId,
    ) -> Result<RenderedEmail> {
        Ok(RenderedEmail {
            subject: format!("Template {}", template_id),
            html_body: None,
            text_body: Some(format!("Hello {}", contact_id)),
        })
    }
}
