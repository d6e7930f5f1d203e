//! Common types for Dripline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for organizations
pub type OrgId = Uuid;

/// Unique identifier for users (the sending identity quota is keyed on)
pub type UserId = Uuid;

/// Unique identifier for campaigns
pub type CampaignId = Uuid;

/// Unique identifier for campaign steps
pub type StepId = Uuid;

/// Unique identifier for contacts
pub type ContactId = Uuid;

/// Unique identifier for contact lists
pub type ContactListId = Uuid;

/// Unique identifier for email templates
pub type TemplateId = Uuid;

/// Unique identifier for email jobs
pub type JobId = Uuid;

/// Timestamp wrapper
pub type Timestamp = DateTime<Utc>;

/// Quota-exceeded policy selected by the caller at activation/resume.
///
/// Modeled as a strategy type rather than a string flag so additional
/// policies can be added without touching call sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMode {
    /// Withhold contacts beyond the day's remaining quota and report
    /// them back as restricted.
    #[default]
    Restrict,
    /// Push overflow onto the earliest subsequent day with remaining
    /// quota, preserving relative ordering and spacing.
    AutoSpread,
}

impl std::fmt::Display for QuotaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuotaMode::Restrict => write!(f, "restrict"),
            QuotaMode::AutoSpread => write!(f, "auto_spread"),
        }
    }
}

impl std::str::FromStr for QuotaMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "restrict" => Ok(QuotaMode::Restrict),
            "auto_spread" => Ok(QuotaMode::AutoSpread),
            _ => Err(format!("Invalid quota mode: {}", s)),
        }
    }
}

/// Page request for listing endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRequest {
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_page_limit")]
    pub limit: i64,
}

fn default_page_limit() -> i64 {
    50
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: default_page_limit(),
        }
    }
}

/// Paginated response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub offset: i64,
    pub limit: i64,
}
