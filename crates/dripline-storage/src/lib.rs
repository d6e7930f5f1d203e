//! Dripline Storage - persisted state for the campaign scheduler
//!
//! This crate provides the Campaign/CampaignStep/EmailJob/QuotaCounter
//! models, the store traits the core scheduler operates over, a
//! PostgreSQL backend, and an in-memory backend used for tests and
//! embedded operation.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;
pub mod store;

pub use db::{Database, DatabasePool};
pub use memory::MemoryStore;
pub use models::*;
pub use repository::{
    PgCampaignStore, PgEmailJobStore, PgQuotaStore, PgStepStore, PgStores,
};
pub use store::{CampaignStore, EmailJobStore, QuotaStore, StepStore};
