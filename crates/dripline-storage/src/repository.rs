//! PostgreSQL store implementations

pub mod campaigns;
pub mod email_jobs;
pub mod quota;
pub mod steps;

pub use campaigns::PgCampaignStore;
pub use email_jobs::PgEmailJobStore;
pub use quota::PgQuotaStore;
pub use steps::PgStepStore;

use crate::db::DatabasePool;

/// Bundle of all Postgres-backed stores over one pool
#[derive(Clone)]
pub struct PgStores {
    pub campaigns: PgCampaignStore,
    pub steps: PgStepStore,
    pub jobs: PgEmailJobStore,
    pub quota: PgQuotaStore,
}

impl PgStores {
    pub fn new(db: &DatabasePool) -> Self {
        let pool = db.pool().clone();
        Self {
            campaigns: PgCampaignStore::new(pool.clone()),
            steps: PgStepStore::new(pool.clone()),
            jobs: PgEmailJobStore::new(pool.clone()),
            quota: PgQuotaStore::new(pool),
        }
    }
}
