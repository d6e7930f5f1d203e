//! Email job and engagement handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use dripline_common::types::{Page, PageRequest};
use dripline_common::Error;
use dripline_core::dispatch::EngagementEvent;
use dripline_storage::models::{EmailJob, JobStatus};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListEmailsQuery {
    pub status: Option<String>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

#[derive(Debug, Deserialize)]
pub struct EngagementRequest {
    pub event: EngagementEvent,
}

/// GET /api/v1/orgs/:org_id/campaigns/:campaign_id/steps/:step_id/emails
pub async fn list_step_emails(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id, step_id)): Path<(Uuid, Uuid, Uuid)>,
    Query(query): Query<ListEmailsQuery>,
) -> Result<Json<Page<EmailJob>>, ApiError> {
    let status = query
        .status
        .map(|s| {
            s.parse::<JobStatus>()
                .map_err(|_| Error::Validation(format!("Unknown job status '{}'", s)))
        })
        .transpose()?;

    let page = state
        .engine
        .get_step_emails(
            org_id,
            campaign_id,
            step_id,
            status,
            PageRequest {
                offset: query.offset,
                limit: query.limit,
            },
        )
        .await?;
    Ok(Json(page))
}

/// POST /api/v1/orgs/:org_id/jobs/:job_id/events
pub async fn record_engagement(
    State(state): State<Arc<AppState>>,
    Path((org_id, job_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<EngagementRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let updated = state
        .engine
        .record_engagement(org_id, job_id, input.event)
        .await?;
    // None means the event was dropped (tracking off, or it would
    // regress the job); that is a success to the caller
    Ok(Json(serde_json::json!({
        "applied": updated.is_some(),
        "job": updated,
    })))
}
