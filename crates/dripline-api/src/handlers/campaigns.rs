//! Campaign handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use dripline_common::types::QuotaMode;
use dripline_core::engine::CampaignSpec;
use dripline_core::lifecycle::ActivationReport;
use dripline_core::progress::ProgressSnapshot;
use dripline_storage::models::Campaign;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

/// Body for activate and resume
#[derive(Debug, Default, Deserialize)]
pub struct ActivateRequest {
    #[serde(default)]
    pub quota_mode: QuotaMode,
}

/// POST /api/v1/orgs/:org_id/campaigns
pub async fn create_campaign(
    State(state): State<Arc<AppState>>,
    Path(org_id): Path<Uuid>,
    Json(input): Json<CampaignSpec>,
) -> Result<(StatusCode, Json<Campaign>), ApiError> {
    let campaign = state.engine.create_campaign(org_id, input).await?;
    Ok((StatusCode::CREATED, Json(campaign)))
}

/// GET /api/v1/orgs/:org_id/campaigns/:campaign_id
pub async fn get_campaign(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state.engine.get_campaign(org_id, campaign_id).await?;
    Ok(Json(campaign))
}

/// POST /api/v1/orgs/:org_id/campaigns/:campaign_id/activate
pub async fn activate_campaign(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
    input: Option<Json<ActivateRequest>>,
) -> Result<Json<ActivationReport>, ApiError> {
    let mode = input.map(|Json(i)| i.quota_mode).unwrap_or_default();
    let report = state.engine.activate(org_id, campaign_id, mode).await?;
    Ok(Json(report))
}

/// POST /api/v1/orgs/:org_id/campaigns/:campaign_id/pause
pub async fn pause_campaign(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state.engine.pause(org_id, campaign_id).await?;
    Ok(Json(campaign))
}

/// POST /api/v1/orgs/:org_id/campaigns/:campaign_id/resume
pub async fn resume_campaign(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
    input: Option<Json<ActivateRequest>>,
) -> Result<Json<ActivationReport>, ApiError> {
    let mode = input.map(|Json(i)| i.quota_mode).unwrap_or_default();
    let report = state.engine.resume(org_id, campaign_id, mode).await?;
    Ok(Json(report))
}

/// POST /api/v1/orgs/:org_id/campaigns/:campaign_id/cancel
pub async fn cancel_campaign(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Campaign>, ApiError> {
    let campaign = state.engine.cancel(org_id, campaign_id).await?;
    Ok(Json(campaign))
}

/// GET /api/v1/orgs/:org_id/campaigns/:campaign_id/progress
pub async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ProgressSnapshot>, ApiError> {
    let snapshot = state.engine.get_progress(org_id, campaign_id).await?;
    Ok(Json(snapshot))
}
