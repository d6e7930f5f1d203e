//! Campaign step handlers

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use dripline_core::engine::StepSpec;
use dripline_storage::models::CampaignStep;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    pub order: Vec<Uuid>,
}

/// GET /api/v1/orgs/:org_id/campaigns/:campaign_id/steps
pub async fn list_steps(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<Vec<CampaignStep>>, ApiError> {
    let steps = state.engine.list_steps(org_id, campaign_id).await?;
    Ok(Json(steps))
}

/// POST /api/v1/orgs/:org_id/campaigns/:campaign_id/steps
pub async fn add_step(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<StepSpec>,
) -> Result<(StatusCode, Json<CampaignStep>), ApiError> {
    let step = state.engine.add_step(org_id, campaign_id, input).await?;
    Ok((StatusCode::CREATED, Json(step)))
}

/// PUT /api/v1/orgs/:org_id/campaigns/:campaign_id/steps/:step_id
pub async fn update_step(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id, step_id)): Path<(Uuid, Uuid, Uuid)>,
    Json(input): Json<StepSpec>,
) -> Result<Json<CampaignStep>, ApiError> {
    let step = state
        .engine
        .update_step(org_id, campaign_id, step_id, input)
        .await?;
    Ok(Json(step))
}

/// DELETE /api/v1/orgs/:org_id/campaigns/:campaign_id/steps/:step_id
pub async fn delete_step(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id, step_id)): Path<(Uuid, Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    state.engine.delete_step(org_id, campaign_id, step_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/orgs/:org_id/campaigns/:campaign_id/steps/order
pub async fn reorder_steps(
    State(state): State<Arc<AppState>>,
    Path((org_id, campaign_id)): Path<(Uuid, Uuid)>,
    Json(input): Json<ReorderRequest>,
) -> Result<Json<Vec<CampaignStep>>, ApiError> {
    let steps = state
        .engine
        .reorder_steps(org_id, campaign_id, input.order)
        .await?;
    Ok(Json(steps))
}
