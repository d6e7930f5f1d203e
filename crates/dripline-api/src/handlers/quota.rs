//! Quota handlers

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::NaiveDate;
use dripline_core::quota::QuotaStats;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct QuotaQuery {
    pub date: Option<NaiveDate>,
}

/// GET /api/v1/orgs/:org_id/users/:user_id/quota
pub async fn get_quota(
    State(state): State<Arc<AppState>>,
    Path((_org_id, user_id)): Path<(Uuid, Uuid)>,
    Query(query): Query<QuotaQuery>,
) -> Result<Json<QuotaStats>, ApiError> {
    let stats = state.engine.quota_stats(user_id, query.date).await?;
    Ok(Json(stats))
}
