//! API routes

use axum::routing::{delete, get, post, put};
use axum::Router;
use dripline_core::Engine;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::handlers::{campaigns, health, jobs, quota, steps};
use crate::state::AppState;

/// Create the API router
pub fn create_router(engine: Arc<Engine>) -> Router {
    let state = Arc::new(AppState::new(engine));

    let health_routes = Router::new()
        .route("/", get(health::health))
        .route("/live", get(health::liveness))
        .route("/ready", get(health::readiness));

    let step_routes = Router::new()
        .route("/", get(steps::list_steps))
        .route("/", post(steps::add_step))
        .route("/order", put(steps::reorder_steps))
        .route("/:step_id", put(steps::update_step))
        .route("/:step_id", delete(steps::delete_step))
        .route("/:step_id/emails", get(jobs::list_step_emails));

    let campaign_routes = Router::new()
        .route("/", post(campaigns::create_campaign))
        .route("/:campaign_id", get(campaigns::get_campaign))
        .route("/:campaign_id/activate", post(campaigns::activate_campaign))
        .route("/:campaign_id/pause", post(campaigns::pause_campaign))
        .route("/:campaign_id/resume", post(campaigns::resume_campaign))
        .route("/:campaign_id/cancel", post(campaigns::cancel_campaign))
        .route("/:campaign_id/progress", get(campaigns::get_progress))
        .nest("/:campaign_id/steps", step_routes);

    let api_v1 = Router::new()
        .nest("/orgs/:org_id/campaigns", campaign_routes)
        .route("/orgs/:org_id/jobs/:job_id/events", post(jobs::record_engagement))
        .route("/orgs/:org_id/users/:user_id/quota", get(quota::get_quota));

    Router::new()
        .nest("/health", health_routes)
        .nest("/api/v1", api_v1)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum_test::TestServer;
    use dripline_common::config::QuotaConfig;
    use dripline_core::lifecycle::CampaignLifecycle;
    use dripline_core::providers::{LogSink, StaticContactDirectory, StaticPlans};
    use dripline_core::Stores;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};
    use uuid::Uuid;

    fn server(contact_list_id: Uuid, contacts: Vec<Uuid>, limit: i32) -> TestServer {
        let stores = Stores::in_memory();
        let directory = StaticContactDirectory::new().with_list(contact_list_id, contacts);
        let lifecycle = Arc::new(CampaignLifecycle::new(
            stores.clone(),
            Arc::new(directory),
            Arc::new(StaticPlans::new(limit)),
            Arc::new(LogSink),
            QuotaConfig::default(),
        ));
        let engine = Arc::new(Engine::new(stores, lifecycle));
        TestServer::new(create_router(engine)).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let server = server(Uuid::new_v4(), vec![], 10);
        let response = server.get("/health").await;
        response.assert_status_ok();
    }

    #[tokio::test]
    async fn test_campaign_crud_and_activation_flow() {
        let list_id = Uuid::new_v4();
        let contacts: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let server = server(list_id, contacts, 10);
        let org_id = Uuid::new_v4();

        let response = server
            .post(&format!("/api/v1/orgs/{}/campaigns", org_id))
            .json(&json!({
                "user_id": Uuid::new_v4(),
                "name": "onboarding",
                "contact_list_id": list_id,
            }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);
        let campaign: Value = response.json();
        let campaign_id = campaign["id"].as_str().unwrap().to_string();
        assert_eq!(campaign["status"], "draft");

        // Activating with no steps is a validation error
        let response = server
            .post(&format!(
                "/api/v1/orgs/{}/campaigns/{}/activate",
                org_id, campaign_id
            ))
            .await;
        response.assert_status(axum::http::StatusCode::UNPROCESSABLE_ENTITY);
        let error: Value = response.json();
        assert_eq!(error["error"], "VALIDATION_ERROR");

        let response = server
            .post(&format!(
                "/api/v1/orgs/{}/campaigns/{}/steps",
                org_id, campaign_id
            ))
            .json(&json!({
                "name": "welcome",
                "template_id": Uuid::new_v4(),
                "trigger_type": "immediate",
                "schedule_time": null,
                "timezone": null,
                "delay_minutes": 1.0,
                "reply_to_step_id": null,
                "reply_filter": null,
            }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);

        let response = server
            .post(&format!(
                "/api/v1/orgs/{}/campaigns/{}/activate",
                org_id, campaign_id
            ))
            .json(&json!({ "quota_mode": "restrict" }))
            .await;
        response.assert_status_ok();
        let report: Value = response.json();
        assert_eq!(report["campaign"]["status"], "active");
        assert_eq!(report["outcomes"][0]["queued"], 3);

        let response = server
            .get(&format!(
                "/api/v1/orgs/{}/campaigns/{}/progress",
                org_id, campaign_id
            ))
            .await;
        response.assert_status_ok();
        let progress: Value = response.json();
        assert_eq!(progress["total_expected"], 3);
        assert_eq!(progress["emails_completed"], 0);
    }

    #[tokio::test]
    async fn test_unknown_campaign_is_404() {
        let server = server(Uuid::new_v4(), vec![], 10);
        let response = server
            .get(&format!(
                "/api/v1/orgs/{}/campaigns/{}",
                Uuid::new_v4(),
                Uuid::new_v4()
            ))
            .await;
        response.assert_status(axum::http::StatusCode::NOT_FOUND);
        let error: Value = response.json();
        assert_eq!(error["error"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_quota_endpoint() {
        let server = server(Uuid::new_v4(), vec![], 25);
        let response = server
            .get(&format!(
                "/api/v1/orgs/{}/users/{}/quota",
                Uuid::new_v4(),
                Uuid::new_v4()
            ))
            .await;
        response.assert_status_ok();
        let stats: Value = response.json();
        assert_eq!(stats["limit"], 25);
        assert_eq!(stats["used"], 0);
        assert_eq!(stats["remaining"], 25);
    }

    #[tokio::test]
    async fn test_bad_status_filter_is_422() {
        let list_id = Uuid::new_v4();
        let server = server(list_id, vec![Uuid::new_v4()], 10);
        let org_id = Uuid::new_v4();

        let response = server
            .post(&format!("/api/v1/orgs/{}/campaigns", org_id))
            .json(&json!({
                "user_id": Uuid::new_v4(),
                "name": "c",
                "contact_list_id": list_id,
            }))
            .await;
        let campaign: Value = response.json();
        let campaign_id = campaign["id"].as_str().unwrap();

        let response = server
            .post(&format!(
                "/api/v1/orgs/{}/campaigns/{}/steps",
                org_id, campaign_id
            ))
            .json(&json!({
                "name": "s",
                "template_id": Uuid::new_v4(),
                "trigger_type": "immediate",
                "schedule_time": null,
                "timezone": null,
                "delay_minutes": 1.0,
                "reply_to_step_id": null,
                "reply_filter": null,
            }))
            .await;
        let step: Value = response.json();
        let step_id = step["id"].as_str().unwrap();

        let response = server
            .get(&format!(
                "/api/v1/orgs/{}/campaigns/{}/steps/{}/emails?status=bogus",
                org_id, campaign_id, step_id
            ))
            .await;
        response.assert_status(axum::http::StatusCode::UNPROCESSABLE_ENTITY);
    }
}
