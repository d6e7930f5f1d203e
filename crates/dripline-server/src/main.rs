//! Dripline - Campaign scheduler entry point

use anyhow::Result;
use dripline_common::config::{Config, LoggingConfig};
use dripline_core::lifecycle::CampaignLifecycle;
use dripline_core::providers::{LogSink, StaticContactDirectory, StaticPlans, StaticTemplates};
use dripline_core::{DeliveryWorker, Engine, SmtpDispatcher, Stores};
use dripline_storage::{DatabasePool, PgStores};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Stand-in plan limit for embedded runs; a billing integration
/// replaces the static provider in a real deployment
const EMBEDDED_DAILY_LIMIT: i32 = 500;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_logging(&config.logging);

    info!("Starting Dripline scheduler...");

    let stores = build_stores(&config).await?;

    // Boundary providers. The static implementations serve embedded
    // and development runs; production deployments wire their own
    // directory, plan, and template services here.
    let contacts = Arc::new(StaticContactDirectory::new());
    let plans = Arc::new(StaticPlans::new(EMBEDDED_DAILY_LIMIT));
    let templates = Arc::new(StaticTemplates);

    let lifecycle = Arc::new(CampaignLifecycle::new(
        stores.clone(),
        contacts.clone(),
        plans,
        Arc::new(LogSink),
        config.quota.clone(),
    ));
    let engine = Arc::new(Engine::new(stores.clone(), lifecycle.clone()));

    let dispatcher = Arc::new(SmtpDispatcher::new(
        &config.smtp,
        &config.smtp.from_address,
    )?);
    let worker = Arc::new(DeliveryWorker::new(
        stores,
        contacts,
        templates,
        dispatcher,
        lifecycle,
        config.worker.clone(),
    ));
    let worker_handle = tokio::spawn(worker.run());

    let api_handle = {
        let bind = format!("{}:{}", config.server.bind_address, config.server.port);
        tokio::spawn(async move {
            let app = dripline_api::create_router(engine);
            let listener = match tokio::net::TcpListener::bind(&bind).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!("Failed to bind API server on {}: {}", bind, e);
                    return;
                }
            };
            info!("API server listening on {}", bind);
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("API server error: {}", e);
            }
        })
    };

    info!("Dripline started");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    worker_handle.abort();
    api_handle.abort();

    info!("Dripline shutdown complete");
    Ok(())
}

async fn build_stores(config: &Config) -> Result<Stores> {
    match config.database.backend.as_str() {
        "memory" => {
            info!("Using in-memory storage");
            Ok(Stores::in_memory())
        }
        _ => {
            let db = DatabasePool::new(&config.database).await?;
            db.migrate().await?;
            let pg = PgStores::new(&db);
            Ok(Stores {
                campaigns: Arc::new(pg.campaigns),
                steps: Arc::new(pg.steps),
                jobs: Arc::new(pg.jobs),
                quota: Arc::new(pg.quota),
            })
        }
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},dripline=debug", config.level)));

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry.with(fmt::layer().json()).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
