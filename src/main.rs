//! Argyll engine binary.
//!
//! ## Endpoints
//!
//! - `POST /engine/workflows` - Submit an execution plan
//! - `GET /engine/workflows` - List workflows
//! - `GET /engine/workflows/:id` - Latest projected state
//! - `GET /engine/workflows/:id/events` - Event slice
//! - `POST /engine/workflows/:id/cancel` - Cancel a workflow
//! - `POST /engine/workflows/:id/rehydrate` - Restore from archive
//! - `POST /engine/steps` - Register a reusable step
//! - `POST /engine/callbacks/:workflow/:step/:token` - Async callbacks
//! - `GET /engine/events` - WebSocket event subscription
//! - `GET /healthz` - Health check
//!
//! ## Exit codes
//!
//! `0` clean shutdown, `1` configuration error, `2` event store
//! unreachable at startup.

mod clients;
mod config;
mod error;
mod events;
mod executor;
mod handlers;
mod hibernate;
mod orchestrator;
mod plan;
mod projection;
mod redis;
mod script;
mod store;
mod tasks;
mod types;
mod ws;

use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{AppState, Config};
use crate::handlers::build_router;
use crate::hibernate::MemoryBlobArchive;
use crate::orchestrator::Engine;
use crate::redis::RedisEventStore;
use crate::script::ExprEngine;
use crate::store::{EventStore, MemoryEventStore};
use crate::tasks::{start_hibernation_sweeper, start_workflow_discovery};

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "argyll=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("configuration error: {e}");
            std::process::exit(1);
        }
    };
    let bind_addr = config.bind_addr();

    info!("Starting Argyll workflow engine");
    info!("Public URL: {}", config.public_url);
    info!("Binding to: {}", bind_addr);

    let http_client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .expect("Failed to create HTTP client");

    // Select the event store backend
    let store: Arc<dyn EventStore> = match (&config.redis_rest_url, &config.redis_rest_token) {
        (Some(url), Some(token)) => {
            info!("Event store: redis at {url}");
            RedisEventStore::new(
                http_client.clone(),
                url.clone(),
                token.clone(),
                config.key_prefix.clone(),
                config.subscription_buffer,
                config.store_poll_interval,
            )
        }
        _ => {
            warn!("ARGYLL_REDIS_REST_URL not set - using the in-memory event store");
            Arc::new(MemoryEventStore::new(config.subscription_buffer))
        }
    };

    if let Err(e) = store.ping().await {
        error!("event store unreachable at startup: {e}");
        std::process::exit(2);
    }

    // Assemble the engine and resume anything the log says is active
    let engine = Engine::new(
        config.clone(),
        store,
        Arc::new(MemoryBlobArchive::default()),
        Arc::new(ExprEngine),
        http_client,
    );
    match engine.recover().await {
        Ok(0) => {}
        Ok(resumed) => info!("resumed {resumed} active workflows"),
        Err(e) => warn!("recovery scan failed: {e}"),
    }

    let state = AppState::new(config.clone(), engine.clone());
    let app = build_router(state);

    // Start background tasks
    let sweeper_engine = engine.clone();
    let sweeper_handle = tokio::spawn(async move {
        start_hibernation_sweeper(sweeper_engine).await;
    });

    let discovery_engine = engine.clone();
    let discovery_handle = tokio::spawn(async move {
        start_workflow_discovery(discovery_engine).await;
    });

    info!("Background tasks started (hibernation sweeper, workflow discovery)");

    // Start server with graceful shutdown
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("failed to bind {bind_addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("Server listening on {}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!("server error: {e}");
    }

    // Shutdown sequence
    info!("Shutdown signal received, stopping engine...");

    sweeper_handle.abort();
    discovery_handle.abort();
    engine.shutdown().await;

    info!("Argyll shutdown complete");
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
