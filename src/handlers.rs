//! HTTP request handlers for the engine control API.
//!
//! Surface:
//! - `POST /engine/workflows` - submit a plan (201, 400, 409)
//! - `GET  /engine/workflows` - list workflows
//! - `GET  /engine/workflows/:id` - latest projected state
//! - `GET  /engine/workflows/:id/events?from=N` - event slice
//! - `POST /engine/workflows/:id/cancel` - request cancellation
//! - `POST /engine/workflows/:id/rehydrate` - restore from archive
//! - `POST /engine/steps` / `GET /engine/steps` - step catalog
//! - `POST /engine/callbacks/:workflow/:step/:token` - async-http
//!   completion ingestion
//! - `GET  /healthz` - liveness and store health

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppState;
use crate::error::{EngineError, StoreError};
use crate::orchestrator::{CallbackOutcome, CancelOutcome, WorkflowFetch};
use crate::types::*;
use crate::ws::events_ws_handler;

/// Assemble the full control API router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Workflows
        .route(
            "/engine/workflows",
            post(submit_workflow_handler).get(list_workflows_handler),
        )
        .route("/engine/workflows/:id", get(get_workflow_handler))
        .route("/engine/workflows/:id/events", get(get_events_handler))
        .route("/engine/workflows/:id/cancel", post(cancel_workflow_handler))
        .route("/engine/workflows/:id/rehydrate", post(rehydrate_workflow_handler))
        // Step catalog
        .route(
            "/engine/steps",
            post(register_step_handler).get(list_steps_handler),
        )
        // Async-http completion channel
        .route(
            "/engine/callbacks/:workflow/:step/:token",
            post(callback_handler),
        )
        // Event subscription
        .route("/engine/events", get(events_ws_handler))
        // Health check
        .route("/healthz", get(health_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_body(message: impl Into<String>) -> Json<ErrorResponse> {
    Json(ErrorResponse {
        error: message.into(),
    })
}

fn engine_error_response(e: EngineError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &e {
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::Store(StoreError::Conflict { .. }) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error_body(e.to_string()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Workflows
// ═══════════════════════════════════════════════════════════════════════════

/// POST /engine/workflows
pub async fn submit_workflow_handler(
    State(state): State<AppState>,
    Json(body): Json<SubmitWorkflowRequest>,
) -> impl IntoResponse {
    match state.engine.submit(body).await {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(e) => engine_error_response(e).into_response(),
    }
}

/// GET /engine/workflows
pub async fn list_workflows_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.engine.list().await {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(e) => engine_error_response(e).into_response(),
    }
}

/// GET /engine/workflows/:id
pub async fn get_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.fetch(&id).await {
        Ok(WorkflowFetch::Found(workflow)) => (StatusCode::OK, Json(workflow)).into_response(),
        Ok(WorkflowFetch::Hibernated) => {
            (StatusCode::GONE, error_body(format!("workflow {id} is hibernated"))).into_response()
        }
        Ok(WorkflowFetch::NotFound) => {
            (StatusCode::NOT_FOUND, error_body(format!("workflow {id} not found"))).into_response()
        }
        Err(e) => engine_error_response(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub from: Sequence,
}

/// GET /engine/workflows/:id/events?from=N
pub async fn get_events_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let events = match state.engine.events(&id, query.from).await {
        Ok(events) => events,
        Err(e) => return engine_error_response(e).into_response(),
    };
    if events.is_empty() {
        // Distinguish an empty slice from an unknown aggregate.
        match state.engine.fetch(&id).await {
            Ok(WorkflowFetch::NotFound) => {
                return (StatusCode::NOT_FOUND, error_body(format!("workflow {id} not found")))
                    .into_response()
            }
            Ok(WorkflowFetch::Hibernated) => {
                return (StatusCode::GONE, error_body(format!("workflow {id} is hibernated")))
                    .into_response()
            }
            _ => {}
        }
    }
    (StatusCode::OK, Json(events)).into_response()
}

/// POST /engine/workflows/:id/cancel
pub async fn cancel_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.cancel(&id).await {
        Ok(CancelOutcome::Accepted) => {
            (StatusCode::ACCEPTED, Json(json!({"cancelled": id}))).into_response()
        }
        Ok(CancelOutcome::AlreadyTerminal) => (
            StatusCode::CONFLICT,
            error_body(format!("workflow {id} is already terminal")),
        )
            .into_response(),
        Ok(CancelOutcome::NotFound) => {
            (StatusCode::NOT_FOUND, error_body(format!("workflow {id} not found"))).into_response()
        }
        Err(e) => engine_error_response(e).into_response(),
    }
}

/// POST /engine/workflows/:id/rehydrate
pub async fn rehydrate_workflow_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.rehydrate(&id).await {
        Ok(true) => (StatusCode::OK, Json(json!({"rehydrated": id}))).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            error_body(format!("no archived workflow {id}")),
        )
            .into_response(),
        Err(e) => engine_error_response(e).into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Step catalog
// ═══════════════════════════════════════════════════════════════════════════

/// POST /engine/steps
pub async fn register_step_handler(
    State(state): State<AppState>,
    Json(step): Json<Step>,
) -> impl IntoResponse {
    let id = step.id.clone();
    match state.engine.register_step(step).await {
        Ok(()) => (StatusCode::CREATED, Json(json!({"registered": id}))).into_response(),
        Err(e) => engine_error_response(e).into_response(),
    }
}

/// GET /engine/steps
pub async fn list_steps_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.registered_steps().await)
}

// ═══════════════════════════════════════════════════════════════════════════
// Async-http callbacks
// ═══════════════════════════════════════════════════════════════════════════

/// POST /engine/callbacks/:workflow/:step/:token
///
/// The token segment is `<callback_token>.<attempt>`; a stale attempt
/// is acknowledged but ignored.
pub async fn callback_handler(
    State(state): State<AppState>,
    Path((workflow, step, token)): Path<(String, String, String)>,
    Json(body): Json<StepInvocationResponse>,
) -> impl IntoResponse {
    match state.engine.ingest_callback(&workflow, &step, &token, body).await {
        Ok(CallbackOutcome::Accepted) => {
            (StatusCode::OK, Json(json!({"accepted": true}))).into_response()
        }
        Ok(CallbackOutcome::Stale(reason)) => (
            StatusCode::OK,
            Json(json!({"accepted": false, "reason": reason})),
        )
            .into_response(),
        Ok(CallbackOutcome::NotFound) => (
            StatusCode::NOT_FOUND,
            error_body(format!("no async step {step} in workflow {workflow}")),
        )
            .into_response(),
        Ok(CallbackOutcome::Forbidden) => {
            (StatusCode::FORBIDDEN, error_body("callback token mismatch")).into_response()
        }
        Err(e) => engine_error_response(e).into_response(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Health
// ═══════════════════════════════════════════════════════════════════════════

/// GET /healthz
pub async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let store = state.engine.store();
    let (status, health) = match store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "degraded"),
    };
    (
        status,
        Json(HealthResponse {
            status: health.to_string(),
            store: store.backend_name().to_string(),
            active_workflows: state.engine.active_runner_count(),
        }),
    )
}
