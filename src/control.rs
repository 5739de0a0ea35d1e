//! Control API for dashboards and operators.
//!
//! | Method | Path | Response |
//! |---|---|---|
//! | GET | `/status` | [`Status`] |
//! | GET | `/backends` | list of [`BackendInfo`](crate::orchestrator::BackendInfo) |
//! | POST | `/backends/{name}/activate` | [`Status`] once the backend is ready |
//! | POST | `/backends/deactivate` | [`Status`] |
//!
//! Orchestrator errors are returned with their JSON error envelope.
use crate::errors::OrchestratorError;
use crate::orchestrator::{Orchestrator, Status};
use axum::{
    Json, Router,
    extract::{Path, State},
    response::IntoResponse,
    routing::{get, post},
};
use std::sync::Arc;
use tracing::info;

pub fn control_router(orchestrator: Arc<Orchestrator>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/backends", get(backends))
        .route("/backends/deactivate", post(deactivate))
        .route("/backends/{name}/activate", post(activate))
        .with_state(orchestrator)
}

async fn status(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Status> {
    Json(orchestrator.status())
}

async fn backends(State(orchestrator): State<Arc<Orchestrator>>) -> impl IntoResponse {
    Json(orchestrator.list_backends_info())
}

async fn activate(
    State(orchestrator): State<Arc<Orchestrator>>,
    Path(name): Path<String>,
) -> Result<Json<Status>, OrchestratorError> {
    info!(backend = %name, "Activation requested");
    orchestrator.activate(&name).await?;
    Ok(Json(orchestrator.status()))
}

async fn deactivate(State(orchestrator): State<Arc<Orchestrator>>) -> Json<Status> {
    info!("Deactivation requested");
    orchestrator.deactivate_all().await;
    Json(orchestrator.status())
}
