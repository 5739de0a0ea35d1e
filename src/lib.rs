//! # Switchboard
//!
//! Exclusive lifecycle orchestration for inference backends sharing one accelerator.
//!
//! A text-generation server, a speech-transcription server and an image-generation server
//! cannot all be resident on the GPU at once. Switchboard keeps exactly one of them active,
//! starting, stopping and hot-swapping models so that every OpenAI-style request reaches a
//! backend that is ready to serve it.
//!
//! This crate provides:
//! - **Orchestrator**: serializes every transition behind one gate, adopts externally
//!   started backends, swaps models in place
//! - **Supervisor / Probe**: OS process control and HTTP readiness polling
//! - **Middleware**: Axum layer that ensures the right backend before forwarding
//! - **Control router**: status, backend listing, manual activation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        switchboard                          │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ BackendGateLayer                                     │   │
//! │  │ - Maps the request path to a backend                 │   │
//! │  │ - Extracts the model for dynamic-model backends      │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │                          │ ensure_with_model                │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ Orchestrator (one gate)                              │   │
//! │  │ - active backend, busy, per-backend process slot     │   │
//! │  │ - stop others -> start target -> wait ready          │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │          │                   │                  │           │
//! │   ModelCatalog       ProcessSupervisor     HealthProbe      │
//! │                              │                              │
//! │      ┌───────────────────────┼───────────────────┐          │
//! │      ▼                       ▼                   ▼          │
//! │  [llm:8080]            [whisper:8081]       [image:8083]    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod catalog;
pub mod command;
pub mod config;
pub mod control;
pub mod descriptor;
pub mod errors;
pub mod middleware;
pub mod orchestrator;
pub mod probe;
pub mod supervisor;

pub use catalog::{LocalModelCatalog, ModelCatalog};
pub use config::{BackendConfig, Settings, SettingsWatcher, SharedSettings, watch_settings_file};
pub use control::control_router;
pub use errors::OrchestratorError;
pub use middleware::{BackendGateLayer, BackendGateService, BackendRoutes};
pub use orchestrator::{BackendInfo, Orchestrator, OrchestratorState, Status};
pub use probe::{HealthProbe, HttpProbe};
pub use supervisor::{OsSupervisor, ProcessSupervisor};

use anyhow::Result;
use axum::Router;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Wrap `upstream` (the forwarding router) with the backend gate and mount the control API
/// under `/control`.
pub fn build_router(orchestrator: Arc<Orchestrator>, upstream: Router) -> Router {
    info!(
        backends = orchestrator.backend_names().len(),
        "Building switchboard router"
    );

    upstream
        .layer(BackendGateLayer::new(orchestrator.clone()))
        .nest("/control", control_router(orchestrator))
}

/// Load settings from `path`, start reloading them on change, and build an orchestrator
/// with the default components.
///
/// Reloading stops when the returned watcher is dropped.
pub async fn orchestrator_from_file(path: &Path) -> Result<(Arc<Orchestrator>, SettingsWatcher)> {
    let settings = Settings::from_file(path).await?;
    let shared = SharedSettings::new(settings);
    let watcher = watch_settings_file(path.to_path_buf(), shared.clone())?;

    let orchestrator = Orchestrator::builder().settings(shared).build();
    Ok((Arc::new(orchestrator), watcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::routing::post;
    use axum_test::TestServer;
    use serde_json::{Value, json};
    use std::time::Duration;

    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_build_router_gates_and_serves_control() {
        let orchestrator = Arc::new(
            Orchestrator::builder()
                .settings(Settings::default())
                .probe(Arc::new(AlwaysUp) as Arc<dyn HealthProbe>)
                .build(),
        );
        let upstream = Router::new().route("/v1/images/generations", post(|| async { "image" }));
        let server = TestServer::new(build_router(orchestrator, upstream)).unwrap();

        let status: Value = server.get("/control/status").await.json();
        assert_eq!(status["backend"], "none");

        let response = server
            .post("/v1/images/generations")
            .json(&json!({ "prompt": "a lighthouse" }))
            .await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "image");

        let status: Value = server.get("/control/status").await.json();
        assert_eq!(status["backend"], "image");
    }

    #[tokio::test]
    async fn test_orchestrator_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.json");
        tokio::fs::write(
            &path,
            r#"{ "backends": { "llm": { "url": "http://127.0.0.1:18080" } } }"#,
        )
        .await
        .unwrap();

        let (orchestrator, _watcher) = orchestrator_from_file(&path).await.unwrap();
        assert_eq!(orchestrator.backend_names(), ["llm".to_string()]);
        assert_eq!(orchestrator.status().backend, "none");
    }
}
