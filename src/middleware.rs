//! Axum middleware layer gating requests on the right backend
//!
//! This layer maps the request path to a backend, extracts the requested model for
//! dynamic-model backends, ensures the backend is active and ready, and then passes the
//! request through to the inner (forwarding) service.

use crate::orchestrator::Orchestrator;
use axum::body::Body;
use axum::http::{HeaderMap, Request, Response, StatusCode};
use axum::response::IntoResponse;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use http_body_util::BodyExt;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{debug, error, trace, warn};

/// Header that takes precedence over the body's `model` field
pub const MODEL_OVERRIDE_HEADER: &str = "model-override";

/// Exact request paths and the backend that serves them
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendRoutes {
    routes: HashMap<String, String>,
}

impl BackendRoutes {
    /// A table with no routes
    pub fn empty() -> Self {
        Self {
            routes: HashMap::new(),
        }
    }

    pub fn route(mut self, path: impl Into<String>, backend: impl Into<String>) -> Self {
        self.routes.insert(path.into(), backend.into());
        self
    }

    pub fn backend_for(&self, path: &str) -> Option<&str> {
        self.routes
            .get(path.trim_end_matches('/'))
            .map(String::as_str)
    }
}

impl Default for BackendRoutes {
    /// OpenAI-style endpoints of the text, transcription and image backends
    fn default() -> Self {
        Self::empty()
            .route("/v1/chat/completions", "llm")
            .route("/v1/completions", "llm")
            .route("/v1/embeddings", "llm")
            .route("/v1/responses", "llm")
            .route("/v1/audio/transcriptions", "whisper")
            .route("/v1/audio/translations", "whisper")
            .route("/v1/images/generations", "image")
    }
}

/// Layer that ensures the right backend before a request is forwarded
#[derive(Clone)]
pub struct BackendGateLayer {
    orchestrator: Arc<Orchestrator>,
    routes: Arc<BackendRoutes>,
}

impl BackendGateLayer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self::with_routes(orchestrator, BackendRoutes::default())
    }

    pub fn with_routes(orchestrator: Arc<Orchestrator>, routes: BackendRoutes) -> Self {
        Self {
            orchestrator,
            routes: Arc::new(routes),
        }
    }
}

impl<S> Layer<S> for BackendGateLayer {
    type Service = BackendGateService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BackendGateService {
            orchestrator: self.orchestrator.clone(),
            routes: self.routes.clone(),
            inner,
        }
    }
}

/// Service that holds requests until their backend is active
#[derive(Clone)]
pub struct BackendGateService<S> {
    orchestrator: Arc<Orchestrator>,
    routes: Arc<BackendRoutes>,
    inner: S,
}

impl<S> Service<Request<Body>> for BackendGateService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let orchestrator = self.orchestrator.clone();
        let routes = self.routes.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let Some(backend) = routes.backend_for(req.uri().path()).map(str::to_string) else {
                trace!(path = %req.uri().path(), "No backend for path, passing through");
                return inner.call(req).await;
            };

            if !orchestrator.is_registered(&backend) {
                warn!(backend = %backend, "Route points to an unregistered backend, passing through");
                return inner.call(req).await;
            }

            let dynamic = orchestrator
                .settings()
                .snapshot()
                .backend(&backend)
                .is_some_and(|config| config.supports_dynamic_model);

            // Only dynamic-model backends need the body, everything else streams through
            let (req, model) = if dynamic {
                let (parts, body) = req.into_parts();
                let body_bytes = match body.collect().await {
                    Ok(collected) => collected.to_bytes(),
                    Err(e) => {
                        error!(error = %e, "Failed to read request body");
                        return Ok(bad_request("Failed to read request body"));
                    }
                };
                let model = extract_model(&parts.headers, &body_bytes);
                (Request::from_parts(parts, Body::from(body_bytes)), model)
            } else {
                (req, None)
            };

            debug!(backend = %backend, model = ?model, "Ensuring backend for request");

            if let Err(e) = orchestrator
                .ensure_with_model(&backend, model.as_deref())
                .await
            {
                error!(backend = %backend, error = %e, "Failed to ensure backend");
                return Ok(e.into_response());
            }

            inner.call(req).await
        })
    }
}

/// Extract model name from request headers or JSON body
fn extract_model(headers: &HeaderMap, body: &Bytes) -> Option<String> {
    if let Some(model) = headers.get(MODEL_OVERRIDE_HEADER)
        && let Ok(model_str) = model.to_str()
        && !model_str.trim().is_empty()
    {
        return Some(model_str.trim().to_string());
    }

    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body)
        && let Some(model) = json.get("model").and_then(|v| v.as_str())
        && !model.trim().is_empty()
    {
        return Some(model.trim().to_string());
    }

    None
}

fn bad_request(message: &str) -> Response<Body> {
    let body = json!({
        "error": {
            "message": message,
            "type": "invalid_request_error",
            "code": "invalid_body"
        }
    });
    (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, Settings};
    use crate::probe::HealthProbe;
    use async_trait::async_trait;
    use axum::{Router, routing::post};
    use axum_test::TestServer;
    use std::time::Duration;

    /// Every backend answers, so activation is always by adoption
    struct AlwaysUp;

    #[async_trait]
    impl HealthProbe for AlwaysUp {
        async fn probe(&self, _url: &str, _timeout: Duration) -> bool {
            true
        }
    }

    fn orchestrator(models: &tempfile::TempDir, auto_switch: bool) -> Arc<Orchestrator> {
        std::fs::write(models.path().join("qwen.gguf"), b"GGUF").unwrap();

        let mut settings = Settings {
            auto_switch,
            models_dir: models.path().to_path_buf(),
            ..Settings::default()
        };
        settings.backends.insert(
            "whisper".to_string(),
            BackendConfig::builder()
                .url(url::Url::parse("http://127.0.0.1:8081").unwrap())
                .model_name("ggml-large-v3")
                .build(),
        );

        Arc::new(
            Orchestrator::builder()
                .settings(settings)
                .probe(Arc::new(AlwaysUp) as Arc<dyn HealthProbe>)
                .build(),
        )
    }

    fn server(orchestrator: Arc<Orchestrator>) -> TestServer {
        let app = Router::new()
            .route("/v1/chat/completions", post(|| async { "chat" }))
            .route("/v1/audio/transcriptions", post(|| async { "transcription" }))
            .route("/v1/other", post(|| async { "other" }))
            .layer(BackendGateLayer::new(orchestrator));
        TestServer::new(app).unwrap()
    }

    #[tokio::test]
    async fn test_chat_request_activates_llm_with_body_model() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, true);
        let server = server(orchestrator.clone());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({ "model": "qwen.gguf", "messages": [] }))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "chat");
        let status = orchestrator.status();
        assert_eq!(status.backend, "llm");
        assert_eq!(status.model, "qwen.gguf");
    }

    #[tokio::test]
    async fn test_header_model_takes_precedence() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, true);
        let server = server(orchestrator.clone());

        let response = server
            .post("/v1/chat/completions")
            .add_header("model-override", "qwen.gguf")
            .json(&json!({ "model": "../escape.gguf" }))
            .await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(orchestrator.status().model, "qwen.gguf");
    }

    #[tokio::test]
    async fn test_invalid_model_is_rejected() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, true);
        let server = server(orchestrator.clone());

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({ "model": "../escape.gguf" }))
            .await;

        assert_eq!(response.status_code(), 400);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["code"], "invalid_model");
        assert_eq!(orchestrator.status().backend, "none");
    }

    #[tokio::test]
    async fn test_transcription_switches_to_whisper() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, true);
        let server = server(orchestrator.clone());

        server
            .post("/v1/chat/completions")
            .json(&json!({ "messages": [] }))
            .await;
        assert_eq!(orchestrator.status().backend, "llm");

        let response = server
            .post("/v1/audio/transcriptions")
            .bytes(Bytes::from_static(b"not json"))
            .await;
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "transcription");

        let status = orchestrator.status();
        assert_eq!(status.backend, "whisper");
        assert_eq!(status.model, "ggml-large-v3");
    }

    #[tokio::test]
    async fn test_switch_rejected_when_auto_switch_disabled() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, false);
        let server = server(orchestrator.clone());

        server
            .post("/v1/audio/transcriptions")
            .bytes(Bytes::from_static(b"audio"))
            .await;

        let response = server
            .post("/v1/chat/completions")
            .json(&json!({ "model": "qwen.gguf" }))
            .await;

        assert_eq!(response.status_code(), 409);
        let body: serde_json::Value = response.json();
        assert_eq!(body["error"]["type"], "backend_error");
        assert_eq!(body["error"]["code"], "auto_switch_disabled");
        assert_eq!(orchestrator.status().backend, "whisper");
    }

    #[tokio::test]
    async fn test_unmatched_path_passes_through() {
        let models = tempfile::tempdir().unwrap();
        let orchestrator = orchestrator(&models, true);
        let server = server(orchestrator.clone());

        let response = server.post("/v1/other").await;

        assert_eq!(response.status_code(), 200);
        assert_eq!(response.text(), "other");
        assert_eq!(orchestrator.status().backend, "none");
    }

    #[test]
    fn test_default_routes() {
        let routes = BackendRoutes::default();
        assert_eq!(routes.backend_for("/v1/chat/completions"), Some("llm"));
        assert_eq!(routes.backend_for("/v1/embeddings/"), Some("llm"));
        assert_eq!(routes.backend_for("/v1/audio/translations"), Some("whisper"));
        assert_eq!(routes.backend_for("/v1/images/generations"), Some("image"));
        assert_eq!(routes.backend_for("/v1/models"), None);
    }

    #[test]
    fn test_extract_model_from_header() {
        let mut headers = HeaderMap::new();
        headers.insert("model-override", "llama.gguf".parse().unwrap());

        let body = Bytes::from("{}");
        assert_eq!(extract_model(&headers, &body), Some("llama.gguf".to_string()));
    }

    #[test]
    fn test_extract_model_from_body() {
        let headers = HeaderMap::new();
        let body = Bytes::from(r#"{"model": "mistral.gguf", "messages": []}"#);

        assert_eq!(
            extract_model(&headers, &body),
            Some("mistral.gguf".to_string())
        );
    }

    #[test]
    fn test_extract_model_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_model(&headers, &Bytes::from(r#"{"messages": []}"#)), None);
        assert_eq!(extract_model(&headers, &Bytes::from(r#"{"model": "  "}"#)), None);
        assert_eq!(extract_model(&headers, &Bytes::from("not json")), None);
    }
}
