//! Errors surfaced by the orchestrator to API callers.
//!
//! Every variant carries a stable machine-readable code so the HTTP boundary can map it
//! without string matching.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid backend: {0}")]
    InvalidBackend(String),

    #[error("invalid model '{model}': {reason}")]
    InvalidModel { model: String, reason: String },

    #[error(
        "automatic backend switching is disabled: cannot activate '{target}' while '{active}' is active"
    )]
    AutoSwitchDisabled { target: String, active: String },

    #[error("cannot activate '{0}': no start command configured and not running externally")]
    BackendUnavailable(String),

    #[error("backend not ready after {elapsed:.1?} at {url}")]
    BackendTimeout { url: String, elapsed: Duration },

    #[error("failed to spawn process for {backend}: {reason}")]
    SpawnFailed { backend: String, reason: String },

    #[error("backend process behind {url} exited before becoming ready")]
    ProcessExited { url: String },
}

impl OrchestratorError {
    pub(crate) fn invalid_model(model: &str, reason: impl Into<String>) -> Self {
        OrchestratorError::InvalidModel {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable code for the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidBackend(_) => "invalid_backend",
            OrchestratorError::InvalidModel { .. } => "invalid_model",
            OrchestratorError::AutoSwitchDisabled { .. } => "auto_switch_disabled",
            OrchestratorError::BackendUnavailable(_) => "backend_unavailable",
            OrchestratorError::BackendTimeout { .. } => "backend_timeout",
            OrchestratorError::SpawnFailed { .. } => "spawn_failed",
            OrchestratorError::ProcessExited { .. } => "process_exited",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::InvalidBackend(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidModel { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::AutoSwitchDisabled { .. } => StatusCode::CONFLICT,
            OrchestratorError::BackendUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::BackendTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::SpawnFailed { .. } | OrchestratorError::ProcessExited { .. } => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": "backend_error",
                "code": self.code(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use rstest::rstest;

    #[rstest]
    #[case(OrchestratorError::InvalidBackend("tts".into()), 404, "invalid_backend")]
    #[case(OrchestratorError::invalid_model("../x.gguf", "escapes"), 400, "invalid_model")]
    #[case(
        OrchestratorError::AutoSwitchDisabled { target: "whisper".into(), active: "llm".into() },
        409,
        "auto_switch_disabled"
    )]
    #[case(OrchestratorError::BackendUnavailable("image".into()), 503, "backend_unavailable")]
    #[case(
        OrchestratorError::BackendTimeout { url: "http://127.0.0.1:8080/health".into(), elapsed: Duration::from_secs(30) },
        504,
        "backend_timeout"
    )]
    fn test_status_and_code(
        #[case] error: OrchestratorError,
        #[case] status: u16,
        #[case] code: &str,
    ) {
        assert_eq!(error.status_code().as_u16(), status);
        assert_eq!(error.code(), code);
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let response = OrchestratorError::BackendUnavailable("image".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "backend_unavailable");
        assert_eq!(body["error"]["type"], "backend_error");
        assert!(
            body["error"]["message"]
                .as_str()
                .unwrap()
                .contains("no start command")
        );
    }
}
