//! Resolution of requested model names to files inside the models directory.
use crate::config::Settings;
use crate::errors::OrchestratorError;
use std::path::{Component, Path, PathBuf};

/// Resolves a client-supplied model name to a local model file.
///
/// Implementations must reject names that resolve outside the configured models directory
/// or that are not recognised model files.
pub trait ModelCatalog: Send + Sync {
    fn resolve(&self, settings: &Settings, model: &str) -> Result<PathBuf, OrchestratorError>;
}

/// Catalog backed by the local filesystem, reading `models_dir` and `model_extension` from
/// the settings snapshot of each call.
#[derive(Debug, Default, Clone)]
pub struct LocalModelCatalog;

impl LocalModelCatalog {
    pub fn new() -> Self {
        Self
    }
}

impl ModelCatalog for LocalModelCatalog {
    fn resolve(&self, settings: &Settings, model: &str) -> Result<PathBuf, OrchestratorError> {
        let models_dir = settings.models_dir.as_path();
        // Accepted with or without the leading dot
        let extension = settings.model_extension.trim_start_matches('.');
        let relative = Path::new(model);

        if model.is_empty()
            || !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(OrchestratorError::invalid_model(
                model,
                "must be a relative path inside the models directory",
            ));
        }

        let has_extension = relative
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if !has_extension {
            return Err(OrchestratorError::invalid_model(
                model,
                format!("expected a .{extension} file"),
            ));
        }

        let root = models_dir.canonicalize().map_err(|e| {
            OrchestratorError::invalid_model(
                model,
                format!("models directory {} is not accessible: {e}", models_dir.display()),
            )
        })?;
        let candidate = root
            .join(relative)
            .canonicalize()
            .map_err(|_| OrchestratorError::invalid_model(model, "model file not found"))?;

        if !candidate.starts_with(&root) {
            return Err(OrchestratorError::invalid_model(
                model,
                "resolves outside the models directory",
            ));
        }
        if !candidate.is_file() {
            return Err(OrchestratorError::invalid_model(model, "not a regular file"));
        }

        Ok(candidate)
    }
}
