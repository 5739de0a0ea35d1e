//! Settings for the backend registry and the switching policy.
//!
//! Settings are read from a JSON file and can be reloaded while the process runs. The
//! orchestrator never caches individual fields: every transition takes one [`Settings`]
//! snapshot from [`SharedSettings`] and uses it until the transition completes, so the
//! latest published values always win without a transition ever seeing a mix of two files.
use anyhow::{Context, Result, anyhow, bail};
use bon::Builder;
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Whether a request for an inactive backend may stop the active one
    #[serde(default = "default_auto_switch")]
    pub auto_switch: bool,

    /// How long a freshly launched backend has to pass its health probe
    #[serde(default = "default_switch_timeout_secs")]
    pub switch_timeout_secs: f64,

    /// Directory holding the model files for dynamic-model backends
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Extension every model file must carry (without the dot)
    #[serde(default = "default_model_extension")]
    pub model_extension: String,

    /// Timeout of a single adoption probe
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Timeout of each probe attempt while waiting for readiness
    #[serde(default = "default_ready_probe_timeout_ms")]
    pub ready_probe_timeout_ms: u64,

    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// Upper bound for a configured stop command
    #[serde(default = "default_stop_command_timeout_secs")]
    pub stop_command_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL
    #[serde(default = "default_terminate_grace_secs")]
    pub terminate_grace_secs: u64,

    /// Backends that compete for the accelerator, keyed by name
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<String, BackendConfig>,
}

fn default_auto_switch() -> bool {
    true
}

fn default_switch_timeout_secs() -> f64 {
    30.0
}

fn default_models_dir() -> PathBuf {
    PathBuf::from("models")
}

fn default_model_extension() -> String {
    "gguf".to_string()
}

fn default_probe_timeout_ms() -> u64 {
    3_000
}

fn default_ready_probe_timeout_ms() -> u64 {
    5_000
}

fn default_ready_poll_interval_ms() -> u64 {
    500
}

fn default_stop_command_timeout_secs() -> u64 {
    15
}

fn default_terminate_grace_secs() -> u64 {
    10
}

fn default_health_path() -> String {
    "/v1/models".to_string()
}

fn local_url(port: u16) -> Url {
    Url::parse(&format!("http://127.0.0.1:{port}")).expect("loopback URL is valid")
}

fn default_backends() -> BTreeMap<String, BackendConfig> {
    BTreeMap::from([
        (
            "llm".to_string(),
            BackendConfig::builder()
                .url(local_url(8080))
                .supports_dynamic_model(true)
                .build(),
        ),
        (
            "whisper".to_string(),
            BackendConfig::builder().url(local_url(8081)).build(),
        ),
        (
            "image".to_string(),
            BackendConfig::builder().url(local_url(8083)).build(),
        ),
    ])
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_switch: default_auto_switch(),
            switch_timeout_secs: default_switch_timeout_secs(),
            models_dir: default_models_dir(),
            model_extension: default_model_extension(),
            probe_timeout_ms: default_probe_timeout_ms(),
            ready_probe_timeout_ms: default_ready_probe_timeout_ms(),
            ready_poll_interval_ms: default_ready_poll_interval_ms(),
            stop_command_timeout_secs: default_stop_command_timeout_secs(),
            terminate_grace_secs: default_terminate_grace_secs(),
            backends: default_backends(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        settings
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.backends.is_empty() {
            bail!("at least one backend must be configured");
        }
        match Duration::try_from_secs_f64(self.switch_timeout_secs) {
            Ok(timeout) if !timeout.is_zero() => {}
            _ => bail!(
                "switch_timeout_secs must be a positive number of seconds, got {}",
                self.switch_timeout_secs
            ),
        }
        if self.ready_poll_interval_ms == 0 {
            bail!("ready_poll_interval_ms must be greater than zero");
        }
        for (name, backend) in &self.backends {
            if !backend.health_path.starts_with('/') {
                return Err(anyhow!(
                    "health_path of backend '{}' must start with '/', got '{}'",
                    name,
                    backend.health_path
                ));
            }
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.backends.get(name)
    }

    /// Falls back to the default when the configured value is not a usable duration, since
    /// settings built in code skip [`Settings::validate`].
    pub fn switch_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.switch_timeout_secs)
            .ok()
            .filter(|timeout| !timeout.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_switch_timeout_secs()))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn ready_probe_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_probe_timeout_ms)
    }

    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }

    pub fn stop_command_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_command_timeout_secs)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Configuration for a single backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Builder)]
pub struct BackendConfig {
    /// Base URL the backend listens on
    pub url: Url,

    /// Path probed for liveness and readiness
    #[serde(default = "default_health_path")]
    #[builder(into, default = default_health_path())]
    pub health_path: String,

    /// Model reported when no model was requested explicitly
    #[serde(default)]
    #[builder(into, default)]
    pub model_name: String,

    /// Command line that launches the backend. Empty means the backend is only adopted when
    /// found running.
    #[serde(default)]
    #[builder(into, default)]
    pub start_command: String,

    /// Optional command run before terminating a supervised process
    #[serde(default)]
    #[builder(into, default)]
    pub stop_command: String,

    /// Whether `--model <path>` is injected into the start command
    #[serde(default)]
    #[builder(default)]
    pub supports_dynamic_model: bool,
}

impl BackendConfig {
    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.url.as_str().trim_end_matches('/'),
            self.health_path
        )
    }

    pub fn endpoint(&self) -> String {
        self.url.as_str().trim_end_matches('/').to_string()
    }

    pub fn has_start_command(&self) -> bool {
        !self.start_command.trim().is_empty()
    }

    pub fn has_stop_command(&self) -> bool {
        !self.stop_command.trim().is_empty()
    }
}

/// Clonable cell holding the latest published [`Settings`].
#[derive(Debug, Clone)]
pub struct SharedSettings {
    tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(settings));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<Settings> {
        Arc::clone(&self.tx.borrow())
    }

    pub fn replace(&self, settings: Settings) {
        self.tx.send_replace(Arc::new(settings));
    }
}

impl From<Settings> for SharedSettings {
    fn from(settings: Settings) -> Self {
        Self::new(settings)
    }
}

/// Keeps a settings file watch alive. Dropping it stops reloading.
pub struct SettingsWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for SettingsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsWatcher")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

impl Drop for SettingsWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Reload `path` into `shared` whenever the file is modified.
///
/// A reload that fails to read, parse or validate is logged and the previous snapshot stays
/// in place.
pub fn watch_settings_file(path: PathBuf, shared: SharedSettings) -> Result<SettingsWatcher> {
    let (file_tx, mut file_rx) = mpsc::channel(16);

    let mut watcher = RecommendedWatcher::new(
        move |res| {
            let _ = file_tx.blocking_send(res);
        },
        NotifyConfig::default(),
    )?;
    watcher
        .watch(&path, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch config file: {}", path.display()))?;

    let task = tokio::spawn(async move {
        while let Some(res) = file_rx.recv().await {
            match res {
                Ok(event) if event.kind.is_modify() => {
                    info!(path = %path.display(), "Config file changed, reloading settings");
                    match Settings::from_file(&path).await {
                        Ok(settings) => shared.replace(settings),
                        Err(e) => error!(error = %e, "Failed to reload settings, keeping previous"),
                    }
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Config watch error"),
            }
        }
    });

    Ok(SettingsWatcher {
        _watcher: watcher,
        task,
    })
}
