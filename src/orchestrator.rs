//! Orchestrator - exclusive lifecycle management of the accelerator backends
//!
//! The orchestrator owns the single fact "which backend is active". Every transition
//! (adoption, switch, model swap, deactivation) runs behind one gate, so callers always see
//! the result of a completed transition:
//!
//! - A request for the active backend is a no-op, unless a dynamic-model backend is asked
//!   for a different model, which restarts only that backend.
//! - With nothing active, a backend that already answers its health probe is adopted
//!   without spawning anything.
//! - Otherwise every other backend is stopped before the target is started, and the call
//!   returns once the target passes its readiness probe.
//!
//! Reads of [`Orchestrator::status`] and [`Orchestrator::subscribe`] never take the gate.

use crate::catalog::{LocalModelCatalog, ModelCatalog};
use crate::command::LaunchCommand;
use crate::config::{BackendConfig, Settings, SharedSettings};
use crate::descriptor::{BackendDescriptor, Registry};
use crate::errors::OrchestratorError;
use crate::probe::{self, HealthProbe, HttpProbe, ReadyPolicy};
use crate::supervisor::{OsSupervisor, ProcessSupervisor, StopPolicy};
use bon::bon;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

/// Published orchestrator state, readable without the gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorState {
    /// Backend currently owning the accelerator
    pub active: Option<String>,
    /// Model loaded in the active backend, if known
    pub model: Option<String>,
    /// A transition is in flight
    pub busy: bool,
}

/// Summary for status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    /// Active backend name or `"none"`
    pub backend: String,
    pub model: String,
    pub busy: bool,
}

/// Per-backend view for dashboards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendInfo {
    pub name: String,
    pub active: bool,
    /// A supervised process is alive
    pub running: bool,
    pub model: String,
    pub endpoint: String,
    pub has_start_command: bool,
    pub has_stop_command: bool,
}

#[derive(Debug, Clone, Default)]
struct Observation {
    running: bool,
    current_model: Option<String>,
}

/// State guarded by the gate
#[derive(Debug)]
struct Gated {
    registry: Registry,
    active: Option<String>,
}

/// Holds `busy` for the lifetime of a transition, including when the caller's future is
/// dropped mid-way.
struct BusyGuard<'a> {
    state: &'a watch::Sender<OrchestratorState>,
}

impl<'a> BusyGuard<'a> {
    fn new(state: &'a watch::Sender<OrchestratorState>) -> Self {
        state.send_modify(|s| s.busy = true);
        Self { state }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.state.send_modify(|s| s.busy = false);
    }
}

/// Orchestrator owns the backend processes and the active-backend state
pub struct Orchestrator {
    settings: SharedSettings,
    catalog: Arc<dyn ModelCatalog>,
    supervisor: Arc<dyn ProcessSupervisor>,
    probe: Arc<dyn HealthProbe>,
    /// Names fixed at construction, in registry order
    names: Vec<String>,
    /// Single gate serializing every transition
    gate: Mutex<Gated>,
    state: watch::Sender<OrchestratorState>,
    /// Last liveness seen under the gate, for lock-free reporting
    observed: DashMap<String, Observation>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("names", &self.names)
            .field("state", &*self.state.borrow())
            .finish_non_exhaustive()
    }
}

#[bon]
impl Orchestrator {
    /// Create an orchestrator for the backends present in the initial settings.
    ///
    /// Components default to the filesystem catalog, real OS processes and HTTP probes.
    #[builder]
    pub fn new(
        #[builder(into)] settings: SharedSettings,
        catalog: Option<Arc<dyn ModelCatalog>>,
        supervisor: Option<Arc<dyn ProcessSupervisor>>,
        probe: Option<Arc<dyn HealthProbe>>,
    ) -> Self {
        let names: Vec<String> = settings.snapshot().backends.keys().cloned().collect();
        let (state, _rx) = watch::channel(OrchestratorState::default());

        info!(backends = ?names, "Registered backends");

        Self {
            settings,
            catalog: catalog.unwrap_or_else(|| Arc::new(LocalModelCatalog::new())),
            supervisor: supervisor.unwrap_or_else(|| Arc::new(OsSupervisor::new())),
            probe: probe.unwrap_or_else(|| Arc::new(HttpProbe::new())),
            gate: Mutex::new(Gated {
                registry: Registry::new(names.iter().cloned()),
                active: None,
            }),
            names,
            state,
            observed: DashMap::new(),
        }
    }
}

impl Orchestrator {
    /// Registered backend names
    pub fn backend_names(&self) -> &[String] {
        &self.names
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    /// Ensure `target` is the active, ready backend
    pub async fn ensure(&self, target: &str) -> Result<(), OrchestratorError> {
        self.ensure_with_model(target, None).await
    }

    /// Alias of [`Orchestrator::ensure`] for control surfaces
    pub async fn activate(&self, target: &str) -> Result<(), OrchestratorError> {
        self.ensure(target).await
    }

    /// Ensure `target` is active and, for dynamic-model backends, serving `model`.
    ///
    /// Blank model names count as no model.
    pub async fn ensure_with_model(
        &self,
        target: &str,
        model: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let model = model.map(str::trim).filter(|m| !m.is_empty());

        if !self.is_registered(target) {
            if self.settings.snapshot().backend(target).is_some() {
                warn!(backend = %target, "Backend was added after startup and is ignored");
            }
            return Err(OrchestratorError::InvalidBackend(target.to_string()));
        }

        let mut gated = self.gate.lock().await;
        let settings = self.settings.snapshot();

        info!(
            backend = %target,
            model = ?model,
            active = ?gated.active,
            "Ensuring backend"
        );

        let result = self.transition(&mut gated, &settings, target, model).await;
        self.observe(&mut gated);

        if let Err(e) = &result {
            warn!(backend = %target, code = e.code(), error = %e, "Failed to ensure backend");
        }
        result
    }

    async fn transition(
        &self,
        gated: &mut Gated,
        settings: &Settings,
        target: &str,
        model: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let config = settings
            .backend(target)
            .ok_or_else(|| OrchestratorError::InvalidBackend(target.to_string()))?;

        if gated.active.as_deref() == Some(target) {
            return self.swap_model(gated, settings, target, config, model).await;
        }

        let launch = self.launch_command(settings, config, model)?;
        let loaded = model.map(str::to_string).or_else(|| default_model(config));

        // Adopt a backend that already answers
        if gated.active.is_none()
            && self.adoptable(gated, target, config, loaded.as_deref())
            && self
                .probe
                .probe(&config.health_url(), settings.probe_timeout())
                .await
        {
            info!(backend = %target, "Backend already running, adopting it");
            if let Some(descriptor) = gated.registry.get_mut(target) {
                descriptor.current_model = loaded.clone();
            }
            self.publish_active(gated, target, loaded);
            return Ok(());
        }

        if !settings.auto_switch {
            return Err(OrchestratorError::AutoSwitchDisabled {
                target: target.to_string(),
                active: gated.active.clone().unwrap_or_else(|| "none".to_string()),
            });
        }

        // Never tear down a working backend for one that cannot start
        let mut confirmed_externally = false;
        if launch.is_none() {
            if !self
                .probe
                .probe(&config.health_url(), settings.probe_timeout())
                .await
            {
                return Err(OrchestratorError::BackendUnavailable(target.to_string()));
            }
            confirmed_externally = true;
        }

        let _busy = BusyGuard::new(&self.state);
        self.publish_inactive(gated);

        for descriptor in gated.registry.iter_mut().filter(|d| d.name() != target) {
            self.stop_backend(settings, descriptor).await;
        }

        // A process kept from a failed launch may hold another model
        if config.supports_dynamic_model
            && let Some(descriptor) = gated.registry.get_mut(target)
            && descriptor.current_model != loaded
            && self.supervisor.is_running(target, &mut descriptor.process)
        {
            info!(
                backend = %target,
                from = ?descriptor.current_model,
                to = ?loaded,
                "Restarting leftover process with the requested model"
            );
            self.stop_backend(settings, descriptor).await;
        }

        self.launch(
            gated,
            settings,
            target,
            config,
            launch.as_ref(),
            confirmed_externally,
            loaded,
        )
        .await
    }

    /// The target is already active; restart it only for a different model
    async fn swap_model(
        &self,
        gated: &mut Gated,
        settings: &Settings,
        target: &str,
        config: &BackendConfig,
        model: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let Some(descriptor) = gated.registry.get_mut(target) else {
            return Err(OrchestratorError::InvalidBackend(target.to_string()));
        };

        let requested = match model {
            Some(m)
                if config.supports_dynamic_model
                    && descriptor.current_model.as_deref() != Some(m) =>
            {
                m
            }
            _ => {
                debug!(backend = %target, "Backend already active");
                return Ok(());
            }
        };

        let Some(launch) = self.launch_command(settings, config, Some(requested))? else {
            warn!(
                backend = %target,
                model = %requested,
                "No start command configured, cannot load another model"
            );
            return Err(OrchestratorError::BackendUnavailable(target.to_string()));
        };

        info!(
            backend = %target,
            from = ?descriptor.current_model,
            to = %requested,
            "Swapping model"
        );

        let _busy = BusyGuard::new(&self.state);
        self.publish_inactive(gated);

        let descriptor = gated
            .registry
            .get_mut(target)
            .ok_or_else(|| OrchestratorError::InvalidBackend(target.to_string()))?;
        if self.supervisor.is_running(target, &mut descriptor.process) {
            self.stop_backend(settings, descriptor).await;
        } else if let Some(stop_command) = LaunchCommand::parse(&config.stop_command) {
            // Adopted: only its stop command reaches the running server
            self.supervisor
                .stop_external(target, &stop_command, stop_policy(settings))
                .await;
            descriptor.current_model = None;
        }

        self.launch(
            gated,
            settings,
            target,
            config,
            Some(&launch),
            false,
            Some(requested.to_string()),
        )
        .await
    }

    /// Start the target, wait for readiness and record it as active
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        gated: &mut Gated,
        settings: &Settings,
        target: &str,
        config: &BackendConfig,
        launch: Option<&LaunchCommand>,
        confirmed_externally: bool,
        loaded: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let url = config.health_url();
        let descriptor = gated
            .registry
            .get_mut(target)
            .ok_or_else(|| OrchestratorError::InvalidBackend(target.to_string()))?;

        let started = self
            .supervisor
            .start(target, &mut descriptor.process, launch)
            .await?;

        if started {
            let supervisor = self.supervisor.as_ref();
            let process = &mut descriptor.process;
            let ready = probe::wait_ready(self.probe.as_ref(), &url, ready_policy(settings), || {
                supervisor.is_running(target, process)
            })
            .await;

            if let Err(e) = ready {
                if matches!(e, OrchestratorError::BackendTimeout { .. }) {
                    // The process stays in its slot and is reused by the next attempt
                    descriptor.current_model = loaded;
                }
                return Err(e);
            }
        } else if !confirmed_externally
            && !self.probe.probe(&url, settings.probe_timeout()).await
        {
            return Err(OrchestratorError::BackendUnavailable(target.to_string()));
        }

        descriptor.current_model = loaded.clone();
        self.publish_active(gated, target, loaded);
        info!(backend = %target, "Backend is now active");
        Ok(())
    }

    /// Stop every supervised backend and clear the active state.
    ///
    /// An adopted backend has no supervised process and is left running.
    pub async fn deactivate_all(&self) {
        let mut gated = self.gate.lock().await;
        let settings = self.settings.snapshot();

        info!(active = ?gated.active, "Deactivating backends");

        let _busy = BusyGuard::new(&self.state);
        self.publish_inactive(&mut gated);

        for descriptor in gated.registry.iter_mut() {
            self.stop_backend(&settings, descriptor).await;
        }

        self.observe(&mut gated);
    }

    /// Current state without waiting for an in-flight transition
    pub fn status(&self) -> Status {
        let state = self.state.borrow().clone();
        let settings = self.settings.snapshot();

        let model = state
            .model
            .or_else(|| {
                state
                    .active
                    .as_deref()
                    .and_then(|name| settings.backend(name))
                    .map(|config| config.model_name.clone())
            })
            .unwrap_or_default();

        Status {
            backend: state.active.unwrap_or_else(|| "none".to_string()),
            model,
            busy: state.busy,
        }
    }

    pub fn active_backend(&self) -> Option<String> {
        self.state.borrow().active.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().busy
    }

    /// Watch active/busy changes
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.state.subscribe()
    }

    /// One entry per registered backend still present in the settings.
    ///
    /// Liveness is refreshed when the gate is free; during a transition the last observed
    /// values are reported.
    pub fn list_backends_info(&self) -> Vec<BackendInfo> {
        if let Ok(mut gated) = self.gate.try_lock() {
            self.observe(&mut gated);
        }

        let settings = self.settings.snapshot();
        let active = self.active_backend();

        self.names
            .iter()
            .filter_map(|name| {
                let config = settings.backend(name)?;
                let observed = self
                    .observed
                    .get(name)
                    .map(|o| o.clone())
                    .unwrap_or_default();

                Some(BackendInfo {
                    name: name.clone(),
                    active: active.as_deref() == Some(name.as_str()),
                    running: observed.running,
                    model: observed
                        .current_model
                        .unwrap_or_else(|| config.model_name.clone()),
                    endpoint: config.endpoint(),
                    has_start_command: config.has_start_command(),
                    has_stop_command: config.has_stop_command(),
                })
            })
            .collect()
    }

    /// Our own leftover process may only be adopted if it holds the requested model
    fn adoptable(
        &self,
        gated: &mut Gated,
        target: &str,
        config: &BackendConfig,
        loaded: Option<&str>,
    ) -> bool {
        let Some(descriptor) = gated.registry.get_mut(target) else {
            return true;
        };
        if !self.supervisor.is_running(target, &mut descriptor.process) {
            return true;
        }
        !config.supports_dynamic_model || descriptor.current_model.as_deref() == loaded
    }

    /// Best-effort stop of a supervised process, using the backend's configured stop command
    async fn stop_backend(&self, settings: &Settings, descriptor: &mut BackendDescriptor) {
        let name = descriptor.name().to_string();
        let stop_command = settings
            .backend(&name)
            .and_then(|c| LaunchCommand::parse(&c.stop_command));
        self.supervisor
            .stop(
                &name,
                &mut descriptor.process,
                stop_command.as_ref(),
                stop_policy(settings),
            )
            .await;
        descriptor.current_model = None;
    }

    fn launch_command(
        &self,
        settings: &Settings,
        config: &BackendConfig,
        model: Option<&str>,
    ) -> Result<Option<LaunchCommand>, OrchestratorError> {
        let model_path = match model {
            Some(model) if config.supports_dynamic_model => {
                Some(self.catalog.resolve(settings, model)?)
            }
            _ => None,
        };
        Ok(LaunchCommand::start(
            &config.start_command,
            model_path.as_deref(),
        ))
    }

    fn publish_active(&self, gated: &mut Gated, target: &str, model: Option<String>) {
        gated.active = Some(target.to_string());
        self.state.send_modify(|s| {
            s.active = Some(target.to_string());
            s.model = model;
        });
    }

    fn publish_inactive(&self, gated: &mut Gated) {
        gated.active = None;
        self.state.send_modify(|s| {
            s.active = None;
            s.model = None;
        });
    }

    fn observe(&self, gated: &mut Gated) {
        for descriptor in gated.registry.iter_mut() {
            let name = descriptor.name().to_string();
            let running = self.supervisor.is_running(&name, &mut descriptor.process);
            self.observed.insert(
                name,
                Observation {
                    running,
                    current_model: descriptor.current_model.clone(),
                },
            );
        }
    }
}

fn default_model(config: &BackendConfig) -> Option<String> {
    Some(config.model_name.clone()).filter(|m| !m.is_empty())
}

fn stop_policy(settings: &Settings) -> StopPolicy {
    StopPolicy {
        command_timeout: settings.stop_command_timeout(),
        grace: settings.terminate_grace(),
    }
}

fn ready_policy(settings: &Settings) -> ReadyPolicy {
    ReadyPolicy {
        timeout: settings.switch_timeout(),
        attempt_timeout: settings.ready_probe_timeout(),
        poll_interval: settings.ready_poll_interval(),
    }
}
