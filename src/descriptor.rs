//! Mutable per-backend state owned by the orchestrator.
//!
//! Static fields (endpoint, commands, capability flags) live in
//! [`BackendConfig`](crate::config::BackendConfig) and are read from the current settings
//! snapshot; a descriptor only carries what the orchestrator itself changes.
use tokio::process::Child;
use tracing::warn;

/// At most one supervised OS process.
#[derive(Debug, Default)]
pub struct ProcessSlot {
    child: Option<Child>,
}

impl ProcessSlot {
    pub fn is_empty(&self) -> bool {
        self.child.is_none()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether the tracked process is still running. A process found to have exited is
    /// reaped and the slot is cleared.
    pub fn is_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };

        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => {
                self.child = None;
                false
            }
            Err(e) => {
                warn!(error = %e, "Failed to check process status");
                false
            }
        }
    }

    pub fn set(&mut self, child: Child) {
        self.child = Some(child);
    }

    pub fn take(&mut self) -> Option<Child> {
        self.child.take()
    }
}

/// One registered backend kind.
#[derive(Debug)]
pub struct BackendDescriptor {
    name: String,
    /// Supervised process, `None` when not running or when adopted externally
    pub process: ProcessSlot,
    /// Model believed to be loaded; only meaningful while this backend is active
    pub current_model: Option<String>,
}

impl BackendDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            process: ProcessSlot::default(),
            current_model: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// The fixed set of descriptors, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    backends: Vec<BackendDescriptor>,
}

impl Registry {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            backends: names.into_iter().map(BackendDescriptor::new).collect(),
        }
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut BackendDescriptor> {
        self.backends.iter_mut().find(|b| b.name == name)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BackendDescriptor> {
        self.backends.iter_mut()
    }
}
