pub mod agent;
pub mod backends;
pub mod container;
pub mod error;
pub mod factory;
pub mod hypervisor;
pub mod instance;
pub mod network;
pub mod orchestrator;
pub mod provider;
pub mod registry;
pub mod resource;
pub mod store;
pub mod types;

// Internal implementation modules
mod cleanup;
mod pipeline;
mod rollback;

use std::sync::Arc;

pub use container::Container;
pub use error::SandboxError;
pub use factory::{Factory, VmTemplate};
pub use hypervisor::{prestart_hook, PrestartHook};
pub use instance::Sandbox;
pub use orchestrator::Orchestrator;
pub use provider::{SandboxBackend, SandboxParts};
pub use registry::{LockMode, Registry, SandboxLock};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
pub use types::*;

use crate::config::Config;

/// Build an orchestrator over `backend` from runtime config.
pub fn build_orchestrator(config: &Config, backend: Arc<dyn SandboxBackend>) -> Orchestrator {
    let store: Arc<dyn StateStore> = match (&config.state_dir, config.persist) {
        (Some(dir), true) => {
            tracing::info!(
                backend = backend.name(),
                state_dir = %dir.display(),
                "initializing orchestrator with file state store"
            );
            Arc::new(FileStateStore::new(dir))
        }
        _ => {
            tracing::info!(backend = backend.name(), "initializing orchestrator with in-memory state");
            Arc::new(MemoryStateStore::new())
        }
    };
    Orchestrator::new(backend, store, config.lock_timeout)
}
