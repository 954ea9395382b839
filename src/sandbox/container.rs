use super::types::{ContainerConfig, ContainerState, ContainerStatus};

/// A container living inside a sandbox VM.
///
/// Owned by its sandbox's container list. The config stays on the sandbox.
#[derive(Debug, Clone)]
pub struct Container {
    id: String,
    state: ContainerState,
}

impl Container {
    pub(crate) fn new(config: &ContainerConfig) -> Self {
        Self {
            id: config.id.clone(),
            state: ContainerState::Ready,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        self.state = state;
    }

    pub(crate) fn status(&self) -> ContainerStatus {
        ContainerStatus {
            id: self.id.clone(),
            state: self.state,
        }
    }
}
