use std::io;

use super::types::Stage;

/// Errors from sandbox lifecycle operations.
///
/// Collaborators map their internal failures into the subsystem variants
/// (`Network`, `Hypervisor`, ...). The creation pipeline wraps those in
/// `Stage` so callers can tell which step broke without inspecting internals.
#[derive(thiserror::Error, Debug)]
pub enum SandboxError {
    #[error("sandbox ID is required")]
    NeedSandboxId,

    #[error("container ID is required")]
    NeedContainerId,

    #[error("invalid sandbox config: {0}")]
    InvalidConfig(String),

    #[error("sandbox already exists: {0}")]
    AlreadyExists(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("timed out waiting for lock on sandbox {0}")]
    LockTimeout(String),

    #[error("{0} cancelled")]
    Cancelled(Stage),

    #[error("{stage} failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<SandboxError>,
    },

    #[error("network: {0}")]
    Network(String),

    #[error("resource controller: {0}")]
    ResourceControl(String),

    #[error("hypervisor: {0}")]
    Hypervisor(String),

    #[error("guest agent: {0}")]
    Agent(String),

    #[error("state store: {0}")]
    Store(String),

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serialization: {0}")]
    Serde(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl SandboxError {
    /// Wrap this error with the pipeline stage it came from.
    ///
    /// Already-staged and cancellation errors are returned unchanged so a
    /// stage is never reported twice.
    pub(crate) fn at(self, stage: Stage) -> Self {
        match self {
            e @ (SandboxError::Stage { .. } | SandboxError::Cancelled(_)) => e,
            other => SandboxError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// The sandbox or container was already gone.
    ///
    /// Re-running cleanup on a torn-down sandbox hits this class, which lets
    /// callers treat it as "already done" rather than an operational failure.
    pub fn is_not_found(&self) -> bool {
        match self {
            SandboxError::NotFound(_) | SandboxError::ContainerNotFound(_) => true,
            SandboxError::Stage { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Errors caused by the request itself. These are never retried.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            SandboxError::NeedSandboxId
                | SandboxError::NeedContainerId
                | SandboxError::InvalidConfig(_)
                | SandboxError::AlreadyExists(_)
        )
    }

    /// Pipeline stage that produced this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SandboxError::Stage { stage, .. } | SandboxError::Cancelled(stage) => Some(*stage),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(e: serde_json::Error) -> Self {
        SandboxError::Serde(e.to_string())
    }
}
