use async_trait::async_trait;

use super::error::SandboxError;
use super::types::ResourceConfig;

/// Host-side resource limits and accounting (cgroup-style) for one sandbox.
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Attach limits. All-or-nothing: on error nothing stays attached.
    async fn setup(&self, sandbox_id: &str, config: &ResourceConfig) -> Result<(), SandboxError>;

    /// Detach and remove the sandbox's group. Idempotent.
    async fn teardown(&self) -> Result<(), SandboxError>;
}
