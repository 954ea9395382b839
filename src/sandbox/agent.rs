use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::types::{ContainerConfig, GuestDetails};

/// RPC client for the agent running inside the guest VM.
#[async_trait]
pub trait GuestAgent: Send + Sync {
    /// Query agent version and capabilities. Pure query.
    async fn guest_details(&self, ctx: &CancellationToken) -> Result<GuestDetails, SandboxError>;

    async fn create_container(
        &self,
        ctx: &CancellationToken,
        config: &ContainerConfig,
    ) -> Result<(), SandboxError>;

    async fn start_container(&self, ctx: &CancellationToken, id: &str)
        -> Result<(), SandboxError>;

    /// Stop the container's processes. `force` escalates to SIGKILL.
    async fn stop_container(
        &self,
        ctx: &CancellationToken,
        id: &str,
        force: bool,
    ) -> Result<(), SandboxError>;

    async fn remove_container(&self, ctx: &CancellationToken, id: &str)
        -> Result<(), SandboxError>;
}
