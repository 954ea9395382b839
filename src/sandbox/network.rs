use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::types::NetworkConfig;

/// Host-side network plumbing for one sandbox (namespace, TAP/veth pairs).
#[async_trait]
pub trait NetworkProvider: Send + Sync {
    async fn create(&self, ctx: &CancellationToken, config: &NetworkConfig)
        -> Result<(), SandboxError>;

    /// Finishing touches once the VM is up (routes, neighbour entries).
    async fn post_create(&self, ctx: &CancellationToken) -> Result<(), SandboxError>;

    /// Tear the network down.
    ///
    /// Must succeed when there is nothing to remove, including after a
    /// `create` that failed halfway.
    async fn remove(&self, ctx: &CancellationToken) -> Result<(), SandboxError>;
}
