use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::hypervisor::Hypervisor;
use super::types::SandboxConfig;

/// A pre-warmed VM handed out by a [`Factory`].
pub struct VmTemplate {
    pub template_id: String,
    pub hypervisor: Box<dyn Hypervisor>,
}

impl std::fmt::Debug for VmTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmTemplate")
            .field("template_id", &self.template_id)
            .finish_non_exhaustive()
    }
}

/// Cache of pre-built VMs used to skip boot latency.
///
/// `lookup` either returns a fully usable template or `None`; it never hands
/// out something half-initialized. On `None` the pipeline builds fresh.
#[async_trait]
pub trait Factory: Send + Sync {
    async fn lookup(
        &self,
        ctx: &CancellationToken,
        config: &SandboxConfig,
    ) -> Result<Option<VmTemplate>, SandboxError>;
}
