use super::agent::GuestAgent;
use super::error::SandboxError;
use super::factory::VmTemplate;
use super::hypervisor::Hypervisor;
use super::network::NetworkProvider;
use super::resource::ResourceController;
use super::types::SandboxConfig;

/// The collaborators one sandbox exclusively owns.
pub struct SandboxParts {
    pub hypervisor: Box<dyn Hypervisor>,
    pub network: Box<dyn NetworkProvider>,
    pub resources: Box<dyn ResourceController>,
    pub agent: Box<dyn GuestAgent>,
    pub template_id: Option<String>,
}

/// Builds per-sandbox collaborators.
///
/// One backend instance lives on the `Orchestrator`. `build` only constructs
/// handles; nothing is created on the host until the pipeline drives them,
/// so a failing `build` needs no rollback. The span is the sandbox's own
/// tracing span and should be handed to every collaborator built here.
pub trait SandboxBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn build(
        &self,
        config: &SandboxConfig,
        template: Option<VmTemplate>,
        span: &tracing::Span,
    ) -> Result<SandboxParts, SandboxError>;
}
