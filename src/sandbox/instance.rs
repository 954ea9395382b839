use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::agent::GuestAgent;
use super::container::Container;
use super::error::SandboxError;
use super::hypervisor::{Hypervisor, PrestartHook};
use super::network::NetworkProvider;
use super::provider::SandboxParts;
use super::resource::ResourceController;
use super::store::StateStore;
use super::types::*;

/// A VM-backed sandbox and the containers inside it.
///
/// The sandbox exclusively owns its hypervisor, network, resource controller
/// and guest agent handles. Mutable state sits behind an internal mutex that
/// is held for the whole of each operation, so the container list is never
/// observed halfway through a change. Callers outside the creation pipeline
/// additionally hold the registry lock for the sandbox ID.
pub struct Sandbox {
    id: SandboxId,
    config: SandboxConfig,
    hypervisor: Box<dyn Hypervisor>,
    network: Box<dyn NetworkProvider>,
    resources: Box<dyn ResourceController>,
    agent: Box<dyn GuestAgent>,
    store: Arc<dyn StateStore>,
    template_id: Option<String>,
    created_at: DateTime<Utc>,
    inner: Mutex<Inner>,
}

struct Inner {
    state: SandboxState,
    vm_running: bool,
    containers: Vec<Container>,
    guest_details: Option<GuestDetails>,
    post_network_warning: Option<String>,
}

impl Inner {
    fn position(&self, container_id: &str) -> Result<usize, SandboxError> {
        self.containers
            .iter()
            .position(|c| c.id() == container_id)
            .ok_or_else(|| SandboxError::ContainerNotFound(container_id.to_string()))
    }
}

impl Sandbox {
    pub(crate) fn new(config: SandboxConfig, parts: SandboxParts, store: Arc<dyn StateStore>) -> Self {
        Self {
            id: config.id.clone(),
            config,
            hypervisor: parts.hypervisor,
            network: parts.network,
            resources: parts.resources,
            agent: parts.agent,
            store,
            template_id: parts.template_id,
            created_at: Utc::now(),
            inner: Mutex::new(Inner {
                state: SandboxState::Provisioning,
                vm_running: false,
                containers: Vec::new(),
                guest_details: None,
                post_network_warning: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn template_id(&self) -> Option<&str> {
        self.template_id.as_deref()
    }

    pub async fn state(&self) -> SandboxState {
        self.inner.lock().await.state
    }

    pub async fn vm_running(&self) -> bool {
        self.inner.lock().await.vm_running
    }

    /// Containers in creation order.
    pub async fn containers(&self) -> Vec<Container> {
        self.inner.lock().await.containers.clone()
    }

    pub async fn container_count(&self) -> usize {
        self.inner.lock().await.containers.len()
    }

    pub async fn guest_details(&self) -> Option<GuestDetails> {
        self.inner.lock().await.guest_details.clone()
    }

    /// Error text from the post-network step, if it failed.
    ///
    /// That step does not fail creation; this is how callers tell
    /// "succeeded" apart from "failed and ignored".
    pub async fn post_network_warning(&self) -> Option<String> {
        self.inner.lock().await.post_network_warning.clone()
    }

    pub async fn status(&self) -> SandboxStatus {
        let inner = self.inner.lock().await;
        SandboxStatus {
            id: self.id.clone(),
            state: inner.state,
            vm_running: inner.vm_running,
            containers: inner.containers.iter().map(Container::status).collect(),
            guest_details: inner.guest_details.clone(),
            annotations: self.config.annotations.clone(),
            created_at: self.created_at,
        }
    }

    pub async fn summary(&self) -> SandboxSummary {
        let inner = self.inner.lock().await;
        SandboxSummary {
            id: self.id.clone(),
            state: inner.state,
            container_count: inner.containers.len(),
        }
    }

    fn snapshot(&self, inner: &Inner) -> SandboxSnapshot {
        SandboxSnapshot {
            id: self.id.clone(),
            state: inner.state,
            containers: inner.containers.iter().map(Container::status).collect(),
            guest_details: inner.guest_details.clone(),
            template_id: self.template_id.clone(),
            created_at: self.created_at,
        }
    }

    async fn persist(&self, inner: &Inner) -> Result<(), SandboxError> {
        self.store.save(&self.snapshot(inner)).await
    }

    // ── Creation stages ─────────────────────────────────────────

    pub(crate) async fn create_network(&self, ctx: &CancellationToken) -> Result<(), SandboxError> {
        tracing::debug!(sandbox_id = %self.id, mode = ?self.config.network.mode, "creating sandbox network");
        self.network.create(ctx, &self.config.network).await
    }

    pub(crate) async fn remove_network(&self, ctx: &CancellationToken) -> Result<(), SandboxError> {
        tracing::debug!(sandbox_id = %self.id, "removing sandbox network");
        self.network.remove(ctx).await
    }

    pub(crate) async fn setup_resource_controller(&self) -> Result<(), SandboxError> {
        self.resources.setup(&self.id, &self.config.resources).await
    }

    pub(crate) async fn start_vm(
        &self,
        ctx: &CancellationToken,
        hook: Option<PrestartHook>,
    ) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        tracing::info!(
            sandbox_id = %self.id,
            vcpus = self.config.hypervisor.vcpus,
            memory_mb = self.config.hypervisor.memory_mb,
            template = ?self.template_id,
            "starting VM"
        );
        self.hypervisor.start(ctx, hook).await?;
        inner.vm_running = true;
        Ok(())
    }

    pub(crate) async fn stop_vm(&self, ctx: &CancellationToken) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        tracing::info!(sandbox_id = %self.id, "stopping VM");
        self.hypervisor.stop(ctx).await?;
        inner.vm_running = false;
        Ok(())
    }

    /// Best-effort network finishing once the VM is up. Failures are logged
    /// and kept as [`Sandbox::post_network_warning`].
    pub(crate) async fn post_created_network(&self, ctx: &CancellationToken) {
        if let Err(e) = self.network.post_create(ctx).await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "post-network setup failed, continuing");
            self.inner.lock().await.post_network_warning = Some(e.to_string());
        }
    }

    pub(crate) async fn get_and_store_guest_details(
        &self,
        ctx: &CancellationToken,
    ) -> Result<(), SandboxError> {
        let details = self.agent.guest_details(ctx).await?;
        tracing::debug!(
            sandbox_id = %self.id,
            agent_version = %details.agent_version,
            capabilities = ?details.capabilities,
            "guest handshake complete"
        );
        let mut inner = self.inner.lock().await;
        inner.guest_details = Some(details);
        self.persist(&inner).await
    }

    /// Create every container from the config, in order.
    pub(crate) async fn create_containers(&self, ctx: &CancellationToken) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        if !inner.vm_running {
            return Err(SandboxError::InvalidState(format!(
                "cannot create containers in sandbox {}: VM is not running",
                self.id
            )));
        }
        for config in &self.config.containers {
            self.agent.create_container(ctx, config).await?;
            inner.containers.push(Container::new(config));
            tracing::info!(sandbox_id = %self.id, container_id = %config.id, "container created");
        }
        self.persist(&inner).await
    }

    pub(crate) async fn mark_ready(&self) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        inner.state = SandboxState::Ready;
        self.persist(&inner).await
    }

    // ── Lifecycle on a live sandbox ─────────────────────────────

    /// Add one container to a sandbox whose VM is already up.
    pub(crate) async fn add_container(
        &self,
        ctx: &CancellationToken,
        config: ContainerConfig,
    ) -> Result<(), SandboxError> {
        if config.id.is_empty() {
            return Err(SandboxError::NeedContainerId);
        }
        let mut inner = self.inner.lock().await;
        if !inner.vm_running {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} VM is not running",
                self.id
            )));
        }
        if inner.containers.iter().any(|c| c.id() == config.id) {
            return Err(SandboxError::InvalidConfig(format!(
                "container {} already exists in sandbox {}",
                config.id, self.id
            )));
        }
        self.agent.create_container(ctx, &config).await?;
        tracing::info!(sandbox_id = %self.id, container_id = %config.id, "container created");
        inner.containers.push(Container::new(&config));
        self.persist(&inner).await
    }

    pub(crate) async fn start_container(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
    ) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        if !inner.vm_running {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} VM is not running",
                self.id
            )));
        }
        let idx = inner.position(container_id)?;
        if inner.containers[idx].is_running() {
            return Ok(());
        }
        self.agent.start_container(ctx, container_id).await?;
        inner.containers[idx].set_state(ContainerState::Running);
        inner.state = SandboxState::Running;
        self.persist(&inner).await
    }

    /// Start every container that is not already running.
    pub(crate) async fn start(&self, ctx: &CancellationToken) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        if !inner.vm_running {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {} is {} and its VM is not running",
                self.id, inner.state
            )));
        }
        for container in inner.containers.iter_mut() {
            if container.is_running() {
                continue;
            }
            self.agent.start_container(ctx, container.id()).await?;
            container.set_state(ContainerState::Running);
        }
        inner.state = SandboxState::Running;
        self.persist(&inner).await
    }

    /// Stop one container.
    ///
    /// With `force`, the container is treated as stopped even when the agent
    /// reports an error, so a following delete can proceed; the error is
    /// still returned for the caller to log or drop.
    pub(crate) async fn stop_container(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
        force: bool,
    ) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        let idx = inner.position(container_id)?;
        match inner.containers[idx].state() {
            ContainerState::Stopped => return Ok(()),
            ContainerState::Ready => {
                inner.containers[idx].set_state(ContainerState::Stopped);
                return self.persist(&inner).await;
            }
            ContainerState::Running => {}
        }
        if !inner.vm_running {
            // The guest is gone and took its processes with it.
            inner.containers[idx].set_state(ContainerState::Stopped);
            return self.persist(&inner).await;
        }

        let result = self.agent.stop_container(ctx, container_id, force).await;
        if result.is_ok() || force {
            inner.containers[idx].set_state(ContainerState::Stopped);
        }
        result?;
        self.persist(&inner).await
    }

    /// Remove a stopped container from the guest and from this sandbox.
    ///
    /// With `force`, the container leaves the list even if the agent could
    /// not remove it; the VM teardown reclaims whatever is left. Once the VM
    /// is down there is nothing left in the guest and only the list changes.
    pub(crate) async fn delete_container(
        &self,
        ctx: &CancellationToken,
        container_id: &str,
        force: bool,
    ) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        let idx = inner.position(container_id)?;
        if inner.containers[idx].is_running() {
            return Err(SandboxError::InvalidState(format!(
                "container {container_id} is still running"
            )));
        }

        let result = if inner.vm_running {
            self.agent.remove_container(ctx, container_id).await
        } else {
            Ok(())
        };
        if result.is_ok() || force {
            inner.containers.remove(idx);
            tracing::info!(sandbox_id = %self.id, container_id = %container_id, "container deleted");
        }
        result?;
        self.persist(&inner).await
    }

    /// Stop containers, the VM and the network, in that order.
    ///
    /// Without `force` the first failure is returned immediately. With
    /// `force` every step runs, the sandbox ends up `Stopped`, and the first
    /// error seen is returned.
    pub(crate) async fn stop(&self, ctx: &CancellationToken, force: bool) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SandboxState::Stopped => return Ok(()),
            SandboxState::Deleted => return Err(SandboxError::NotFound(self.id.clone())),
            _ => {}
        }
        tracing::info!(sandbox_id = %self.id, force, "stopping sandbox");

        let mut first_err: Option<SandboxError> = None;
        let mut note = |e: SandboxError, what: &str| -> Result<(), SandboxError> {
            if !force {
                return Err(e);
            }
            tracing::warn!(sandbox_id = %self.id, error = %e, "forced stop: {what} failed");
            first_err.get_or_insert(e);
            Ok(())
        };

        for container in inner.containers.iter_mut() {
            if !container.is_running() {
                continue;
            }
            if let Err(e) = self.agent.stop_container(ctx, container.id(), force).await {
                note(e, "container stop")?;
            }
            container.set_state(ContainerState::Stopped);
        }

        if let Err(e) = self.hypervisor.stop(ctx).await {
            note(e, "VM stop")?;
        }
        inner.vm_running = false;

        if let Err(e) = self.network.remove(ctx).await {
            note(e, "network removal")?;
        }

        inner.state = SandboxState::Stopped;
        if let Err(e) = self.persist(&inner).await {
            note(e, "state save")?;
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Release the resource controller and persisted state.
    ///
    /// The VM and network must already be stopped; this invalidates the
    /// sandbox for every other operation.
    pub(crate) async fn delete(&self) -> Result<(), SandboxError> {
        let mut inner = self.inner.lock().await;
        match inner.state {
            SandboxState::Deleted => return Err(SandboxError::NotFound(self.id.clone())),
            SandboxState::Running => {
                return Err(SandboxError::InvalidState(format!(
                    "sandbox {} is running, stop it before deleting",
                    self.id
                )));
            }
            _ => {}
        }

        inner.containers.clear();
        inner.state = SandboxState::Deleted;

        let teardown = self.resources.teardown().await;
        let removed = self.store.remove(&self.id).await;
        tracing::info!(sandbox_id = %self.id, "sandbox deleted");
        teardown?;
        removed.map(|_| ())
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("template_id", &self.template_id)
            .finish_non_exhaustive()
    }
}
