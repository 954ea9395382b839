use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use super::cleanup;
use super::error::SandboxError;
use super::factory::Factory;
use super::hypervisor::PrestartHook;
use super::instance::Sandbox;
use super::pipeline;
use super::provider::SandboxBackend;
use super::registry::{LockMode, Registry, SandboxLock};
use super::store::StateStore;
use super::types::{ContainerConfig, SandboxConfig, SandboxStatus, SandboxSummary};

/// Entry point for sandbox lifecycle operations.
///
/// Owns the registry of live sandboxes, the backend that builds their
/// collaborators and the state store. Every operation on an existing sandbox
/// takes that sandbox's registry lock for its whole duration.
pub struct Orchestrator {
    registry: Arc<Registry>,
    backend: Arc<dyn SandboxBackend>,
    store: Arc<dyn StateStore>,
    span: tracing::Span,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn SandboxBackend>,
        store: Arc<dyn StateStore>,
        lock_timeout: Option<Duration>,
    ) -> Self {
        let span = tracing::info_span!("orchestrator", backend = backend.name());
        Self {
            registry: Registry::new(lock_timeout),
            backend,
            store,
            span,
        }
    }

    /// Use `span` as the parent of every sandbox span instead of the default.
    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Create a sandbox, start its VM and create its containers.
    ///
    /// The ID is reserved first, so a concurrent create with the same ID
    /// fails with `AlreadyExists`. The pipeline runs on its own task: if the
    /// caller stops polling, creation still completes or rolls back.
    pub async fn create_sandbox(
        &self,
        ctx: &CancellationToken,
        config: SandboxConfig,
        factory: Option<Arc<dyn Factory>>,
        hook: Option<PrestartHook>,
    ) -> Result<Arc<Sandbox>, SandboxError> {
        config.validate()?;
        let reservation = self.registry.reserve(&config.id)?;

        let span = tracing::info_span!(parent: &self.span, "sandbox", sandbox_id = %config.id);
        let backend = Arc::clone(&self.backend);
        let store = Arc::clone(&self.store);
        let ctx = ctx.clone();
        let task_span = span.clone();

        let task = tokio::spawn(
            async move {
                let result = pipeline::create_sandbox_from_config(
                    backend.as_ref(),
                    store,
                    &ctx,
                    config,
                    factory.as_deref(),
                    hook,
                    &span,
                )
                .await;
                if let Ok(sandbox) = &result {
                    reservation.publish(Arc::clone(sandbox));
                }
                result
            }
            .instrument(task_span),
        );

        task.await
            .map_err(|e| SandboxError::Backend(format!("sandbox creation task failed: {e}")))?
    }

    /// Stop and delete one container, removing the sandbox with its last
    /// container.
    ///
    /// With `force`, container and sandbox stop/delete failures are logged
    /// and skipped; only the final sandbox deletion error is returned.
    pub async fn cleanup_container(
        &self,
        ctx: &CancellationToken,
        sandbox_id: &str,
        container_id: &str,
        force: bool,
    ) -> Result<(), SandboxError> {
        let span = tracing::info_span!(
            parent: &self.span,
            "cleanup_container",
            sandbox_id = %sandbox_id,
            container_id = %container_id,
            force
        );
        cleanup::cleanup_container(&self.registry, ctx, sandbox_id, container_id, force)
            .instrument(span)
            .await
    }

    async fn locked(
        &self,
        sandbox_id: &str,
        mode: LockMode,
    ) -> Result<(SandboxLock, Arc<Sandbox>), SandboxError> {
        let held = self.registry.lock(sandbox_id, mode).await?;
        let sandbox = self.registry.fetch(&held)?;
        Ok((held, sandbox))
    }

    pub async fn start_sandbox(
        &self,
        ctx: &CancellationToken,
        sandbox_id: &str,
    ) -> Result<(), SandboxError> {
        let (_held, sandbox) = self.locked(sandbox_id, LockMode::Exclusive).await?;
        sandbox.start(ctx).await?;
        tracing::info!(parent: &self.span, sandbox_id, "sandbox started");
        Ok(())
    }

    pub async fn stop_sandbox(
        &self,
        ctx: &CancellationToken,
        sandbox_id: &str,
        force: bool,
    ) -> Result<(), SandboxError> {
        let (_held, sandbox) = self.locked(sandbox_id, LockMode::Exclusive).await?;
        sandbox.stop(ctx, force).await
    }

    /// Remove a sandbox whose VM is already stopped.
    pub async fn delete_sandbox(&self, sandbox_id: &str) -> Result<(), SandboxError> {
        let (held, sandbox) = self.locked(sandbox_id, LockMode::Exclusive).await?;
        if sandbox.vm_running().await {
            return Err(SandboxError::InvalidState(format!(
                "sandbox {sandbox_id} VM is still running, stop it before deleting"
            )));
        }
        cleanup::destroy(&self.registry, &held, &sandbox).await
    }

    pub async fn create_container(
        &self,
        ctx: &CancellationToken,
        sandbox_id: &str,
        config: ContainerConfig,
    ) -> Result<(), SandboxError> {
        let (_held, sandbox) = self.locked(sandbox_id, LockMode::Exclusive).await?;
        sandbox.add_container(ctx, config).await
    }

    pub async fn start_container(
        &self,
        ctx: &CancellationToken,
        sandbox_id: &str,
        container_id: &str,
    ) -> Result<(), SandboxError> {
        if container_id.is_empty() {
            return Err(SandboxError::NeedContainerId);
        }
        let (_held, sandbox) = self.locked(sandbox_id, LockMode::Exclusive).await?;
        sandbox.start_container(ctx, container_id).await
    }

    pub async fn status_sandbox(&self, sandbox_id: &str) -> Result<SandboxStatus, SandboxError> {
        let (_held, sandbox) = self.locked(sandbox_id, LockMode::Shared).await?;
        Ok(sandbox.status().await)
    }

    /// Summaries of every published sandbox, sorted by ID.
    pub async fn list_sandboxes(&self) -> Vec<SandboxSummary> {
        let mut summaries = Vec::new();
        for sandbox in self.registry.sandboxes() {
            summaries.push(sandbox.summary().await);
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::dry_run::{DryRunBackend, FaultPoint, Ledger};
    use crate::sandbox::store::MemoryStateStore;
    use crate::sandbox::types::{ContainerState, SandboxState, Stage};

    fn config(id: &str, containers: &[&str]) -> SandboxConfig {
        SandboxConfig {
            id: id.into(),
            containers: containers.iter().map(|c| container(c)).collect(),
            ..Default::default()
        }
    }

    fn container(id: &str) -> ContainerConfig {
        ContainerConfig {
            id: id.into(),
            image: "alpine".into(),
            ..Default::default()
        }
    }

    fn setup() -> (Orchestrator, Arc<DryRunBackend>, Arc<Ledger>) {
        let backend = Arc::new(DryRunBackend::new());
        let ledger = backend.ledger();
        let orchestrator =
            Orchestrator::new(backend.clone(), Arc::new(MemoryStateStore::new()), None);
        (orchestrator, backend, ledger)
    }

    #[tokio::test]
    async fn create_publishes_sandbox() {
        let (orch, _backend, _ledger) = setup();
        let ctx = CancellationToken::new();
        let sandbox = orch
            .create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();
        assert_eq!(sandbox.id(), "s1");
        assert!(orch.registry().contains("s1"));
        assert_eq!(orch.backend_name(), "dry-run");
    }

    #[tokio::test]
    async fn duplicate_id_rejected_without_side_effects() {
        let (orch, _backend, ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &[]), None, None)
            .await
            .unwrap();
        let before = ledger.events().len();

        let err = orch
            .create_sandbox(&ctx, config("s1", &[]), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));
        assert_eq!(ledger.events().len(), before);
    }

    #[tokio::test]
    async fn failed_create_frees_the_id() {
        let (orch, backend, ledger) = setup();
        let ctx = CancellationToken::new();
        backend.faults().inject(FaultPoint::VmStart);
        let err = orch
            .create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::VmStart));
        assert!(!orch.registry().contains("s1"));
        assert!(ledger.is_clean("s1"));

        backend.faults().clear(FaultPoint::VmStart);
        orch.create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dropped_create_still_rolls_back() {
        let backend = Arc::new(DryRunBackend::new().with_latency(Duration::from_millis(10)));
        backend.faults().inject(FaultPoint::GuestDetails);
        let ledger = backend.ledger();
        let orch = Orchestrator::new(backend.clone(), Arc::new(MemoryStateStore::new()), None);
        let ctx = CancellationToken::new();

        let create = orch.create_sandbox(&ctx, config("s1", &["c1"]), None, None);
        let timed_out = tokio::time::timeout(Duration::from_millis(15), create).await;
        assert!(timed_out.is_err());

        // The detached pipeline finishes its rollback on its own.
        for _ in 0..100 {
            if ledger.events_for("s1").last().map(String::as_str) == Some("resources.teardown") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ledger.is_clean("s1"));
        assert!(!orch.registry().contains("s1"));
    }

    #[tokio::test]
    async fn start_stop_delete_lifecycle() {
        let (orch, _backend, ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &["c1", "c2"]), None, None)
            .await
            .unwrap();

        orch.start_sandbox(&ctx, "s1").await.unwrap();
        let status = orch.status_sandbox("s1").await.unwrap();
        assert_eq!(status.state, SandboxState::Running);
        assert!(status
            .containers
            .iter()
            .all(|c| c.state == ContainerState::Running));

        let err = orch.delete_sandbox("s1").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));

        orch.stop_sandbox(&ctx, "s1", false).await.unwrap();
        let status = orch.status_sandbox("s1").await.unwrap();
        assert_eq!(status.state, SandboxState::Stopped);
        assert!(!status.vm_running);

        orch.delete_sandbox("s1").await.unwrap();
        assert!(orch.status_sandbox("s1").await.unwrap_err().is_not_found());
        assert!(ledger.is_clean("s1"));
    }

    #[tokio::test]
    async fn stopping_twice_is_fine() {
        let (orch, _backend, _ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &[]), None, None)
            .await
            .unwrap();
        orch.stop_sandbox(&ctx, "s1", false).await.unwrap();
        orch.stop_sandbox(&ctx, "s1", false).await.unwrap();
    }

    #[tokio::test]
    async fn forced_stop_finishes_and_reports_first_error() {
        let (orch, backend, ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();
        orch.start_sandbox(&ctx, "s1").await.unwrap();
        backend.faults().inject(FaultPoint::ContainerStop);

        let err = orch.stop_sandbox(&ctx, "s1", true).await.unwrap_err();
        assert!(matches!(err, SandboxError::Agent(_)));
        let status = orch.status_sandbox("s1").await.unwrap();
        assert_eq!(status.state, SandboxState::Stopped);
        assert!(!ledger.has_vm("s1"));
        assert!(!ledger.has_network("s1"));
    }

    #[tokio::test]
    async fn add_container_to_live_sandbox() {
        let (orch, _backend, ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();

        orch.create_container(&ctx, "s1", container("c2")).await.unwrap();
        orch.start_container(&ctx, "s1", "c2").await.unwrap();
        assert_eq!(ledger.containers("s1"), ["c1", "c2"]);

        let err = orch
            .create_container(&ctx, "s1", container("c2"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidConfig(_)));

        let err = orch
            .start_container(&ctx, "s1", "missing")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn container_ops_need_a_running_vm() {
        let (orch, _backend, _ledger) = setup();
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();
        orch.stop_sandbox(&ctx, "s1", false).await.unwrap();

        let err = orch
            .create_container(&ctx, "s1", container("c2"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
        let err = orch.start_sandbox(&ctx, "s1").await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidState(_)));
    }

    #[tokio::test]
    async fn list_is_sorted_and_reflects_deletes() {
        let (orch, _backend, _ledger) = setup();
        let ctx = CancellationToken::new();
        for id in ["b", "a", "c"] {
            orch.create_sandbox(&ctx, config(id, &["x"]), None, None)
                .await
                .unwrap();
        }
        let ids: Vec<_> = orch.list_sandboxes().await.into_iter().map(|s| s.id).collect();
        assert_eq!(ids, ["a", "b", "c"]);

        orch.cleanup_container(&ctx, "b", "x", false).await.unwrap();
        let summaries = orch.list_sandboxes().await;
        assert_eq!(summaries.len(), 2);
        assert!(summaries.iter().all(|s| s.container_count == 1));
    }

    #[tokio::test]
    async fn status_waits_for_exclusive_holder() {
        let backend = Arc::new(DryRunBackend::new());
        let orch = Orchestrator::new(
            backend,
            Arc::new(MemoryStateStore::new()),
            Some(Duration::from_millis(20)),
        );
        let ctx = CancellationToken::new();
        orch.create_sandbox(&ctx, config("s1", &[]), None, None)
            .await
            .unwrap();

        let held = orch.registry().lock("s1", LockMode::Exclusive).await.unwrap();
        let err = orch.status_sandbox("s1").await.unwrap_err();
        assert!(matches!(err, SandboxError::LockTimeout(_)));
        drop(held);
        assert!(orch.status_sandbox("s1").await.is_ok());
    }
}
