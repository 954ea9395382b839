use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::instance::Sandbox;
use super::registry::{LockMode, Registry, SandboxLock};

/// Stop and delete one container; tear the sandbox down once it is empty.
///
/// Runs entirely under the sandbox's exclusive lock. With `force`, stop and
/// delete failures on the container and the sandbox are logged and skipped;
/// only the final sandbox deletion can fail the call.
pub(crate) async fn cleanup_container(
    registry: &Registry,
    ctx: &CancellationToken,
    sandbox_id: &str,
    container_id: &str,
    force: bool,
) -> Result<(), SandboxError> {
    if sandbox_id.is_empty() {
        return Err(SandboxError::NeedSandboxId);
    }
    if container_id.is_empty() {
        return Err(SandboxError::NeedContainerId);
    }

    let held = registry.lock(sandbox_id, LockMode::Exclusive).await?;
    let sandbox = registry.fetch(&held)?;

    if let Err(e) = sandbox.stop_container(ctx, container_id, force).await {
        if !force {
            return Err(e);
        }
        tracing::warn!(sandbox_id, container_id, error = %e, "forced cleanup: container stop failed");
    }

    if let Err(e) = sandbox.delete_container(ctx, container_id, force).await {
        if !force {
            return Err(e);
        }
        tracing::warn!(sandbox_id, container_id, error = %e, "forced cleanup: container delete failed");
    }

    let remaining = sandbox.container_count().await;
    if remaining > 0 {
        tracing::debug!(sandbox_id, container_id, remaining, "container cleaned up");
        return Ok(());
    }

    tracing::info!(sandbox_id, "last container gone, removing sandbox");
    if let Err(e) = sandbox.stop(ctx, force).await {
        if !force {
            return Err(e);
        }
        tracing::warn!(sandbox_id, error = %e, "forced cleanup: sandbox stop failed");
    }

    destroy(registry, &held, &sandbox).await
}

/// Release what the sandbox still holds, then drop it from the registry.
///
/// The caller holds the exclusive lock, and the registry entry stays until
/// delete returns, so the ID cannot be reserved again while teardown runs.
/// The sandbox is deregistered even when delete fails; waiters that acquire
/// the lock afterwards see `NotFound`.
pub(crate) async fn destroy(
    registry: &Registry,
    held: &SandboxLock,
    sandbox: &Sandbox,
) -> Result<(), SandboxError> {
    let deleted = sandbox.delete().await;
    let deregistered = registry.deregister(held);
    deleted?;
    deregistered.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::dry_run::{DryRunBackend, FaultPoint, Ledger};
    use crate::sandbox::store::{MemoryStateStore, StateStore};
    use crate::sandbox::types::{ContainerConfig, SandboxConfig, SandboxSnapshot, SandboxState};
    use crate::sandbox::Orchestrator;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    fn config(id: &str, containers: &[&str]) -> SandboxConfig {
        SandboxConfig {
            id: id.into(),
            containers: containers
                .iter()
                .map(|c| ContainerConfig {
                    id: (*c).into(),
                    image: "busybox".into(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        backend: Arc<DryRunBackend>,
        ledger: Arc<Ledger>,
        store: Arc<MemoryStateStore>,
        ctx: CancellationToken,
    }

    fn harness(backend: DryRunBackend) -> Harness {
        let backend = Arc::new(backend);
        let store = Arc::new(MemoryStateStore::new());
        Harness {
            orchestrator: Orchestrator::new(backend.clone(), store.clone(), None),
            ledger: backend.ledger(),
            backend,
            store,
            ctx: CancellationToken::new(),
        }
    }

    impl Harness {
        async fn create(&self, id: &str, containers: &[&str]) -> Arc<Sandbox> {
            self.orchestrator
                .create_sandbox(&self.ctx, config(id, containers), None, None)
                .await
                .unwrap()
        }

        async fn cleanup(&self, sid: &str, cid: &str, force: bool) -> Result<(), SandboxError> {
            self.orchestrator
                .cleanup_container(&self.ctx, sid, cid, force)
                .await
        }
    }

    #[tokio::test]
    async fn empty_ids_rejected_before_locking() {
        let h = harness(DryRunBackend::new());
        assert!(matches!(
            h.cleanup("", "c1", false).await,
            Err(SandboxError::NeedSandboxId)
        ));
        assert!(matches!(
            h.cleanup("s1", "", true).await,
            Err(SandboxError::NeedContainerId)
        ));
        assert!(h.ledger.events().is_empty());
    }

    #[tokio::test]
    async fn removing_one_of_two_containers_keeps_the_sandbox() {
        let h = harness(DryRunBackend::new());
        let sandbox = h.create("s1", &["c1", "c2"]).await;
        h.orchestrator.start_container(&h.ctx, "s1", "c1").await.unwrap();

        h.cleanup("s1", "c1", false).await.unwrap();

        assert!(h.orchestrator.registry().contains("s1"));
        let ids: Vec<_> = sandbox.containers().await.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(ids, ["c2"]);
        assert!(h.ledger.has_vm("s1"));
        assert_eq!(h.ledger.containers("s1"), ["c2"]);
        let events = h.ledger.events_for("s1");
        assert!(events.ends_with(&["container.stop:c1".to_string(), "container.remove:c1".to_string()]));
    }

    #[tokio::test]
    async fn last_container_cascades_to_sandbox() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;

        h.cleanup("s1", "c1", false).await.unwrap();

        assert!(!h.orchestrator.registry().contains("s1"));
        assert!(h.ledger.is_clean("s1"));
        assert!(h.store.load("s1").await.unwrap().is_none());
        let events = h.ledger.events_for("s1");
        assert_eq!(
            events[events.len() - 4..],
            ["container.remove:c1", "vm.stop", "network.remove", "resources.teardown"]
        );
    }

    #[tokio::test]
    async fn second_cleanup_reports_not_found_and_touches_nothing() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;
        h.cleanup("s1", "c1", false).await.unwrap();
        let before = h.ledger.events().len();

        let err = h.cleanup("s1", "c1", false).await.unwrap_err();
        assert!(err.is_not_found());
        let err = h.cleanup("s1", "c1", true).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.ledger.events().len(), before);
    }

    #[tokio::test]
    async fn unknown_container_is_not_found_without_force() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;
        let err = h.cleanup("s1", "nope", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::ContainerNotFound(_)));
        assert!(h.orchestrator.registry().contains("s1"));
    }

    #[tokio::test]
    async fn non_forced_stop_failure_aborts_and_keeps_container() {
        let h = harness(DryRunBackend::new());
        let sandbox = h.create("s1", &["c1"]).await;
        h.orchestrator.start_container(&h.ctx, "s1", "c1").await.unwrap();
        h.backend.faults().inject(FaultPoint::ContainerStop);

        let err = h.cleanup("s1", "c1", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::Agent(_)));

        assert_eq!(sandbox.container_count().await, 1);
        assert!(sandbox.containers().await[0].is_running());
        assert!(h.orchestrator.registry().contains("s1"));
        assert!(h.ledger.has_vm("s1"));
    }

    #[tokio::test]
    async fn forced_cleanup_pushes_through_every_failure_but_delete() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;
        h.orchestrator.start_container(&h.ctx, "s1", "c1").await.unwrap();
        let faults = h.backend.faults();
        faults.inject(FaultPoint::ContainerStop);
        faults.inject(FaultPoint::ContainerRemove);
        faults.inject(FaultPoint::VmStop);
        faults.inject(FaultPoint::NetworkRemove);

        h.cleanup("s1", "c1", true).await.unwrap();
        assert!(!h.orchestrator.registry().contains("s1"));
        assert!(!h.ledger.has_resource_group("s1"));
    }

    #[tokio::test]
    async fn forced_cleanup_still_reports_sandbox_delete_failure() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;
        h.backend.faults().inject(FaultPoint::ResourceTeardown);

        let err = h.cleanup("s1", "c1", true).await.unwrap_err();
        assert!(matches!(err, SandboxError::ResourceControl(_)));
        // Deregistered regardless: a retry reports not-found.
        assert!(!h.orchestrator.registry().contains("s1"));
        assert!(h.cleanup("s1", "c1", true).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn non_forced_sandbox_stop_failure_keeps_sandbox_registered() {
        let h = harness(DryRunBackend::new());
        let sandbox = h.create("s1", &["c1"]).await;
        h.backend.faults().inject(FaultPoint::VmStop);

        let err = h.cleanup("s1", "c1", false).await.unwrap_err();
        assert!(matches!(err, SandboxError::Hypervisor(_)));
        assert!(h.orchestrator.registry().contains("s1"));
        assert_eq!(sandbox.container_count().await, 0);
        assert_ne!(sandbox.state().await, SandboxState::Deleted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_cleanups_on_one_sandbox_serialize() {
        let h = Arc::new(harness(
            DryRunBackend::new().with_latency(Duration::from_millis(5)),
        ));
        h.create("s1", &["c1", "c2"]).await;
        h.orchestrator.start_container(&h.ctx, "s1", "c1").await.unwrap();
        h.orchestrator.start_container(&h.ctx, "s1", "c2").await.unwrap();

        let (a, b) = (h.clone(), h.clone());
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.cleanup("s1", "c1", false).await }),
            tokio::spawn(async move { b.cleanup("s1", "c2", false).await }),
        );
        ra.unwrap().unwrap();
        rb.unwrap().unwrap();

        // Each container's stop+remove pair is contiguous: no interleaving.
        let events = h.ledger.events_for("s1");
        for cid in ["c1", "c2"] {
            let stop = events.iter().position(|e| *e == format!("container.stop:{cid}")).unwrap();
            assert_eq!(events[stop + 1], format!("container.remove:{cid}"));
        }
        // Exactly one of the two calls tore the sandbox down.
        assert_eq!(events.iter().filter(|e| *e == "vm.stop").count(), 1);
        assert_eq!(events.iter().filter(|e| *e == "resources.teardown").count(), 1);
        assert!(h.ledger.is_clean("s1"));
        assert!(!h.orchestrator.registry().contains("s1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cleanups_on_different_sandboxes_do_not_block() {
        let h = Arc::new(harness(
            DryRunBackend::new().with_latency(Duration::from_millis(20)),
        ));
        h.create("s1", &["c1"]).await;
        h.create("s2", &["c1"]).await;

        let held = h
            .orchestrator
            .registry()
            .lock("s1", LockMode::Exclusive)
            .await
            .unwrap();
        let other = tokio::time::timeout(Duration::from_secs(2), h.cleanup("s2", "c1", false)).await;
        assert!(matches!(other, Ok(Ok(()))));
        drop(held);

        h.cleanup("s1", "c1", false).await.unwrap();
        assert!(h.orchestrator.registry().is_empty());
    }

    #[tokio::test]
    async fn non_forced_cleanup_after_stop_cascades() {
        let h = harness(DryRunBackend::new());
        h.create("s1", &["c1"]).await;
        h.orchestrator.start_container(&h.ctx, "s1", "c1").await.unwrap();
        h.orchestrator.stop_sandbox(&h.ctx, "s1", false).await.unwrap();
        assert!(!h.ledger.has_vm("s1"));

        h.cleanup("s1", "c1", false).await.unwrap();
        assert!(!h.orchestrator.registry().contains("s1"));
        assert!(h.ledger.is_clean("s1"));
        assert!(h.cleanup("s1", "c1", false).await.unwrap_err().is_not_found());
    }

    /// Store whose removals take a while, to hold a cascade inside delete.
    struct SlowRemoveStore {
        inner: MemoryStateStore,
        delay: Duration,
    }

    #[async_trait]
    impl StateStore for SlowRemoveStore {
        async fn save(&self, snapshot: &SandboxSnapshot) -> Result<(), SandboxError> {
            self.inner.save(snapshot).await
        }

        async fn load(&self, id: &str) -> Result<Option<SandboxSnapshot>, SandboxError> {
            self.inner.load(id).await
        }

        async fn remove(&self, id: &str) -> Result<bool, SandboxError> {
            tokio::time::sleep(self.delay).await;
            self.inner.remove(id).await
        }

        async fn list(&self) -> Result<Vec<SandboxSnapshot>, SandboxError> {
            self.inner.list().await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn id_stays_taken_until_cascade_delete_finishes() {
        let backend = Arc::new(DryRunBackend::new());
        let store = Arc::new(SlowRemoveStore {
            inner: MemoryStateStore::new(),
            delay: Duration::from_millis(200),
        });
        let orchestrator = Arc::new(Orchestrator::new(backend.clone(), store.clone(), None));
        let ctx = CancellationToken::new();
        orchestrator
            .create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();

        let (orch, task_ctx) = (orchestrator.clone(), ctx.clone());
        let cleanup = tokio::spawn(async move {
            orch.cleanup_container(&task_ctx, "s1", "c1", false).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Old delete is still running: the ID is not free yet.
        assert!(orchestrator.registry().contains("s1"));
        let err = orchestrator
            .create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists(_)));

        cleanup.await.unwrap().unwrap();
        assert!(!orchestrator.registry().contains("s1"));

        // A sandbox created after the cascade keeps its state.
        orchestrator
            .create_sandbox(&ctx, config("s1", &["c1"]), None, None)
            .await
            .unwrap();
        assert!(store.load("s1").await.unwrap().is_some());
        assert!(orchestrator.registry().contains("s1"));
    }

    #[tokio::test]
    async fn scenario_create_then_clean_up_both_containers() {
        let h = harness(DryRunBackend::new());
        h.create("S1", &["C1", "C2"]).await;
        h.orchestrator.start_sandbox(&h.ctx, "S1").await.unwrap();

        h.cleanup("S1", "C1", false).await.unwrap();
        let status = h.orchestrator.status_sandbox("S1").await.unwrap();
        assert_eq!(status.containers.len(), 1);
        assert_eq!(status.containers[0].id, "C2");

        h.cleanup("S1", "C2", false).await.unwrap();
        assert!(h.orchestrator.status_sandbox("S1").await.unwrap_err().is_not_found());
        assert!(h.ledger.is_clean("S1"));
        assert_eq!(h.ledger.live_vm_count(), 0);
    }
}
