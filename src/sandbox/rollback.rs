use std::fmt;

use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::instance::Sandbox;

/// One step that undoes a completed creation stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UndoAction {
    DeleteSandbox,
    RemoveNetwork,
    StopVm,
}

impl fmt::Display for UndoAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UndoAction::DeleteSandbox => "delete sandbox",
            UndoAction::RemoveNetwork => "remove network",
            UndoAction::StopVm => "stop VM",
        })
    }
}

/// Undo stack for a sandbox under construction.
///
/// Actions are pushed right after the resource they protect exists and run
/// last-in first-out. Every action runs even if an earlier one failed.
pub(crate) struct Rollback<'a> {
    sandbox: &'a Sandbox,
    actions: Vec<UndoAction>,
}

impl<'a> Rollback<'a> {
    pub(crate) fn new(sandbox: &'a Sandbox) -> Self {
        Self {
            sandbox,
            actions: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, action: UndoAction) {
        self.actions.push(action);
    }

    #[cfg(test)]
    pub(crate) fn pending(&self) -> &[UndoAction] {
        &self.actions
    }

    /// Creation succeeded; forget the undo actions.
    pub(crate) fn disarm(mut self) {
        self.actions.clear();
    }

    /// Run the queued actions in reverse order.
    ///
    /// Uses a fresh cancellation token: the signal that aborted creation must
    /// not also abort reclaiming what it left behind. Returns the actions
    /// that failed; they never replace the error that triggered the unwind.
    pub(crate) async fn unwind(mut self) -> Vec<(UndoAction, SandboxError)> {
        let ctx = CancellationToken::new();
        let mut failures = Vec::new();

        while let Some(action) = self.actions.pop() {
            let result = match action {
                UndoAction::StopVm => self.sandbox.stop_vm(&ctx).await,
                UndoAction::RemoveNetwork => self.sandbox.remove_network(&ctx).await,
                UndoAction::DeleteSandbox => self.sandbox.delete().await,
            };
            match result {
                Ok(()) => {
                    tracing::debug!(sandbox_id = %self.sandbox.id(), action = %action, "rollback step done");
                }
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %self.sandbox.id(),
                        action = %action,
                        error = %e,
                        "rollback step failed, continuing"
                    );
                    failures.push((action, e));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::backends::dry_run::{DryRunBackend, FaultPoint};
    use crate::sandbox::provider::SandboxBackend;
    use crate::sandbox::store::MemoryStateStore;
    use crate::sandbox::types::SandboxConfig;
    use std::sync::Arc;

    fn build(backend: &DryRunBackend) -> Sandbox {
        let config = SandboxConfig {
            id: "rb".into(),
            ..Default::default()
        };
        let parts = backend.build(&config, None, &tracing::Span::none()).unwrap();
        Sandbox::new(config, parts, Arc::new(MemoryStateStore::new()))
    }

    #[tokio::test]
    async fn unwinds_in_reverse_order() {
        let backend = DryRunBackend::new();
        let sandbox = build(&backend);
        let ctx = CancellationToken::new();
        sandbox.create_network(&ctx).await.unwrap();
        sandbox.setup_resource_controller().await.unwrap();
        sandbox.start_vm(&ctx, None).await.unwrap();

        let mut rollback = Rollback::new(&sandbox);
        rollback.push(UndoAction::DeleteSandbox);
        rollback.push(UndoAction::RemoveNetwork);
        rollback.push(UndoAction::StopVm);
        assert_eq!(rollback.pending().len(), 3);

        let failures = rollback.unwind().await;
        assert!(failures.is_empty());

        let events = backend.ledger().events_for("rb");
        assert_eq!(
            events[events.len() - 3..],
            ["vm.stop", "network.remove", "resources.teardown"]
        );
        assert!(backend.ledger().is_clean("rb"));
    }

    #[tokio::test]
    async fn failing_step_does_not_stop_the_rest() {
        let backend = DryRunBackend::new();
        backend.faults().inject(FaultPoint::VmStop);
        let sandbox = build(&backend);
        let ctx = CancellationToken::new();
        sandbox.create_network(&ctx).await.unwrap();
        sandbox.setup_resource_controller().await.unwrap();

        let mut rollback = Rollback::new(&sandbox);
        rollback.push(UndoAction::DeleteSandbox);
        rollback.push(UndoAction::RemoveNetwork);
        rollback.push(UndoAction::StopVm);
        let failures = rollback.unwind().await;

        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, UndoAction::StopVm);
        let ledger = backend.ledger();
        assert!(!ledger.has_network("rb"));
        assert!(!ledger.has_resource_group("rb"));
    }

    #[tokio::test]
    async fn disarmed_rollback_does_nothing() {
        let backend = DryRunBackend::new();
        let sandbox = build(&backend);
        let ctx = CancellationToken::new();
        sandbox.create_network(&ctx).await.unwrap();

        let mut rollback = Rollback::new(&sandbox);
        rollback.push(UndoAction::RemoveNetwork);
        rollback.disarm();
        assert!(backend.ledger().has_network("rb"));
    }
}
