use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;
use super::factory::Factory;
use super::hypervisor::PrestartHook;
use super::instance::Sandbox;
use super::provider::SandboxBackend;
use super::rollback::{Rollback, UndoAction};
use super::store::StateStore;
use super::types::{SandboxConfig, Stage};

/// Build a sandbox from `config` and drive it to a VM with containers.
///
/// Stages run strictly in order. On the first failure every completed stage
/// is undone (stop VM, remove network, delete sandbox) and that first error
/// is returned, tagged with its stage.
pub(crate) async fn create_sandbox_from_config(
    backend: &dyn SandboxBackend,
    store: Arc<dyn StateStore>,
    ctx: &CancellationToken,
    config: SandboxConfig,
    factory: Option<&dyn Factory>,
    hook: Option<PrestartHook>,
    span: &tracing::Span,
) -> Result<Arc<Sandbox>, SandboxError> {
    let started = Instant::now();
    let sandbox = Arc::new(allocate(backend, store, ctx, config, factory, span).await?);

    let mut rollback = Rollback::new(&sandbox);
    // A panicking collaborator must not skip the undo stack.
    let outcome = AssertUnwindSafe(run_stages(&sandbox, &mut rollback, ctx, hook))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(SandboxError::Backend(format!(
                "sandbox creation panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
    match outcome {
        Ok(()) => {
            rollback.disarm();
            tracing::info!(
                sandbox_id = %sandbox.id(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "sandbox created"
            );
            Ok(sandbox)
        }
        Err(e) => {
            tracing::warn!(sandbox_id = %sandbox.id(), error = %e, "sandbox creation failed, rolling back");
            let failures = rollback.unwind().await;
            if !failures.is_empty() {
                tracing::warn!(
                    sandbox_id = %sandbox.id(),
                    failed_steps = failures.len(),
                    "rollback incomplete, some resources may need manual cleanup"
                );
            }
            Err(e)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

async fn allocate(
    backend: &dyn SandboxBackend,
    store: Arc<dyn StateStore>,
    ctx: &CancellationToken,
    config: SandboxConfig,
    factory: Option<&dyn Factory>,
    span: &tracing::Span,
) -> Result<Sandbox, SandboxError> {
    config.validate()?;
    if ctx.is_cancelled() {
        return Err(SandboxError::Cancelled(Stage::Allocate));
    }

    let template = match factory {
        Some(factory) => factory
            .lookup(ctx, &config)
            .await
            .map_err(|e| e.at(Stage::Allocate))?,
        None => None,
    };
    if let Some(t) = &template {
        tracing::debug!(sandbox_id = %config.id, template_id = %t.template_id, "using pre-warmed VM template");
    }

    let parts = backend
        .build(&config, template, span)
        .map_err(|e| e.at(Stage::Allocate))?;
    Ok(Sandbox::new(config, parts, store))
}

async fn run_stages(
    sandbox: &Sandbox,
    rollback: &mut Rollback<'_>,
    ctx: &CancellationToken,
    hook: Option<PrestartHook>,
) -> Result<(), SandboxError> {
    rollback.push(UndoAction::DeleteSandbox);

    // Queued before create: removal copes with a half-built network.
    rollback.push(UndoAction::RemoveNetwork);
    stage(ctx, Stage::Network, sandbox, sandbox.create_network(ctx)).await?;

    stage(
        ctx,
        Stage::ResourceController,
        sandbox,
        sandbox.setup_resource_controller(),
    )
    .await?;

    stage(ctx, Stage::VmStart, sandbox, sandbox.start_vm(ctx, hook)).await?;
    rollback.push(UndoAction::StopVm);

    stage(ctx, Stage::PostNetwork, sandbox, async {
        sandbox.post_created_network(ctx).await;
        Ok(())
    })
    .await?;

    stage(
        ctx,
        Stage::GuestHandshake,
        sandbox,
        sandbox.get_and_store_guest_details(ctx),
    )
    .await?;

    stage(ctx, Stage::Containers, sandbox, async {
        sandbox.create_containers(ctx).await?;
        sandbox.mark_ready().await
    })
    .await
}

async fn stage<F>(
    ctx: &CancellationToken,
    stage: Stage,
    sandbox: &Sandbox,
    fut: F,
) -> Result<(), SandboxError>
where
    F: Future<Output = Result<(), SandboxError>>,
{
    if ctx.is_cancelled() {
        return Err(SandboxError::Cancelled(stage));
    }
    let started = Instant::now();
    fut.await.map_err(|e| e.at(stage))?;
    tracing::debug!(
        sandbox_id = %sandbox.id(),
        stage = %stage,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "stage complete"
    );
    Ok(())
}
