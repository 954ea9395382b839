use std::future::Future;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::error::SandboxError;

/// Caller-supplied setup run inside VM start, e.g. to move the VM process
/// into extra namespaces before the guest boots.
///
/// `FnOnce` so a hypervisor cannot invoke it more than once.
pub type PrestartHook =
    Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), SandboxError>> + Send>;

/// Box an async closure as a [`PrestartHook`].
pub fn prestart_hook<F, Fut>(f: F) -> PrestartHook
where
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), SandboxError>> + Send + 'static,
{
    Box::new(move |ctx| Box::pin(f(ctx)))
}

/// Driver for the VM backing one sandbox.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Boot the VM (or resume a pre-warmed template).
    ///
    /// The hook runs inside this call's critical section. If the hook or the
    /// boot fails, the driver must leave no VM process behind: the pipeline
    /// does not register a stop for a start that did not complete.
    async fn start(
        &self,
        ctx: &CancellationToken,
        hook: Option<PrestartHook>,
    ) -> Result<(), SandboxError>;

    /// Stop the VM. Stopping a VM that is not running is not an error.
    async fn stop(&self, ctx: &CancellationToken) -> Result<(), SandboxError>;
}
