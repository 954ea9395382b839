//! In-process backend that simulates a sandbox's host resources.
//!
//! Nothing touches the host: every collaborator records what it would have
//! created in a shared [`Ledger`], which doubles as the "externally visible"
//! state when checking that a failed creation reclaimed everything. Failures
//! can be injected per operation through [`FaultPlan`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::sandbox::agent::GuestAgent;
use crate::sandbox::error::SandboxError;
use crate::sandbox::factory::{Factory, VmTemplate};
use crate::sandbox::hypervisor::{Hypervisor, PrestartHook};
use crate::sandbox::network::NetworkProvider;
use crate::sandbox::provider::{SandboxBackend, SandboxParts};
use crate::sandbox::resource::ResourceController;
use crate::sandbox::types::*;

const DRY_RUN_AGENT_VERSION: &str = "dry-run-1.0";

// ── Fault injection ─────────────────────────────────────────────────

/// An operation that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    NetworkCreate,
    NetworkPostCreate,
    NetworkRemove,
    ResourceSetup,
    ResourceTeardown,
    VmStart,
    VmStop,
    GuestDetails,
    ContainerCreate,
    ContainerStart,
    ContainerStop,
    ContainerRemove,
    TemplateLookup,
}

impl FaultPoint {
    pub const ALL: [FaultPoint; 13] = [
        FaultPoint::NetworkCreate,
        FaultPoint::NetworkPostCreate,
        FaultPoint::NetworkRemove,
        FaultPoint::ResourceSetup,
        FaultPoint::ResourceTeardown,
        FaultPoint::VmStart,
        FaultPoint::VmStop,
        FaultPoint::GuestDetails,
        FaultPoint::ContainerCreate,
        FaultPoint::ContainerStart,
        FaultPoint::ContainerStop,
        FaultPoint::ContainerRemove,
        FaultPoint::TemplateLookup,
    ];

    fn as_str(self) -> &'static str {
        match self {
            FaultPoint::NetworkCreate => "network-create",
            FaultPoint::NetworkPostCreate => "network-post-create",
            FaultPoint::NetworkRemove => "network-remove",
            FaultPoint::ResourceSetup => "resource-setup",
            FaultPoint::ResourceTeardown => "resource-teardown",
            FaultPoint::VmStart => "vm-start",
            FaultPoint::VmStop => "vm-stop",
            FaultPoint::GuestDetails => "guest-details",
            FaultPoint::ContainerCreate => "container-create",
            FaultPoint::ContainerStart => "container-start",
            FaultPoint::ContainerStop => "container-stop",
            FaultPoint::ContainerRemove => "container-remove",
            FaultPoint::TemplateLookup => "template-lookup",
        }
    }
}

impl fmt::Display for FaultPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FaultPoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultPoint::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<_> = FaultPoint::ALL.iter().map(|p| p.as_str()).collect();
                format!("unknown fault point '{s}' (expected one of: {})", known.join(", "))
            })
    }
}

/// Which operations fail. Shared by every collaborator of one backend.
#[derive(Default)]
pub struct FaultPlan {
    points: Mutex<HashSet<FaultPoint>>,
}

impl FaultPlan {
    pub fn inject(&self, point: FaultPoint) {
        lock(&self.points).insert(point);
    }

    pub fn clear(&self, point: FaultPoint) {
        lock(&self.points).remove(&point);
    }

    fn check(&self, point: FaultPoint, sandbox_id: &str) -> Result<(), String> {
        if lock(&self.points).contains(&point) {
            return Err(format!("injected {point} failure for sandbox {sandbox_id}"));
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Ledger ──────────────────────────────────────────────────────────

#[derive(Default)]
struct LedgerState {
    vms: HashSet<String>,
    networks: HashSet<String>,
    resource_groups: HashSet<String>,
    containers: HashMap<String, BTreeSet<String>>,
    running: HashSet<(String, String)>,
    events: Vec<(String, String)>,
}

/// Record of simulated host resources, keyed by sandbox ID.
#[derive(Default)]
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    fn record(&self, sandbox_id: &str, event: impl Into<String>) -> MutexGuard<'_, LedgerState> {
        let mut state = lock(&self.state);
        state.events.push((sandbox_id.to_string(), event.into()));
        state
    }

    pub fn has_vm(&self, sandbox_id: &str) -> bool {
        lock(&self.state).vms.contains(sandbox_id)
    }

    pub fn has_network(&self, sandbox_id: &str) -> bool {
        lock(&self.state).networks.contains(sandbox_id)
    }

    pub fn has_resource_group(&self, sandbox_id: &str) -> bool {
        lock(&self.state).resource_groups.contains(sandbox_id)
    }

    /// Containers present in the sandbox's guest, sorted by ID.
    pub fn containers(&self, sandbox_id: &str) -> Vec<String> {
        lock(&self.state)
            .containers
            .get(sandbox_id)
            .map(|c| c.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// No VM, network, resource group or container is left for the sandbox.
    pub fn is_clean(&self, sandbox_id: &str) -> bool {
        let state = lock(&self.state);
        !state.vms.contains(sandbox_id)
            && !state.networks.contains(sandbox_id)
            && !state.resource_groups.contains(sandbox_id)
            && state.containers.get(sandbox_id).is_none_or(|c| c.is_empty())
    }

    /// Operations performed for one sandbox, oldest first.
    pub fn events_for(&self, sandbox_id: &str) -> Vec<String> {
        lock(&self.state)
            .events
            .iter()
            .filter(|(id, _)| id == sandbox_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Every operation as `sandbox_id:event`, oldest first.
    pub fn events(&self) -> Vec<String> {
        lock(&self.state)
            .events
            .iter()
            .map(|(id, event)| format!("{id}:{event}"))
            .collect()
    }

    pub fn live_vm_count(&self) -> usize {
        lock(&self.state).vms.len()
    }
}

// ── Backend ─────────────────────────────────────────────────────────

/// Builds dry-run collaborators that share one [`Ledger`] and [`FaultPlan`].
pub struct DryRunBackend {
    ledger: Arc<Ledger>,
    faults: Arc<FaultPlan>,
    latency: Option<Duration>,
}

impl Default for DryRunBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunBackend {
    pub fn new() -> Self {
        Self {
            ledger: Arc::new(Ledger::default()),
            faults: Arc::new(FaultPlan::default()),
            latency: None,
        }
    }

    /// Make every simulated operation take `latency`, to widen race windows.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn ledger(&self) -> Arc<Ledger> {
        Arc::clone(&self.ledger)
    }

    pub fn faults(&self) -> Arc<FaultPlan> {
        Arc::clone(&self.faults)
    }

    /// A template pool that hands out VMs recorded in this backend's ledger.
    pub fn template_pool(&self) -> DryRunTemplatePool {
        DryRunTemplatePool {
            sim: self.sim(""),
            available: Mutex::new(HashMap::new()),
        }
    }

    fn sim(&self, sandbox_id: &str) -> Sim {
        Sim {
            sandbox_id: sandbox_id.to_string(),
            ledger: Arc::clone(&self.ledger),
            faults: Arc::clone(&self.faults),
            latency: self.latency,
            span: tracing::Span::none(),
        }
    }
}

impl SandboxBackend for DryRunBackend {
    fn name(&self) -> &'static str {
        "dry-run"
    }

    fn build(
        &self,
        config: &SandboxConfig,
        template: Option<VmTemplate>,
        span: &tracing::Span,
    ) -> Result<SandboxParts, SandboxError> {
        let mut sim = self.sim(&config.id);
        sim.span = span.clone();

        let (hypervisor, template_id): (Box<dyn Hypervisor>, _) = match template {
            Some(t) => (t.hypervisor, Some(t.template_id)),
            None => (
                Box::new(DryRunHypervisor {
                    sim: sim.clone(),
                    from_template: false,
                }),
                None,
            ),
        };

        Ok(SandboxParts {
            hypervisor,
            network: Box::new(DryRunNetwork { sim: sim.clone() }),
            resources: Box::new(DryRunResources { sim: sim.clone() }),
            agent: Box::new(DryRunAgent { sim }),
            template_id,
        })
    }
}

/// State shared by the simulated collaborators of one sandbox.
#[derive(Clone)]
struct Sim {
    sandbox_id: String,
    ledger: Arc<Ledger>,
    faults: Arc<FaultPlan>,
    latency: Option<Duration>,
    span: tracing::Span,
}

impl Sim {
    async fn step(
        &self,
        point: FaultPoint,
        to_error: fn(String) -> SandboxError,
    ) -> Result<(), SandboxError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        tracing::debug!(parent: &self.span, sandbox_id = %self.sandbox_id, op = %point, "dry-run step");
        self.faults.check(point, &self.sandbox_id).map_err(to_error)
    }

    fn require_vm(&self) -> Result<(), SandboxError> {
        if self.ledger.has_vm(&self.sandbox_id) {
            Ok(())
        } else {
            Err(SandboxError::Agent(format!(
                "guest of sandbox {} is unreachable: VM not running",
                self.sandbox_id
            )))
        }
    }
}

// ── Hypervisor ──────────────────────────────────────────────────────

struct DryRunHypervisor {
    sim: Sim,
    from_template: bool,
}

#[async_trait]
impl Hypervisor for DryRunHypervisor {
    async fn start(
        &self,
        ctx: &CancellationToken,
        hook: Option<PrestartHook>,
    ) -> Result<(), SandboxError> {
        if ctx.is_cancelled() {
            return Err(SandboxError::Hypervisor("start cancelled".into()));
        }
        if let Some(hook) = hook {
            self.sim.ledger.record(&self.sim.sandbox_id, "vm.prestart-hook");
            hook(ctx.clone()).await?;
        }
        self.sim.step(FaultPoint::VmStart, SandboxError::Hypervisor).await?;

        let event = if self.from_template { "vm.resume" } else { "vm.start" };
        let mut state = self.sim.ledger.record(&self.sim.sandbox_id, event);
        state.vms.insert(self.sim.sandbox_id.clone());
        Ok(())
    }

    async fn stop(&self, _ctx: &CancellationToken) -> Result<(), SandboxError> {
        self.sim.step(FaultPoint::VmStop, SandboxError::Hypervisor).await?;

        let id = &self.sim.sandbox_id;
        let mut state = self.sim.ledger.record(id, "vm.stop");
        state.vms.remove(id);
        // Containers live inside the guest and go away with it.
        state.containers.remove(id);
        state.running.retain(|(sid, _)| sid != id);
        Ok(())
    }
}

// ── Network ─────────────────────────────────────────────────────────

struct DryRunNetwork {
    sim: Sim,
}

#[async_trait]
impl NetworkProvider for DryRunNetwork {
    async fn create(
        &self,
        _ctx: &CancellationToken,
        config: &NetworkConfig,
    ) -> Result<(), SandboxError> {
        let result = self.sim.step(FaultPoint::NetworkCreate, SandboxError::Network).await;
        if config.mode == NetworkMode::None && result.is_ok() {
            self.sim.ledger.record(&self.sim.sandbox_id, "network.skip");
            return Ok(());
        }
        // A failing create still leaves a half-built namespace behind, the
        // way a real one does when device setup fails after `ip netns add`.
        let mut state = self.sim.ledger.record(&self.sim.sandbox_id, "network.create");
        state.networks.insert(self.sim.sandbox_id.clone());
        result
    }

    async fn post_create(&self, _ctx: &CancellationToken) -> Result<(), SandboxError> {
        self.sim
            .step(FaultPoint::NetworkPostCreate, SandboxError::Network)
            .await?;
        self.sim.ledger.record(&self.sim.sandbox_id, "network.post-create");
        Ok(())
    }

    async fn remove(&self, _ctx: &CancellationToken) -> Result<(), SandboxError> {
        self.sim.step(FaultPoint::NetworkRemove, SandboxError::Network).await?;
        let mut state = self.sim.ledger.record(&self.sim.sandbox_id, "network.remove");
        state.networks.remove(&self.sim.sandbox_id);
        Ok(())
    }
}

// ── Resource controller ─────────────────────────────────────────────

struct DryRunResources {
    sim: Sim,
}

#[async_trait]
impl ResourceController for DryRunResources {
    async fn setup(&self, sandbox_id: &str, config: &ResourceConfig) -> Result<(), SandboxError> {
        self.sim
            .step(FaultPoint::ResourceSetup, SandboxError::ResourceControl)
            .await?;
        tracing::debug!(
            parent: &self.sim.span,
            sandbox_id = %sandbox_id,
            cpu_quota = ?config.cpu_quota,
            memory_limit_mb = ?config.memory_limit_mb,
            "dry-run resource group attached"
        );
        let mut state = self.sim.ledger.record(sandbox_id, "resources.setup");
        state.resource_groups.insert(sandbox_id.to_string());
        Ok(())
    }

    async fn teardown(&self) -> Result<(), SandboxError> {
        self.sim
            .step(FaultPoint::ResourceTeardown, SandboxError::ResourceControl)
            .await?;
        let mut state = self.sim.ledger.record(&self.sim.sandbox_id, "resources.teardown");
        state.resource_groups.remove(&self.sim.sandbox_id);
        Ok(())
    }
}

// ── Guest agent ─────────────────────────────────────────────────────

struct DryRunAgent {
    sim: Sim,
}

#[async_trait]
impl GuestAgent for DryRunAgent {
    async fn guest_details(&self, _ctx: &CancellationToken) -> Result<GuestDetails, SandboxError> {
        self.sim.require_vm()?;
        self.sim.step(FaultPoint::GuestDetails, SandboxError::Agent).await?;
        self.sim.ledger.record(&self.sim.sandbox_id, "agent.guest-details");
        Ok(GuestDetails {
            agent_version: DRY_RUN_AGENT_VERSION.to_string(),
            capabilities: vec!["block-device".into(), "memory-hotplug".into()],
        })
    }

    async fn create_container(
        &self,
        _ctx: &CancellationToken,
        config: &ContainerConfig,
    ) -> Result<(), SandboxError> {
        self.sim.require_vm()?;
        self.sim
            .step(FaultPoint::ContainerCreate, SandboxError::Agent)
            .await?;
        let id = &self.sim.sandbox_id;
        let mut state = self
            .sim
            .ledger
            .record(id, format!("container.create:{}", config.id));
        state
            .containers
            .entry(id.clone())
            .or_default()
            .insert(config.id.clone());
        Ok(())
    }

    async fn start_container(&self, _ctx: &CancellationToken, cid: &str) -> Result<(), SandboxError> {
        self.sim.require_vm()?;
        self.sim.step(FaultPoint::ContainerStart, SandboxError::Agent).await?;
        let id = &self.sim.sandbox_id;
        let mut state = self.sim.ledger.record(id, format!("container.start:{cid}"));
        state.running.insert((id.clone(), cid.to_string()));
        Ok(())
    }

    async fn stop_container(
        &self,
        _ctx: &CancellationToken,
        cid: &str,
        force: bool,
    ) -> Result<(), SandboxError> {
        self.sim.require_vm()?;
        self.sim.step(FaultPoint::ContainerStop, SandboxError::Agent).await?;
        let id = &self.sim.sandbox_id;
        let event = if force {
            format!("container.kill:{cid}")
        } else {
            format!("container.stop:{cid}")
        };
        let mut state = self.sim.ledger.record(id, event);
        state.running.remove(&(id.clone(), cid.to_string()));
        Ok(())
    }

    async fn remove_container(&self, _ctx: &CancellationToken, cid: &str) -> Result<(), SandboxError> {
        self.sim.require_vm()?;
        self.sim
            .step(FaultPoint::ContainerRemove, SandboxError::Agent)
            .await?;
        let id = &self.sim.sandbox_id;
        let mut state = self.sim.ledger.record(id, format!("container.remove:{cid}"));
        if let Some(containers) = state.containers.get_mut(id) {
            containers.remove(cid);
        }
        Ok(())
    }
}

// ── Template pool ───────────────────────────────────────────────────

/// Pre-warmed VM counts per config shape.
pub struct DryRunTemplatePool {
    sim: Sim,
    available: Mutex<HashMap<TemplateKey, usize>>,
}

impl DryRunTemplatePool {
    /// Make `count` more templates available for configs shaped like `config`.
    pub fn warm(&self, config: &SandboxConfig, count: usize) {
        *lock(&self.available).entry(config.template_key()).or_default() += count;
    }

    pub fn available(&self, config: &SandboxConfig) -> usize {
        lock(&self.available)
            .get(&config.template_key())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl Factory for DryRunTemplatePool {
    async fn lookup(
        &self,
        _ctx: &CancellationToken,
        config: &SandboxConfig,
    ) -> Result<Option<VmTemplate>, SandboxError> {
        self.sim
            .faults
            .check(FaultPoint::TemplateLookup, &config.id)
            .map_err(SandboxError::Backend)?;

        {
            let mut available = lock(&self.available);
            match available.get_mut(&config.template_key()) {
                Some(n) if *n > 0 => *n -= 1,
                _ => return Ok(None),
            }
        }

        let mut sim = self.sim.clone();
        sim.sandbox_id = config.id.clone();
        Ok(Some(VmTemplate {
            template_id: format!("tmpl-{}", uuid::Uuid::new_v4()),
            hypervisor: Box::new(DryRunHypervisor {
                sim,
                from_template: true,
            }),
        }))
    }
}
