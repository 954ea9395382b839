use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::SandboxError;

// ── Identity ────────────────────────────────────────────────────────

pub type SandboxId = String;
pub type ContainerId = String;

// ── Sandbox config (input to create) ────────────────────────────────

/// Desired shape of a sandbox. Supplied by the caller, never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub id: SandboxId,
    pub hypervisor: HypervisorConfig,
    pub network: NetworkConfig,
    pub resources: ResourceConfig,
    pub containers: Vec<ContainerConfig>,
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    pub vcpus: u8,
    pub memory_mb: u32,
    pub kernel_path: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
    pub kernel_params: Vec<String>,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            vcpus: 1,
            memory_mb: 2048,
            kernel_path: None,
            image_path: None,
            kernel_params: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// No network devices are attached to the VM.
    None,
    /// TAP device bridged to the sandbox network namespace.
    #[default]
    Tap,
    /// MACVTAP device on top of the namespace's veth.
    Macvtap,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub mode: NetworkMode,
    /// Pre-created network namespace to join instead of creating one.
    pub netns_path: Option<String>,
    pub interfaces: Vec<String>,
    pub dns: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<u64>,
    pub memory_limit_mb: Option<u32>,
    /// Account the hypervisor threads to the sandbox group only.
    pub sandbox_cgroup_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub id: ContainerId,
    pub image: String,
    pub command: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl SandboxConfig {
    /// Structural validation run before anything is allocated.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.id.is_empty() {
            return Err(SandboxError::NeedSandboxId);
        }
        if self.hypervisor.vcpus == 0 {
            return Err(SandboxError::InvalidConfig("vcpus must be at least 1".into()));
        }
        if self.hypervisor.memory_mb < 64 {
            return Err(SandboxError::InvalidConfig(format!(
                "memory_mb {} is below the 64 MiB minimum",
                self.hypervisor.memory_mb
            )));
        }
        if let (Some(quota), None) = (self.resources.cpu_quota, self.resources.cpu_period) {
            if quota > 0 {
                return Err(SandboxError::InvalidConfig(
                    "cpu_quota requires cpu_period".into(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for container in &self.containers {
            if container.id.is_empty() {
                return Err(SandboxError::NeedContainerId);
            }
            if !seen.insert(container.id.as_str()) {
                return Err(SandboxError::InvalidConfig(format!(
                    "duplicate container id {}",
                    container.id
                )));
            }
        }
        Ok(())
    }

    /// The part of the config a pre-warmed VM template has to match.
    pub fn template_key(&self) -> TemplateKey {
        TemplateKey {
            vcpus: self.hypervisor.vcpus,
            memory_mb: self.hypervisor.memory_mb,
            kernel_path: self.hypervisor.kernel_path.clone(),
            image_path: self.hypervisor.image_path.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    pub vcpus: u8,
    pub memory_mb: u32,
    pub kernel_path: Option<PathBuf>,
    pub image_path: Option<PathBuf>,
}

// ── Pipeline stages ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Allocate,
    Network,
    ResourceController,
    VmStart,
    PostNetwork,
    GuestHandshake,
    Containers,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Allocate => "allocate",
            Stage::Network => "network create",
            Stage::ResourceController => "resource controller setup",
            Stage::VmStart => "vm start",
            Stage::PostNetwork => "post-network",
            Stage::GuestHandshake => "guest handshake",
            Stage::Containers => "container creation",
        };
        f.write_str(name)
    }
}

// ── Lifecycle state ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxState {
    Provisioning,
    Ready,
    Running,
    Stopped,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Ready,
    Running,
    Stopped,
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SandboxState::Provisioning => "provisioning",
            SandboxState::Ready => "ready",
            SandboxState::Running => "running",
            SandboxState::Stopped => "stopped",
            SandboxState::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

// ── Guest details ───────────────────────────────────────────────────

/// What the guest agent reported during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GuestDetails {
    pub agent_version: String,
    pub capabilities: Vec<String>,
}

// ── Persisted / reported views ──────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub state: ContainerState,
}

/// Serializable view of a sandbox, written through the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSnapshot {
    pub id: SandboxId,
    pub state: SandboxState,
    pub containers: Vec<ContainerStatus>,
    pub guest_details: Option<GuestDetails>,
    pub template_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SandboxStatus {
    pub id: SandboxId,
    pub state: SandboxState,
    pub vm_running: bool,
    pub containers: Vec<ContainerStatus>,
    pub guest_details: Option<GuestDetails>,
    pub annotations: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxSummary {
    pub id: SandboxId,
    pub state: SandboxState,
    pub container_count: usize,
}
