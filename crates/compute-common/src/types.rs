use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Substrate that executes an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Hypervisor,
    ContainerEngine,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Hypervisor, Backend::ContainerEngine];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Hypervisor => "hypervisor",
            Backend::ContainerEngine => "container_engine",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hypervisor" | "kvm" | "libvirt" => Ok(Self::Hypervisor),
            "container_engine" | "docker" => Ok(Self::ContainerEngine),
            _ => Err(format!("Invalid backend: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceKind {
    Vm,
    Container,
}

impl InstanceKind {
    pub const ALL: [InstanceKind; 2] = [InstanceKind::Vm, InstanceKind::Container];

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceKind::Vm => "vm",
            InstanceKind::Container => "container",
        }
    }

    /// The only backend that can host this kind.
    pub fn default_backend(&self) -> Backend {
        match self {
            InstanceKind::Vm => Backend::Hypervisor,
            InstanceKind::Container => Backend::ContainerEngine,
        }
    }
}

impl fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vm" => Ok(Self::Vm),
            "container" => Ok(Self::Container),
            _ => Err(format!("Invalid instance kind: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Creating,
    Created,
    Running,
    Paused,
    Restarting,
    Stopping,
    Stopped,
    Error,
    #[default]
    Unknown,
}

impl InstanceState {
    pub const ALL: [InstanceState; 9] = [
        Self::Creating,
        Self::Created,
        Self::Running,
        Self::Paused,
        Self::Restarting,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
        Self::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl std::str::FromStr for InstanceState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_lowercase()))
            .map_err(|_| format!("Invalid instance state: {s}"))
    }
}

/// Normalised description of a VM or a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub kind: InstanceKind,
    pub backend: Backend,
    pub state: InstanceState,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub user_id: u64,
    #[serde(default)]
    pub config: InstanceConfig,
    #[serde(default)]
    pub resources: ComputeResources,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub storage: Vec<StorageAttachment>,
    #[serde(default)]
    pub runtime: RuntimeInfo,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub backend_data: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    #[serde(alias = "environment")]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub restart_policy: RestartPolicy,
    pub capabilities: Vec<String>,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// always, on-failure, unless-stopped, no
    pub policy: String,
    pub max_retry_count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityContext {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub run_as_non_root: Option<bool>,
    pub read_only_root_fs: Option<bool>,
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub add: Vec<String>,
    pub drop: Vec<String>,
}

/// Resource allocation. Memory is in bytes, CPU in (fractional) cores.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeResources {
    pub cpu: CpuResources,
    pub memory: MemoryResources,
    pub storage: StorageResources,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuResources {
    pub cores: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<CpuTopology>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CpuTopology {
    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryResources {
    pub limit: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageResources {
    pub total_space: u64,
    pub used_space: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkAttachment {
    pub name: String,
    /// Network name, bridge device or host interface depending on `network_type`.
    pub network: String,
    /// bridge, network or direct (hypervisor only)
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub network_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageAttachment {
    pub name: String,
    /// volume, bind or disk
    #[serde(rename = "type")]
    pub storage_type: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bus: Option<String>,
    /// Bytes
    pub size: u64,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// Interface or network name to address.
    pub addresses: HashMap<String, String>,
}

/// Point-in-time usage sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub cpu: CpuUsage,
    pub memory: MemoryUsage,
    pub network: NetworkUsage,
    pub storage: StorageUsage,
}

impl ResourceUsage {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            cpu: CpuUsage::default(),
            memory: MemoryUsage::default(),
            network: NetworkUsage::default(),
            storage: StorageUsage::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CpuUsage {
    /// Percent of one core, summed across cores.
    pub usage_percent: f64,
    pub usage_nanos: u64,
    pub system_nanos: u64,
    pub online_cpus: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub usage: u64,
    pub max_usage: u64,
    pub limit: u64,
    pub usage_percent: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkUsage {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageUsage {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Input to instance creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRequest {
    #[serde(default)]
    pub name: String,
    pub kind: InstanceKind,
    #[serde(default)]
    pub backend: Option<Backend>,
    /// Assigned by the service before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub config: InstanceConfig,
    #[serde(default)]
    pub resources: ComputeResources,
    #[serde(default)]
    pub networks: Vec<NetworkAttachment>,
    #[serde(default)]
    pub storage: Vec<StorageAttachment>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Set from the authenticated caller, never from the body.
    #[serde(default, skip_deserializing)]
    pub user_id: u64,
    #[serde(default)]
    pub auto_start: bool,
}

impl InstanceRequest {
    pub fn new(name: impl Into<String>, kind: InstanceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            backend: None,
            id: None,
            config: InstanceConfig::default(),
            resources: ComputeResources::default(),
            networks: Vec::new(),
            storage: Vec::new(),
            labels: HashMap::new(),
            user_id: 0,
            auto_start: false,
        }
    }

    pub fn target_backend(&self) -> Backend {
        self.backend.unwrap_or_else(|| self.kind.default_backend())
    }
}

/// Mutable subset of an instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceUpdate {
    pub resources: Option<ComputeResources>,
    pub labels: Option<HashMap<String, String>>,
    pub restart_policy: Option<RestartPolicy>,
    pub networks: Option<Vec<NetworkAttachment>>,
    pub storage: Option<Vec<StorageAttachment>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ListOptions {
    pub backend: Option<Backend>,
    pub kind: Option<InstanceKind>,
    pub state: Option<InstanceState>,
    pub labels: HashMap<String, String>,
    pub user_id: Option<u64>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl ListOptions {
    /// Post-filter applied after drivers return; drivers may pre-filter too.
    pub fn matches(&self, instance: &Instance) -> bool {
        if self.backend.is_some_and(|b| b != instance.backend) {
            return false;
        }
        if self.kind.is_some_and(|k| k != instance.kind) {
            return false;
        }
        if self.state.is_some_and(|s| s != instance.state) {
            return false;
        }
        if self.user_id.is_some_and(|u| u != instance.user_id) {
            return false;
        }
        self.labels
            .iter()
            .all(|(k, v)| instance.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            status: HealthState::Healthy,
            message: None,
            checked_at: Utc::now(),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthState::Unhealthy,
            message: Some(message.into()),
            checked_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendInfo {
    pub backend: Backend,
    pub version: String,
    pub api_version: String,
    pub capabilities: Vec<String>,
    pub supported_kinds: Vec<InstanceKind>,
    pub total_cpu: CpuResources,
    pub total_memory: MemoryResources,
    pub available_cpu: CpuResources,
    pub available_memory: MemoryResources,
    #[serde(default)]
    pub configuration: HashMap<String, String>,
    pub health: HealthStatus,
}
