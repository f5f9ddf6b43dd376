//! Hypervisor daemon contract and the domain model it speaks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use compute_common::{
    CpuTopology, InstanceConfig, InstanceState, NetworkAttachment, SnapshotState,
    StorageAttachment, VmDisk,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::Result;

/// Hypervisor-native domain state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Parse the state column printed by `virsh dominfo`/`domstate`.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "running" => DomainState::Running,
            "idle" | "blocked" => DomainState::Blocked,
            "paused" => DomainState::Paused,
            "in shutdown" | "shutdown" => DomainState::Shutdown,
            "shut off" | "shutoff" => DomainState::Shutoff,
            "crashed" => DomainState::Crashed,
            "pmsuspended" => DomainState::PmSuspended,
            _ => DomainState::NoState,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::PmSuspended => "pmsuspended",
        }
    }

    pub fn to_instance_state(self) -> InstanceState {
        match self {
            DomainState::Running => InstanceState::Running,
            DomainState::Paused | DomainState::Blocked | DomainState::PmSuspended => {
                InstanceState::Paused
            }
            DomainState::Shutdown => InstanceState::Stopping,
            DomainState::Shutoff => InstanceState::Stopped,
            DomainState::Crashed => InstanceState::Error,
            DomainState::NoState => InstanceState::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(
            self,
            DomainState::Running | DomainState::Blocked | DomainState::Paused | DomainState::Shutdown
        )
    }
}

/// Control-plane fields carried alongside the domain definition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainMetadata {
    pub instance_id: String,
    pub user_id: u64,
    pub labels: HashMap<String, String>,
    pub config: InstanceConfig,
    pub networks: Vec<NetworkAttachment>,
    pub storage: Vec<StorageAttachment>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Volumes the control plane created and removes with the domain.
    pub managed_volumes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DiskSource {
    File(String),
    Volume { pool: String, volume: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskSpec {
    pub target: String,
    pub source: DiskSource,
    pub format: String,
    pub bus: String,
    pub size_bytes: u64,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// bridge, network or direct
    pub kind: String,
    pub source: String,
    pub model: String,
    pub mac_address: String,
}

/// Everything needed to define a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainSpec {
    pub name: String,
    pub uuid: String,
    pub vcpus: u32,
    pub topology: Option<CpuTopology>,
    pub memory_bytes: u64,
    pub disks: Vec<DiskSpec>,
    pub interfaces: Vec<InterfaceSpec>,
    pub metadata: DomainMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub max_memory_bytes: u64,
    pub cpu_time_ns: u64,
    pub disks: Vec<VmDisk>,
    pub interfaces: Vec<InterfaceSpec>,
    pub metadata: DomainMetadata,
}

/// Counters from one stats sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainStats {
    pub cpu_time_ns: u64,
    pub online_vcpus: u32,
    pub memory_actual_bytes: u64,
    pub memory_unused_bytes: u64,
    pub memory_rss_bytes: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub block_read_bytes: u64,
    pub block_write_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub cpus: u32,
    pub memory_bytes: u64,
    pub cpu_model: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub name: String,
    pub description: String,
    pub include_memory: bool,
    pub quiesce: bool,
}

/// A snapshot as the hypervisor reports it. Parents are snapshot names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub parent: Option<String>,
    /// Domain state captured with the snapshot; `None` for disk-only ones.
    pub state: Option<SnapshotState>,
    pub created_at: Option<DateTime<Utc>>,
    pub is_current: bool,
}

impl SnapshotInfo {
    pub fn has_memory(&self) -> bool {
        matches!(
            self.state,
            Some(SnapshotState::Running) | Some(SnapshotState::Paused)
        )
    }
}

impl DomainState {
    pub fn to_snapshot_state(self) -> SnapshotState {
        match self {
            DomainState::Running | DomainState::Blocked => SnapshotState::Running,
            DomainState::Paused | DomainState::PmSuspended => SnapshotState::Paused,
            DomainState::Crashed => SnapshotState::Crashed,
            _ => SnapshotState::Shutoff,
        }
    }
}

/// Operations the driver needs from a hypervisor daemon. Lookups accept a
/// domain name or UUID.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn version(&self) -> Result<String>;
    async fn node_info(&self) -> Result<NodeInfo>;
    fn uri(&self) -> &str;

    // Domains
    async fn define_domain(&self, spec: &DomainSpec) -> Result<DomainInfo>;
    async fn undefine_domain(&self, name: &str) -> Result<()>;
    async fn lookup_domain(&self, name: &str) -> Result<DomainInfo>;
    async fn list_domains(&self) -> Result<Vec<DomainInfo>>;
    async fn domain_xml(&self, name: &str) -> Result<String>;
    async fn set_metadata(&self, name: &str, metadata: &DomainMetadata) -> Result<()>;

    // Lifecycle
    async fn start_domain(&self, name: &str) -> Result<()>;
    async fn shutdown_domain(&self, name: &str) -> Result<()>;
    async fn destroy_domain(&self, name: &str) -> Result<()>;
    async fn reboot_domain(&self, name: &str) -> Result<()>;
    async fn suspend_domain(&self, name: &str) -> Result<()>;
    async fn resume_domain(&self, name: &str) -> Result<()>;

    // Resources
    async fn domain_stats(&self, name: &str) -> Result<DomainStats>;
    async fn set_vcpus(&self, name: &str, vcpus: u32) -> Result<()>;
    async fn set_memory(&self, name: &str, bytes: u64) -> Result<()>;

    // Snapshots. New snapshots become children of the current one.
    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>>;
    async fn create_snapshot(&self, domain: &str, req: &SnapshotRequest) -> Result<()>;
    async fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;
    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()>;

    // Storage
    async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        format: &str,
    ) -> Result<String>;
    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()>;
    async fn volume_path(&self, pool: &str, name: &str) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing_and_mapping() {
        let cases = [
            ("running", InstanceState::Running),
            ("paused", InstanceState::Paused),
            ("idle", InstanceState::Paused),
            ("in shutdown", InstanceState::Stopping),
            ("shut off", InstanceState::Stopped),
            ("crashed", InstanceState::Error),
            ("no state", InstanceState::Unknown),
        ];
        for (raw, expected) in cases {
            assert_eq!(DomainState::parse(raw).to_instance_state(), expected, "{raw}");
        }
        assert!(DomainState::Paused.is_active());
        assert!(!DomainState::Shutoff.is_active());
    }
}
