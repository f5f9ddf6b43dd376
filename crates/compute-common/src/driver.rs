use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    Backend, BackendInfo, ComputeResources, Instance, InstanceKind, InstanceRequest,
    InstanceState, InstanceUpdate, ListOptions, ResourceUsage, Result, Snapshot, SnapshotParams,
    SnapshotTree,
};

/// Backend driver contract. Every substrate implements this so the service
/// can dispatch without knowing which one it is talking to.
#[async_trait]
pub trait ComputeDriver: Send + Sync {
    async fn create(&self, req: &InstanceRequest) -> Result<Instance>;

    /// Look up by backend id or by name.
    async fn get(&self, id: &str) -> Result<Instance>;

    async fn list(&self, opts: &ListOptions) -> Result<Vec<Instance>>;

    async fn update(&self, id: &str, update: &InstanceUpdate) -> Result<Instance>;

    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    async fn start(&self, id: &str) -> Result<()>;

    async fn stop(&self, id: &str, force: bool) -> Result<()>;

    async fn restart(&self, id: &str, force: bool) -> Result<()>;

    async fn pause(&self, id: &str) -> Result<()>;

    async fn unpause(&self, id: &str) -> Result<()>;

    async fn resource_usage(&self, id: &str) -> Result<ResourceUsage>;

    async fn update_resource_limits(&self, id: &str, resources: &ComputeResources) -> Result<()>;

    async fn backend_info(&self) -> Result<BackendInfo>;

    async fn validate_config(&self, req: &InstanceRequest) -> Result<()>;

    fn backend(&self) -> Backend;

    fn supported_kinds(&self) -> Vec<InstanceKind>;
}

/// Snapshot operations; only substrates with point-in-time images implement it.
#[async_trait]
pub trait SnapshotDriver: Send + Sync {
    async fn create_snapshot(&self, instance: &str, params: &SnapshotParams) -> Result<Snapshot>;

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<Snapshot>>;

    async fn snapshot_tree(&self, instance: &str) -> Result<Vec<SnapshotTree>>;

    async fn get_snapshot(&self, instance: &str, snapshot: &str) -> Result<Snapshot>;

    async fn delete_snapshot(&self, instance: &str, snapshot: &str) -> Result<()>;

    async fn revert_snapshot(&self, instance: &str, snapshot: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmDisk {
    pub path: String,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub volume: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
}

/// What a disk export needs to know about a VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmDetails {
    pub name: String,
    pub uuid: String,
    pub vcpus: u32,
    pub memory_bytes: u64,
    pub state: InstanceState,
    pub disks: Vec<VmDisk>,
}

/// Disk access used by long-running export jobs.
#[async_trait]
pub trait VmDiskSource: Send + Sync {
    async fn vm_details(&self, name: &str) -> Result<VmDetails>;

    async fn volume_path(&self, pool: &str, volume: &str) -> Result<String>;

    async fn stop_vm(&self, name: &str) -> Result<()>;

    async fn start_vm(&self, name: &str) -> Result<()>;
}
