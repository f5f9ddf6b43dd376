use async_trait::async_trait;
use chrono::Utc;
use compute_common::{
    Backend, BackendInfo, ComputeDriver, ComputeError, ComputeResources, CpuResources, CpuUsage,
    HealthStatus, Instance, InstanceKind, InstanceRequest, InstanceUpdate, ListOptions,
    MemoryResources, MemoryUsage, NetworkAttachment, NetworkUsage, ResourceUsage, Result,
    RuntimeInfo, Snapshot, SnapshotDriver, SnapshotParams, SnapshotTree,
    StorageAttachment, StorageResources, StorageUsage, VmDetails, VmDiskSource, USER_ID_LABEL,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock, RwLockWriteGuard};
use tracing::{info, instrument, warn};

use crate::client::{
    DiskSource, DomainInfo, DomainMetadata, DomainState, HypervisorClient, SnapshotRequest,
};
use crate::error::HypervisorError;
use crate::snapshot::SnapshotForest;
use crate::validation::{
    build_domain_spec, validate_request, vcpus_for, MAX_VCPUS, MIN_MEMORY_BYTES,
};

pub const DEFAULT_POOL: &str = "default";

pub const CAPABILITIES: [&str; 4] = ["vms", "snapshots", "export", "storage_pools"];

/// How long `stop_vm` waits for a guest to power off before pulling the plug.
const GRACEFUL_STOP_WAIT: Duration = Duration::from_secs(60);

/// Hypervisor driver: VMs as unified instances plus their snapshot forests.
pub struct HypervisorDriver {
    client: Arc<dyn HypervisorClient>,
    pool: String,
    /// Keyed by domain UUID.
    snapshots: RwLock<HashMap<String, SnapshotForest>>,
    /// Last CPU-time sample per domain, for usage deltas.
    cpu_samples: Mutex<HashMap<String, (Instant, u64)>>,
}

fn disk_target(index: usize) -> String {
    let letter = char::from(b'a' + (index % 26) as u8);
    format!("vd{letter}")
}

/// Normalise a domain into a unified instance.
pub fn domain_to_instance(info: DomainInfo, uri: &str) -> Instance {
    let meta = info.metadata;
    let state = info.state.to_instance_state();

    let mut labels = meta.labels.clone();
    labels.insert(USER_ID_LABEL.to_string(), meta.user_id.to_string());

    let networks: Vec<NetworkAttachment> = info
        .interfaces
        .iter()
        .enumerate()
        .map(|(i, iface)| NetworkAttachment {
            name: meta
                .networks
                .get(i)
                .map(|n| n.name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| format!("net{i}")),
            network: iface.source.clone(),
            network_type: Some(iface.kind.clone()),
            ip_address: None,
            mac_address: Some(iface.mac_address.clone()).filter(|m| !m.is_empty()),
            model: Some(iface.model.clone()).filter(|m| !m.is_empty()),
        })
        .collect();

    let storage: Vec<StorageAttachment> = info
        .disks
        .iter()
        .enumerate()
        .map(|(i, disk)| {
            let declared = meta.storage.get(i);
            StorageAttachment {
                name: disk
                    .volume
                    .clone()
                    .unwrap_or_else(|| declared.map(|d| d.name.clone()).unwrap_or_default()),
                storage_type: if disk.volume.is_some() { "volume" } else { "disk" }.to_string(),
                source: disk.path.clone(),
                target: disk_target(i),
                format: disk.format.clone(),
                bus: Some("virtio".to_string()),
                size: declared.map(|d| d.size).unwrap_or(0),
                read_only: declared.is_some_and(|d| d.read_only),
            }
        })
        .collect();

    let mut backend_data = HashMap::new();
    backend_data.insert("uuid".to_string(), serde_json::json!(info.uuid));
    backend_data.insert("domain_state".to_string(), serde_json::json!(info.state.as_str()));
    backend_data.insert("cpu_time_ns".to_string(), serde_json::json!(info.cpu_time_ns));
    backend_data.insert("hypervisor_uri".to_string(), serde_json::json!(uri));
    backend_data.insert(
        "disk_paths".to_string(),
        serde_json::json!(info.disks.iter().map(|d| d.path.clone()).collect::<Vec<_>>()),
    );

    let running = state == compute_common::InstanceState::Running;
    Instance {
        id: info.uuid,
        name: info.name,
        kind: InstanceKind::Vm,
        backend: Backend::Hypervisor,
        state,
        status: info.state.as_str().to_string(),
        user_id: meta.user_id,
        config: meta.config.clone(),
        resources: ComputeResources {
            cpu: CpuResources {
                cores: f64::from(info.vcpus),
                ..Default::default()
            },
            memory: MemoryResources {
                limit: info.max_memory_bytes,
                ..Default::default()
            },
            storage: StorageResources {
                total_space: storage.iter().map(|s| s.size).sum(),
                used_space: 0,
            },
        },
        networks,
        storage,
        runtime: RuntimeInfo::default(),
        labels,
        created_at: meta.created_at.unwrap_or_else(Utc::now),
        started_at: if running {
            meta.started_at.or_else(|| Some(Utc::now()))
        } else {
            meta.started_at
        },
        finished_at: if running { None } else { meta.finished_at },
        backend_data,
    }
}

impl HypervisorDriver {
    pub fn new(client: Arc<dyn HypervisorClient>) -> Self {
        Self {
            client,
            pool: DEFAULT_POOL.to_string(),
            snapshots: RwLock::new(HashMap::new()),
            cpu_samples: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pool(mut self, pool: impl Into<String>) -> Self {
        self.pool = pool.into();
        self
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn client(&self) -> &Arc<dyn HypervisorClient> {
        &self.client
    }

    /// Rendered domain definition.
    pub async fn definition(&self, id: &str) -> Result<String> {
        Ok(self.client.domain_xml(id).await?)
    }

    async fn lookup(&self, id: &str) -> Result<DomainInfo> {
        self.client.lookup_domain(id).await.map_err(|e| match e {
            HypervisorError::DomainNotFound(_) => ComputeError::not_found("vm", id),
            other => other.into(),
        })
    }

    /// Snapshot forests, with this domain's forest refreshed from the
    /// hypervisor. The hypervisor is authoritative; the forest only adds ids
    /// and metadata it cannot store.
    async fn synced_snapshots(
        &self,
        info: &DomainInfo,
    ) -> Result<RwLockWriteGuard<'_, HashMap<String, SnapshotForest>>> {
        let listing = self.client.list_snapshots(&info.name).await?;
        let mut forests = self.snapshots.write().await;
        forests
            .entry(info.uuid.clone())
            .or_insert_with(|| SnapshotForest::new(info.uuid.clone()))
            .sync(&listing);
        Ok(forests)
    }

    async fn update_metadata(
        &self,
        name: &str,
        f: impl FnOnce(&mut DomainMetadata) + Send,
    ) -> Result<()> {
        let mut meta = self.lookup(name).await?.metadata;
        f(&mut meta);
        Ok(self.client.set_metadata(name, &meta).await?)
    }

    /// Best effort: lifecycle timestamps are informational.
    async fn stamp(&self, name: &str, started: bool) {
        let now = Utc::now();
        let result = self
            .update_metadata(name, move |meta| {
                if started {
                    meta.started_at = Some(now);
                    meta.finished_at = None;
                } else {
                    meta.finished_at = Some(now);
                }
            })
            .await;
        if let Err(e) = result {
            warn!(domain = name, error = %e, "Failed to record lifecycle timestamp");
        }
    }

    async fn remove_volumes(&self, volumes: &[String]) {
        for volume in volumes {
            if let Err(e) = self.client.delete_volume(&self.pool, volume).await {
                warn!(pool = %self.pool, volume, error = %e, "Failed to remove volume");
            }
        }
    }

    async fn wait_for_state(&self, name: &str, wanted: DomainState, deadline: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < deadline {
            match self.client.lookup_domain(name).await {
                Ok(info) if info.state == wanted => return true,
                Ok(_) => tokio::time::sleep(Duration::from_millis(500)).await,
                Err(_) => return false,
            }
        }
        false
    }

    fn validate_limits(resources: &ComputeResources) -> Result<(Option<u32>, Option<u64>)> {
        let vcpus = if resources.cpu.cores > 0.0 {
            let n = vcpus_for(resources.cpu.cores);
            if n > MAX_VCPUS {
                return Err(ComputeError::InvalidInput(format!(
                    "VM supports at most {MAX_VCPUS} vCPUs"
                )));
            }
            Some(n)
        } else {
            None
        };
        let memory = match resources.memory.limit {
            0 => None,
            bytes if bytes < MIN_MEMORY_BYTES => {
                return Err(ComputeError::InvalidInput(
                    "VM memory must be at least 128 MiB".into(),
                ))
            }
            bytes => Some(bytes),
        };
        Ok((vcpus, memory))
    }
}

#[async_trait]
impl ComputeDriver for HypervisorDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create(&self, req: &InstanceRequest) -> Result<Instance> {
        self.validate_config(req).await?;

        match self.client.lookup_domain(&req.name).await {
            Ok(_) => return Err(ComputeError::AlreadyExists(format!("vm {}", req.name))),
            Err(HypervisorError::DomainNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let uuid = req
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let spec = build_domain_spec(req, &uuid, &self.pool)?;

        let mut created_volumes = Vec::new();
        for disk in &spec.disks {
            if let DiskSource::Volume { pool, volume } = &disk.source {
                if spec.metadata.managed_volumes.contains(volume) {
                    match self
                        .client
                        .create_volume(pool, volume, disk.size_bytes, &disk.format)
                        .await
                    {
                        Ok(path) => {
                            info!(volume, path, "Created VM volume");
                            created_volumes.push(volume.clone());
                        }
                        Err(e) => {
                            self.remove_volumes(&created_volumes).await;
                            return Err(e.into());
                        }
                    }
                }
            }
        }

        if let Err(e) = self.client.define_domain(&spec).await {
            self.remove_volumes(&created_volumes).await;
            return Err(e.into());
        }
        info!(domain = %spec.name, uuid = %uuid, "Domain defined");

        if req.auto_start {
            if let Err(e) = self.client.start_domain(&spec.name).await {
                warn!(domain = %spec.name, error = %e, "Start after define failed, undefining");
                if let Err(undefine) = self.client.undefine_domain(&spec.name).await {
                    warn!(domain = %spec.name, error = %undefine, "Undefine after failed start failed");
                }
                self.remove_volumes(&created_volumes).await;
                return Err(e.into());
            }
            self.stamp(&spec.name, true).await;
        }

        let info = self.lookup(&spec.name).await?;
        Ok(domain_to_instance(info, self.client.uri()))
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let info = self.lookup(id).await?;
        Ok(domain_to_instance(info, self.client.uri()))
    }

    #[instrument(skip(self, opts))]
    async fn list(&self, opts: &ListOptions) -> Result<Vec<Instance>> {
        let domains = self.client.list_domains().await?;
        Ok(domains
            .into_iter()
            .map(|d| domain_to_instance(d, self.client.uri()))
            .filter(|i| opts.matches(i))
            .collect())
    }

    #[instrument(skip(self, update))]
    async fn update(&self, id: &str, update: &InstanceUpdate) -> Result<Instance> {
        let info = self.lookup(id).await?;
        if let Some(resources) = &update.resources {
            self.update_resource_limits(&info.name, resources).await?;
        }
        if update.labels.is_some() || update.restart_policy.is_some() {
            let labels = update.labels.clone();
            let policy = update.restart_policy.clone();
            self.update_metadata(&info.name, move |meta| {
                if let Some(mut labels) = labels {
                    labels.remove(USER_ID_LABEL);
                    meta.labels = labels;
                }
                if let Some(policy) = policy {
                    meta.config.restart_policy = policy;
                }
            })
            .await?;
        }
        if update.networks.is_some() || update.storage.is_some() {
            warn!(domain = %info.name, "Network and disk changes require redefinition; ignoring");
        }
        self.get(&info.uuid).await
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let info = self.lookup(id).await?;
        if info.state.is_active() {
            if !force {
                return Err(ComputeError::InvalidState(format!(
                    "vm {} is {}; stop it first or force the deletion",
                    info.name,
                    info.state.as_str()
                )));
            }
            self.client.destroy_domain(&info.name).await?;
        }
        self.client.undefine_domain(&info.name).await?;
        self.remove_volumes(&info.metadata.managed_volumes).await;

        self.snapshots.write().await.remove(&info.uuid);
        self.cpu_samples.lock().await.remove(&info.uuid);
        info!(domain = %info.name, "Domain deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self, id: &str) -> Result<()> {
        let info = self.lookup(id).await?;
        match info.state {
            DomainState::Running | DomainState::Blocked => Ok(()),
            DomainState::Paused | DomainState::PmSuspended => Err(ComputeError::InvalidState(
                format!("vm {} is paused; unpause it instead", info.name),
            )),
            _ => {
                self.client.start_domain(&info.name).await?;
                self.stamp(&info.name, true).await;
                Ok(())
            }
        }
    }

    #[instrument(skip(self))]
    async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let info = self.lookup(id).await?;
        if !info.state.is_active() {
            return Ok(());
        }
        if force || info.state == DomainState::Paused {
            self.client.destroy_domain(&info.name).await?;
        } else {
            self.client.shutdown_domain(&info.name).await?;
        }
        self.stamp(&info.name, false).await;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart(&self, id: &str, force: bool) -> Result<()> {
        let info = self.lookup(id).await?;
        if !info.state.is_active() {
            self.client.start_domain(&info.name).await?;
        } else if force {
            self.client.destroy_domain(&info.name).await?;
            self.client.start_domain(&info.name).await?;
        } else {
            self.client.reboot_domain(&info.name).await?;
        }
        self.stamp(&info.name, true).await;
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let info = self.lookup(id).await?;
        Ok(self.client.suspend_domain(&info.name).await?)
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let info = self.lookup(id).await?;
        Ok(self.client.resume_domain(&info.name).await?)
    }

    async fn resource_usage(&self, id: &str) -> Result<ResourceUsage> {
        let info = self.lookup(id).await?;
        let stats = self.client.domain_stats(&info.name).await?;

        let now = Instant::now();
        let previous = self
            .cpu_samples
            .lock()
            .await
            .insert(info.uuid.clone(), (now, stats.cpu_time_ns));
        let usage_percent = match previous {
            Some((at, cpu_ns)) if stats.cpu_time_ns >= cpu_ns => {
                let elapsed = now.duration_since(at).as_nanos() as f64;
                if elapsed > 0.0 {
                    (stats.cpu_time_ns - cpu_ns) as f64 / elapsed * 100.0
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };

        let used = if stats.memory_unused_bytes > 0 {
            stats
                .memory_actual_bytes
                .saturating_sub(stats.memory_unused_bytes)
        } else {
            stats.memory_rss_bytes
        };
        let limit = stats.memory_actual_bytes.max(info.max_memory_bytes);

        Ok(ResourceUsage {
            timestamp: Utc::now(),
            cpu: CpuUsage {
                usage_percent,
                usage_nanos: stats.cpu_time_ns,
                system_nanos: 0,
                online_cpus: if stats.online_vcpus > 0 {
                    stats.online_vcpus
                } else {
                    info.vcpus
                },
            },
            memory: MemoryUsage {
                usage: used,
                max_usage: used,
                limit,
                usage_percent: if limit > 0 {
                    used as f64 / limit as f64 * 100.0
                } else {
                    0.0
                },
            },
            network: NetworkUsage {
                rx_bytes: stats.rx_bytes,
                tx_bytes: stats.tx_bytes,
                rx_packets: stats.rx_packets,
                tx_packets: stats.tx_packets,
            },
            storage: StorageUsage {
                read_bytes: stats.block_read_bytes,
                write_bytes: stats.block_write_bytes,
            },
        })
    }

    #[instrument(skip(self, resources))]
    async fn update_resource_limits(&self, id: &str, resources: &ComputeResources) -> Result<()> {
        let (vcpus, memory) = Self::validate_limits(resources)?;
        let info = self.lookup(id).await?;
        if let Some(vcpus) = vcpus.filter(|n| *n != info.vcpus) {
            self.client.set_vcpus(&info.name, vcpus).await?;
        }
        if let Some(bytes) = memory.filter(|b| *b != info.max_memory_bytes) {
            self.client.set_memory(&info.name, bytes).await?;
        }
        Ok(())
    }

    async fn backend_info(&self) -> Result<BackendInfo> {
        let health = match self.client.ping().await {
            Ok(()) => HealthStatus::healthy(),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        };
        let version = self.client.version().await?;
        let node = self.client.node_info().await?;

        let (allocated_cpus, allocated_memory) = self
            .client
            .list_domains()
            .await?
            .iter()
            .filter(|d| d.state.is_active())
            .fold((0u64, 0u64), |(cpu, mem), d| {
                (cpu + u64::from(d.vcpus), mem + d.max_memory_bytes)
            });

        let configuration = HashMap::from([
            ("uri".to_string(), self.client.uri().to_string()),
            ("storage_pool".to_string(), self.pool.clone()),
            ("cpu_model".to_string(), node.cpu_model.clone()),
        ]);

        Ok(BackendInfo {
            backend: Backend::Hypervisor,
            api_version: version.clone(),
            version,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            supported_kinds: self.supported_kinds(),
            total_cpu: CpuResources {
                cores: f64::from(node.cpus),
                ..Default::default()
            },
            total_memory: MemoryResources {
                limit: node.memory_bytes,
                ..Default::default()
            },
            available_cpu: CpuResources {
                cores: (f64::from(node.cpus) - allocated_cpus as f64).max(0.0),
                ..Default::default()
            },
            available_memory: MemoryResources {
                limit: node.memory_bytes.saturating_sub(allocated_memory),
                ..Default::default()
            },
            configuration,
            health,
        })
    }

    async fn validate_config(&self, req: &InstanceRequest) -> Result<()> {
        if req.kind != InstanceKind::Vm {
            return Err(ComputeError::InvalidInput(format!(
                "hypervisor cannot host instance kind {}",
                req.kind
            )));
        }
        Ok(validate_request(req)?)
    }

    fn backend(&self) -> Backend {
        Backend::Hypervisor
    }

    fn supported_kinds(&self) -> Vec<InstanceKind> {
        vec![InstanceKind::Vm]
    }
}

#[async_trait]
impl SnapshotDriver for HypervisorDriver {
    #[instrument(skip(self, params), fields(snapshot = %params.name))]
    async fn create_snapshot(&self, instance: &str, params: &SnapshotParams) -> Result<Snapshot> {
        if params.name.trim().is_empty() {
            return Err(ComputeError::InvalidInput("snapshot name is required".into()));
        }
        let mut info = self.lookup(instance).await?;
        let mut forests = self.synced_snapshots(&info).await?;
        let forest = forest_mut(&mut forests, &info, &params.name)?;
        if forest.resolve(&params.name).is_some() {
            return Err(HypervisorError::SnapshotExists(params.name.clone()).into());
        }

        // The hypervisor parents new snapshots under the current one, so a
        // different parent has to become current first.
        if let Some(parent) = params.parent.as_deref() {
            let parent = forest
                .resolve(parent)
                .cloned()
                .ok_or_else(|| HypervisorError::SnapshotNotFound(parent.to_string()))?;
            if !parent.is_current {
                self.client.revert_snapshot(&info.name, &parent.name).await?;
                forest.set_current(&parent.id)?;
                info = self.lookup(&info.name).await?;
                info!(domain = %info.name, parent = %parent.name, "Reverted to requested parent");
            }
        }
        if params.include_memory && !info.state.is_active() {
            return Err(ComputeError::InvalidState(format!(
                "memory snapshot of {} requires a running domain",
                info.name
            )));
        }

        self.client
            .create_snapshot(
                &info.name,
                &SnapshotRequest {
                    name: params.name.clone(),
                    description: params.description.clone(),
                    include_memory: params.include_memory,
                    quiesce: params.quiesce,
                },
            )
            .await?;

        let size = if params.include_memory {
            info.memory_bytes
        } else {
            0
        };
        let snapshot = forest.insert(params, info.state.to_snapshot_state(), size)?;
        info!(domain = %info.name, snapshot_id = %snapshot.id, "Snapshot created");
        Ok(snapshot)
    }

    async fn list_snapshots(&self, instance: &str) -> Result<Vec<Snapshot>> {
        let info = self.lookup(instance).await?;
        let forests = self.synced_snapshots(&info).await?;
        Ok(forests
            .get(&info.uuid)
            .map(SnapshotForest::list)
            .unwrap_or_default())
    }

    async fn snapshot_tree(&self, instance: &str) -> Result<Vec<SnapshotTree>> {
        let info = self.lookup(instance).await?;
        let forests = self.synced_snapshots(&info).await?;
        Ok(forests
            .get(&info.uuid)
            .map(SnapshotForest::tree)
            .unwrap_or_default())
    }

    async fn get_snapshot(&self, instance: &str, snapshot: &str) -> Result<Snapshot> {
        let info = self.lookup(instance).await?;
        self.synced_snapshots(&info)
            .await?
            .get(&info.uuid)
            .and_then(|f| f.resolve(snapshot).cloned())
            .ok_or_else(|| ComputeError::not_found("snapshot", snapshot))
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, instance: &str, snapshot: &str) -> Result<()> {
        let info = self.lookup(instance).await?;
        let mut forests = self.synced_snapshots(&info).await?;
        let forest = forest_mut(&mut forests, &info, snapshot)?;
        let name = forest
            .resolve(snapshot)
            .map(|s| s.name.clone())
            .ok_or_else(|| ComputeError::not_found("snapshot", snapshot))?;

        self.client.delete_snapshot(&info.name, &name).await?;
        forest.remove(&name)?;
        info!(domain = %info.name, snapshot = %name, "Snapshot deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn revert_snapshot(&self, instance: &str, snapshot: &str) -> Result<()> {
        let info = self.lookup(instance).await?;
        let mut forests = self.synced_snapshots(&info).await?;
        let forest = forest_mut(&mut forests, &info, snapshot)?;
        let name = forest
            .resolve(snapshot)
            .map(|s| s.name.clone())
            .ok_or_else(|| ComputeError::not_found("snapshot", snapshot))?;

        self.client.revert_snapshot(&info.name, &name).await?;
        forest.set_current(&name)?;
        info!(domain = %info.name, snapshot = %name, "Reverted to snapshot");
        Ok(())
    }
}

fn forest_mut<'a>(
    forests: &'a mut HashMap<String, SnapshotForest>,
    info: &DomainInfo,
    snapshot: &str,
) -> Result<&'a mut SnapshotForest> {
    forests
        .get_mut(&info.uuid)
        .ok_or_else(|| ComputeError::not_found("snapshot", snapshot))
}

#[async_trait]
impl VmDiskSource for HypervisorDriver {
    async fn vm_details(&self, name: &str) -> Result<VmDetails> {
        let info = self.lookup(name).await?;
        Ok(VmDetails {
            name: info.name,
            uuid: info.uuid,
            vcpus: info.vcpus,
            memory_bytes: info.max_memory_bytes,
            state: info.state.to_instance_state(),
            disks: info.disks,
        })
    }

    async fn volume_path(&self, pool: &str, volume: &str) -> Result<String> {
        Ok(self.client.volume_path(pool, volume).await?)
    }

    async fn stop_vm(&self, name: &str) -> Result<()> {
        let info = self.lookup(name).await?;
        if !info.state.is_active() {
            return Ok(());
        }
        self.client.shutdown_domain(&info.name).await?;
        if !self
            .wait_for_state(&info.name, DomainState::Shutoff, GRACEFUL_STOP_WAIT)
            .await
        {
            warn!(domain = %info.name, "Guest ignored shutdown, destroying");
            self.client.destroy_domain(&info.name).await?;
        }
        self.stamp(&info.name, false).await;
        Ok(())
    }

    async fn start_vm(&self, name: &str) -> Result<()> {
        self.start(name).await
    }
}
