//! In-process hypervisor behind `test:///default`. Behaves like a libvirt
//! test driver: domains, snapshots and volumes live in memory.

use async_trait::async_trait;
use chrono::Utc;
use compute_common::VmDisk;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use crate::client::{
    DiskSource, DomainInfo, DomainMetadata, DomainSpec, DomainState, DomainStats,
    HypervisorClient, NodeInfo, SnapshotInfo, SnapshotRequest,
};
use crate::error::{HypervisorError, Result};
use crate::xml::render_domain;

pub const TEST_URI: &str = "test:///default";

struct Domain {
    spec: DomainSpec,
    state: DomainState,
    cpu_time_ns: u64,
    /// Creation order, like `virsh snapshot-list`.
    snapshots: Vec<SnapshotInfo>,
}

impl Domain {
    fn snapshot_index(&self, name: &str) -> Result<usize> {
        self.snapshots
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| HypervisorError::SnapshotNotFound(name.to_string()))
    }

    fn set_current(&mut self, name: Option<&str>) {
        for snapshot in &mut self.snapshots {
            snapshot.is_current = Some(snapshot.name.as_str()) == name;
        }
    }
}

#[derive(Default)]
struct State {
    domains: HashMap<String, Domain>,
    /// (pool, volume) -> (path, size)
    volumes: HashMap<(String, String), (String, u64)>,
}

pub struct InMemoryHypervisor {
    uri: String,
    reachable: AtomicBool,
    state: RwLock<State>,
}

impl Default for InMemoryHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHypervisor {
    pub fn new() -> Self {
        Self {
            uri: TEST_URI.to_string(),
            reachable: AtomicBool::new(true),
            state: RwLock::new(State::default()),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Put a domain into an arbitrary state, e.g. to simulate a crash.
    pub async fn force_state(&self, name: &str, state: DomainState) -> Result<()> {
        let mut guard = self.state.write().await;
        let key = Self::key(&guard, name)?;
        if let Some(domain) = guard.domains.get_mut(&key) {
            domain.state = state;
        }
        Ok(())
    }

    pub async fn volume_exists(&self, pool: &str, name: &str) -> bool {
        self.state
            .read()
            .await
            .volumes
            .contains_key(&(pool.to_string(), name.to_string()))
    }

    fn check(&self) -> Result<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(HypervisorError::Connection(format!(
                "cannot connect to {}",
                self.uri
            )))
        }
    }

    fn key(state: &State, name: &str) -> Result<String> {
        if state.domains.contains_key(name) {
            return Ok(name.to_string());
        }
        state
            .domains
            .iter()
            .find(|(_, d)| d.spec.uuid == name)
            .map(|(k, _)| k.clone())
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    fn info(state: &State, domain: &Domain) -> DomainInfo {
        let disks = domain
            .spec
            .disks
            .iter()
            .map(|d| match &d.source {
                DiskSource::File(path) => VmDisk {
                    path: path.clone(),
                    pool: None,
                    volume: None,
                    format: Some(d.format.clone()),
                },
                DiskSource::Volume { pool, volume } => VmDisk {
                    path: state
                        .volumes
                        .get(&(pool.clone(), volume.clone()))
                        .map(|(path, _)| path.clone())
                        .unwrap_or_default(),
                    pool: Some(pool.clone()),
                    volume: Some(volume.clone()),
                    format: Some(d.format.clone()),
                },
            })
            .collect();
        DomainInfo {
            name: domain.spec.name.clone(),
            uuid: domain.spec.uuid.clone(),
            state: domain.state,
            vcpus: domain.spec.vcpus,
            memory_bytes: domain.spec.memory_bytes,
            max_memory_bytes: domain.spec.memory_bytes,
            cpu_time_ns: domain.cpu_time_ns,
            disks,
            interfaces: domain.spec.interfaces.clone(),
            metadata: domain.spec.metadata.clone(),
        }
    }

    async fn transition(
        &self,
        name: &str,
        f: impl FnOnce(&mut Domain) -> Result<()> + Send,
    ) -> Result<()> {
        self.check()?;
        let mut guard = self.state.write().await;
        let key = Self::key(&guard, name)?;
        let domain = guard
            .domains
            .get_mut(&key)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        f(domain)
    }
}

fn not_running(domain: &Domain) -> HypervisorError {
    HypervisorError::InvalidState(format!("domain {} is not running", domain.spec.name))
}

#[async_trait]
impl HypervisorClient for InMemoryHypervisor {
    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn version(&self) -> Result<String> {
        self.check()?;
        Ok("10.0.0".to_string())
    }

    async fn node_info(&self) -> Result<NodeInfo> {
        self.check()?;
        Ok(NodeInfo {
            cpus: 16,
            memory_bytes: 64 * 1024 * 1024 * 1024,
            cpu_model: "x86_64".to_string(),
        })
    }

    fn uri(&self) -> &str {
        &self.uri
    }

    async fn define_domain(&self, spec: &DomainSpec) -> Result<DomainInfo> {
        self.check()?;
        let mut guard = self.state.write().await;
        if guard.domains.contains_key(&spec.name)
            || guard.domains.values().any(|d| d.spec.uuid == spec.uuid)
        {
            return Err(HypervisorError::DomainExists(spec.name.clone()));
        }
        for disk in &spec.disks {
            if let DiskSource::Volume { pool, volume } = &disk.source {
                if !guard.volumes.contains_key(&(pool.clone(), volume.clone())) {
                    return Err(HypervisorError::VolumeNotFound(format!("{pool}/{volume}")));
                }
            }
        }
        let domain = Domain {
            spec: spec.clone(),
            state: DomainState::Shutoff,
            cpu_time_ns: 0,
            snapshots: Vec::new(),
        };
        let info = Self::info(&guard, &domain);
        guard.domains.insert(spec.name.clone(), domain);
        Ok(info)
    }

    async fn undefine_domain(&self, name: &str) -> Result<()> {
        self.check()?;
        let mut guard = self.state.write().await;
        let key = Self::key(&guard, name)?;
        if guard.domains.get(&key).is_some_and(|d| d.state.is_active()) {
            return Err(HypervisorError::InvalidState(format!(
                "cannot undefine active domain {name}"
            )));
        }
        guard.domains.remove(&key);
        Ok(())
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainInfo> {
        self.check()?;
        let guard = self.state.read().await;
        let key = Self::key(&guard, name)?;
        let domain = guard
            .domains
            .get(&key)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        Ok(Self::info(&guard, domain))
    }

    async fn list_domains(&self) -> Result<Vec<DomainInfo>> {
        self.check()?;
        let guard = self.state.read().await;
        let mut domains: Vec<DomainInfo> = guard
            .domains
            .values()
            .map(|d| Self::info(&guard, d))
            .collect();
        domains.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(domains)
    }

    async fn domain_xml(&self, name: &str) -> Result<String> {
        self.check()?;
        let guard = self.state.read().await;
        let key = Self::key(&guard, name)?;
        guard
            .domains
            .get(&key)
            .map(|d| render_domain(&d.spec))
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))
    }

    async fn set_metadata(&self, name: &str, metadata: &DomainMetadata) -> Result<()> {
        let metadata = metadata.clone();
        self.transition(name, move |d| {
            d.spec.metadata = metadata;
            Ok(())
        })
        .await
    }

    async fn start_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| match d.state {
            DomainState::Shutoff | DomainState::Crashed | DomainState::NoState => {
                d.state = DomainState::Running;
                Ok(())
            }
            _ => Err(HypervisorError::InvalidState(format!(
                "domain {} is already active",
                d.spec.name
            ))),
        })
        .await
    }

    async fn shutdown_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| match d.state {
            DomainState::Running | DomainState::Blocked => {
                d.state = DomainState::Shutoff;
                Ok(())
            }
            _ => Err(not_running(d)),
        })
        .await
    }

    async fn destroy_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| {
            if !d.state.is_active() {
                return Err(not_running(d));
            }
            d.state = DomainState::Shutoff;
            Ok(())
        })
        .await
    }

    async fn reboot_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| match d.state {
            DomainState::Running | DomainState::Blocked => {
                d.state = DomainState::Running;
                Ok(())
            }
            _ => Err(not_running(d)),
        })
        .await
    }

    async fn suspend_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| match d.state {
            DomainState::Running | DomainState::Blocked => {
                d.state = DomainState::Paused;
                Ok(())
            }
            _ => Err(not_running(d)),
        })
        .await
    }

    async fn resume_domain(&self, name: &str) -> Result<()> {
        self.transition(name, |d| match d.state {
            DomainState::Paused => {
                d.state = DomainState::Running;
                Ok(())
            }
            _ => Err(HypervisorError::InvalidState(format!(
                "domain {} is not paused",
                d.spec.name
            ))),
        })
        .await
    }

    async fn domain_stats(&self, name: &str) -> Result<DomainStats> {
        self.check()?;
        let mut guard = self.state.write().await;
        let key = Self::key(&guard, name)?;
        let domain = guard
            .domains
            .get_mut(&key)
            .ok_or_else(|| HypervisorError::DomainNotFound(name.to_string()))?;
        if domain.state == DomainState::Running {
            // Pretend every vCPU burned 10ms since the last sample.
            domain.cpu_time_ns += u64::from(domain.spec.vcpus) * 10_000_000;
        }
        let active = domain.state.is_active();
        Ok(DomainStats {
            cpu_time_ns: domain.cpu_time_ns,
            online_vcpus: domain.spec.vcpus,
            memory_actual_bytes: domain.spec.memory_bytes,
            memory_unused_bytes: if active { domain.spec.memory_bytes / 2 } else { 0 },
            memory_rss_bytes: if active { domain.spec.memory_bytes / 2 } else { 0 },
            ..Default::default()
        })
    }

    async fn set_vcpus(&self, name: &str, vcpus: u32) -> Result<()> {
        self.transition(name, move |d| {
            d.spec.vcpus = vcpus;
            d.spec.topology = None;
            Ok(())
        })
        .await
    }

    async fn set_memory(&self, name: &str, bytes: u64) -> Result<()> {
        self.transition(name, move |d| {
            d.spec.memory_bytes = bytes;
            Ok(())
        })
        .await
    }

    async fn list_snapshots(&self, domain: &str) -> Result<Vec<SnapshotInfo>> {
        self.check()?;
        let guard = self.state.read().await;
        let key = Self::key(&guard, domain)?;
        Ok(guard
            .domains
            .get(&key)
            .map(|d| d.snapshots.clone())
            .unwrap_or_default())
    }

    async fn create_snapshot(&self, domain: &str, req: &SnapshotRequest) -> Result<()> {
        let req = req.clone();
        self.transition(domain, move |d| {
            if d.snapshots.iter().any(|s| s.name == req.name) {
                return Err(HypervisorError::SnapshotExists(req.name));
            }
            if req.include_memory && !d.state.is_active() {
                return Err(HypervisorError::InvalidState(format!(
                    "domain {} is not running",
                    d.spec.name
                )));
            }
            let parent = d
                .snapshots
                .iter()
                .find(|s| s.is_current)
                .map(|s| s.name.clone());
            let state = req.include_memory.then(|| d.state.to_snapshot_state());
            d.snapshots.push(SnapshotInfo {
                name: req.name.clone(),
                parent,
                state,
                created_at: Some(Utc::now()),
                is_current: false,
            });
            d.set_current(Some(&req.name));
            Ok(())
        })
        .await
    }

    async fn revert_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.transition(domain, |d| {
            d.snapshot_index(snapshot)?;
            d.set_current(Some(snapshot));
            Ok(())
        })
        .await
    }

    async fn delete_snapshot(&self, domain: &str, snapshot: &str) -> Result<()> {
        self.transition(domain, |d| {
            let index = d.snapshot_index(snapshot)?;
            let removed = d.snapshots.remove(index);
            for child in d
                .snapshots
                .iter_mut()
                .filter(|s| s.parent.as_deref() == Some(snapshot))
            {
                child.parent = removed.parent.clone();
            }
            if removed.is_current {
                d.set_current(removed.parent.as_deref());
            }
            Ok(())
        })
        .await
    }

    async fn create_volume(
        &self,
        pool: &str,
        name: &str,
        size_bytes: u64,
        format: &str,
    ) -> Result<String> {
        self.check()?;
        let mut guard = self.state.write().await;
        let key = (pool.to_string(), name.to_string());
        if guard.volumes.contains_key(&key) {
            return Err(HypervisorError::Command {
                command: "vol-create-as".to_string(),
                message: format!("storage volume '{name}' exists already"),
            });
        }
        let path = format!("/var/lib/libvirt/images/{name}.{format}");
        guard.volumes.insert(key, (path.clone(), size_bytes));
        Ok(path)
    }

    async fn delete_volume(&self, pool: &str, name: &str) -> Result<()> {
        self.check()?;
        self.state
            .write()
            .await
            .volumes
            .remove(&(pool.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| HypervisorError::VolumeNotFound(format!("{pool}/{name}")))
    }

    async fn volume_path(&self, pool: &str, name: &str) -> Result<String> {
        self.check()?;
        self.state
            .read()
            .await
            .volumes
            .get(&(pool.to_string(), name.to_string()))
            .map(|(path, _)| path.clone())
            .ok_or_else(|| HypervisorError::VolumeNotFound(format!("{pool}/{name}")))
    }
}
