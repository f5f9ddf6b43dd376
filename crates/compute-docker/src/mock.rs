//! In-process engine used by unit tests and by downstream crates' tests.

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{
    ContainerConfig, ContainerInspectResponse, ContainerState, ContainerStateStatusEnum,
    EndpointSettings, HostConfig, NetworkSettings,
};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::client::{ClientConfig, EngineConnector, Result as ClientResult};
use crate::engine::{
    DaemonInfo, DaemonVersion, EngineApi, EngineError, EngineResult, EngineStats, ImageRef,
    NetworkRef, ResourceUpdate, VolumeRef,
};

#[derive(Default)]
struct EngineState {
    containers: HashMap<String, ContainerInspectResponse>,
    images: HashMap<String, ImageRef>,
    networks: HashMap<String, NetworkRef>,
    volumes: HashMap<String, VolumeRef>,
    stats: HashMap<String, EngineStats>,
}

pub struct InMemoryEngine {
    healthy: AtomicBool,
    /// Make `start_container` fail like a broken entrypoint would.
    fail_starts: AtomicBool,
    next_id: AtomicU64,
    state: Mutex<EngineState>,
}

impl Default for InMemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEngine {
    pub fn new() -> Self {
        let mut state = EngineState::default();
        for name in ["bridge", "host", "none"] {
            state.networks.insert(
                name.to_string(),
                NetworkRef {
                    id: format!("net-{name}"),
                    name: name.to_string(),
                    driver: if name == "bridge" { "bridge" } else { name }.to_string(),
                },
            );
        }
        Self {
            healthy: AtomicBool::new(true),
            fail_starts: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            state: Mutex::new(state),
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_start_failure(&self, fail: bool) {
        self.fail_starts.store(fail, Ordering::SeqCst);
    }

    /// Seed a stats sample returned for the container.
    pub fn set_stats(&self, id: &str, stats: EngineStats) {
        self.lock().stats.insert(id.to_string(), stats);
    }

    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        // A poisoned lock only happens after a panicking test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_health(&self) -> EngineResult<()> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Transport("daemon unreachable".into()))
        }
    }

    fn resolve(state: &EngineState, id: &str) -> EngineResult<String> {
        if state.containers.contains_key(id) {
            return Ok(id.to_string());
        }
        let wanted = format!("/{}", id.trim_start_matches('/'));
        state
            .containers
            .iter()
            .find(|(key, c)| key.starts_with(id) || c.name.as_deref() == Some(wanted.as_str()))
            .map(|(key, _)| key.clone())
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ContainerInspectResponse) -> EngineResult<T>,
    ) -> EngineResult<T> {
        self.check_health()?;
        let mut state = self.lock();
        let key = Self::resolve(&state, id)?;
        let container = state
            .containers
            .get_mut(&key)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {id}")))?;
        f(container)
    }
}

fn status_of(c: &ContainerInspectResponse) -> Option<ContainerStateStatusEnum> {
    c.state.as_ref().and_then(|s| s.status)
}

fn set_status(c: &mut ContainerInspectResponse, status: ContainerStateStatusEnum) {
    let now = Utc::now().to_rfc3339();
    let state = c.state.get_or_insert_with(ContainerState::default);
    match status {
        ContainerStateStatusEnum::RUNNING => {
            state.running = Some(true);
            state.paused = Some(false);
            state.pid = Some(1000);
            state.started_at = Some(now);
        }
        ContainerStateStatusEnum::PAUSED => {
            state.paused = Some(true);
        }
        ContainerStateStatusEnum::EXITED => {
            state.running = Some(false);
            state.paused = Some(false);
            state.pid = Some(0);
            state.exit_code = Some(0);
            state.finished_at = Some(now);
        }
        _ => {}
    }
    state.status = Some(status);
}

#[async_trait]
impl EngineApi for InMemoryEngine {
    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String> {
        self.check_health()?;
        let mut state = self.lock();
        let wanted = format!("/{name}");
        if state
            .containers
            .values()
            .any(|c| c.name.as_deref() == Some(wanted.as_str()))
        {
            return Err(EngineError::Conflict(format!(
                "container name \"{wanted}\" is already in use"
            )));
        }
        let image = config.image.clone().unwrap_or_default();
        if image.is_empty() {
            return Err(EngineError::BadRequest("image is required".into()));
        }

        let seq = self.next_id.fetch_add(1, Ordering::SeqCst);
        let id = format!("{seq:012x}{}", "0".repeat(52));
        let network_mode = config
            .host_config
            .as_ref()
            .and_then(|h| h.network_mode.clone())
            .unwrap_or_else(|| "bridge".to_string());
        let networks = HashMap::from([(
            network_mode,
            EndpointSettings {
                ip_address: Some(format!("172.17.0.{}", (seq % 250) + 2)),
                ..Default::default()
            },
        )]);

        let inspect = ContainerInspectResponse {
            id: Some(id.clone()),
            name: Some(wanted),
            created: Some(Utc::now().to_rfc3339()),
            image: Some(format!("sha256:{image}")),
            driver: Some("overlay2".to_string()),
            state: Some(ContainerState {
                status: Some(ContainerStateStatusEnum::CREATED),
                ..Default::default()
            }),
            config: Some(ContainerConfig {
                image: config.image,
                cmd: config.cmd,
                entrypoint: config.entrypoint,
                env: config.env,
                working_dir: config.working_dir,
                user: config.user,
                labels: config.labels,
                ..Default::default()
            }),
            host_config: Some(config.host_config.unwrap_or_else(HostConfig::default)),
            network_settings: Some(NetworkSettings {
                networks: Some(networks),
                ..Default::default()
            }),
            ..Default::default()
        };
        state.containers.insert(id.clone(), inspect);
        Ok(id)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        self.with_container(id, |c| Ok(c.clone()))
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &HashMap<String, String>,
    ) -> EngineResult<Vec<String>> {
        self.check_health()?;
        let state = self.lock();
        let mut ids: Vec<String> = state
            .containers
            .iter()
            .filter(|(_, c)| all || status_of(c) == Some(ContainerStateStatusEnum::RUNNING))
            .filter(|(_, c)| {
                let have = c.config.as_ref().and_then(|cfg| cfg.labels.as_ref());
                labels
                    .iter()
                    .all(|(k, v)| have.and_then(|l| l.get(k)) == Some(v))
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 500,
                message: "OCI runtime create failed: exec format error".into(),
            });
        }
        self.with_container(id, |c| match status_of(c) {
            Some(ContainerStateStatusEnum::RUNNING) => {
                Err(EngineError::NotModified("container already started".into()))
            }
            Some(ContainerStateStatusEnum::PAUSED) => Err(EngineError::Conflict(
                "cannot start a paused container, try unpause instead".into(),
            )),
            _ => {
                set_status(c, ContainerStateStatusEnum::RUNNING);
                Ok(())
            }
        })
    }

    async fn stop_container(&self, id: &str, _timeout_secs: Option<i64>) -> EngineResult<()> {
        self.with_container(id, |c| match status_of(c) {
            Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::PAUSED) => {
                set_status(c, ContainerStateStatusEnum::EXITED);
                Ok(())
            }
            _ => Err(EngineError::NotModified("container already stopped".into())),
        })
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        self.with_container(id, |c| match status_of(c) {
            Some(ContainerStateStatusEnum::RUNNING) | Some(ContainerStateStatusEnum::PAUSED) => {
                set_status(c, ContainerStateStatusEnum::EXITED);
                if let Some(state) = c.state.as_mut() {
                    state.exit_code = Some(137);
                }
                Ok(())
            }
            _ => Err(EngineError::Conflict("container is not running".into())),
        })
    }

    async fn restart_container(&self, id: &str, _timeout_secs: Option<i64>) -> EngineResult<()> {
        self.with_container(id, |c| {
            set_status(c, ContainerStateStatusEnum::RUNNING);
            c.restart_count = Some(c.restart_count.unwrap_or(0) + 1);
            Ok(())
        })
    }

    async fn pause_container(&self, id: &str) -> EngineResult<()> {
        self.with_container(id, |c| match status_of(c) {
            Some(ContainerStateStatusEnum::RUNNING) => {
                set_status(c, ContainerStateStatusEnum::PAUSED);
                Ok(())
            }
            Some(ContainerStateStatusEnum::PAUSED) => {
                Err(EngineError::Conflict("container is already paused".into()))
            }
            _ => Err(EngineError::Conflict("container is not running".into())),
        })
    }

    async fn unpause_container(&self, id: &str) -> EngineResult<()> {
        self.with_container(id, |c| match status_of(c) {
            Some(ContainerStateStatusEnum::PAUSED) => {
                set_status(c, ContainerStateStatusEnum::RUNNING);
                Ok(())
            }
            _ => Err(EngineError::Conflict("container is not paused".into())),
        })
    }

    async fn remove_container(&self, id: &str, force: bool, _volumes: bool) -> EngineResult<()> {
        self.check_health()?;
        let mut state = self.lock();
        let key = Self::resolve(&state, id)?;
        let running = state.containers.get(&key).and_then(status_of).is_some_and(|s| {
            matches!(
                s,
                ContainerStateStatusEnum::RUNNING | ContainerStateStatusEnum::PAUSED
            )
        });
        if running && !force {
            return Err(EngineError::Conflict(
                "cannot remove a running container, stop it first or force the removal".into(),
            ));
        }
        state.containers.remove(&key);
        state.stats.remove(&key);
        Ok(())
    }

    async fn update_container(&self, id: &str, update: ResourceUpdate) -> EngineResult<()> {
        self.with_container(id, |c| {
            let host = c.host_config.get_or_insert_with(HostConfig::default);
            if let Some(memory) = update.memory {
                host.memory = Some(memory);
            }
            if let Some(swap) = update.memory_swap {
                host.memory_swap = Some(swap);
            }
            if let Some(shares) = update.cpu_shares {
                host.cpu_shares = Some(shares);
            }
            if let Some(quota) = update.cpu_quota {
                host.cpu_quota = Some(quota);
                host.nano_cpus = None;
            }
            if let Some(period) = update.cpu_period {
                host.cpu_period = Some(period);
            }
            if let Some(cpuset) = update.cpuset_cpus {
                host.cpuset_cpus = Some(cpuset);
            }
            if let Some(policy) = update.restart_policy {
                host.restart_policy = Some(policy);
            }
            Ok(())
        })
    }

    async fn container_stats(&self, id: &str) -> EngineResult<EngineStats> {
        self.check_health()?;
        let state = self.lock();
        let key = Self::resolve(&state, id)?;
        let limit = state
            .containers
            .get(&key)
            .and_then(|c| c.host_config.as_ref())
            .and_then(|h| h.memory)
            .and_then(|m| u64::try_from(m).ok())
            .unwrap_or(0);
        Ok(state.stats.get(&key).cloned().unwrap_or(EngineStats {
            online_cpus: 1,
            memory_limit: limit,
            ..Default::default()
        }))
    }

    async fn container_logs(&self, id: &str, _tail: usize) -> EngineResult<Vec<String>> {
        self.with_container(id, |_| Ok(Vec::new()))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        self.check_health()?;
        let tag = if image.contains(':') {
            image.to_string()
        } else {
            format!("{image}:latest")
        };
        self.lock().images.insert(
            tag.clone(),
            ImageRef {
                id: format!("sha256:{tag}"),
                tags: vec![tag],
                size: 0,
            },
        );
        Ok(())
    }

    async fn list_images(&self) -> EngineResult<Vec<ImageRef>> {
        self.check_health()?;
        Ok(self.lock().images.values().cloned().collect())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageRef> {
        self.check_health()?;
        self.lock()
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {image}")))
    }

    async fn remove_image(&self, image: &str, _force: bool) -> EngineResult<()> {
        self.check_health()?;
        self.lock()
            .images
            .remove(image)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {image}")))
    }

    async fn prune_images(&self) -> EngineResult<u64> {
        self.check_health()?;
        Ok(0)
    }

    async fn list_networks(&self) -> EngineResult<Vec<NetworkRef>> {
        self.check_health()?;
        Ok(self.lock().networks.values().cloned().collect())
    }

    async fn create_network(&self, name: &str, driver: &str) -> EngineResult<NetworkRef> {
        self.check_health()?;
        let mut state = self.lock();
        if state.networks.contains_key(name) {
            return Err(EngineError::Conflict(format!("network with name {name} already exists")));
        }
        let network = NetworkRef {
            id: format!("net-{name}"),
            name: name.to_string(),
            driver: driver.to_string(),
        };
        state.networks.insert(name.to_string(), network.clone());
        Ok(network)
    }

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkRef> {
        self.check_health()?;
        self.lock()
            .networks
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("network {name} not found")))
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.check_health()?;
        self.lock()
            .networks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("network {name} not found")))
    }

    async fn connect_network(&self, network: &str, container: &str) -> EngineResult<()> {
        self.inspect_network(network).await?;
        self.with_container(container, |c| {
            c.network_settings
                .get_or_insert_with(NetworkSettings::default)
                .networks
                .get_or_insert_with(HashMap::new)
                .insert(network.to_string(), EndpointSettings::default());
            Ok(())
        })
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        _force: bool,
    ) -> EngineResult<()> {
        self.with_container(container, |c| {
            c.network_settings
                .as_mut()
                .and_then(|ns| ns.networks.as_mut())
                .and_then(|nets| nets.remove(network))
                .map(|_| ())
                .ok_or_else(|| {
                    EngineError::NotFound(format!("container is not connected to {network}"))
                })
        })
    }

    async fn list_volumes(&self) -> EngineResult<Vec<VolumeRef>> {
        self.check_health()?;
        Ok(self.lock().volumes.values().cloned().collect())
    }

    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<VolumeRef> {
        self.check_health()?;
        let volume = VolumeRef {
            name: name.to_string(),
            driver: driver.to_string(),
            mountpoint: format!("/var/lib/docker/volumes/{name}/_data"),
        };
        self.lock().volumes.insert(name.to_string(), volume.clone());
        Ok(volume)
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeRef> {
        self.check_health()?;
        self.lock()
            .volumes
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("get {name}: no such volume")))
    }

    async fn remove_volume(&self, name: &str, _force: bool) -> EngineResult<()> {
        self.check_health()?;
        self.lock()
            .volumes
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(format!("get {name}: no such volume")))
    }

    async fn prune_volumes(&self) -> EngineResult<u64> {
        self.check_health()?;
        Ok(0)
    }

    async fn ping(&self) -> EngineResult<()> {
        self.check_health()
    }

    async fn info(&self) -> EngineResult<DaemonInfo> {
        self.check_health()?;
        let state = self.lock();
        let running = state
            .containers
            .values()
            .filter(|c| status_of(c) == Some(ContainerStateStatusEnum::RUNNING))
            .count();
        Ok(DaemonInfo {
            name: "in-memory".to_string(),
            driver: "overlay2".to_string(),
            kernel_version: "6.0.0".to_string(),
            os_type: "linux".to_string(),
            architecture: "x86_64".to_string(),
            ncpu: 8,
            mem_total: 16 * 1024 * 1024 * 1024,
            containers_running: u32::try_from(running).unwrap_or(u32::MAX),
        })
    }

    async fn version(&self) -> EngineResult<DaemonVersion> {
        self.check_health()?;
        Ok(DaemonVersion {
            version: "24.0.0".to_string(),
            api_version: "1.43".to_string(),
        })
    }
}

/// Hands out the same engine on every connect and counts the calls.
pub struct InMemoryConnector {
    engine: Arc<InMemoryEngine>,
    calls: AtomicU64,
}

impl InMemoryConnector {
    pub fn new(engine: Arc<InMemoryEngine>) -> Self {
        Self {
            engine,
            calls: AtomicU64::new(0),
        }
    }

    pub fn connect_calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineConnector for InMemoryConnector {
    async fn connect(&self, _config: &ClientConfig) -> ClientResult<Arc<dyn EngineApi>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.engine.clone() as Arc<dyn EngineApi>)
    }
}
