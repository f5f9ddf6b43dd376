//! Docker daemon access through bollard.

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, LogsOptions, RemoveContainerOptions, RestartContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::image::{CreateImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{ContainerInspectResponse, EndpointSettings};
use bollard::network::{
    ConnectNetworkOptions, CreateNetworkOptions, DisconnectNetworkOptions, InspectNetworkOptions,
    ListNetworksOptions,
};
use bollard::volume::{
    CreateVolumeOptions, ListVolumesOptions, PruneVolumesOptions, RemoveVolumeOptions,
};
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::{parse_api_version, ClientConfig, ClientError, EngineConnector};
use crate::engine::{
    DaemonInfo, DaemonVersion, EngineApi, EngineError, EngineResult, EngineStats, ImageRef,
    NetworkRef, ResourceUpdate, VolumeRef,
};

/// Dials a Docker daemon according to a [`ClientConfig`].
pub struct BollardConnector;

#[async_trait]
impl EngineConnector for BollardConnector {
    async fn connect(&self, config: &ClientConfig) -> Result<Arc<dyn EngineApi>, ClientError> {
        let pinned = match &config.api_version {
            Some(v) => {
                let (major_version, minor_version) = parse_api_version(v)?;
                Some(ClientVersion {
                    major_version,
                    minor_version,
                })
            }
            None => None,
        };
        let version = pinned.as_ref().unwrap_or(API_DEFAULT_VERSION);
        let timeout = config.request_timeout.as_secs();
        let failed = |e: bollard::errors::Error| ClientError::ConnectionFailed {
            attempts: 1,
            message: e.to_string(),
        };

        let docker = if let Some(path) = config.host.strip_prefix("unix://") {
            Docker::connect_with_unix(path, timeout, version).map_err(failed)?
        } else if config.uses_tls() {
            let (Some(key), Some(cert), Some(ca)) =
                (&config.key_path, &config.cert_path, &config.ca_path)
            else {
                return Err(ClientError::MissingTlsConfig("cert_path, key_path or ca_path"));
            };
            let addr = config.host.replacen("https://", "tcp://", 1);
            Docker::connect_with_ssl(&addr, key, cert, ca, timeout, version).map_err(failed)?
        } else {
            Docker::connect_with_http(&config.host, timeout, version).map_err(failed)?
        };

        let docker = if pinned.is_none() {
            docker.negotiate_version().await.map_err(failed)?
        } else {
            docker
        };

        info!(host = %config.host, "Connected to container engine");
        Ok(Arc::new(BollardEngine::new(docker)))
    }
}

pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

fn non_negative(v: Option<i64>) -> u64 {
    v.and_then(|v| u64::try_from(v).ok()).unwrap_or(0)
}

#[async_trait]
impl EngineApi for BollardEngine {
    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            platform: None,
        };
        let created = self.docker.create_container(Some(options), config).await?;
        for warning in &created.warnings {
            debug!(container = %created.id, %warning, "Engine warning on create");
        }
        Ok(created.id)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        Ok(self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?)
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &HashMap<String, String>,
    ) -> EngineResult<Vec<String>> {
        let mut filters = HashMap::new();
        if !labels.is_empty() {
            filters.insert(
                "label".to_string(),
                labels.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            );
        }
        let options = ListContainersOptions::<String> {
            all,
            filters,
            ..Default::default()
        };
        let summaries = self.docker.list_containers(Some(options)).await?;
        Ok(summaries.into_iter().filter_map(|s| s.id).collect())
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        Ok(self
            .docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?)
    }

    async fn stop_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()> {
        let options = timeout_secs.map(|t| StopContainerOptions { t });
        Ok(self.docker.stop_container(id, options).await?)
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        Ok(self.docker.kill_container(id, Some(options)).await?)
    }

    async fn restart_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()> {
        let options = timeout_secs.map(|t| RestartContainerOptions {
            t: t.try_into().unwrap_or(30),
        });
        Ok(self.docker.restart_container(id, options).await?)
    }

    async fn pause_container(&self, id: &str) -> EngineResult<()> {
        Ok(self.docker.pause_container(id).await?)
    }

    async fn unpause_container(&self, id: &str) -> EngineResult<()> {
        Ok(self.docker.unpause_container(id).await?)
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force,
            v: volumes,
            ..Default::default()
        };
        Ok(self.docker.remove_container(id, Some(options)).await?)
    }

    async fn update_container(&self, id: &str, update: ResourceUpdate) -> EngineResult<()> {
        let options = UpdateContainerOptions::<String> {
            memory: update.memory,
            memory_swap: update.memory_swap,
            cpu_shares: update.cpu_shares.and_then(|s| s.try_into().ok()),
            cpu_quota: update.cpu_quota,
            cpu_period: update.cpu_period,
            cpuset_cpus: update.cpuset_cpus,
            restart_policy: update.restart_policy,
            ..Default::default()
        };
        Ok(self.docker.update_container(id, options).await?)
    }

    async fn container_stats(&self, id: &str) -> EngineResult<EngineStats> {
        let options = StatsOptions {
            stream: false,
            one_shot: false,
        };
        let mut stream = Box::pin(self.docker.stats(id, Some(options)));
        let stats = stream
            .next()
            .await
            .ok_or_else(|| EngineError::Transport(format!("no stats returned for {id}")))??;

        let (rx_bytes, tx_bytes, rx_packets, tx_packets) = stats
            .networks
            .as_ref()
            .map(|nets| {
                nets.values().fold((0, 0, 0, 0), |acc, n| {
                    (
                        acc.0 + n.rx_bytes,
                        acc.1 + n.tx_bytes,
                        acc.2 + n.rx_packets,
                        acc.3 + n.tx_packets,
                    )
                })
            })
            .unwrap_or_default();

        let (blk_read, blk_write) = stats
            .blkio_stats
            .io_service_bytes_recursive
            .as_ref()
            .map(|entries| {
                entries.iter().fold((0, 0), |acc, e| match e.op.to_lowercase().as_str() {
                    "read" => (acc.0 + e.value, acc.1),
                    "write" => (acc.0, acc.1 + e.value),
                    _ => acc,
                })
            })
            .unwrap_or_default();

        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or_else(|| {
            stats
                .cpu_stats
                .cpu_usage
                .percpu_usage
                .as_ref()
                .map(|p| p.len() as u64)
                .unwrap_or(1)
        });

        Ok(EngineStats {
            cpu_total: stats.cpu_stats.cpu_usage.total_usage,
            precpu_total: stats.precpu_stats.cpu_usage.total_usage,
            system_cpu: stats.cpu_stats.system_cpu_usage.unwrap_or(0),
            presystem_cpu: stats.precpu_stats.system_cpu_usage.unwrap_or(0),
            online_cpus: online_cpus as u32,
            memory_usage: stats.memory_stats.usage.unwrap_or(0),
            memory_max_usage: stats.memory_stats.max_usage.unwrap_or(0),
            memory_limit: stats.memory_stats.limit.unwrap_or(0),
            rx_bytes,
            tx_bytes,
            rx_packets,
            tx_packets,
            blk_read,
            blk_write,
        })
    }

    async fn container_logs(&self, id: &str, tail: usize) -> EngineResult<Vec<String>> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };
        let lines = self
            .docker
            .logs(id, Some(options))
            .map_ok(|line| line.to_string())
            .try_collect::<Vec<_>>()
            .await?;
        Ok(lines)
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        info!(%image, "Pulled image");
        Ok(())
    }

    async fn list_images(&self) -> EngineResult<Vec<ImageRef>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String>::default()))
            .await?;
        Ok(images
            .into_iter()
            .map(|img| ImageRef {
                id: img.id,
                tags: img.repo_tags,
                size: u64::try_from(img.size).unwrap_or(0),
            })
            .collect())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageRef> {
        let img = self.docker.inspect_image(image).await?;
        Ok(ImageRef {
            id: img.id.unwrap_or_default(),
            tags: img.repo_tags.unwrap_or_default(),
            size: non_negative(img.size),
        })
    }

    async fn remove_image(&self, image: &str, force: bool) -> EngineResult<()> {
        let options = RemoveImageOptions {
            force,
            noprune: false,
        };
        self.docker.remove_image(image, Some(options), None).await?;
        Ok(())
    }

    async fn prune_images(&self) -> EngineResult<u64> {
        let pruned = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await?;
        Ok(non_negative(pruned.space_reclaimed))
    }

    async fn list_networks(&self) -> EngineResult<Vec<NetworkRef>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;
        Ok(networks
            .into_iter()
            .map(|n| NetworkRef {
                id: n.id.unwrap_or_default(),
                name: n.name.unwrap_or_default(),
                driver: n.driver.unwrap_or_default(),
            })
            .collect())
    }

    async fn create_network(&self, name: &str, driver: &str) -> EngineResult<NetworkRef> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            ..Default::default()
        };
        self.docker.create_network(options).await?;
        self.inspect_network(name).await
    }

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkRef> {
        let n = self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await?;
        Ok(NetworkRef {
            id: n.id.unwrap_or_default(),
            name: n.name.unwrap_or_default(),
            driver: n.driver.unwrap_or_default(),
        })
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        Ok(self.docker.remove_network(name).await?)
    }

    async fn connect_network(&self, network: &str, container: &str) -> EngineResult<()> {
        let options = ConnectNetworkOptions {
            container: container.to_string(),
            endpoint_config: EndpointSettings::default(),
        };
        Ok(self.docker.connect_network(network, options).await?)
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> EngineResult<()> {
        let options = DisconnectNetworkOptions {
            container: container.to_string(),
            force,
        };
        Ok(self.docker.disconnect_network(network, options).await?)
    }

    async fn list_volumes(&self) -> EngineResult<Vec<VolumeRef>> {
        let listed = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;
        Ok(listed
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|v| VolumeRef {
                name: v.name,
                driver: v.driver,
                mountpoint: v.mountpoint,
            })
            .collect())
    }

    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<VolumeRef> {
        let options = CreateVolumeOptions {
            name: name.to_string(),
            driver: driver.to_string(),
            ..Default::default()
        };
        let v = self.docker.create_volume(options).await?;
        Ok(VolumeRef {
            name: v.name,
            driver: v.driver,
            mountpoint: v.mountpoint,
        })
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeRef> {
        let v = self.docker.inspect_volume(name).await?;
        Ok(VolumeRef {
            name: v.name,
            driver: v.driver,
            mountpoint: v.mountpoint,
        })
    }

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()> {
        Ok(self
            .docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await?)
    }

    async fn prune_volumes(&self) -> EngineResult<u64> {
        let pruned = self
            .docker
            .prune_volumes(None::<PruneVolumesOptions<String>>)
            .await?;
        Ok(non_negative(pruned.space_reclaimed))
    }

    async fn ping(&self) -> EngineResult<()> {
        self.docker.ping().await?;
        Ok(())
    }

    async fn info(&self) -> EngineResult<DaemonInfo> {
        let info = self.docker.info().await?;
        Ok(DaemonInfo {
            name: info.name.unwrap_or_default(),
            driver: info.driver.unwrap_or_default(),
            kernel_version: info.kernel_version.unwrap_or_default(),
            os_type: info.os_type.unwrap_or_default(),
            architecture: info.architecture.unwrap_or_default(),
            ncpu: info.ncpu.and_then(|n| u32::try_from(n).ok()).unwrap_or(0),
            mem_total: non_negative(info.mem_total),
            containers_running: info
                .containers_running
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(0),
        })
    }

    async fn version(&self) -> EngineResult<DaemonVersion> {
        let version = self.docker.version().await?;
        Ok(DaemonVersion {
            version: version.version.unwrap_or_default(),
            api_version: version.api_version.unwrap_or_default(),
        })
    }
}
