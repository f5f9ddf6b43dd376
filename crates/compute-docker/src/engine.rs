//! Container-engine API surface consumed by the driver, and the serializing
//! wrapper the client pool hands out.

use async_trait::async_trait;
use bollard::container::Config;
use bollard::models::{ContainerInspectResponse, RestartPolicy};
use compute_common::ComputeError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("No such object: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Not modified: {0}")]
    NotModified(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Engine API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => match status_code {
                404 => EngineError::NotFound(message),
                409 => EngineError::Conflict(message),
                304 => EngineError::NotModified(message),
                400 => EngineError::BadRequest(message),
                status => EngineError::Api { status, message },
            },
            other => EngineError::Transport(other.to_string()),
        }
    }
}

impl From<EngineError> for ComputeError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(msg) => ComputeError::NotFound(msg),
            EngineError::Conflict(msg) | EngineError::NotModified(msg) => {
                ComputeError::InvalidState(msg)
            }
            EngineError::BadRequest(msg) => ComputeError::InvalidInput(msg),
            EngineError::Api { status, message } => {
                ComputeError::Internal(format!("engine returned {status}: {message}"))
            }
            EngineError::Transport(msg) => ComputeError::Unavailable(msg),
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Raw counters from one stats sample, with the previous sample folded in.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStats {
    pub cpu_total: u64,
    pub precpu_total: u64,
    pub system_cpu: u64,
    pub presystem_cpu: u64,
    pub online_cpus: u32,
    pub memory_usage: u64,
    pub memory_max_usage: u64,
    pub memory_limit: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub blk_read: u64,
    pub blk_write: u64,
}

/// Mutable resource fields of a live container.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub cpu_shares: Option<i64>,
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub restart_policy: Option<RestartPolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub name: String,
    pub driver: String,
    pub kernel_version: String,
    pub os_type: String,
    pub architecture: String,
    pub ncpu: u32,
    pub mem_total: u64,
    pub containers_running: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonVersion {
    pub version: String,
    pub api_version: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRef {
    pub id: String,
    pub tags: Vec<String>,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkRef {
    pub id: String,
    pub name: String,
    pub driver: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VolumeRef {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
}

/// Native client operations. Implementations need not be safe for
/// concurrent command submission; the pool serializes calls.
#[async_trait]
pub trait EngineApi: Send + Sync {
    // Containers
    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String>;
    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse>;
    async fn list_containers(
        &self,
        all: bool,
        labels: &HashMap<String, String>,
    ) -> EngineResult<Vec<String>>;
    async fn start_container(&self, id: &str) -> EngineResult<()>;
    async fn stop_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()>;
    async fn kill_container(&self, id: &str) -> EngineResult<()>;
    async fn restart_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()>;
    async fn pause_container(&self, id: &str) -> EngineResult<()>;
    async fn unpause_container(&self, id: &str) -> EngineResult<()>;
    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> EngineResult<()>;
    async fn update_container(&self, id: &str, update: ResourceUpdate) -> EngineResult<()>;
    async fn container_stats(&self, id: &str) -> EngineResult<EngineStats>;
    async fn container_logs(&self, id: &str, tail: usize) -> EngineResult<Vec<String>>;

    // Images
    async fn pull_image(&self, image: &str) -> EngineResult<()>;
    async fn list_images(&self) -> EngineResult<Vec<ImageRef>>;
    async fn inspect_image(&self, image: &str) -> EngineResult<ImageRef>;
    async fn remove_image(&self, image: &str, force: bool) -> EngineResult<()>;
    async fn prune_images(&self) -> EngineResult<u64>;

    // Networks
    async fn list_networks(&self) -> EngineResult<Vec<NetworkRef>>;
    async fn create_network(&self, name: &str, driver: &str) -> EngineResult<NetworkRef>;
    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkRef>;
    async fn remove_network(&self, name: &str) -> EngineResult<()>;
    async fn connect_network(&self, network: &str, container: &str) -> EngineResult<()>;
    async fn disconnect_network(&self, network: &str, container: &str, force: bool)
        -> EngineResult<()>;

    // Volumes
    async fn list_volumes(&self) -> EngineResult<Vec<VolumeRef>>;
    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<VolumeRef>;
    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeRef>;
    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()>;
    async fn prune_volumes(&self) -> EngineResult<u64>;

    // Daemon
    async fn ping(&self) -> EngineResult<()>;
    async fn info(&self) -> EngineResult<DaemonInfo>;
    async fn version(&self) -> EngineResult<DaemonVersion>;
}

/// Wraps a native client so every call holds the per-client mutex.
pub struct SerializedEngine {
    inner: Arc<dyn EngineApi>,
    lock: Mutex<()>,
}

impl SerializedEngine {
    pub fn new(inner: Arc<dyn EngineApi>) -> Self {
        Self {
            inner,
            lock: Mutex::new(()),
        }
    }
}

macro_rules! serialized {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {{
        let _guard = $self.lock.lock().await;
        $self.inner.$method($($arg),*).await
    }};
}

#[async_trait]
impl EngineApi for SerializedEngine {
    async fn create_container(&self, name: &str, config: Config<String>) -> EngineResult<String> {
        serialized!(self.create_container(name, config))
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<ContainerInspectResponse> {
        serialized!(self.inspect_container(id))
    }

    async fn list_containers(
        &self,
        all: bool,
        labels: &HashMap<String, String>,
    ) -> EngineResult<Vec<String>> {
        serialized!(self.list_containers(all, labels))
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        serialized!(self.start_container(id))
    }

    async fn stop_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()> {
        serialized!(self.stop_container(id, timeout_secs))
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        serialized!(self.kill_container(id))
    }

    async fn restart_container(&self, id: &str, timeout_secs: Option<i64>) -> EngineResult<()> {
        serialized!(self.restart_container(id, timeout_secs))
    }

    async fn pause_container(&self, id: &str) -> EngineResult<()> {
        serialized!(self.pause_container(id))
    }

    async fn unpause_container(&self, id: &str) -> EngineResult<()> {
        serialized!(self.unpause_container(id))
    }

    async fn remove_container(&self, id: &str, force: bool, volumes: bool) -> EngineResult<()> {
        serialized!(self.remove_container(id, force, volumes))
    }

    async fn update_container(&self, id: &str, update: ResourceUpdate) -> EngineResult<()> {
        serialized!(self.update_container(id, update))
    }

    async fn container_stats(&self, id: &str) -> EngineResult<EngineStats> {
        serialized!(self.container_stats(id))
    }

    async fn container_logs(&self, id: &str, tail: usize) -> EngineResult<Vec<String>> {
        serialized!(self.container_logs(id, tail))
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        serialized!(self.pull_image(image))
    }

    async fn list_images(&self) -> EngineResult<Vec<ImageRef>> {
        serialized!(self.list_images())
    }

    async fn inspect_image(&self, image: &str) -> EngineResult<ImageRef> {
        serialized!(self.inspect_image(image))
    }

    async fn remove_image(&self, image: &str, force: bool) -> EngineResult<()> {
        serialized!(self.remove_image(image, force))
    }

    async fn prune_images(&self) -> EngineResult<u64> {
        serialized!(self.prune_images())
    }

    async fn list_networks(&self) -> EngineResult<Vec<NetworkRef>> {
        serialized!(self.list_networks())
    }

    async fn create_network(&self, name: &str, driver: &str) -> EngineResult<NetworkRef> {
        serialized!(self.create_network(name, driver))
    }

    async fn inspect_network(&self, name: &str) -> EngineResult<NetworkRef> {
        serialized!(self.inspect_network(name))
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        serialized!(self.remove_network(name))
    }

    async fn connect_network(&self, network: &str, container: &str) -> EngineResult<()> {
        serialized!(self.connect_network(network, container))
    }

    async fn disconnect_network(
        &self,
        network: &str,
        container: &str,
        force: bool,
    ) -> EngineResult<()> {
        serialized!(self.disconnect_network(network, container, force))
    }

    async fn list_volumes(&self) -> EngineResult<Vec<VolumeRef>> {
        serialized!(self.list_volumes())
    }

    async fn create_volume(&self, name: &str, driver: &str) -> EngineResult<VolumeRef> {
        serialized!(self.create_volume(name, driver))
    }

    async fn inspect_volume(&self, name: &str) -> EngineResult<VolumeRef> {
        serialized!(self.inspect_volume(name))
    }

    async fn remove_volume(&self, name: &str, force: bool) -> EngineResult<()> {
        serialized!(self.remove_volume(name, force))
    }

    async fn prune_volumes(&self) -> EngineResult<u64> {
        serialized!(self.prune_volumes())
    }

    async fn ping(&self) -> EngineResult<()> {
        serialized!(self.ping())
    }

    async fn info(&self) -> EngineResult<DaemonInfo> {
        serialized!(self.info())
    }

    async fn version(&self) -> EngineResult<DaemonVersion> {
        serialized!(self.version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_mapping() {
        let err: ComputeError = EngineError::NotFound("abc".into()).into();
        assert!(matches!(err, ComputeError::NotFound(_)));

        let err: ComputeError = EngineError::Conflict("in use".into()).into();
        assert!(matches!(err, ComputeError::InvalidState(_)));

        let err: ComputeError = EngineError::Transport("refused".into()).into();
        assert!(matches!(err, ComputeError::Unavailable(_)));
    }

    #[test]
    fn test_bollard_status_mapping() {
        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: x".to_string(),
        };
        assert!(matches!(EngineError::from(err), EngineError::NotFound(_)));

        let err = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(matches!(
            EngineError::from(err),
            EngineError::Api { status: 500, .. }
        ));
    }
}
