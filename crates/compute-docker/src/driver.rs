use async_trait::async_trait;
use compute_common::{
    Backend, BackendInfo, ComputeDriver, ComputeError, ComputeResources, CpuResources,
    HealthStatus, Instance, InstanceKind, InstanceRequest, InstanceUpdate, ListOptions,
    MemoryResources, ResourceUsage, Result, USER_ID_LABEL,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::client::ClientManager;
use crate::convert::{
    inspect_to_instance, request_to_config, resources_to_update, restart_policy_update,
    stats_to_usage,
};
use crate::engine::{EngineApi, EngineError};

/// Graceful stop deadline before the engine kills the container.
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(30);

pub const CAPABILITIES: [&str; 4] = ["containers", "images", "networks", "volumes"];

/// Container-engine driver. Every call acquires its client from the pool.
pub struct ContainerDriver {
    clients: Arc<ClientManager>,
    stop_timeout: Duration,
}

impl ContainerDriver {
    pub fn new(clients: Arc<ClientManager>) -> Self {
        Self {
            clients,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    pub fn clients(&self) -> &Arc<ClientManager> {
        &self.clients
    }

    /// Live engine handle for image, network and volume management.
    pub async fn engine(&self) -> Result<Arc<dyn EngineApi>> {
        Ok(self.clients.get().await?)
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<Vec<String>> {
        let engine = self.engine().await?;
        Ok(engine.container_logs(id, tail).await?)
    }

    fn stop_timeout_secs(&self) -> i64 {
        i64::try_from(self.stop_timeout.as_secs()).unwrap_or(i64::MAX)
    }

    async fn ensure_image(&self, engine: &dyn EngineApi, image: &str) -> Result<()> {
        match engine.inspect_image(image).await {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(_)) => {
                info!(image, "Image not present locally, pulling");
                engine.pull_image(image).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ComputeDriver for ContainerDriver {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create(&self, req: &InstanceRequest) -> Result<Instance> {
        self.validate_config(req).await?;
        let engine = self.engine().await?;
        self.ensure_image(engine.as_ref(), &req.config.image).await?;

        let id = engine
            .create_container(&req.name, request_to_config(req))
            .await
            .map_err(|e| match e {
                EngineError::Conflict(_) => {
                    ComputeError::AlreadyExists(format!("container {}", req.name))
                }
                other => other.into(),
            })?;
        info!(container_id = %id, "Container created");

        if req.auto_start {
            if let Err(e) = engine.start_container(&id).await {
                warn!(container_id = %id, error = %e, "Auto-start failed");
                return Err(e.into());
            }
        }

        let inspect = engine.inspect_container(&id).await?;
        Ok(inspect_to_instance(inspect))
    }

    async fn get(&self, id: &str) -> Result<Instance> {
        let engine = self.engine().await?;
        let inspect = engine.inspect_container(id).await.map_err(|e| match e {
            EngineError::NotFound(_) => ComputeError::not_found("container", id),
            other => other.into(),
        })?;
        Ok(inspect_to_instance(inspect))
    }

    #[instrument(skip(self, opts))]
    async fn list(&self, opts: &ListOptions) -> Result<Vec<Instance>> {
        let engine = self.engine().await?;

        let mut label_filter: HashMap<String, String> = opts.labels.clone();
        if let Some(user_id) = opts.user_id {
            label_filter.insert(USER_ID_LABEL.to_string(), user_id.to_string());
        }

        let ids = engine.list_containers(true, &label_filter).await?;
        let mut instances = Vec::with_capacity(ids.len());
        for id in ids {
            match engine.inspect_container(&id).await {
                Ok(inspect) => {
                    let instance = inspect_to_instance(inspect);
                    if opts.matches(&instance) {
                        instances.push(instance);
                    }
                }
                // Removed between list and inspect.
                Err(EngineError::NotFound(_)) => debug!(container_id = %id, "Container vanished"),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(instances)
    }

    #[instrument(skip(self, update))]
    async fn update(&self, id: &str, update: &InstanceUpdate) -> Result<Instance> {
        let engine = self.engine().await?;
        if let Some(resources) = &update.resources {
            engine
                .update_container(id, resources_to_update(resources))
                .await?;
        }
        if let Some(policy) = &update.restart_policy {
            engine
                .update_container(id, restart_policy_update(policy))
                .await?;
        }
        if update.labels.is_some() || update.networks.is_some() || update.storage.is_some() {
            warn!(container_id = %id, "Labels, networks and storage are fixed at creation; ignoring");
        }
        let inspect = engine.inspect_container(id).await?;
        Ok(inspect_to_instance(inspect))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let engine = self.engine().await?;
        engine.remove_container(id, force, true).await.map_err(|e| match e {
            EngineError::NotFound(_) => ComputeError::not_found("container", id),
            other => other.into(),
        })?;
        info!(container_id = %id, "Container removed");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn start(&self, id: &str) -> Result<()> {
        let engine = self.engine().await?;
        match engine.start_container(id).await {
            Ok(()) | Err(EngineError::NotModified(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn stop(&self, id: &str, force: bool) -> Result<()> {
        let engine = self.engine().await?;
        let result = if force {
            engine.kill_container(id).await
        } else {
            engine
                .stop_container(id, Some(self.stop_timeout_secs()))
                .await
        };
        match result {
            Ok(()) | Err(EngineError::NotModified(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn restart(&self, id: &str, force: bool) -> Result<()> {
        let engine = self.engine().await?;
        let timeout = if force { 0 } else { self.stop_timeout_secs() };
        Ok(engine.restart_container(id, Some(timeout)).await?)
    }

    async fn pause(&self, id: &str) -> Result<()> {
        let engine = self.engine().await?;
        Ok(engine.pause_container(id).await?)
    }

    async fn unpause(&self, id: &str) -> Result<()> {
        let engine = self.engine().await?;
        Ok(engine.unpause_container(id).await?)
    }

    async fn resource_usage(&self, id: &str) -> Result<ResourceUsage> {
        let engine = self.engine().await?;
        let stats = engine.container_stats(id).await?;
        Ok(stats_to_usage(&stats))
    }

    #[instrument(skip(self, resources))]
    async fn update_resource_limits(&self, id: &str, resources: &ComputeResources) -> Result<()> {
        let engine = self.engine().await?;
        Ok(engine
            .update_container(id, resources_to_update(resources))
            .await?)
    }

    async fn backend_info(&self) -> Result<BackendInfo> {
        let engine = self.engine().await?;
        let health = match engine.ping().await {
            Ok(()) => HealthStatus::healthy(),
            Err(e) => HealthStatus::unhealthy(e.to_string()),
        };
        let info = engine.info().await?;
        let version = engine.version().await?;

        let configuration = HashMap::from([
            ("host".to_string(), self.clients.config().host.clone()),
            ("driver".to_string(), info.driver.clone()),
            ("kernel_version".to_string(), info.kernel_version.clone()),
            ("os_type".to_string(), info.os_type.clone()),
            ("architecture".to_string(), info.architecture.clone()),
        ]);

        let total_cpu = CpuResources {
            cores: f64::from(info.ncpu),
            ..Default::default()
        };
        let total_memory = MemoryResources {
            limit: info.mem_total,
            ..Default::default()
        };

        Ok(BackendInfo {
            backend: Backend::ContainerEngine,
            version: version.version,
            api_version: version.api_version,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            supported_kinds: self.supported_kinds(),
            // Containers share the host; nothing is reserved up front.
            available_cpu: total_cpu.clone(),
            available_memory: total_memory.clone(),
            total_cpu,
            total_memory,
            configuration,
            health,
        })
    }

    async fn validate_config(&self, req: &InstanceRequest) -> Result<()> {
        if req.kind != InstanceKind::Container {
            return Err(ComputeError::InvalidInput(format!(
                "container engine cannot host instance kind {}",
                req.kind
            )));
        }
        if req.config.image.trim().is_empty() {
            return Err(ComputeError::InvalidInput("image is required".into()));
        }
        if let Some(uid) = req
            .config
            .security_context
            .as_ref()
            .and_then(|s| s.run_as_user)
        {
            if uid < 0 {
                return Err(ComputeError::InvalidInput(
                    "run_as_user must be non-negative".into(),
                ));
            }
        }
        if req.resources.cpu.cores < 0.0 {
            return Err(ComputeError::InvalidInput("cpu cores must be non-negative".into()));
        }
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::ContainerEngine
    }

    fn supported_kinds(&self) -> Vec<InstanceKind> {
        vec![InstanceKind::Container]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::engine::EngineStats;
    use crate::mock::{InMemoryConnector, InMemoryEngine};
    use compute_common::{InstanceState, SecurityContext};

    fn driver() -> (ContainerDriver, Arc<InMemoryEngine>) {
        let engine = Arc::new(InMemoryEngine::new());
        let connector = Arc::new(InMemoryConnector::new(engine.clone()));
        let manager = ClientManager::new(ClientConfig::default(), connector).unwrap();
        (ContainerDriver::new(Arc::new(manager)), engine)
    }

    fn web_request() -> InstanceRequest {
        let mut req = InstanceRequest::new("web", InstanceKind::Container);
        req.config.image = "nginx:latest".into();
        req.resources.cpu.cores = 1.0;
        req.resources.memory.limit = 268_435_456;
        req.user_id = 7;
        req
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (driver, _) = driver();
        let instance = driver.create(&web_request()).await.unwrap();
        assert_eq!(instance.name, "web");
        assert_eq!(instance.state, InstanceState::Created);
        assert_eq!(instance.kind, InstanceKind::Container);
        assert_eq!(instance.backend, Backend::ContainerEngine);
        assert_eq!(instance.user_id, 7);
        assert_eq!(instance.resources.memory.limit, 268_435_456);

        let by_name = driver.get("web").await.unwrap();
        assert_eq!(by_name.id, instance.id);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let (driver, _) = driver();
        driver.create(&web_request()).await.unwrap();
        let err = driver.create(&web_request()).await.unwrap_err();
        assert!(matches!(err, ComputeError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let (driver, _) = driver();
        let id = driver.create(&web_request()).await.unwrap().id;

        driver.start(&id).await.unwrap();
        assert_eq!(driver.get(&id).await.unwrap().state, InstanceState::Running);
        // Already running is not an error.
        driver.start(&id).await.unwrap();

        driver.pause(&id).await.unwrap();
        assert_eq!(driver.get(&id).await.unwrap().state, InstanceState::Paused);
        assert!(matches!(
            driver.pause(&id).await,
            Err(ComputeError::InvalidState(_))
        ));
        driver.unpause(&id).await.unwrap();

        driver.stop(&id, false).await.unwrap();
        let stopped = driver.get(&id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.finished_at.is_some());
        driver.stop(&id, false).await.unwrap();

        driver.restart(&id, true).await.unwrap();
        assert_eq!(driver.get(&id).await.unwrap().state, InstanceState::Running);
        driver.stop(&id, true).await.unwrap();
        assert_eq!(driver.get(&id).await.unwrap().runtime.exit_code, Some(137));
    }

    #[tokio::test]
    async fn test_auto_start() {
        let (driver, _) = driver();
        let mut req = web_request();
        req.auto_start = true;
        let instance = driver.create(&req).await.unwrap();
        assert_eq!(instance.state, InstanceState::Running);
        assert!(instance.started_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_running_requires_force() {
        let (driver, engine) = driver();
        let id = driver.create(&web_request()).await.unwrap().id;
        driver.start(&id).await.unwrap();

        assert!(matches!(
            driver.delete(&id, false).await,
            Err(ComputeError::InvalidState(_))
        ));
        driver.delete(&id, true).await.unwrap();
        assert_eq!(engine.container_count(), 0);
        assert!(matches!(driver.get(&id).await, Err(ComputeError::NotFound(_))));
        assert!(matches!(
            driver.delete(&id, true).await,
            Err(ComputeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters_by_user_and_state() {
        let (driver, _) = driver();
        driver.create(&web_request()).await.unwrap();
        let mut other = web_request();
        other.name = "db".into();
        other.user_id = 8;
        other.auto_start = true;
        driver.create(&other).await.unwrap();

        let all = driver.list(&ListOptions::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let mine = driver
            .list(&ListOptions {
                user_id: Some(7),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].name, "web");

        let running = driver
            .list(&ListOptions {
                state: Some(InstanceState::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].name, "db");
    }

    #[tokio::test]
    async fn test_update_resources() {
        let (driver, _) = driver();
        let id = driver.create(&web_request()).await.unwrap().id;

        let mut resources = ComputeResources::default();
        resources.memory.limit = 536_870_912;
        resources.cpu.shares = Some(512);
        let updated = driver
            .update(
                &id,
                &InstanceUpdate {
                    resources: Some(resources),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.resources.memory.limit, 536_870_912);
        assert_eq!(updated.resources.cpu.shares, Some(512));
    }

    #[tokio::test]
    async fn test_resource_usage_from_stats() {
        let (driver, engine) = driver();
        let id = driver.create(&web_request()).await.unwrap().id;
        engine.set_stats(
            &id,
            EngineStats {
                cpu_total: 200,
                precpu_total: 100,
                system_cpu: 1_100,
                presystem_cpu: 100,
                online_cpus: 2,
                memory_usage: 64,
                memory_limit: 256,
                ..Default::default()
            },
        );
        let usage = driver.resource_usage(&id).await.unwrap();
        assert!((usage.cpu.usage_percent - 20.0).abs() < 1e-9);
        assert!((usage.memory.usage_percent - 25.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_validation() {
        let (driver, _) = driver();

        let mut req = web_request();
        req.config.image = String::new();
        assert!(matches!(
            driver.validate_config(&req).await,
            Err(ComputeError::InvalidInput(_))
        ));

        let mut req = web_request();
        req.config.security_context = Some(SecurityContext {
            run_as_user: Some(-1),
            ..Default::default()
        });
        assert!(driver.validate_config(&req).await.is_err());

        let mut req = web_request();
        req.kind = InstanceKind::Vm;
        assert!(driver.create(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_backend_info() {
        let (driver, _) = driver();
        let info = driver.backend_info().await.unwrap();
        assert_eq!(info.backend, Backend::ContainerEngine);
        assert_eq!(info.capabilities.len(), 4);
        assert_eq!(info.supported_kinds, vec![InstanceKind::Container]);
        assert_eq!(info.configuration["os_type"], "linux");
        assert_eq!(info.total_cpu.cores, 8.0);
    }

    #[tokio::test]
    async fn test_unreachable_engine_is_unavailable() {
        let (driver, engine) = driver();
        engine.set_healthy(false);
        let err = driver.get("web").await.unwrap_err();
        assert!(matches!(err, ComputeError::Unavailable(_)));
    }
}
