//! The unified compute service: one façade over every registered backend
//! driver, with quota admission, usage tracking and lifecycle events.

use chrono::{DateTime, Utc};
use compute_common::{
    Backend, BackendInfo, ComputeDriver, ComputeError, ComputeResources, EventFilter, EventType,
    HealthState, HealthStatus, Instance, InstanceEvent, InstanceRequest, InstanceState,
    InstanceUpdate, ListOptions, ResourceUsage, Result, Snapshot, SnapshotDriver, SnapshotParams,
    SnapshotTree, USER_ID_LABEL,
};
use compute_quota::{
    Admission, Allocation, QuotaManager, ResourceQuotas, ResourceTracker, TrackedInstance,
    UserAllocation,
};
use dashmap::DashMap;
use futures::{future::join_all, stream, StreamExt};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

use crate::context::CallerContext;
use crate::event_bus::{EventBus, EventSubscription};
use crate::export::{ExportJob, ExportManager, ExportParams, JobOwner};

pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);
const LIST_CONCURRENCY: usize = 4;

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Per-driver budget for health checks.
    pub health_timeout: Duration,
    /// Drivers queried at once during fan-out.
    pub list_concurrency: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            health_timeout: HEALTH_TIMEOUT,
            list_concurrency: LIST_CONCURRENCY,
        }
    }
}

/// Result of a fan-out listing. `count` is the total before paging;
/// `errors` names the backends that could not be listed.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceList {
    pub instances: Vec<Instance>,
    pub count: usize,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BackendSummary {
    pub instances: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub allocated: Allocation,
}

impl BackendSummary {
    fn record(&mut self, instance: &Instance) {
        self.instances += 1;
        match instance.state {
            InstanceState::Running => {
                self.running += 1;
                self.allocated.running += 1;
                self.allocated.cpu_cores += instance.resources.cpu.cores;
                self.allocated.memory_bytes += instance.resources.memory.limit;
            }
            InstanceState::Stopped | InstanceState::Created => self.stopped += 1,
            InstanceState::Error => self.error += 1,
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterStatus {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub error: usize,
    pub allocated: Allocation,
    pub backends: HashMap<String, BackendSummary>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub status: HealthState,
    pub backends: HashMap<String, HealthStatus>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    pub quota: ResourceQuotas,
    pub usage: UserAllocation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Start,
    Stop { force: bool },
    Restart { force: bool },
    Pause,
    Unpause,
}

impl Lifecycle {
    fn action(&self) -> &'static str {
        match self {
            Lifecycle::Start => "start",
            Lifecycle::Stop { .. } => "stop",
            Lifecycle::Restart { .. } => "restart",
            Lifecycle::Pause => "pause",
            Lifecycle::Unpause => "unpause",
        }
    }

    fn target_state(&self) -> InstanceState {
        match self {
            Lifecycle::Start | Lifecycle::Restart { .. } | Lifecycle::Unpause => {
                InstanceState::Running
            }
            Lifecycle::Stop { .. } => InstanceState::Stopped,
            Lifecycle::Pause => InstanceState::Paused,
        }
    }

    /// Start of a running instance and stop of a stopped one succeed
    /// without touching the driver.
    fn is_noop_for(&self, state: InstanceState) -> bool {
        match self {
            Lifecycle::Start => state == InstanceState::Running,
            Lifecycle::Stop { .. } => {
                matches!(state, InstanceState::Stopped | InstanceState::Created)
            }
            _ => false,
        }
    }

    fn needs_admission(&self) -> bool {
        matches!(self, Lifecycle::Start | Lifecycle::Restart { .. })
    }
}

pub struct ComputeService {
    drivers: DashMap<Backend, Arc<dyn ComputeDriver>>,
    snapshot_drivers: DashMap<Backend, Arc<dyn SnapshotDriver>>,
    quotas: Arc<QuotaManager>,
    tracker: Arc<ResourceTracker>,
    events: Arc<EventBus>,
    exports: Option<ExportManager>,
    config: ServiceConfig,
}

impl ComputeService {
    pub fn new(quotas: Arc<QuotaManager>, events: Arc<EventBus>) -> Self {
        Self {
            drivers: DashMap::new(),
            snapshot_drivers: DashMap::new(),
            tracker: quotas.tracker().clone(),
            quotas,
            events,
            exports: None,
            config: ServiceConfig::default(),
        }
    }

    /// Export progress is published on this service's event bus.
    pub fn with_exports(mut self, exports: ExportManager) -> Self {
        if !exports.attach_events(self.events.clone()) {
            warn!("Export manager already publishes to another event bus");
        }
        self.exports = Some(exports);
        self
    }

    pub fn with_config(mut self, config: ServiceConfig) -> Self {
        self.config = config;
        self
    }

    pub fn register_driver(&self, driver: Arc<dyn ComputeDriver>) -> Result<()> {
        let backend = driver.backend();
        match self.drivers.entry(backend) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ComputeError::AlreadyExists(
                format!("backend {backend} is already registered"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(driver);
                info!(backend = %backend, "Registered compute backend");
                Ok(())
            }
        }
    }

    pub fn register_snapshot_driver(
        &self,
        backend: Backend,
        driver: Arc<dyn SnapshotDriver>,
    ) -> Result<()> {
        match self.snapshot_drivers.entry(backend) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ComputeError::AlreadyExists(
                format!("snapshot driver for {backend} is already registered"),
            )),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(driver);
                Ok(())
            }
        }
    }

    /// Registered backends in canonical order.
    pub fn backends(&self) -> Vec<Backend> {
        Backend::ALL
            .into_iter()
            .filter(|b| self.drivers.contains_key(b))
            .collect()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    pub fn quotas(&self) -> &Arc<QuotaManager> {
        &self.quotas
    }

    fn driver(&self, backend: Backend) -> Result<Arc<dyn ComputeDriver>> {
        self.drivers
            .get(&backend)
            .map(|d| d.value().clone())
            .ok_or_else(|| ComputeError::Unsupported(format!("backend {backend} is not enabled")))
    }

    fn all_drivers(&self) -> Vec<Arc<dyn ComputeDriver>> {
        self.backends()
            .into_iter()
            .filter_map(|b| self.drivers.get(&b).map(|d| d.value().clone()))
            .collect()
    }

    fn snapshot_driver(&self, backend: Backend) -> Result<Arc<dyn SnapshotDriver>> {
        self.snapshot_drivers
            .get(&backend)
            .map(|d| d.value().clone())
            .ok_or_else(|| {
                ComputeError::Unsupported(format!("snapshots are not supported on {backend}"))
            })
    }

    fn export_manager(&self) -> Result<&ExportManager> {
        self.exports
            .as_ref()
            .ok_or_else(|| ComputeError::Unsupported("export is not enabled".to_string()))
    }

    fn emit(&self, ctx: &CallerContext, instance_id: &str, event_type: EventType, action: &str) {
        self.events.publish(
            InstanceEvent::new(instance_id, event_type, action, "success").with_user(ctx.actor()),
        );
    }

    fn emit_failure(&self, ctx: &CallerContext, instance_id: &str, action: &str, err: &ComputeError) {
        self.events.publish(
            InstanceEvent::new(instance_id, EventType::Error, action, "failure")
                .with_user(ctx.actor())
                .with_message(err.to_string()),
        );
    }

    /// Locate an instance on any backend. Instances the caller may not see
    /// are reported as missing.
    async fn find(
        &self,
        ctx: &CallerContext,
        id: &str,
    ) -> Result<(Instance, Arc<dyn ComputeDriver>)> {
        let mut failure = None;
        for driver in self.all_drivers() {
            match driver.get(id).await {
                Ok(instance) if ctx.can_access(instance.user_id) => return Ok((instance, driver)),
                Ok(_) | Err(ComputeError::NotFound(_)) => {}
                Err(e) => {
                    warn!(backend = %driver.backend(), error = %e, "Lookup failed");
                    failure.get_or_insert(e);
                }
            }
        }
        Err(failure.unwrap_or_else(|| ComputeError::not_found("instance", id)))
    }

    /// A VM on the hypervisor backend, by name or id.
    async fn find_vm(&self, ctx: &CallerContext, name: &str) -> Result<Instance> {
        let instance = self.driver(Backend::Hypervisor)?.get(name).await?;
        if !ctx.can_access(instance.user_id) {
            return Err(ComputeError::not_found("vm", name));
        }
        Ok(instance)
    }

    async fn admit(&self, admission: &Admission) -> Result<()> {
        Ok(self.quotas.check(admission).await?)
    }

    #[instrument(skip(self, ctx, req), fields(user_id = ctx.user_id, kind = %req.kind, name = %req.name))]
    pub async fn create_instance(
        &self,
        ctx: &CallerContext,
        mut req: InstanceRequest,
    ) -> Result<Instance> {
        let backend = req.target_backend();
        req.backend = Some(backend);
        req.user_id = ctx.user_id;

        // Quota first: a denied request must not reach a driver.
        self.admit(&Admission::create(&req)).await?;

        if backend != req.kind.default_backend() {
            return Err(ComputeError::InvalidInput(format!(
                "backend {backend} cannot host {} instances",
                req.kind
            )));
        }
        let driver = self.driver(backend)?;
        if !driver.supported_kinds().contains(&req.kind) {
            return Err(ComputeError::Unsupported(format!(
                "backend {backend} does not support {} instances",
                req.kind
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        if req.name.trim().is_empty() {
            req.name = format!("{}-{}", req.kind, &id[..8]);
        }
        req.id = Some(id.clone());
        req.labels
            .insert(USER_ID_LABEL.to_string(), ctx.user_id.to_string());

        driver.validate_config(&req).await?;
        match driver.get(&req.name).await {
            Ok(_) => {
                return Err(ComputeError::AlreadyExists(format!(
                    "instance {} already exists on {backend}",
                    req.name
                )))
            }
            Err(ComputeError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let instance = match driver.create(&req).await {
            Ok(instance) => instance,
            Err(e) => {
                // A container whose start failed is still there; record the
                // failure under its id.
                let key = match driver.get(&req.name).await {
                    Ok(leftover) => leftover.id,
                    Err(_) => id,
                };
                self.emit_failure(ctx, &key, "create", &e);
                return Err(e);
            }
        };
        self.tracker.add(TrackedInstance::from(&instance)).await;
        self.emit(ctx, &instance.id, EventType::Lifecycle, "create");
        info!(instance_id = %instance.id, backend = %backend, "Instance created");
        Ok(instance)
    }

    pub async fn get_instance(&self, ctx: &CallerContext, id: &str) -> Result<Instance> {
        Ok(self.find(ctx, id).await?.0)
    }

    pub async fn get_instance_by_name(
        &self,
        ctx: &CallerContext,
        backend: Backend,
        name: &str,
    ) -> Result<Instance> {
        let instance = self.driver(backend)?.get(name).await?;
        if !ctx.can_access(instance.user_id) {
            return Err(ComputeError::not_found("instance", name));
        }
        Ok(instance)
    }

    /// Query every matching backend in parallel and merge. Fails only when
    /// every queried backend fails.
    #[instrument(skip(self, ctx, opts), fields(user_id = ctx.user_id))]
    pub async fn list_instances(
        &self,
        ctx: &CallerContext,
        mut opts: ListOptions,
    ) -> Result<InstanceList> {
        if !ctx.is_admin() {
            opts.user_id = Some(ctx.user_id);
        }
        let offset = opts.offset.take().unwrap_or(0);
        let limit = opts.limit.take().unwrap_or(usize::MAX);

        let drivers = match opts.backend {
            Some(backend) => vec![self.driver(backend)?],
            None => self.all_drivers(),
        };
        let queried = drivers.len();
        let query = &opts;
        let queries: Vec<_> = drivers
            .into_iter()
            .map(|driver| async move { (driver.backend(), driver.list(query).await) })
            .collect();
        let results: Vec<(Backend, Result<Vec<Instance>>)> = stream::iter(queries)
            .buffer_unordered(self.config.list_concurrency.max(1))
            .collect()
            .await;

        let mut seen = HashSet::new();
        let mut instances = Vec::new();
        let mut errors = HashMap::new();
        let mut failure = None;
        for (backend, result) in results {
            match result {
                Ok(list) => instances.extend(
                    list.into_iter()
                        .filter(|i| query.matches(i))
                        .filter(|i| seen.insert(i.id.clone())),
                ),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Listing failed");
                    errors.insert(backend.to_string(), e.to_string());
                    failure.get_or_insert(e);
                }
            }
        }
        if queried > 0 && errors.len() == queried {
            if let Some(e) = failure {
                return Err(e);
            }
        }

        instances.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        let count = instances.len();
        let instances = instances.into_iter().skip(offset).take(limit).collect();
        Ok(InstanceList {
            instances,
            count,
            errors,
        })
    }

    #[instrument(skip(self, ctx, update), fields(user_id = ctx.user_id))]
    pub async fn update_instance(
        &self,
        ctx: &CallerContext,
        id: &str,
        mut update: InstanceUpdate,
    ) -> Result<Instance> {
        let (instance, driver) = self.find(ctx, id).await?;
        if let Some(resources) = &update.resources {
            if instance.state == InstanceState::Running {
                self.admit(&Admission::resize(
                    &instance,
                    resources.cpu.cores,
                    resources.memory.limit,
                ))
                .await?;
            }
        }
        if let Some(labels) = update.labels.as_mut() {
            labels.insert(USER_ID_LABEL.to_string(), instance.user_id.to_string());
        }

        let updated = match driver.update(&instance.id, &update).await {
            Ok(updated) => updated,
            Err(e) => {
                self.emit_failure(ctx, &instance.id, "update", &e);
                return Err(e);
            }
        };
        self.tracker.add(TrackedInstance::from(&updated)).await;
        self.emit(ctx, &updated.id, EventType::Lifecycle, "update");
        Ok(updated)
    }

    #[instrument(skip(self, ctx), fields(user_id = ctx.user_id))]
    pub async fn delete_instance(&self, ctx: &CallerContext, id: &str, force: bool) -> Result<()> {
        let (instance, driver) = self.find(ctx, id).await?;
        if let Err(e) = driver.delete(&instance.id, force).await {
            self.emit_failure(ctx, &instance.id, "delete", &e);
            return Err(e);
        }
        self.tracker.remove(&instance.id).await;
        self.emit(ctx, &instance.id, EventType::Lifecycle, "delete");
        info!(instance_id = %instance.id, "Instance deleted");
        Ok(())
    }

    pub async fn start_instance(&self, ctx: &CallerContext, id: &str) -> Result<Instance> {
        self.transition(ctx, id, Lifecycle::Start).await
    }

    pub async fn stop_instance(&self, ctx: &CallerContext, id: &str, force: bool) -> Result<Instance> {
        self.transition(ctx, id, Lifecycle::Stop { force }).await
    }

    pub async fn restart_instance(
        &self,
        ctx: &CallerContext,
        id: &str,
        force: bool,
    ) -> Result<Instance> {
        self.transition(ctx, id, Lifecycle::Restart { force }).await
    }

    pub async fn pause_instance(&self, ctx: &CallerContext, id: &str) -> Result<Instance> {
        self.transition(ctx, id, Lifecycle::Pause).await
    }

    pub async fn unpause_instance(&self, ctx: &CallerContext, id: &str) -> Result<Instance> {
        self.transition(ctx, id, Lifecycle::Unpause).await
    }

    #[instrument(skip(self, ctx), fields(user_id = ctx.user_id, action = op.action()))]
    async fn transition(&self, ctx: &CallerContext, id: &str, op: Lifecycle) -> Result<Instance> {
        let (instance, driver) = self.find(ctx, id).await?;
        if op.is_noop_for(instance.state) {
            return Ok(instance);
        }
        if op.needs_admission() {
            self.admit(&Admission::start(&instance)).await?;
        }

        let result = match op {
            Lifecycle::Start => driver.start(&instance.id).await,
            Lifecycle::Stop { force } => driver.stop(&instance.id, force).await,
            Lifecycle::Restart { force } => driver.restart(&instance.id, force).await,
            Lifecycle::Pause => driver.pause(&instance.id).await,
            Lifecycle::Unpause => driver.unpause(&instance.id).await,
        };
        if let Err(e) = result {
            self.emit_failure(ctx, &instance.id, op.action(), &e);
            return Err(e);
        }

        let lookup = driver.get(&instance.id).await;
        let refreshed = match lookup {
            Ok(refreshed) => refreshed,
            Err(e) => {
                warn!(instance_id = %instance.id, error = %e, "Refresh after transition failed");
                Instance {
                    state: op.target_state(),
                    ..instance
                }
            }
        };
        self.tracker.add(TrackedInstance::from(&refreshed)).await;
        self.emit(ctx, &refreshed.id, EventType::Lifecycle, op.action());
        Ok(refreshed)
    }

    pub async fn resource_usage(&self, ctx: &CallerContext, id: &str) -> Result<ResourceUsage> {
        let (instance, driver) = self.find(ctx, id).await?;
        driver.resource_usage(&instance.id).await
    }

    #[instrument(skip(self, ctx, resources), fields(user_id = ctx.user_id))]
    pub async fn update_resource_limits(
        &self,
        ctx: &CallerContext,
        id: &str,
        resources: ComputeResources,
    ) -> Result<Instance> {
        let (instance, driver) = self.find(ctx, id).await?;
        if instance.state == InstanceState::Running {
            self.admit(&Admission::resize(
                &instance,
                resources.cpu.cores,
                resources.memory.limit,
            ))
            .await?;
        }
        if let Err(e) = driver.update_resource_limits(&instance.id, &resources).await {
            self.emit_failure(ctx, &instance.id, "update_resources", &e);
            return Err(e);
        }
        self.tracker
            .update_resources(&instance.id, resources.cpu.cores, resources.memory.limit)
            .await;
        self.emit(ctx, &instance.id, EventType::Resource, "update_resources");
        driver.get(&instance.id).await
    }

    pub async fn backend_info(&self, backend: Backend) -> Result<BackendInfo> {
        self.driver(backend)?.backend_info().await
    }

    /// Info for every backend that answers within the health budget.
    pub async fn list_backends(&self) -> Vec<BackendInfo> {
        let budget = self.config.health_timeout;
        let checks = self.all_drivers().into_iter().map(|driver| async move {
            match tokio::time::timeout(budget, driver.backend_info()).await {
                Ok(Ok(info)) => Some(info),
                Ok(Err(e)) => {
                    warn!(backend = %driver.backend(), error = %e, "Backend info failed");
                    None
                }
                Err(_) => {
                    warn!(backend = %driver.backend(), "Backend info timed out");
                    None
                }
            }
        });
        join_all(checks).await.into_iter().flatten().collect()
    }

    /// Probe every backend in parallel; the overall status is the worst one.
    pub async fn health_check(&self) -> ServiceHealth {
        let budget = self.config.health_timeout;
        let checks = self.all_drivers().into_iter().map(|driver| async move {
            let status = match tokio::time::timeout(budget, driver.backend_info()).await {
                Ok(Ok(info)) => info.health,
                Ok(Err(e)) => HealthStatus::unhealthy(e.to_string()),
                Err(_) => HealthStatus::unhealthy("health check timed out"),
            };
            (driver.backend(), status)
        });
        let results = join_all(checks).await;

        let status = results
            .iter()
            .map(|(_, s)| s.status)
            .max()
            .unwrap_or(HealthState::Unhealthy);
        ServiceHealth {
            status,
            backends: results
                .into_iter()
                .map(|(backend, s)| (backend.to_string(), s))
                .collect(),
            checked_at: Utc::now(),
        }
    }

    pub async fn cluster_status(&self, ctx: &CallerContext) -> Result<ClusterStatus> {
        let list = self.list_instances(ctx, ListOptions::default()).await?;
        let mut backends: HashMap<String, BackendSummary> = self
            .backends()
            .into_iter()
            .map(|b| (b.to_string(), BackendSummary::default()))
            .collect();
        let mut overall = BackendSummary::default();
        for instance in &list.instances {
            overall.record(instance);
            backends
                .entry(instance.backend.to_string())
                .or_default()
                .record(instance);
        }
        Ok(ClusterStatus {
            total: overall.instances,
            running: overall.running,
            stopped: overall.stopped,
            error: overall.error,
            allocated: overall.allocated,
            backends,
            errors: list.errors,
            updated_at: Utc::now(),
        })
    }

    /// Rebuild the tracker from what the drivers report. When a backend
    /// cannot be listed its existing records are kept.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<usize> {
        let opts = ListOptions::default();
        let results = join_all(
            self.all_drivers()
                .into_iter()
                .map(|d| {
                    let opts = &opts;
                    async move { (d.backend(), d.list(opts).await) }
                }),
        )
        .await;

        let mut records = Vec::new();
        let mut complete = true;
        for (backend, result) in results {
            match result {
                Ok(list) => records.extend(list.iter().map(TrackedInstance::from)),
                Err(e) => {
                    warn!(backend = %backend, error = %e, "Reconcile skipped backend");
                    complete = false;
                }
            }
        }
        let count = records.len();
        if complete {
            self.tracker.replace_all(records).await;
        } else {
            for record in records {
                self.tracker.add(record).await;
            }
        }
        info!(count, "Resource tracker reconciled");
        Ok(count)
    }

    pub async fn instance_events(
        &self,
        ctx: &CallerContext,
        id: &str,
        filter: &EventFilter,
    ) -> Result<Vec<InstanceEvent>> {
        let (instance, _) = self.find(ctx, id).await?;
        Ok(self.events.history(&instance.id, filter))
    }

    pub async fn subscribe_events(
        &self,
        ctx: &CallerContext,
        id: &str,
        filter: &EventFilter,
    ) -> Result<EventSubscription> {
        let (instance, _) = self.find(ctx, id).await?;
        Ok(self.events.subscribe(&instance.id, filter))
    }

    #[instrument(skip(self, ctx, params), fields(user_id = ctx.user_id, snapshot = %params.name))]
    pub async fn create_snapshot(
        &self,
        ctx: &CallerContext,
        vm: &str,
        params: SnapshotParams,
    ) -> Result<Snapshot> {
        let instance = self.find_vm(ctx, vm).await?;
        let driver = self.snapshot_driver(instance.backend)?;
        match driver.create_snapshot(&instance.id, &params).await {
            Ok(snapshot) => {
                self.events.publish(
                    InstanceEvent::new(&instance.id, EventType::Info, "snapshot_create", "success")
                        .with_user(ctx.actor())
                        .with_detail("snapshot", snapshot.name.clone()),
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.emit_failure(ctx, &instance.id, "snapshot_create", &e);
                Err(e)
            }
        }
    }

    pub async fn list_snapshots(&self, ctx: &CallerContext, vm: &str) -> Result<Vec<Snapshot>> {
        let instance = self.find_vm(ctx, vm).await?;
        self.snapshot_driver(instance.backend)?
            .list_snapshots(&instance.id)
            .await
    }

    pub async fn snapshot_tree(&self, ctx: &CallerContext, vm: &str) -> Result<Vec<SnapshotTree>> {
        let instance = self.find_vm(ctx, vm).await?;
        self.snapshot_driver(instance.backend)?
            .snapshot_tree(&instance.id)
            .await
    }

    pub async fn get_snapshot(
        &self,
        ctx: &CallerContext,
        vm: &str,
        snapshot: &str,
    ) -> Result<Snapshot> {
        let instance = self.find_vm(ctx, vm).await?;
        self.snapshot_driver(instance.backend)?
            .get_snapshot(&instance.id, snapshot)
            .await
    }

    pub async fn delete_snapshot(&self, ctx: &CallerContext, vm: &str, snapshot: &str) -> Result<()> {
        let instance = self.find_vm(ctx, vm).await?;
        self.snapshot_driver(instance.backend)?
            .delete_snapshot(&instance.id, snapshot)
            .await?;
        self.events.publish(
            InstanceEvent::new(&instance.id, EventType::Info, "snapshot_delete", "success")
                .with_user(ctx.actor())
                .with_detail("snapshot", snapshot),
        );
        Ok(())
    }

    pub async fn revert_snapshot(&self, ctx: &CallerContext, vm: &str, snapshot: &str) -> Result<()> {
        let instance = self.find_vm(ctx, vm).await?;
        let driver = self.snapshot_driver(instance.backend)?;
        if let Err(e) = driver.revert_snapshot(&instance.id, snapshot).await {
            self.emit_failure(ctx, &instance.id, "snapshot_revert", &e);
            return Err(e);
        }
        self.events.publish(
            InstanceEvent::new(&instance.id, EventType::Lifecycle, "snapshot_revert", "success")
                .with_user(ctx.actor())
                .with_detail("snapshot", snapshot),
        );
        Ok(())
    }

    /// Queue a disk export. The format is checked before anything else so an
    /// unsupported one never creates a job.
    #[instrument(skip(self, ctx, params), fields(user_id = ctx.user_id, format = %params.format))]
    pub async fn export_instance(
        &self,
        ctx: &CallerContext,
        vm: &str,
        params: ExportParams,
    ) -> Result<ExportJob> {
        let exports = self.export_manager()?;
        exports.resolve_format(&params.format)?;
        let instance = self.find_vm(ctx, vm).await?;
        let owner = JobOwner {
            user_id: ctx.user_id,
            actor: ctx.actor(),
            instance_id: Some(instance.id.clone()),
        };
        Ok(exports.create_job(&instance.name, &params, owner).await?)
    }

    pub fn get_export_job(&self, ctx: &CallerContext, job_id: &str) -> Result<ExportJob> {
        let job = self.export_manager()?.get_job(job_id)?;
        if !ctx.can_access(job.user_id) {
            return Err(ComputeError::not_found("export job", job_id));
        }
        Ok(job)
    }

    pub fn list_export_jobs(&self, ctx: &CallerContext) -> Result<Vec<ExportJob>> {
        Ok(self
            .export_manager()?
            .list_jobs()
            .into_iter()
            .filter(|job| ctx.can_access(job.user_id))
            .collect())
    }

    pub async fn cancel_export_job(&self, ctx: &CallerContext, job_id: &str) -> Result<ExportJob> {
        self.get_export_job(ctx, job_id)?;
        Ok(self.export_manager()?.cancel_job(job_id).await?)
    }

    /// Live migration needs a second host; this control plane has one.
    pub async fn migrate_instance(
        &self,
        ctx: &CallerContext,
        id: &str,
        target_host: &str,
    ) -> Result<Instance> {
        let (instance, _) = self.find(ctx, id).await?;
        warn!(instance_id = %instance.id, target_host, "Migration requested");
        Err(ComputeError::Unsupported(
            "migration is not supported on a single-host control plane".to_string(),
        ))
    }

    pub async fn get_quota(&self, ctx: &CallerContext, user_id: u64) -> Result<QuotaReport> {
        if !ctx.can_access(user_id) {
            return Err(ComputeError::Forbidden(
                "quotas of other users require the admin role".to_string(),
            ));
        }
        Ok(QuotaReport {
            quota: self.quotas.get_quota(user_id).await?,
            usage: self.tracker.user_allocation(user_id, None).await,
        })
    }

    pub async fn set_quota(
        &self,
        ctx: &CallerContext,
        user_id: u64,
        mut quota: ResourceQuotas,
    ) -> Result<ResourceQuotas> {
        if !ctx.is_admin() {
            return Err(ComputeError::Forbidden(
                "setting quotas requires the admin role".to_string(),
            ));
        }
        quota.user_id = user_id;
        let saved = self.quotas.set_quota(quota).await?;
        info!(user_id, admin = %ctx.actor(), "Quota updated");
        Ok(saved)
    }
}
