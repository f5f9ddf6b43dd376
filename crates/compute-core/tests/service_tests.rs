use async_trait::async_trait;
use compute_common::{
    Backend, ComputeError, EventFilter, EventType, InstanceKind, InstanceRequest, InstanceState,
    ListOptions, SnapshotParams,
};
use compute_core::export::{default_converters, ExportOptions};
use compute_core::{
    CallerContext, ComputeService, Converter, EventBus, ExportConfig, ExportError, ExportFormat,
    ExportJob, ExportManager, ExportParams, JobState,
};
use compute_docker::mock::{InMemoryConnector, InMemoryEngine};
use compute_docker::{ClientConfig, ClientManager, ContainerDriver};
use compute_hypervisor::{HypervisorDriver, InMemoryHypervisor};
use compute_quota::{InMemoryStorage, QuotaManager, ResourceQuotas, ResourceTracker};
use futures::StreamExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Stands in for qemu-img: writes the destination, then ticks until done or
/// canceled.
struct TickingConverter {
    ticks: u32,
}

#[async_trait]
impl Converter for TickingConverter {
    fn format_name(&self) -> &'static str {
        "qcow2"
    }

    fn validate_options(&self, _options: &ExportOptions) -> compute_core::export::Result<()> {
        Ok(())
    }

    async fn convert(
        &self,
        _source: &Path,
        dest: &Path,
        _options: &ExportOptions,
        cancel: &CancellationToken,
    ) -> compute_core::export::Result<()> {
        tokio::fs::write(dest, b"image").await?;
        for _ in 0..self.ticks {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExportError::Canceled),
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        Ok(())
    }
}

struct Harness {
    service: ComputeService,
    engine: Arc<InMemoryEngine>,
    _exports_dir: TempDir,
}

fn harness_with(quotas: Vec<ResourceQuotas>, ticks: u32) -> Harness {
    let engine = Arc::new(InMemoryEngine::new());
    let connector = Arc::new(InMemoryConnector::new(engine.clone()));
    let clients = ClientManager::new(ClientConfig::default(), connector).unwrap();
    let containers = Arc::new(ContainerDriver::new(Arc::new(clients)));
    let vms = Arc::new(HypervisorDriver::new(Arc::new(InMemoryHypervisor::new())));

    let exports_dir = tempfile::tempdir().unwrap();
    let mut converters = default_converters(None);
    converters.insert(ExportFormat::Qcow2, Arc::new(TickingConverter { ticks }));
    let exports = ExportManager::with_converters(
        ExportConfig {
            output_dir: exports_dir.path().to_path_buf(),
            ..Default::default()
        },
        vms.clone(),
        converters,
    );

    let tracker = Arc::new(ResourceTracker::new());
    let storage = Arc::new(InMemoryStorage::with_quotas(quotas));
    let quota_manager = Arc::new(QuotaManager::new(storage, tracker));
    let service = ComputeService::new(quota_manager, Arc::new(EventBus::new())).with_exports(exports);
    service.register_driver(containers).unwrap();
    service.register_driver(vms.clone()).unwrap();
    service
        .register_snapshot_driver(Backend::Hypervisor, vms)
        .unwrap();

    Harness {
        service,
        engine,
        _exports_dir: exports_dir,
    }
}

fn harness() -> Harness {
    harness_with(Vec::new(), 1)
}

fn web(name: &str) -> InstanceRequest {
    let mut req = InstanceRequest::new(name, InstanceKind::Container);
    req.backend = Some(Backend::ContainerEngine);
    req.config.image = "nginx:latest".into();
    req.resources.cpu.cores = 1.0;
    req.resources.memory.limit = 268_435_456;
    req
}

fn vm(name: &str) -> InstanceRequest {
    let mut req = InstanceRequest::new(name, InstanceKind::Vm);
    req.resources.cpu.cores = 2.0;
    req.resources.memory.limit = 1024 * 1024 * 1024;
    req
}

async fn wait_terminal(service: &ComputeService, ctx: &CallerContext, id: &str) -> ExportJob {
    for _ in 0..300 {
        let job = service.get_export_job(ctx, id).unwrap();
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("export job {id} did not finish");
}

#[tokio::test]
async fn test_create_container_emits_one_event() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let instance = h.service.create_instance(&ctx, web("web")).await.unwrap();

    assert_eq!(instance.name, "web");
    assert_eq!(instance.state, InstanceState::Created);
    assert_eq!(instance.kind, InstanceKind::Container);
    assert_eq!(instance.backend, Backend::ContainerEngine);
    assert_eq!(instance.user_id, 7);

    let events = h
        .service
        .instance_events(&ctx, &instance.id, &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, "create");
    assert_eq!(events[0].status, "success");
    assert!(h.service.tracker().get(&instance.id).await.is_some());
}

#[tokio::test]
async fn test_failed_start_on_create_is_recorded_on_the_container() {
    let h = harness();
    let ctx = CallerContext::user(7);
    h.engine.set_start_failure(true);

    let mut req = web("broken");
    req.auto_start = true;
    assert!(h.service.create_instance(&ctx, req).await.is_err());

    // The engine kept the container; its events carry the failure.
    h.engine.set_start_failure(false);
    let events = h
        .service
        .instance_events(&ctx, "broken", &EventFilter::default())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].action, "create");
    assert_eq!(events[0].status, "failure");
    assert!(events[0].message.contains("exec format error"));
}

#[tokio::test]
async fn test_quota_denies_disallowed_backend() {
    let mut quota = ResourceQuotas::default_for(7);
    quota.allowed_backends = vec![Backend::ContainerEngine];
    let h = harness_with(vec![quota], 1);
    let ctx = CallerContext::user(7);

    let mut req = web("web");
    req.backend = Some(Backend::Hypervisor);
    let err = h.service.create_instance(&ctx, req).await.unwrap_err();
    assert!(matches!(err, ComputeError::Forbidden(_)));
    assert!(h.service.events().is_empty());
    assert!(h.service.tracker().is_empty().await);
}

#[tokio::test]
async fn test_duplicate_name_and_default_name() {
    let h = harness();
    let ctx = CallerContext::user(7);
    h.service.create_instance(&ctx, web("web")).await.unwrap();
    assert!(matches!(
        h.service.create_instance(&ctx, web("web")).await,
        Err(ComputeError::AlreadyExists(_))
    ));

    let unnamed = h.service.create_instance(&ctx, web("")).await.unwrap();
    assert!(unnamed.name.starts_with("container-"));
    assert_eq!(unnamed.name.len(), "container-".len() + 8);
}

#[tokio::test]
async fn test_event_replay_is_newest_first() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let id = h.service.create_instance(&ctx, web("web")).await.unwrap().id;
    h.service.start_instance(&ctx, &id).await.unwrap();
    h.service.stop_instance(&ctx, &id, false).await.unwrap();

    let filter = EventFilter {
        limit: Some(3),
        ..Default::default()
    };
    let events = h.service.instance_events(&ctx, &id, &filter).await.unwrap();
    let actions: Vec<&str> = events.iter().map(|e| e.action.as_str()).collect();
    assert_eq!(actions, vec!["stop", "start", "create"]);

    let streamed: Vec<String> = h
        .service
        .subscribe_events(&ctx, &id, &filter)
        .await
        .unwrap()
        .into_stream()
        .map(|e| e.action)
        .collect()
        .await;
    assert_eq!(streamed, vec!["stop", "start", "create"]);
}

#[tokio::test]
async fn test_idempotent_start_and_stop() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let id = h.service.create_instance(&ctx, web("web")).await.unwrap().id;

    // Stopping a never-started instance is a no-op.
    h.service.stop_instance(&ctx, &id, false).await.unwrap();
    let running = h.service.start_instance(&ctx, &id).await.unwrap();
    assert_eq!(running.state, InstanceState::Running);
    h.service.start_instance(&ctx, &id).await.unwrap();
    assert_eq!(h.service.events().len(), 2);

    let paused = h.service.pause_instance(&ctx, &id).await.unwrap();
    assert_eq!(paused.state, InstanceState::Paused);
    let err = h.service.pause_instance(&ctx, &id).await.unwrap_err();
    assert!(matches!(err, ComputeError::InvalidState(_)));

    let history = h.service.events().history(&id, &EventFilter {
        types: vec![EventType::Error],
        ..Default::default()
    });
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].action, "pause");
    assert_eq!(history[0].status, "failure");
}

#[tokio::test]
async fn test_usage_quota_blocks_second_start() {
    let mut quota = ResourceQuotas::default_for(7);
    quota.max_cpu_cores = 2.0;
    let h = harness_with(vec![quota], 1);
    let ctx = CallerContext::user(7);

    let mut a = web("a");
    a.resources.cpu.cores = 1.5;
    let mut b = web("b");
    b.resources.cpu.cores = 1.5;
    let a = h.service.create_instance(&ctx, a).await.unwrap();
    let b = h.service.create_instance(&ctx, b).await.unwrap();

    h.service.start_instance(&ctx, &a.id).await.unwrap();
    let err = h.service.start_instance(&ctx, &b.id).await.unwrap_err();
    assert!(matches!(err, ComputeError::QuotaExceeded(_)));

    // Restarting the running one replaces its own allocation.
    h.service.restart_instance(&ctx, &a.id, false).await.unwrap();
    let allocated = h.service.tracker().total_allocated().await;
    assert_eq!(allocated.cpu_cores, 1.5);
}

#[tokio::test]
async fn test_list_scoping_and_paging() {
    let h = harness();
    let alice = CallerContext::user(7);
    let bob = CallerContext::user(8);
    for name in ["a", "b", "c"] {
        h.service.create_instance(&alice, web(name)).await.unwrap();
    }
    h.service.create_instance(&bob, web("d")).await.unwrap();

    let mine = h.service.list_instances(&alice, ListOptions::default()).await.unwrap();
    assert_eq!(mine.count, 3);
    assert!(mine.instances.iter().all(|i| i.user_id == 7));

    let admin = CallerContext::admin(1);
    let all = h.service.list_instances(&admin, ListOptions::default()).await.unwrap();
    assert_eq!(all.count, 4);
    assert!(all.errors.is_empty());
    assert!(all
        .instances
        .windows(2)
        .all(|w| w[0].created_at >= w[1].created_at));

    let page = h
        .service
        .list_instances(
            &admin,
            ListOptions {
                limit: Some(2),
                offset: Some(2),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.instances.len(), 2);
    assert_eq!(page.count, 4);

    let past_end = h
        .service
        .list_instances(
            &admin,
            ListOptions {
                limit: Some(1000),
                offset: Some(1000),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(past_end.instances.is_empty());
    assert_eq!(past_end.count, 4);

    // Bob cannot see Alice's instance at all.
    let first = &mine.instances[0];
    assert!(matches!(
        h.service.get_instance(&bob, &first.id).await,
        Err(ComputeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let id = h.service.create_instance(&ctx, web("web")).await.unwrap().id;
    h.service.delete_instance(&ctx, &id, false).await.unwrap();

    assert!(matches!(
        h.service.get_instance(&ctx, &id).await,
        Err(ComputeError::NotFound(_))
    ));
    assert!(h.service.tracker().get(&id).await.is_none());
}

#[tokio::test]
async fn test_vm_lifecycle_and_snapshot_forest() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let instance = h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();
    assert_eq!(instance.backend, Backend::Hypervisor);
    assert_eq!(instance.state, InstanceState::Stopped);

    let snapshot = |name: &str, parent: Option<&str>| SnapshotParams {
        name: name.to_string(),
        parent: parent.map(str::to_string),
        ..Default::default()
    };
    h.service.create_snapshot(&ctx, "test-vm", snapshot("s1", None)).await.unwrap();
    h.service.create_snapshot(&ctx, "test-vm", snapshot("s2", Some("s1"))).await.unwrap();
    h.service.create_snapshot(&ctx, "test-vm", snapshot("s3", Some("s1"))).await.unwrap();
    h.service.delete_snapshot(&ctx, "test-vm", "s1").await.unwrap();

    let snapshots = h.service.list_snapshots(&ctx, "test-vm").await.unwrap();
    assert_eq!(snapshots.len(), 2);
    assert!(snapshots.iter().all(|s| s.parent_id.is_none()));
    assert_eq!(h.service.snapshot_tree(&ctx, "test-vm").await.unwrap().len(), 2);

    assert!(matches!(
        h.service.get_snapshot(&ctx, "test-vm", "s1").await,
        Err(ComputeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_export_completes() {
    let h = harness();
    let ctx = CallerContext::user(7);
    h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();

    let job = h
        .service
        .export_instance(&ctx, "test-vm", ExportParams::new("qcow2"))
        .await
        .unwrap();
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.progress, 0);

    let done = wait_terminal(&h.service, &ctx, &job.id).await;
    assert_eq!(done.state, JobState::Completed);
    assert_eq!(done.progress, 100);
    assert!(!done.output_path.is_empty());
    assert_eq!(h.service.list_export_jobs(&ctx).unwrap().len(), 1);
    assert!(h.service.list_export_jobs(&CallerContext::user(8)).unwrap().is_empty());
}

#[tokio::test]
async fn test_export_progress_reaches_event_bus() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let instance = h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();

    let job = h
        .service
        .export_instance(&ctx, "test-vm", ExportParams::new("qcow2"))
        .await
        .unwrap();
    assert_eq!(job.instance_id, instance.id);
    wait_terminal(&h.service, &ctx, &job.id).await;

    let mut events = h
        .service
        .instance_events(&ctx, &instance.id, &EventFilter::default())
        .await
        .unwrap();
    events.reverse();
    let exports: Vec<(&str, Option<u64>)> = events
        .iter()
        .filter(|e| e.action == "export")
        .map(|e| (e.status.as_str(), e.details.get("progress").and_then(|p| p.as_u64())))
        .collect();
    assert_eq!(exports.first(), Some(&("pending", Some(0))));
    assert_eq!(exports.get(1), Some(&("running", Some(5))));
    assert_eq!(exports.last(), Some(&("completed", Some(100))));
    let checkpoints: Vec<u64> = exports
        .iter()
        .filter(|(status, _)| *status == "progress")
        .filter_map(|(_, progress)| *progress)
        .collect();
    assert_eq!(checkpoints, vec![10, 20, 30, 40]);
}

#[tokio::test]
async fn test_export_cancel() {
    let h = harness_with(Vec::new(), 1000);
    let ctx = CallerContext::user(7);
    h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();

    let job = h
        .service
        .export_instance(&ctx, "test-vm", ExportParams::new("qcow2"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.service.cancel_export_job(&ctx, &job.id).await.unwrap();

    let job = wait_terminal(&h.service, &ctx, &job.id).await;
    assert_eq!(job.state, JobState::Canceled);
    assert!(job.end_time.is_some());
    assert!(job.progress < 100);

    assert!(matches!(
        h.service.cancel_export_job(&ctx, &job.id).await,
        Err(ComputeError::InvalidState(_))
    ));
}

#[tokio::test]
async fn test_export_unsupported_format_creates_no_job() {
    let h = harness();
    let ctx = CallerContext::user(7);
    h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();
    assert!(matches!(
        h.service
            .export_instance(&ctx, "test-vm", ExportParams::new("vhdx"))
            .await,
        Err(ComputeError::Unsupported(_))
    ));
    assert!(h.service.list_export_jobs(&ctx).unwrap().is_empty());
}

#[tokio::test]
async fn test_migrate_is_unsupported() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let id = h.service.create_instance(&ctx, vm("test-vm")).await.unwrap().id;
    assert!(matches!(
        h.service.migrate_instance(&ctx, &id, "other-host").await,
        Err(ComputeError::Unsupported(_))
    ));
    assert!(matches!(
        h.service.migrate_instance(&ctx, "missing", "other-host").await,
        Err(ComputeError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_health_cluster_and_reconcile() {
    let h = harness();
    let ctx = CallerContext::user(7);
    let id = h.service.create_instance(&ctx, web("web")).await.unwrap().id;
    h.service.start_instance(&ctx, &id).await.unwrap();
    h.service.create_instance(&ctx, vm("test-vm")).await.unwrap();

    let health = h.service.health_check().await;
    assert_eq!(health.status, compute_common::HealthState::Healthy);
    assert_eq!(health.backends.len(), 2);

    let status = h.service.cluster_status(&ctx).await.unwrap();
    assert_eq!(status.total, 2);
    assert_eq!(status.running, 1);
    assert_eq!(status.stopped, 1);
    assert_eq!(status.allocated.cpu_cores, 1.0);
    assert_eq!(status.backends["container_engine"].running, 1);

    h.service.tracker().replace_all(Vec::new()).await;
    assert_eq!(h.service.reconcile().await.unwrap(), 2);
    assert_eq!(h.service.tracker().total_allocated().await.running, 1);
    assert_eq!(h.service.list_backends().await.len(), 2);
}

#[tokio::test]
async fn test_registry_and_quota_admin() {
    let h = harness();
    let duplicate = Arc::new(HypervisorDriver::new(Arc::new(InMemoryHypervisor::new())));
    assert!(matches!(
        h.service.register_driver(duplicate),
        Err(ComputeError::AlreadyExists(_))
    ));

    let user = CallerContext::user(7);
    let mut quota = ResourceQuotas::default_for(7);
    quota.max_instances = 1;
    assert!(matches!(
        h.service.set_quota(&user, 7, quota.clone()).await,
        Err(ComputeError::Forbidden(_))
    ));
    assert!(matches!(
        h.service.get_quota(&user, 8).await,
        Err(ComputeError::Forbidden(_))
    ));

    let admin = CallerContext::admin(1);
    h.service.set_quota(&admin, 7, quota).await.unwrap();
    h.service.create_instance(&user, web("one")).await.unwrap();
    assert!(matches!(
        h.service.create_instance(&user, web("two")).await,
        Err(ComputeError::QuotaExceeded(_))
    ));
    let report = h.service.get_quota(&user, 7).await.unwrap();
    assert_eq!(report.quota.max_instances, 1);
    assert_eq!(report.usage.instances, 1);
}
