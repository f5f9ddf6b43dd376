//! Exercises the bollard-backed engine against a real daemon when one is
//! reachable; skipped otherwise.

use compute_common::{ComputeDriver, InstanceKind, InstanceRequest, InstanceState};
use compute_docker::test_utils::docker_host;
use compute_docker::{require_docker, BollardConnector, ClientConfig, ClientManager, ContainerDriver};
use std::sync::Arc;

fn live_driver() -> ContainerDriver {
    let config = ClientConfig::default().with_host(docker_host());
    let manager = ClientManager::new(config, Arc::new(BollardConnector)).expect("valid config");
    ContainerDriver::new(Arc::new(manager))
}

#[tokio::test]
async fn test_live_ping_and_info() {
    require_docker!();
    let driver = live_driver();
    driver.clients().get().await.expect("engine reachable");
    let info = driver.backend_info().await.expect("backend info");
    assert!(!info.version.is_empty());
    assert!(info.total_cpu.cores >= 1.0);
}

#[tokio::test]
async fn test_live_container_lifecycle() {
    require_docker!();
    let driver = live_driver();

    let name = format!("compute-live-{}", uuid::Uuid::new_v4().simple());
    let mut req = InstanceRequest::new(name.clone(), InstanceKind::Container);
    req.config.image = "alpine:latest".into();
    req.config.command = vec!["sleep".into()];
    req.config.args = vec!["30".into()];

    let instance = driver.create(&req).await.expect("create");
    assert_eq!(instance.state, InstanceState::Created);

    driver.start(&instance.id).await.expect("start");
    assert_eq!(
        driver.get(&name).await.expect("get").state,
        InstanceState::Running
    );

    driver.stop(&instance.id, true).await.expect("stop");
    driver.delete(&instance.id, true).await.expect("delete");
    assert!(driver.get(&instance.id).await.is_err());
}
