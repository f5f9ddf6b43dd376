use crate::auth::hash_password;
use crate::config::{AuthConfig, UserEntry};
use crate::{create_app, AppState, TokenAuthority};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use compute_common::Backend;
use compute_core::export::{default_converters, ExportOptions};
use compute_core::{ComputeService, Converter, EventBus, ExportConfig, ExportError, ExportFormat, ExportManager};
use compute_docker::mock::{InMemoryConnector, InMemoryEngine};
use compute_docker::{ClientConfig, ClientManager, ContainerDriver};
use compute_hypervisor::{HypervisorDriver, InMemoryHypervisor};
use compute_quota::{InMemoryStorage, QuotaManager, ResourceQuotas, ResourceTracker};
use futures::StreamExt;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

/// Writes the destination and then waits `ticks` x 10ms, honouring cancel.
struct SlowConverter {
    ticks: u32,
}

#[async_trait]
impl Converter for SlowConverter {
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

struct TestGateway {
    app: Router,
    events: Arc<EventBus>,
    _exports_dir: TempDir,
}

fn gateway(quotas: Vec<ResourceQuotas>, ticks: u32) -> TestGateway {
    let engine = Arc::new(InMemoryEngine::new());
    let clients = ClientManager::new(ClientConfig::default(), Arc::new(InMemoryConnector::new(engine))).unwrap();
    let containers = Arc::new(ContainerDriver::new(Arc::new(clients)));
    let vms = Arc::new(HypervisorDriver::new(Arc::new(InMemoryHypervisor::new())));

    let exports_dir = tempfile::tempdir().unwrap();
    let mut converters = default_converters(None);
    converters.insert(ExportFormat::Qcow2, Arc::new(SlowConverter { ticks }));
    let exports = ExportManager::with_converters(
        ExportConfig {
            output_dir: exports_dir.path().to_path_buf(),
            ..Default::default()
        },
        vms.clone(),
        converters,
    );

    let storage = Arc::new(InMemoryStorage::with_quotas(quotas));
    let quota_manager = Arc::new(QuotaManager::new(storage, Arc::new(ResourceTracker::new())));
    let events = Arc::new(EventBus::new());
    let service = ComputeService::new(quota_manager, events.clone()).with_exports(exports);
    service.register_driver(containers).unwrap();
    service.register_driver(vms.clone()).unwrap();
    service.register_snapshot_driver(Backend::Hypervisor, vms).unwrap();

    let auth = TokenAuthority::new(&AuthConfig {
        secret_key: "gateway-test-signing-key".to_string(),
        default_users: vec![
            UserEntry {
                username: "alice".to_string(),
                password_sha256: hash_password("alice-pw"),
                user_id: 7,
                roles: vec!["user".to_string()],
            },
            UserEntry {
                username: "root".to_string(),
                password_sha256: hash_password("root-pw"),
                user_id: 1,
                roles: vec!["admin".to_string()],
            },
        ],
        ..Default::default()
    })
    .unwrap();

    TestGateway {
        app: create_app(AppState::new(Arc::new(service), Arc::new(auth))),
        events,
        _exports_dir: exports_dir,
    }
}

async fn send(app: &Router, method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "username": username, "password": password })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().unwrap().to_string()
}

fn web_request() -> Value {
    json!({
        "name": "web",
        "kind": "container",
        "backend": "container_engine",
        "config": { "image": "nginx:latest" },
        "resources": { "cpu": { "cores": 1 }, "memory": { "limit": 268435456u64 } }
    })
}

fn vm_request(name: &str) -> Value {
    json!({
        "name": name,
        "kind": "vm",
        "resources": { "cpu": { "cores": 2 }, "memory": { "limit": 1073741824u64 } }
    })
}

async fn poll_job(app: &Router, token: &str, id: &str) -> Value {
    for _ in 0..300 {
        let (status, body) = send(app, "GET", &format!("/exports/{id}"), Some(token), None).await;
        assert_eq!(status, StatusCode::OK);
        let state = body["job"]["state"].as_str().unwrap().to_string();
        if matches!(state.as_str(), "completed" | "failed" | "canceled") {
            return body["job"].clone();
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("export job {id} did not finish");
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = gateway(Vec::new(), 1);
    let (status, body) = send(&gw.app, "GET", "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert!(body["backends"]["hypervisor"].is_object());
    assert!(body["backends"]["container_engine"].is_object());
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    let (_, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    let id = body["instance"]["id"].as_str().unwrap().to_string();
    send(&gw.app, "POST", &format!("/compute/instances/{id}/start"), Some(&token), None).await;

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()["content-type"]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    assert!(text.contains("# TYPE compute_instances gauge"));
    assert!(text.contains(r#"compute_instances{backend="container_engine",state="running"} 1"#));
    assert!(text.contains(r#"compute_instances{backend="hypervisor",state="running"} 0"#));
    assert!(text.contains(r#"compute_events_total{action="create",type="lifecycle"} 1"#));
    assert!(text.contains(r#"compute_events_total{action="start",type="lifecycle"} 1"#));
    assert!(text.contains(r#"compute_export_jobs{state="pending"} 0"#));
}

#[tokio::test]
async fn test_requests_without_token_are_rejected() {
    let gw = gateway(Vec::new(), 1);
    let (status, body) = send(&gw.app, "GET", "/compute/instances", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["status"], 401);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = send(&gw.app, "GET", "/compute/instances", Some("not.a-token"), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &gw.app,
        "POST",
        "/auth/login",
        None,
        Some(json!({ "username": "alice", "password": "wrong" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_create_container() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;

    let (status, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    assert_eq!(status, StatusCode::CREATED);
    let instance = &body["instance"];
    assert_eq!(instance["name"], "web");
    assert_eq!(instance["state"], "created");
    assert_eq!(instance["kind"], "container");
    assert_eq!(instance["backend"], "container_engine");

    let id = instance["id"].as_str().unwrap();
    let (status, body) = send(&gw.app, "GET", &format!("/compute/instances/{id}/events"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["events"][0]["action"], "create");
    assert_eq!(body["events"][0]["status"], "success");

    let (status, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RESOURCE_CONFLICT");

    let (status, body) = send(
        &gw.app,
        "GET",
        "/compute/instances/by-name/container_engine/web",
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["id"], id);
}

#[tokio::test]
async fn test_quota_denies_backend() {
    let mut quota = ResourceQuotas::default_for(7);
    quota.allowed_backends = vec![Backend::ContainerEngine];
    let gw = gateway(vec![quota], 1);
    let token = login(&gw.app, "alice", "alice-pw").await;

    let mut request = web_request();
    request["backend"] = json!("hypervisor");
    let (status, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(request)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
    assert!(gw.events.is_empty());
}

#[tokio::test]
async fn test_invalid_vm_request() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;

    let mut request = vm_request("tiny");
    request["resources"]["memory"]["limit"] = json!(64 * 1024 * 1024);
    let (status, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");

    let (status, body) = send(&gw.app, "GET", "/compute/instances?state=sleeping", Some(&token), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_event_replay_newest_first() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;

    let (_, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    let id = body["instance"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&gw.app, "POST", &format!("/compute/instances/{id}/start"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["state"], "running");
    let (status, _) = send(&gw.app, "POST", &format!("/compute/instances/{id}/start"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&gw.app, "POST", &format!("/compute/instances/{id}/stop"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["instance"]["state"], "stopped");

    let (status, body) = send(
        &gw.app,
        "GET",
        &format!("/compute/instances/{id}/events?limit=3"),
        Some(&token),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let actions: Vec<&str> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert_eq!(actions, vec!["stop", "start", "create"]);

    let (status, _) = send(&gw.app, "POST", &format!("/compute/instances/{id}/pause"), Some(&token), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_follow_streams_ndjson() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    let (_, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    let id = body["instance"]["id"].as_str().unwrap().to_string();

    let request = Request::builder()
        .uri(format!("/compute/instances/{id}/events?follow=true"))
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    let response = gw.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "application/x-ndjson");

    let mut body = response.into_body().into_data_stream();
    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let line = std::str::from_utf8(&first).unwrap().lines().next().unwrap().to_string();
    let event: Value = serde_json::from_str(&line).unwrap();
    assert_eq!(event["action"], "create");

    let (status, _) = send(&gw.app, "POST", &format!("/compute/instances/{id}/start"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let next = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let event: Value = serde_json::from_slice(next.strip_suffix(b"\n").unwrap()).unwrap();
    assert_eq!(event["action"], "start");
}

#[tokio::test]
async fn test_list_scoping_and_paging() {
    let gw = gateway(Vec::new(), 1);
    let alice = login(&gw.app, "alice", "alice-pw").await;
    let root = login(&gw.app, "root", "root-pw").await;

    send(&gw.app, "POST", "/compute/instances", Some(&alice), Some(web_request())).await;
    let mut other = web_request();
    other["name"] = json!("admin-web");
    send(&gw.app, "POST", "/compute/instances", Some(&root), Some(other)).await;

    let (_, body) = send(&gw.app, "GET", "/compute/instances", Some(&alice), None).await;
    assert_eq!(body["count"], 1);
    assert_eq!(body["instances"][0]["name"], "web");

    let (_, body) = send(&gw.app, "GET", "/compute/instances?backend=container_engine", Some(&root), None).await;
    assert_eq!(body["count"], 2);

    let (status, body) = send(
        &gw.app,
        "GET",
        "/compute/instances?page=1000&pageSize=1000",
        Some(&root),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert!(body["instances"].as_array().unwrap().is_empty());

    let (_, body) = send(&gw.app, "GET", "/compute/cluster", Some(&root), None).await;
    assert_eq!(body["total"], 2);
}

#[tokio::test]
async fn test_delete_then_get_is_not_found() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    let (_, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(web_request())).await;
    let id = body["instance"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&gw.app, "DELETE", &format!("/compute/instances/{id}?force=true"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&gw.app, "GET", &format!("/compute/instances/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_snapshot_forest() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    let (status, _) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(vm_request("test-vm"))).await;
    assert_eq!(status, StatusCode::CREATED);

    for (name, parent) in [("s1", None), ("s2", Some("s1")), ("s3", Some("s1"))] {
        let (status, _) = send(
            &gw.app,
            "POST",
            "/vms/test-vm/snapshots",
            Some(&token),
            Some(json!({ "name": name, "parent": parent })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
    }
    let (status, _) = send(&gw.app, "DELETE", "/vms/test-vm/snapshots/s1", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&gw.app, "GET", "/vms/test-vm/snapshots", Some(&token), None).await;
    assert_eq!(body["count"], 2);
    for snapshot in body["snapshots"].as_array().unwrap() {
        assert!(snapshot["parent_id"].is_null(), "{snapshot}");
    }

    let (_, body) = send(&gw.app, "GET", "/vms/test-vm/snapshots?tree=true", Some(&token), None).await;
    assert_eq!(body["tree"].as_array().unwrap().len(), 2);

    let (status, _) = send(&gw.app, "GET", "/vms/test-vm/snapshots/s1", Some(&token), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = send(&gw.app, "POST", "/vms/test-vm/snapshots/s2/revert", Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_export_lifecycle() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    send(&gw.app, "POST", "/compute/instances", Some(&token), Some(vm_request("test-vm"))).await;

    let (status, body) = send(
        &gw.app,
        "POST",
        "/vms/test-vm/export",
        Some(&token),
        Some(json!({ "format": "qcow2" })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["job"]["state"], "pending");
    assert_eq!(body["job"]["progress"], 0);

    let id = body["job"]["id"].as_str().unwrap().to_string();
    let job = poll_job(&gw.app, &token, &id).await;
    assert_eq!(job["state"], "completed");
    assert_eq!(job["progress"], 100);
    assert!(!job["output_path"].as_str().unwrap().is_empty());

    let (_, body) = send(&gw.app, "GET", "/exports", Some(&token), None).await;
    assert_eq!(body["count"], 1);
}

#[tokio::test]
async fn test_export_cancel() {
    let gw = gateway(Vec::new(), 1000);
    let token = login(&gw.app, "alice", "alice-pw").await;
    send(&gw.app, "POST", "/compute/instances", Some(&token), Some(vm_request("test-vm"))).await;

    let (_, body) = send(
        &gw.app,
        "POST",
        "/vms/test-vm/export",
        Some(&token),
        Some(json!({ "format": "qcow2" })),
    )
    .await;
    let id = body["job"]["id"].as_str().unwrap().to_string();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, _) = send(&gw.app, "DELETE", &format!("/exports/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::OK);

    let job = poll_job(&gw.app, &token, &id).await;
    assert_eq!(job["state"], "canceled");
    assert!(job["end_time"].is_string());
    assert!(job["progress"].as_u64().unwrap() < 100);

    let (status, body) = send(&gw.app, "DELETE", &format!("/exports/{id}"), Some(&token), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "RESOURCE_CONFLICT");
}

#[tokio::test]
async fn test_export_unsupported_format() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    send(&gw.app, "POST", "/compute/instances", Some(&token), Some(vm_request("test-vm"))).await;

    let (status, body) = send(
        &gw.app,
        "POST",
        "/vms/test-vm/export",
        Some(&token),
        Some(json!({ "format": "vhdx" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNSUPPORTED_FORMAT");

    let (_, body) = send(&gw.app, "GET", "/exports", Some(&token), None).await;
    assert_eq!(body["count"], 0);
}

#[tokio::test]
async fn test_quota_admin() {
    let gw = gateway(Vec::new(), 1);
    let alice = login(&gw.app, "alice", "alice-pw").await;
    let root = login(&gw.app, "root", "root-pw").await;

    let (status, body) = send(&gw.app, "GET", "/quotas/7", Some(&alice), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quota"]["max_instances"], 10);

    let (status, body) = send(&gw.app, "GET", "/quotas/1", Some(&alice), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let (status, _) = send(&gw.app, "PUT", "/quotas/7", Some(&alice), Some(json!({ "max_instances": 50 }))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&gw.app, "PUT", "/quotas/7", Some(&root), Some(json!({ "max_instances": 1 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["quota"]["max_instances"], 1);
    assert_eq!(body["quota"]["user_id"], 7);

    send(&gw.app, "POST", "/compute/instances", Some(&alice), Some(web_request())).await;
    let mut second = web_request();
    second["name"] = json!("web-2");
    let (status, body) = send(&gw.app, "POST", "/compute/instances", Some(&alice), Some(second)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "QUOTA_EXCEEDED");
}

#[tokio::test]
async fn test_migrate_unsupported() {
    let gw = gateway(Vec::new(), 1);
    let token = login(&gw.app, "alice", "alice-pw").await;
    let (_, body) = send(&gw.app, "POST", "/compute/instances", Some(&token), Some(vm_request("test-vm"))).await;
    let id = body["instance"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &gw.app,
        "POST",
        &format!("/compute/instances/{id}/migrate"),
        Some(&token),
        Some(json!({ "target_host": "other" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "UNSUPPORTED_FORMAT");
}
