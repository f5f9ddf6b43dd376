use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use compute_common::{
    Backend, ComputeResources, EventFilter, EventType, HealthState, InstanceKind, InstanceRequest,
    InstanceState, InstanceUpdate, ListOptions, SnapshotParams,
};
use compute_core::ExportParams;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use tracing::info;

use crate::auth::{Caller, LoginRequest};
use crate::config::QuotaOverride;
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery};
use crate::streaming::{follow_stream, ndjson_response};
use crate::AppState;

type ApiResult<T> = Result<T, ApiError>;

fn parse<T>(field: &str, raw: Option<&str>) -> ApiResult<Option<T>>
where
    T: std::str::FromStr<Err = String>,
{
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|e| ApiError::bad_request(format!("{field}: {e}"))),
        None => Ok(None),
    }
}

/// `k=v,k2=v2`
fn parse_labels(raw: Option<&str>) -> ApiResult<HashMap<String, String>> {
    let mut labels = HashMap::new();
    for pair in raw.unwrap_or_default().split(',').filter(|p| !p.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ApiError::bad_request(format!("labels: expected key=value, got {pair}")))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(labels)
}

pub async fn login(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    let response = state.auth.login(&request)?;
    info!(username = %request.username, "User logged in");
    Ok(Json(response))
}

pub async fn health(State(state): State<AppState>) -> Response {
    let health = state.service.health_check().await;
    let status = match health.status {
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    };
    (status, Json(health)).into_response()
}

pub async fn metrics(State(state): State<AppState>) -> ApiResult<Response> {
    let body = crate::metrics::gather(&state.service).await.map_err(|e| {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            format!("encoding metrics: {e}"),
        )
    })?;
    Ok(([(CONTENT_TYPE, crate::metrics::CONTENT_TYPE)], body).into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ListQuery {
    backend: Option<String>,
    kind: Option<String>,
    state: Option<String>,
    labels: Option<String>,
    limit: Option<usize>,
    offset: Option<usize>,
    page: Option<usize>,
    #[serde(alias = "pageSize")]
    page_size: Option<usize>,
}

impl ListQuery {
    fn into_options(self) -> ApiResult<ListOptions> {
        let mut opts = ListOptions {
            backend: parse::<Backend>("backend", self.backend.as_deref())?,
            kind: parse::<InstanceKind>("kind", self.kind.as_deref())?,
            state: parse::<InstanceState>("state", self.state.as_deref())?,
            labels: parse_labels(self.labels.as_deref())?,
            user_id: None,
            limit: self.limit,
            offset: self.offset,
        };
        // 1-based pages take precedence over raw offsets.
        if let Some(page) = self.page {
            let size = self.page_size.or(self.limit).unwrap_or(20).max(1);
            opts.offset = Some(page.max(1).saturating_sub(1).saturating_mul(size));
            opts.limit = Some(size);
        }
        Ok(opts)
    }
}

pub async fn list_instances(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let list = state.service.list_instances(&ctx, query.into_options()?).await?;
    Ok(Json(list))
}

pub async fn create_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    ApiJson(request): ApiJson<InstanceRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.create_instance(&ctx, request).await?;
    Ok((StatusCode::CREATED, Json(json!({ "instance": instance }))))
}

pub async fn get_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.get_instance(&ctx, &id).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn get_instance_by_name(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((backend, name)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let backend: Backend = backend.parse().map_err(ApiError::bad_request)?;
    let instance = state
        .service
        .get_instance_by_name(&ctx, backend, &name)
        .await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn update_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(update): ApiJson<InstanceUpdate>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.update_instance(&ctx, &id, update).await?;
    Ok(Json(json!({ "instance": instance })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ForceQuery {
    force: bool,
}

pub async fn delete_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete_instance(&ctx, &id, query.force).await?;
    Ok(Json(json!({ "id": id, "deleted": true })))
}

pub async fn start_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.start_instance(&ctx, &id).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn stop_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.stop_instance(&ctx, &id, query.force).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn restart_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<ForceQuery>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .service
        .restart_instance(&ctx, &id, query.force)
        .await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn pause_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.pause_instance(&ctx, &id).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn unpause_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let instance = state.service.unpause_instance(&ctx, &id).await?;
    Ok(Json(json!({ "instance": instance })))
}

pub async fn resource_usage(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let usage = state.service.resource_usage(&ctx, &id).await?;
    Ok(Json(json!({ "usage": usage })))
}

pub async fn update_resources(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(resources): ApiJson<ComputeResources>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .service
        .update_resource_limits(&ctx, &id, resources)
        .await?;
    Ok(Json(json!({ "instance": instance })))
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    target_host: String,
}

pub async fn migrate_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiJson(request): ApiJson<MigrateRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .service
        .migrate_instance(&ctx, &id, &request.target_host)
        .await?;
    Ok(Json(json!({ "instance": instance })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EventsQuery {
    /// Comma-separated event types.
    types: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    limit: Option<usize>,
    follow: bool,
}

impl EventsQuery {
    fn into_filter(self) -> ApiResult<EventFilter> {
        let types = self
            .types
            .unwrap_or_default()
            .split(',')
            .filter(|t| !t.trim().is_empty())
            .map(|t| t.trim().parse::<EventType>().map_err(ApiError::bad_request))
            .collect::<ApiResult<Vec<_>>>()?;
        Ok(EventFilter {
            types,
            since: self.since,
            until: self.until,
            limit: self.limit,
            follow: self.follow,
        })
    }
}

/// Replay as a JSON document, or with `follow=true` an NDJSON stream that
/// stays open until the client disconnects.
pub async fn instance_events(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
    ApiQuery(query): ApiQuery<EventsQuery>,
) -> ApiResult<Response> {
    let filter = query.into_filter()?;
    if !filter.follow {
        let events = state.service.instance_events(&ctx, &id, &filter).await?;
        let count = events.len();
        return Ok(Json(json!({ "events": events, "count": count })).into_response());
    }

    let live = state.service.subscribe_events(&ctx, &id, &filter).await?;
    let replay_filter = EventFilter {
        follow: false,
        ..filter.clone()
    };
    let replay = state
        .service
        .instance_events(&ctx, &id, &replay_filter)
        .await?;
    let events = follow_stream(replay, live)
        .filter(move |event| futures::future::ready(filter.matches(event)));
    Ok(ndjson_response(events))
}

pub async fn cluster_status(
    State(state): State<AppState>,
    Caller(ctx): Caller,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.cluster_status(&ctx).await?))
}

pub async fn list_backends(
    State(state): State<AppState>,
    Caller(_ctx): Caller,
) -> ApiResult<impl IntoResponse> {
    let backends = state.service.list_backends().await;
    Ok(Json(json!({ "backends": backends })))
}

pub async fn backend_info(
    State(state): State<AppState>,
    Caller(_ctx): Caller,
    Path(backend): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let backend: Backend = backend.parse().map_err(ApiError::bad_request)?;
    Ok(Json(state.service.backend_info(backend).await?))
}

pub async fn create_snapshot(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(vm): Path<String>,
    ApiJson(params): ApiJson<SnapshotParams>,
) -> ApiResult<impl IntoResponse> {
    if params.name.trim().is_empty() {
        return Err(ApiError::bad_request("snapshot name is required"));
    }
    let snapshot = state.service.create_snapshot(&ctx, &vm, params).await?;
    Ok((StatusCode::CREATED, Json(json!({ "snapshot": snapshot }))))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TreeQuery {
    tree: bool,
}

pub async fn list_snapshots(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(vm): Path<String>,
    ApiQuery(query): ApiQuery<TreeQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.tree {
        let tree = state.service.snapshot_tree(&ctx, &vm).await?;
        return Ok(Json(json!({ "tree": tree })));
    }
    let snapshots = state.service.list_snapshots(&ctx, &vm).await?;
    let count = snapshots.len();
    Ok(Json(json!({ "snapshots": snapshots, "count": count })))
}

pub async fn get_snapshot(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((vm, snapshot)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let snapshot = state.service.get_snapshot(&ctx, &vm, &snapshot).await?;
    Ok(Json(json!({ "snapshot": snapshot })))
}

pub async fn delete_snapshot(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((vm, snapshot)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.service.delete_snapshot(&ctx, &vm, &snapshot).await?;
    Ok(Json(json!({ "snapshot": snapshot, "deleted": true })))
}

pub async fn revert_snapshot(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path((vm, snapshot)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    state.service.revert_snapshot(&ctx, &vm, &snapshot).await?;
    Ok(Json(json!({ "snapshot": snapshot, "reverted": true })))
}

pub async fn export_instance(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(vm): Path<String>,
    ApiJson(params): ApiJson<ExportParams>,
) -> ApiResult<impl IntoResponse> {
    let job = state.service.export_instance(&ctx, &vm, params).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "job": job }))))
}

pub async fn list_exports(
    State(state): State<AppState>,
    Caller(ctx): Caller,
) -> ApiResult<impl IntoResponse> {
    let jobs = state.service.list_export_jobs(&ctx)?;
    let count = jobs.len();
    Ok(Json(json!({ "jobs": jobs, "count": count })))
}

pub async fn get_export(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.service.get_export_job(&ctx, &id)?;
    Ok(Json(json!({ "job": job })))
}

pub async fn cancel_export(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let job = state.service.cancel_export_job(&ctx, &id).await?;
    Ok(Json(json!({ "job": job })))
}

pub async fn get_quota(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(user_id): Path<u64>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.service.get_quota(&ctx, user_id).await?))
}

pub async fn set_quota(
    State(state): State<AppState>,
    Caller(ctx): Caller,
    Path(user_id): Path<u64>,
    ApiJson(patch): ApiJson<QuotaOverride>,
) -> ApiResult<impl IntoResponse> {
    let current = state.service.get_quota(&ctx, user_id).await?.quota;
    let quota = state
        .service
        .set_quota(&ctx, user_id, patch.apply_to(current))
        .await?;
    Ok(Json(json!({ "quota": quota })))
}
