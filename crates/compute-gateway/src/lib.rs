//! HTTP edge of the compute control plane.

pub mod auth;
pub mod config;
pub mod error;
pub mod extract;
pub mod handlers;
pub mod metrics;
pub mod streaming;

#[cfg(test)]
mod tests;

use axum::routing::{get, post, put};
use axum::Router;
use compute_core::ComputeService;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::{AuthError, Caller, TokenAuthority};
pub use config::{ConfigError, GatewayConfig};
pub use error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ComputeService>,
    pub auth: Arc<TokenAuthority>,
}

impl AppState {
    pub fn new(service: Arc<ComputeService>, auth: Arc<TokenAuthority>) -> Self {
        Self { service, auth }
    }
}

pub fn create_app(state: AppState) -> Router {
    use handlers::*;

    Router::new()
        .route("/auth/login", post(login))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        // Instances
        .route("/compute/instances", get(list_instances).post(create_instance))
        .route(
            "/compute/instances/by-name/:backend/:name",
            get(get_instance_by_name),
        )
        .route(
            "/compute/instances/:id",
            get(get_instance)
                .patch(update_instance)
                .delete(delete_instance),
        )
        .route("/compute/instances/:id/start", post(start_instance))
        .route("/compute/instances/:id/stop", post(stop_instance))
        .route("/compute/instances/:id/restart", post(restart_instance))
        .route("/compute/instances/:id/pause", post(pause_instance))
        .route("/compute/instances/:id/unpause", post(unpause_instance))
        .route("/compute/instances/:id/usage", get(resource_usage))
        .route("/compute/instances/:id/resources", put(update_resources))
        .route("/compute/instances/:id/events", get(instance_events))
        .route("/compute/instances/:id/migrate", post(migrate_instance))
        // Cluster and backends
        .route("/compute/cluster", get(cluster_status))
        .route("/compute/backends", get(list_backends))
        .route("/compute/backends/:backend", get(backend_info))
        // VM snapshots and exports
        .route(
            "/vms/:name/snapshots",
            get(list_snapshots).post(create_snapshot),
        )
        .route(
            "/vms/:name/snapshots/:snapshot",
            get(get_snapshot).delete(delete_snapshot),
        )
        .route(
            "/vms/:name/snapshots/:snapshot/revert",
            post(revert_snapshot),
        )
        .route("/vms/:name/export", post(export_instance))
        .route("/exports", get(list_exports))
        .route("/exports/:id", get(get_export).delete(cancel_export))
        // Quotas
        .route("/quotas/:user_id", get(get_quota).put(set_quota))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
