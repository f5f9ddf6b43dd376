use anyhow::{bail, Context, Result};
use clap::Parser;
use compute_common::Backend;
use compute_core::{ComputeService, EventBus, ExportManager};
use compute_docker::{BollardConnector, ClientManager, ContainerDriver};
use compute_gateway::config::{GatewayConfig, LogFormat, LoggingConfig, QuotaOverride};
use compute_gateway::{create_app, AppState, TokenAuthority};
use compute_hypervisor::HypervisorDriver;
use compute_quota::{InMemoryStorage, QuotaManager, ResourceTracker};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "compute-gateway")]
#[command(version)]
#[command(about = "Unified VM and container control plane", long_about = None)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, env = "COMPUTE_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    let tracker = Arc::new(ResourceTracker::new());
    let storage = Arc::new(InMemoryStorage::with_quotas(
        config.quota.overrides.iter().map(QuotaOverride::to_quota),
    ));
    let quotas = Arc::new(
        QuotaManager::new(storage, tracker).with_usage_enforcement(config.quota.enforce_usage),
    );
    let mut service = ComputeService::new(quotas, Arc::new(EventBus::new()));

    let hypervisor = if config.libvirt.enabled {
        let client = compute_hypervisor::connect(
            &config.libvirt.uri,
            Duration::from_secs(config.libvirt.connection_timeout),
        );
        let driver = Arc::new(HypervisorDriver::new(client).with_pool(&config.libvirt.pool_name));
        let exports = ExportManager::new(
            config.export.export_config(&config.libvirt.pool_name)?,
            driver.clone(),
        );
        service = service.with_exports(exports);
        Some(driver)
    } else {
        None
    };
    if let Some(driver) = hypervisor {
        service.register_driver(driver.clone())?;
        service.register_snapshot_driver(Backend::Hypervisor, driver)?;
        info!(uri = %config.libvirt.uri, "Hypervisor backend enabled");
    }

    let clients = if config.docker.enabled {
        let manager = Arc::new(ClientManager::new(
            config.docker.client_config()?,
            Arc::new(BollardConnector),
        )?);
        service.register_driver(Arc::new(ContainerDriver::new(manager.clone())))?;
        info!(host = %config.docker.host, "Container engine backend enabled");
        Some(manager)
    } else {
        None
    };

    if service.backends().is_empty() {
        bail!("no backend enabled; enable docker or libvirt in the configuration");
    }

    match service.reconcile().await {
        Ok(count) => info!(count, "Loaded existing instances"),
        Err(e) => warn!(error = %e, "Initial reconcile failed; starting with an empty tracker"),
    }

    let auth = TokenAuthority::new(&config.auth)?;
    if !auth.is_enabled() {
        warn!("Authentication is disabled; every request acts as admin");
    }
    if config.server.tls.enabled {
        info!("TLS is configured; terminate it at the fronting proxy");
    }

    let app = create_app(AppState::new(Arc::new(service), Arc::new(auth)));
    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "Compute gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(clients) = clients {
        clients.close().await;
    }
    info!("Compute gateway stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.to_lowercase()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_config_flag() {
        let cli = Cli::try_parse_from(["compute-gateway", "--config", "/etc/compute.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/compute.yaml")));

        let cli = Cli::try_parse_from(["compute-gateway", "-c", "gw.yaml"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("gw.yaml")));

        assert!(Cli::try_parse_from(["compute-gateway", "--bogus"]).is_err());
    }
}
