//! Pooled container-engine client: validated config, lazy ping-driven
//! reconnection and at-most-one in-flight client creation.

use async_trait::async_trait;
use compute_common::ComputeError;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::engine::{EngineApi, SerializedEngine};

pub const DEFAULT_HOST: &str = "unix:///var/run/docker.sock";

const VALID_SCHEMES: [&str; 4] = ["unix://", "tcp://", "http://", "https://"];

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("TLS verification enabled but {0} is missing")]
    MissingTlsConfig(&'static str),
    #[error("invalid API version: {0}")]
    InvalidApiVersion(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("connection failed after {attempts} attempt(s): {message}")]
    ConnectionFailed { attempts: u32, message: String },
    #[error("client not initialized")]
    ClientNotInitialized,
    #[error("client manager is closed")]
    ClientClosed,
    #[error("operation canceled")]
    ContextCanceled,
}

impl From<ClientError> for ComputeError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::ContextCanceled => ComputeError::Canceled,
            ClientError::InvalidHost(_)
            | ClientError::MissingTlsConfig(_)
            | ClientError::InvalidApiVersion(_)
            | ClientError::InvalidConfig(_) => ComputeError::Internal(err.to_string()),
            other => ComputeError::Unavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    /// Pinned API version; negotiated with the daemon when absent.
    pub api_version: Option<String>,
    pub tls_verify: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub connection_timeout: Duration,
    pub ping_timeout: Duration,
    pub retry_count: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            api_version: None,
            tls_verify: false,
            cert_path: None,
            key_path: None,
            ca_path: None,
            request_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(15),
            ping_timeout: Duration::from_secs(5),
            retry_count: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !VALID_SCHEMES.iter().any(|s| self.host.starts_with(s)) {
            return Err(ClientError::InvalidHost(format!(
                "{} (must start with unix://, tcp://, http:// or https://)",
                self.host
            )));
        }

        if self.tls_verify {
            if self.cert_path.is_none() {
                return Err(ClientError::MissingTlsConfig("cert_path"));
            }
            if self.key_path.is_none() {
                return Err(ClientError::MissingTlsConfig("key_path"));
            }
            if self.ca_path.is_none() {
                return Err(ClientError::MissingTlsConfig("ca_path"));
            }
        }

        if let Some(version) = &self.api_version {
            parse_api_version(version)?;
        }

        if self.ping_timeout.is_zero() || self.connection_timeout.is_zero() {
            return Err(ClientError::InvalidConfig(
                "timeouts must be non-zero".to_string(),
            ));
        }

        Ok(())
    }

    pub fn uses_tls(&self) -> bool {
        self.tls_verify || self.host.starts_with("https://")
    }
}

/// Parses `vX.Y` or `X.Y` into (major, minor).
pub fn parse_api_version(version: &str) -> Result<(usize, usize)> {
    let trimmed = version.strip_prefix('v').unwrap_or(version);
    let invalid = || ClientError::InvalidApiVersion(version.to_string());
    let (major, minor) = trimmed.split_once('.').ok_or_else(invalid)?;
    let major = major.parse::<usize>().map_err(|_| invalid())?;
    let minor = minor.parse::<usize>().map_err(|_| invalid())?;
    Ok((major, minor))
}

/// Builds a transport from the config and dials the daemon.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, config: &ClientConfig) -> Result<Arc<dyn EngineApi>>;
}

#[derive(Default)]
struct PoolState {
    client: Option<Arc<SerializedEngine>>,
    initialized: bool,
    closed: bool,
}

/// Single shared client per process, reconnected on demand.
pub struct ClientManager {
    config: ClientConfig,
    connector: Arc<dyn EngineConnector>,
    state: RwLock<PoolState>,
    create_count: AtomicU64,
}

impl ClientManager {
    pub fn new(config: ClientConfig, connector: Arc<dyn EngineConnector>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            connector,
            state: RwLock::new(PoolState::default()),
            create_count: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Number of clients successfully created over the manager's lifetime.
    pub fn create_count(&self) -> u64 {
        self.create_count.load(Ordering::SeqCst)
    }

    pub async fn is_initialized(&self) -> bool {
        self.state.read().await.initialized
    }

    pub async fn is_closed(&self) -> bool {
        self.state.read().await.closed
    }

    pub async fn get(&self) -> Result<Arc<dyn EngineApi>> {
        self.get_with_cancel(&CancellationToken::new()).await
    }

    /// Acquire a live client, creating one if the current client is missing
    /// or fails its ping.
    #[instrument(skip(self, cancel), fields(host = %self.config.host))]
    pub async fn get_with_cancel(&self, cancel: &CancellationToken) -> Result<Arc<dyn EngineApi>> {
        if cancel.is_cancelled() {
            return Err(ClientError::ContextCanceled);
        }

        {
            let state = self.state.read().await;
            if state.closed {
                return Err(ClientError::ClientClosed);
            }
            if let Some(client) = &state.client {
                if self.ping_client(client.as_ref()).await.is_ok() {
                    return Ok(client.clone() as Arc<dyn EngineApi>);
                }
                warn!("Existing engine client failed ping, reconnecting");
            }
        }

        let mut state = self.state.write().await;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        // Another caller may have reconnected while we waited for the write lock.
        if let Some(client) = &state.client {
            if self.ping_client(client.as_ref()).await.is_ok() {
                return Ok(client.clone() as Arc<dyn EngineApi>);
            }
            state.client = None;
        }

        let attempts = self.config.retry_count + 1;
        let mut last_error = String::from("no attempt made");
        for attempt in 0..attempts {
            if cancel.is_cancelled() {
                return Err(ClientError::ContextCanceled);
            }
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ClientError::ContextCanceled),
                    _ = tokio::time::sleep(self.config.retry_delay) => {}
                }
            }

            match self.create_client(cancel).await {
                Ok(client) => {
                    self.create_count.fetch_add(1, Ordering::SeqCst);
                    state.client = Some(client.clone());
                    state.initialized = true;
                    info!(attempt = attempt + 1, "Engine client connected");
                    return Ok(client as Arc<dyn EngineApi>);
                }
                Err(ClientError::ContextCanceled) => return Err(ClientError::ContextCanceled),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Engine client creation failed");
                    last_error = e.to_string();
                }
            }
        }

        Err(ClientError::ConnectionFailed {
            attempts,
            message: last_error,
        })
    }

    /// Ping the current client without creating one.
    pub async fn ping(&self) -> Result<()> {
        let state = self.state.read().await;
        if state.closed {
            return Err(ClientError::ClientClosed);
        }
        let client = state.client.as_ref().ok_or(ClientError::ClientNotInitialized)?;
        self.ping_client(client.as_ref()).await
    }

    /// Mark closed and release the client. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.write().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.client = None;
        info!(host = %self.config.host, "Engine client manager closed");
    }

    async fn create_client(&self, cancel: &CancellationToken) -> Result<Arc<SerializedEngine>> {
        let connect = tokio::time::timeout(
            self.config.connection_timeout,
            self.connector.connect(&self.config),
        );
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::ContextCanceled),
            res = connect => match res {
                Ok(client) => client?,
                Err(_) => {
                    return Err(ClientError::ConnectionFailed {
                        attempts: 1,
                        message: format!("connect timed out after {:?}", self.config.connection_timeout),
                    })
                }
            },
        };

        let client = Arc::new(SerializedEngine::new(raw));
        // A client that cannot answer a ping is dropped here.
        self.ping_client(client.as_ref()).await?;
        debug!("New engine client answered ping");
        Ok(client)
    }

    async fn ping_client(&self, client: &SerializedEngine) -> Result<()> {
        match tokio::time::timeout(self.config.ping_timeout, client.ping()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ClientError::ConnectionFailed {
                attempts: 1,
                message: format!("ping failed: {e}"),
            }),
            Err(_) => Err(ClientError::ConnectionFailed {
                attempts: 1,
                message: format!("ping timed out after {:?}", self.config.ping_timeout),
            }),
        }
    }
}

static DEFAULT_MANAGER: OnceLock<Arc<ClientManager>> = OnceLock::new();

/// Process-wide manager for convenience entry points; services should take
/// their manager by injection instead.
pub fn default_manager() -> Result<Arc<ClientManager>> {
    if let Some(manager) = DEFAULT_MANAGER.get() {
        return Ok(manager.clone());
    }
    let manager = Arc::new(ClientManager::new(
        ClientConfig::default(),
        Arc::new(crate::BollardConnector),
    )?);
    Ok(DEFAULT_MANAGER.get_or_init(|| manager).clone())
}

/// Install a manager as the process default. Returns false if one was already set.
pub fn set_default_manager(manager: Arc<ClientManager>) -> bool {
    DEFAULT_MANAGER.set(manager).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{InMemoryConnector, InMemoryEngine};
    use std::sync::atomic::AtomicU32;

    fn fast_config() -> ClientConfig {
        ClientConfig {
            retry_count: 2,
            retry_delay: Duration::from_millis(10),
            ping_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = ClientConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(500));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert!(!config.uses_tls());
    }

    #[test]
    fn test_invalid_host_rejected() {
        let config = ClientConfig::default().with_host("ftp://docker");
        assert!(matches!(config.validate(), Err(ClientError::InvalidHost(_))));

        for host in ["unix:///run/docker.sock", "tcp://10.0.0.1:2375", "https://d:2376"] {
            assert!(ClientConfig::default().with_host(host).validate().is_ok(), "{host}");
        }
    }

    #[test]
    fn test_tls_requires_all_paths() {
        let config = ClientConfig {
            tls_verify: true,
            cert_path: Some("/certs/cert.pem".into()),
            key_path: Some("/certs/key.pem".into()),
            ..Default::default()
        };
        assert_eq!(
            config.validate(),
            Err(ClientError::MissingTlsConfig("ca_path"))
        );
    }

    #[test]
    fn test_api_version_parsing() {
        assert_eq!(parse_api_version("v1.43").unwrap(), (1, 43));
        assert_eq!(parse_api_version("1.41").unwrap(), (1, 41));
        assert!(parse_api_version("latest").is_err());
        assert!(parse_api_version("v1").is_err());

        let config = ClientConfig {
            api_version: Some("one.two".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::InvalidApiVersion(_))));
    }

    #[tokio::test]
    async fn test_get_reuses_healthy_client() {
        let engine = Arc::new(InMemoryEngine::new());
        let connector = Arc::new(InMemoryConnector::new(engine));
        let manager = ClientManager::new(fast_config(), connector.clone()).unwrap();

        assert!(!manager.is_initialized().await);
        assert_eq!(manager.ping().await, Err(ClientError::ClientNotInitialized));

        manager.get().await.unwrap();
        manager.get().await.unwrap();
        assert_eq!(manager.create_count(), 1);
        assert_eq!(connector.connect_calls(), 1);
        assert!(manager.is_initialized().await);
        assert!(manager.ping().await.is_ok());
    }

    #[tokio::test]
    async fn test_reconnects_after_failed_ping() {
        let engine = Arc::new(InMemoryEngine::new());
        let connector = Arc::new(InMemoryConnector::new(engine.clone()));
        let manager = ClientManager::new(fast_config(), connector.clone()).unwrap();

        manager.get().await.unwrap();
        engine.set_healthy(false);
        assert!(manager.get().await.is_err());

        engine.set_healthy(true);
        manager.get().await.unwrap();
        assert_eq!(manager.create_count(), 2);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.set_healthy(false);
        let connector = Arc::new(InMemoryConnector::new(engine));
        let manager = ClientManager::new(fast_config(), connector.clone()).unwrap();

        let err = manager.get().await.err().unwrap();
        assert!(matches!(err, ClientError::ConnectionFailed { attempts: 3, .. }));
        assert_eq!(connector.connect_calls(), 3);
        assert!(!manager.is_initialized().await);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_loop() {
        let engine = Arc::new(InMemoryEngine::new());
        engine.set_healthy(false);
        let connector = Arc::new(InMemoryConnector::new(engine));
        let config = ClientConfig {
            retry_count: 5,
            retry_delay: Duration::from_secs(30),
            ..fast_config()
        };
        let manager = ClientManager::new(config, connector).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = manager.get_with_cancel(&cancel).await.err().unwrap();
        assert_eq!(err, ClientError::ContextCanceled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_close_is_terminal_and_idempotent() {
        let engine = Arc::new(InMemoryEngine::new());
        let manager =
            ClientManager::new(fast_config(), Arc::new(InMemoryConnector::new(engine))).unwrap();
        manager.get().await.unwrap();

        manager.close().await;
        manager.close().await;
        assert!(manager.is_closed().await);
        assert_eq!(manager.get().await.err(), Some(ClientError::ClientClosed));
        assert_eq!(manager.ping().await, Err(ClientError::ClientClosed));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_one_client() {
        let engine = Arc::new(InMemoryEngine::new());
        let connector = Arc::new(InMemoryConnector::new(engine));
        let manager = Arc::new(ClientManager::new(fast_config(), connector.clone()).unwrap());

        let started = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            let started = started.clone();
            handles.push(tokio::spawn(async move {
                started.fetch_add(1, Ordering::SeqCst);
                manager.get().await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(started.load(Ordering::SeqCst), 16);
        assert_eq!(manager.create_count(), 1);
        assert_eq!(connector.connect_calls(), 1);
    }
}
