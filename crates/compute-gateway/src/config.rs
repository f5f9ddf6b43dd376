//! Gateway configuration, read from a YAML file with environment overrides.

use compute_common::{Backend, InstanceKind};
use compute_core::{ExportConfig, ExportFormat};
use compute_docker::ClientConfig;
use compute_quota::ResourceQuotas;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const CONFIG_ENV: &str = "COMPUTE_CONFIG";
pub const HOST_ENV: &str = "COMPUTE_HOST";
pub const PORT_ENV: &str = "COMPUTE_PORT";
pub const LOG_LEVEL_ENV: &str = "COMPUTE_LOG_LEVEL";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const MIN_SECRET_LEN: usize = 16;
/// Upper bound on `auth.token_expiration`, in seconds (30 days).
pub const MAX_TOKEN_EXPIRATION: u64 = 30 * 24 * 60 * 60;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {key}: {message}")]
    Invalid { key: String, message: String },
}

impl ConfigError {
    fn invalid(key: &str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
    pub docker: DockerConfig,
    pub libvirt: LibvirtConfig,
    pub export: ExportSection,
    pub quota: QuotaConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            tls: TlsConfig::default(),
        }
    }
}

/// Recorded for the fronting proxy; the listener itself speaks plain HTTP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub enabled: bool,
    /// HMAC key for issued tokens. A random per-process key is used when empty.
    pub secret_key: String,
    pub issuer: String,
    /// Token lifetime in seconds.
    pub token_expiration: u64,
    pub default_users: Vec<UserEntry>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            secret_key: String::new(),
            issuer: "compute-gateway".to_string(),
            token_expiration: 3600,
            default_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    /// Hex SHA-256 of the password.
    pub password_sha256: String,
    pub user_id: u64,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// Engine client options. Durations are seconds unless the name says otherwise.
/// Unknown keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    pub enabled: bool,
    pub host: String,
    pub api_version: Option<String>,
    pub tls_verify: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub request_timeout: u64,
    pub connection_timeout: u64,
    pub ping_timeout: u64,
    pub retry_count: u32,
    pub retry_delay_ms: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        let client = ClientConfig::default();
        Self {
            enabled: true,
            host: client.host,
            api_version: client.api_version,
            tls_verify: client.tls_verify,
            cert_path: client.cert_path,
            key_path: client.key_path,
            ca_path: client.ca_path,
            request_timeout: client.request_timeout.as_secs(),
            connection_timeout: client.connection_timeout.as_secs(),
            ping_timeout: client.ping_timeout.as_secs(),
            retry_count: client.retry_count,
            retry_delay_ms: client.retry_delay.as_millis() as u64,
        }
    }
}

impl DockerConfig {
    pub fn client_config(&self) -> Result<ClientConfig> {
        let config = ClientConfig {
            host: self.host.clone(),
            api_version: self.api_version.clone(),
            tls_verify: self.tls_verify,
            cert_path: self.cert_path.clone(),
            key_path: self.key_path.clone(),
            ca_path: self.ca_path.clone(),
            request_timeout: Duration::from_secs(self.request_timeout),
            connection_timeout: Duration::from_secs(self.connection_timeout),
            ping_timeout: Duration::from_secs(self.ping_timeout),
            retry_count: self.retry_count,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        };
        config
            .validate()
            .map_err(|e| ConfigError::invalid("docker", e.to_string()))?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    pub enabled: bool,
    pub uri: String,
    /// Seconds.
    pub connection_timeout: u64,
    pub pool_name: String,
    pub network_name: String,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            uri: compute_hypervisor::DEFAULT_URI.to_string(),
            connection_timeout: 30,
            pool_name: compute_hypervisor::DEFAULT_POOL.to_string(),
            network_name: "default".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportSection {
    pub output_dir: PathBuf,
    pub temp_dir: Option<PathBuf>,
    pub default_format: String,
    pub max_concurrent: usize,
}

impl Default for ExportSection {
    fn default() -> Self {
        let defaults = ExportConfig::default();
        Self {
            output_dir: defaults.output_dir,
            temp_dir: defaults.temp_dir,
            default_format: defaults.default_format.to_string(),
            max_concurrent: defaults.max_concurrent,
        }
    }
}

impl ExportSection {
    pub fn export_config(&self, pool: &str) -> Result<ExportConfig> {
        let default_format: ExportFormat = self
            .default_format
            .parse()
            .map_err(|e| ConfigError::invalid("export.default_format", format!("{e}")))?;
        Ok(ExportConfig {
            output_dir: self.output_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            default_format,
            max_concurrent: self.max_concurrent,
            default_pool: pool.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub enforce_usage: bool,
    pub overrides: Vec<QuotaOverride>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enforce_usage: true,
            overrides: Vec::new(),
        }
    }
}

/// Per-user deviations from the default quota. Also the body of a quota
/// update, where unset fields keep their current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotaOverride {
    #[serde(default)]
    pub user_id: u64,
    pub max_instances: Option<u32>,
    pub max_cpu_cores: Option<f64>,
    pub max_memory_gb: Option<f64>,
    pub max_storage_gb: Option<f64>,
    pub max_networks: Option<u32>,
    pub allowed_backends: Option<Vec<Backend>>,
    pub allowed_kinds: Option<Vec<InstanceKind>>,
}

impl QuotaOverride {
    pub fn to_quota(&self) -> ResourceQuotas {
        self.apply_to(ResourceQuotas::default_for(self.user_id))
    }

    pub fn apply_to(&self, mut quota: ResourceQuotas) -> ResourceQuotas {
        if let Some(v) = self.max_instances {
            quota.max_instances = v;
        }
        if let Some(v) = self.max_cpu_cores {
            quota.max_cpu_cores = v;
        }
        if let Some(v) = self.max_memory_gb {
            quota.max_memory_gb = v;
        }
        if let Some(v) = self.max_storage_gb {
            quota.max_storage_gb = v;
        }
        if let Some(v) = self.max_networks {
            quota.max_networks = v;
        }
        if let Some(v) = &self.allowed_backends {
            quota.allowed_backends = v.clone();
        }
        if let Some(v) = &self.allowed_kinds {
            quota.allowed_kinds = v.clone();
        }
        quota
    }
}

impl GatewayConfig {
    /// Load from `path`, or from `COMPUTE_CONFIG` when no path is given.
    /// No file at all means defaults. Environment overrides and validation
    /// are applied either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        let mut config = match path {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup(HOST_ENV) {
            self.server.host = host;
        }
        if let Some(port) = lookup(PORT_ENV) {
            self.server.port = port
                .parse()
                .map_err(|_| ConfigError::invalid(PORT_ENV, format!("not a port: {port}")))?;
        }
        if let Some(level) = lookup(LOG_LEVEL_ENV) {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            return Err(ConfigError::invalid("server.host", "must not be empty"));
        }
        if self.server.port == 0 {
            return Err(ConfigError::invalid("server.port", "must be non-zero"));
        }
        let tls = &self.server.tls;
        if tls.enabled && (tls.cert_file.is_none() || tls.key_file.is_none()) {
            return Err(ConfigError::invalid(
                "server.tls",
                "cert_file and key_file are required when TLS is enabled",
            ));
        }

        if self.auth.enabled {
            if !self.auth.secret_key.is_empty() && self.auth.secret_key.len() < MIN_SECRET_LEN {
                return Err(ConfigError::invalid(
                    "auth.secret_key",
                    format!("must be at least {MIN_SECRET_LEN} bytes"),
                ));
            }
            if self.auth.token_expiration == 0 {
                return Err(ConfigError::invalid("auth.token_expiration", "must be non-zero"));
            }
            if self.auth.token_expiration > MAX_TOKEN_EXPIRATION {
                return Err(ConfigError::invalid(
                    "auth.token_expiration",
                    format!("must be at most {MAX_TOKEN_EXPIRATION} seconds"),
                ));
            }
        }
        for user in &self.auth.default_users {
            let hash = &user.password_sha256;
            if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(ConfigError::invalid(
                    "auth.default_users",
                    format!("password_sha256 of {} is not a hex SHA-256 digest", user.username),
                ));
            }
        }

        if !LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::invalid(
                "logging.level",
                format!("unknown level {}", self.logging.level),
            ));
        }

        if self.docker.enabled {
            self.docker.client_config()?;
        }
        if self.libvirt.enabled && self.libvirt.uri.trim().is_empty() {
            return Err(ConfigError::invalid("libvirt.uri", "must not be empty"));
        }

        if self.export.max_concurrent == 0 {
            return Err(ConfigError::invalid("export.max_concurrent", "must be at least 1"));
        }
        self.export.export_config(&self.libvirt.pool_name)?;
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
