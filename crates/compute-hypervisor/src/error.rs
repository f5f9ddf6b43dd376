use compute_common::ComputeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HypervisorError {
    #[error("Domain not found: {0}")]
    DomainNotFound(String),
    #[error("Domain already exists: {0}")]
    DomainExists(String),
    #[error("Invalid domain state: {0}")]
    InvalidState(String),
    #[error("Invalid VM configuration: {0}")]
    Validation(String),
    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(String),
    #[error("Snapshot already exists: {0}")]
    SnapshotExists(String),
    #[error("Storage volume not found: {0}")]
    VolumeNotFound(String),
    #[error("Hypervisor connection failed: {0}")]
    Connection(String),
    #[error("{command} failed: {message}")]
    Command { command: String, message: String },
    #[error("Malformed hypervisor output: {0}")]
    Parse(String),
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<HypervisorError> for ComputeError {
    fn from(err: HypervisorError) -> Self {
        match err {
            HypervisorError::DomainNotFound(name) => ComputeError::not_found("domain", &name),
            HypervisorError::SnapshotNotFound(name) => ComputeError::not_found("snapshot", &name),
            HypervisorError::VolumeNotFound(name) => ComputeError::not_found("volume", &name),
            HypervisorError::DomainExists(name) => {
                ComputeError::AlreadyExists(format!("domain {name}"))
            }
            HypervisorError::SnapshotExists(name) => {
                ComputeError::AlreadyExists(format!("snapshot {name}"))
            }
            HypervisorError::InvalidState(msg) => ComputeError::InvalidState(msg),
            HypervisorError::Validation(msg) => ComputeError::InvalidInput(msg),
            HypervisorError::Connection(msg) => ComputeError::Unavailable(msg),
            HypervisorError::Io(e) => ComputeError::Io(e),
            other => ComputeError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, HypervisorError>;
