// Re-export dependencies used in public interfaces of common types

pub use serde::{Deserialize, Serialize};
use thiserror::Error;
pub use uuid;

mod driver;
mod event;
mod snapshot;
mod types;

pub use driver::{ComputeDriver, SnapshotDriver, VmDetails, VmDisk, VmDiskSource};
pub use event::{EventFilter, EventType, InstanceEvent};
pub use snapshot::{Snapshot, SnapshotParams, SnapshotState, SnapshotTree};
pub use types::*;

/// Label carrying the owning user id on every instance the service creates.
pub const USER_ID_LABEL: &str = "compute.user_id";

#[derive(Error, Debug)]
pub enum ComputeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Resource Not Found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl ComputeError {
    pub fn not_found(what: &str, id: &str) -> Self {
        ComputeError::NotFound(format!("{what} {id}"))
    }

    /// True for errors the caller caused; these are safe to echo back.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ComputeError::InvalidInput(_)
                | ComputeError::Unauthorized(_)
                | ComputeError::Forbidden(_)
                | ComputeError::QuotaExceeded(_)
                | ComputeError::NotFound(_)
                | ComputeError::AlreadyExists(_)
                | ComputeError::InvalidState(_)
                | ComputeError::Unsupported(_)
        )
    }
}

// Define the primary Result type for compute operations
pub type Result<T> = std::result::Result<T, ComputeError>;
