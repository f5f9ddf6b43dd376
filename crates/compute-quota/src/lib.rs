// Per-user quotas and the allocation ledger they are checked against.
use compute_common::ComputeError;
use thiserror::Error;

mod manager;
mod storage;
mod tracker;
mod types;

pub use manager::QuotaManager;
pub use storage::{InMemoryStorage, QuotaStorage};
pub use tracker::ResourceTracker;
pub use types::*;

#[derive(Error, Debug)]
pub enum QuotaError {
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Invalid quota: {0}")]
    InvalidQuota(String),
    #[error("Not allowed: {0}")]
    NotAllowed(String),
    #[error("Resource limit exceeded: {message}")]
    LimitExceeded { message: String },
}

pub type Result<T> = std::result::Result<T, QuotaError>;

impl From<QuotaError> for ComputeError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::LimitExceeded { message } => ComputeError::QuotaExceeded(message),
            QuotaError::NotAllowed(msg) => ComputeError::Forbidden(msg),
            QuotaError::InvalidQuota(msg) => ComputeError::InvalidInput(msg),
            QuotaError::Storage(msg) => ComputeError::Internal(msg),
        }
    }
}
