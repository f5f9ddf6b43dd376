//! VM disk export jobs.

mod converter;
mod job;
mod manager;
mod ovf;

use compute_common::ComputeError;
use thiserror::Error;

pub use converter::{
    default_converters, Converter, ExportOptions, OvaConverter, Qcow2Converter, RawConverter,
    VdiConverter, VmdkConverter,
};
pub use job::{ExportFormat, ExportJob, ExportParams, JobOwner, JobState};
pub use manager::{ExportConfig, ExportManager};
pub use ovf::OvfDescriptor;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("invalid export options: {0}")]
    InvalidOptions(String),

    #[error("export job not found: {0}")]
    JobNotFound(String),

    #[error("export job {id} is {state} and cannot be canceled")]
    NotCancelable { id: String, state: JobState },

    #[error("no exportable disk found for VM {0}")]
    DiskNotFound(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("export canceled")]
    Canceled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Compute(#[from] ComputeError),
}

pub type Result<T> = std::result::Result<T, ExportError>;

impl From<ExportError> for ComputeError {
    fn from(err: ExportError) -> Self {
        match err {
            ExportError::UnsupportedFormat(f) => {
                ComputeError::Unsupported(format!("export format {f}"))
            }
            ExportError::InvalidOptions(m) => ComputeError::InvalidInput(m),
            ExportError::JobNotFound(id) => ComputeError::not_found("export job", &id),
            e @ ExportError::NotCancelable { .. } => ComputeError::InvalidState(e.to_string()),
            e @ ExportError::DiskNotFound(_) => ComputeError::NotFound(e.to_string()),
            e @ ExportError::Tool { .. } => ComputeError::Internal(e.to_string()),
            ExportError::Canceled => ComputeError::Canceled,
            ExportError::Io(e) => ComputeError::Io(e),
            ExportError::Compute(e) => e,
        }
    }
}
