//! Control-plane core: the event bus, export jobs and the unified compute
//! service that fronts every backend driver.

pub use compute_common as common;

pub mod context;
pub mod event_bus;
pub mod export;
pub mod service;

pub use context::{CallerContext, ADMIN_ROLE};
pub use event_bus::{EventBus, EventSubscription, ALL_INSTANCES, HISTORY_CAPACITY, SUBSCRIBER_BUFFER};
pub use export::{
    Converter, ExportConfig, ExportError, ExportFormat, ExportJob, ExportManager, ExportParams,
    JobOwner, JobState,
};
pub use service::{
    BackendSummary, ClusterStatus, ComputeService, InstanceList, QuotaReport, ServiceConfig,
    ServiceHealth, HEALTH_TIMEOUT,
};
