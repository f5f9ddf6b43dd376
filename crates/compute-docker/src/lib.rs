//! Container-engine side of the control plane: the pooled engine client and
//! the driver that maps unified instances onto containers.

pub use bollard;
pub use compute_common as common;

pub mod bollard_engine;
pub mod client;
pub mod convert;
pub mod driver;
pub mod engine;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod test_utils;

pub use bollard_engine::{BollardConnector, BollardEngine};
pub use client::{
    default_manager, set_default_manager, ClientConfig, ClientError, ClientManager,
    EngineConnector,
};
pub use driver::ContainerDriver;
pub use engine::{EngineApi, EngineError, EngineStats, ResourceUpdate};
