//! Hypervisor backend: VMs driven through a libvirt-compatible daemon.
//!
//! [`VirshClient`] talks to a real daemon through the `virsh` CLI;
//! [`InMemoryHypervisor`] serves `test:///default` without one.

pub use compute_common as common;

pub mod client;
pub mod driver;
pub mod error;
pub mod memory;
pub mod snapshot;
pub mod validation;
pub mod virsh;
pub mod xml;

use std::sync::Arc;
use std::time::Duration;

pub use client::{
    DomainInfo, DomainMetadata, DomainSpec, DomainState, HypervisorClient, SnapshotInfo,
};
pub use driver::{domain_to_instance, HypervisorDriver, DEFAULT_POOL};
pub use error::{HypervisorError, Result};
pub use memory::{InMemoryHypervisor, TEST_URI};
pub use snapshot::SnapshotForest;
pub use virsh::{VirshClient, DEFAULT_URI};

/// Client for `uri`. `test://` URIs get the in-process hypervisor.
pub fn connect(uri: &str, timeout: Duration) -> Arc<dyn HypervisorClient> {
    if uri.starts_with("test://") {
        tracing::info!(uri, "Using in-memory hypervisor");
        Arc::new(InMemoryHypervisor::new())
    } else {
        Arc::new(VirshClient::new(uri, timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_picks_in_memory_for_test_uri() {
        let client = connect(TEST_URI, Duration::from_secs(5));
        assert_eq!(client.uri(), TEST_URI);
        assert!(client.ping().await.is_ok());

        let client = connect(DEFAULT_URI, Duration::from_secs(5));
        assert_eq!(client.uri(), DEFAULT_URI);
    }
}
