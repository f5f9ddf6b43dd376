use chrono::{DateTime, Utc};
use compute_common::{Backend, Instance, InstanceKind, InstanceRequest, InstanceState};
use serde::{Deserialize, Serialize};

use crate::{QuotaError, Result};

pub const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Per-user ceilings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuotas {
    pub user_id: u64,
    pub max_instances: u32,
    pub max_cpu_cores: f64,
    pub max_memory_gb: f64,
    pub max_storage_gb: f64,
    pub max_networks: u32,
    pub allowed_backends: Vec<Backend>,
    pub allowed_kinds: Vec<InstanceKind>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ResourceQuotas {
    /// Quota for a user without an entry.
    pub fn default_for(user_id: u64) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            max_instances: 10,
            max_cpu_cores: 8.0,
            max_memory_gb: 32.0,
            max_storage_gb: 500.0,
            max_networks: 10,
            allowed_backends: Backend::ALL.to_vec(),
            allowed_kinds: InstanceKind::ALL.to_vec(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("max_cpu_cores", self.max_cpu_cores),
            ("max_memory_gb", self.max_memory_gb),
            ("max_storage_gb", self.max_storage_gb),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(QuotaError::InvalidQuota(format!(
                    "{name} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }

    pub fn allows_backend(&self, backend: Backend) -> bool {
        self.allowed_backends.contains(&backend)
    }

    pub fn allows_kind(&self, kind: InstanceKind) -> bool {
        self.allowed_kinds.contains(&kind)
    }
}

/// Ledger entry for one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedInstance {
    pub instance_id: String,
    pub user_id: u64,
    pub backend: Backend,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub state: InstanceState,
}

impl From<&Instance> for TrackedInstance {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id.clone(),
            user_id: instance.user_id,
            backend: instance.backend,
            cpu_cores: instance.resources.cpu.cores,
            memory_bytes: instance.resources.memory.limit,
            state: instance.state,
        }
    }
}

/// Sum over running instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub running: usize,
}

impl Allocation {
    pub fn memory_gb(&self) -> f64 {
        self.memory_bytes as f64 / BYTES_PER_GB
    }
}

/// One user's footprint in the ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UserAllocation {
    pub instances: usize,
    pub running: Allocation,
}

/// What an operation would add to a user's footprint.
#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub user_id: u64,
    pub backend: Backend,
    pub kind: InstanceKind,
    pub cpu_cores: f64,
    pub memory_bytes: u64,
    pub storage_bytes: u64,
    pub networks: usize,
    /// Creates count against `max_instances`.
    pub new_instance: bool,
    /// Instance whose current allocation the admission replaces.
    pub replaces: Option<String>,
}

impl Admission {
    pub fn create(req: &InstanceRequest) -> Self {
        Self {
            user_id: req.user_id,
            backend: req.target_backend(),
            kind: req.kind,
            cpu_cores: req.resources.cpu.cores,
            memory_bytes: req.resources.memory.limit,
            storage_bytes: req.storage.iter().map(|s| s.size).sum(),
            networks: req.networks.len(),
            new_instance: true,
            replaces: None,
        }
    }

    /// Starting an existing instance puts its resources back in play.
    pub fn start(instance: &Instance) -> Self {
        Self {
            user_id: instance.user_id,
            backend: instance.backend,
            kind: instance.kind,
            cpu_cores: instance.resources.cpu.cores,
            memory_bytes: instance.resources.memory.limit,
            storage_bytes: 0,
            networks: 0,
            new_instance: false,
            replaces: Some(instance.id.clone()),
        }
    }

    /// Resizing swaps the instance's allocation for the new one.
    pub fn resize(instance: &Instance, cpu_cores: f64, memory_bytes: u64) -> Self {
        Self {
            cpu_cores,
            memory_bytes,
            ..Self::start(instance)
        }
    }
}
