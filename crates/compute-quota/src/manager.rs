use crate::{Admission, QuotaError, QuotaStorage, ResourceQuotas, ResourceTracker, Result, BYTES_PER_GB};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

pub struct QuotaManager {
    storage: Arc<dyn QuotaStorage>,
    tracker: Arc<ResourceTracker>,
    /// Check ceilings against the tracker, not only the allow-lists.
    enforce_usage: bool,
}

impl QuotaManager {
    pub fn new(storage: Arc<dyn QuotaStorage>, tracker: Arc<ResourceTracker>) -> Self {
        Self {
            storage,
            tracker,
            enforce_usage: true,
        }
    }

    pub fn with_usage_enforcement(mut self, enforce: bool) -> Self {
        self.enforce_usage = enforce;
        self
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.tracker
    }

    /// Stored quota, or the default for users without one.
    pub async fn get_quota(&self, user_id: u64) -> Result<ResourceQuotas> {
        Ok(self
            .storage
            .get_quota(user_id)
            .await?
            .unwrap_or_else(|| ResourceQuotas::default_for(user_id)))
    }

    pub async fn set_quota(&self, mut quota: ResourceQuotas) -> Result<ResourceQuotas> {
        quota.validate()?;
        let now = Utc::now();
        quota.created_at = match self.storage.get_quota(quota.user_id).await? {
            Some(existing) => existing.created_at,
            None => now,
        };
        quota.updated_at = now;
        self.storage.put_quota(&quota).await?;
        info!(user_id = quota.user_id, "Quota updated");
        Ok(quota)
    }

    pub async fn reset_quota(&self, user_id: u64) -> Result<bool> {
        self.storage.delete_quota(user_id).await
    }

    pub async fn list_quotas(&self) -> Result<Vec<ResourceQuotas>> {
        self.storage.list_quotas().await
    }

    /// Admission check. Allow-lists always apply; ceilings apply when usage
    /// enforcement is on.
    pub async fn check(&self, admission: &Admission) -> Result<()> {
        let quota = self.get_quota(admission.user_id).await?;

        if !quota.allows_backend(admission.backend) {
            return Err(QuotaError::NotAllowed(format!(
                "backend {} is not allowed for user {}",
                admission.backend, admission.user_id
            )));
        }
        if !quota.allows_kind(admission.kind) {
            return Err(QuotaError::NotAllowed(format!(
                "instance kind {} is not allowed for user {}",
                admission.kind, admission.user_id
            )));
        }

        let storage_gb = admission.storage_bytes as f64 / BYTES_PER_GB;
        if storage_gb > quota.max_storage_gb {
            return Err(QuotaError::LimitExceeded {
                message: format!(
                    "storage limit exceeded: {storage_gb:.2} GB > {} GB",
                    quota.max_storage_gb
                ),
            });
        }
        if admission.networks > quota.max_networks as usize {
            return Err(QuotaError::LimitExceeded {
                message: format!(
                    "network limit exceeded: {} > {}",
                    admission.networks, quota.max_networks
                ),
            });
        }

        if !self.enforce_usage {
            return Ok(());
        }

        let current = self
            .tracker
            .user_allocation(admission.user_id, admission.replaces.as_deref())
            .await;
        debug!(
            user_id = admission.user_id,
            instances = current.instances,
            cpu = current.running.cpu_cores,
            memory_bytes = current.running.memory_bytes,
            "Checking quota"
        );

        if admission.new_instance && current.instances + 1 > quota.max_instances as usize {
            return Err(QuotaError::LimitExceeded {
                message: format!(
                    "instance limit exceeded: {} + 1 > {}",
                    current.instances, quota.max_instances
                ),
            });
        }

        let cpu = current.running.cpu_cores + admission.cpu_cores;
        if cpu > quota.max_cpu_cores {
            return Err(QuotaError::LimitExceeded {
                message: format!(
                    "CPU limit exceeded: {} + {} > {}",
                    current.running.cpu_cores, admission.cpu_cores, quota.max_cpu_cores
                ),
            });
        }

        let memory_gb = current.running.memory_gb() + admission.memory_bytes as f64 / BYTES_PER_GB;
        if memory_gb > quota.max_memory_gb {
            return Err(QuotaError::LimitExceeded {
                message: format!(
                    "memory limit exceeded: {memory_gb:.2} GB > {} GB",
                    quota.max_memory_gb
                ),
            });
        }

        Ok(())
    }
}
