use crate::{ResourceQuotas, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[async_trait]
pub trait QuotaStorage: Send + Sync {
    async fn get_quota(&self, user_id: u64) -> Result<Option<ResourceQuotas>>;
    async fn put_quota(&self, quota: &ResourceQuotas) -> Result<()>;
    async fn delete_quota(&self, user_id: u64) -> Result<bool>;
    async fn list_quotas(&self) -> Result<Vec<ResourceQuotas>>;
}

// Process-local storage; quotas do not survive a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    quotas: Arc<RwLock<HashMap<u64, ResourceQuotas>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quotas(quotas: impl IntoIterator<Item = ResourceQuotas>) -> Self {
        Self {
            quotas: Arc::new(RwLock::new(
                quotas.into_iter().map(|q| (q.user_id, q)).collect(),
            )),
        }
    }
}

#[async_trait]
impl QuotaStorage for InMemoryStorage {
    async fn get_quota(&self, user_id: u64) -> Result<Option<ResourceQuotas>> {
        Ok(self.quotas.read().await.get(&user_id).cloned())
    }

    async fn put_quota(&self, quota: &ResourceQuotas) -> Result<()> {
        self.quotas
            .write()
            .await
            .insert(quota.user_id, quota.clone());
        Ok(())
    }

    async fn delete_quota(&self, user_id: u64) -> Result<bool> {
        Ok(self.quotas.write().await.remove(&user_id).is_some())
    }

    async fn list_quotas(&self) -> Result<Vec<ResourceQuotas>> {
        let mut quotas: Vec<_> = self.quotas.read().await.values().cloned().collect();
        quotas.sort_by_key(|q| q.user_id);
        Ok(quotas)
    }
}
