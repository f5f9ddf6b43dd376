use crate::{Allocation, TrackedInstance, UserAllocation};
use compute_common::InstanceState;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

/// Advisory ledger of what each instance holds. The drivers stay the source
/// of truth; `replace_all` resynchronises from them.
#[derive(Default)]
pub struct ResourceTracker {
    instances: RwLock<HashMap<String, TrackedInstance>>,
}

fn sum_running<'a>(records: impl Iterator<Item = &'a TrackedInstance>) -> Allocation {
    records
        .filter(|r| r.state == InstanceState::Running)
        .fold(Allocation::default(), |mut acc, r| {
            acc.cpu_cores += r.cpu_cores;
            acc.memory_bytes += r.memory_bytes;
            acc.running += 1;
            acc
        })
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the record for `record.instance_id`.
    pub async fn add(&self, record: TrackedInstance) {
        debug!(instance_id = %record.instance_id, state = ?record.state, "Tracking instance");
        self.instances
            .write()
            .await
            .insert(record.instance_id.clone(), record);
    }

    /// Returns false when the instance is not tracked.
    pub async fn update_state(&self, instance_id: &str, state: InstanceState) -> bool {
        match self.instances.write().await.get_mut(instance_id) {
            Some(record) => {
                record.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn update_resources(
        &self,
        instance_id: &str,
        cpu_cores: f64,
        memory_bytes: u64,
    ) -> bool {
        match self.instances.write().await.get_mut(instance_id) {
            Some(record) => {
                record.cpu_cores = cpu_cores;
                record.memory_bytes = memory_bytes;
                true
            }
            None => false,
        }
    }

    pub async fn remove(&self, instance_id: &str) -> Option<TrackedInstance> {
        self.instances.write().await.remove(instance_id)
    }

    pub async fn get(&self, instance_id: &str) -> Option<TrackedInstance> {
        self.instances.read().await.get(instance_id).cloned()
    }

    /// Copy of every record.
    pub async fn records(&self) -> Vec<TrackedInstance> {
        self.instances.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.instances.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.instances.read().await.is_empty()
    }

    /// CPU and memory held by running instances.
    pub async fn total_allocated(&self) -> Allocation {
        sum_running(self.instances.read().await.values())
    }

    /// A user's instance count plus the running allocation, optionally
    /// leaving one instance out.
    pub async fn user_allocation(&self, user_id: u64, exclude: Option<&str>) -> UserAllocation {
        let guard = self.instances.read().await;
        let owned = || {
            guard
                .values()
                .filter(move |r| r.user_id == user_id)
                .filter(move |r| Some(r.instance_id.as_str()) != exclude)
        };
        UserAllocation {
            instances: owned().count(),
            running: sum_running(owned()),
        }
    }

    /// Swap the whole ledger for a fresh view from the drivers.
    pub async fn replace_all(&self, records: impl IntoIterator<Item = TrackedInstance>) {
        let fresh: HashMap<_, _> = records
            .into_iter()
            .map(|r| (r.instance_id.clone(), r))
            .collect();
        *self.instances.write().await = fresh;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use compute_common::Backend;

    fn record(id: &str, user: u64, cores: f64, state: InstanceState) -> TrackedInstance {
        TrackedInstance {
            instance_id: id.to_string(),
            user_id: user,
            backend: Backend::ContainerEngine,
            cpu_cores: cores,
            memory_bytes: 1024,
            state,
        }
    }

    #[tokio::test]
    async fn test_totals_count_running_only() {
        let tracker = ResourceTracker::new();
        tracker.add(record("a", 1, 2.0, InstanceState::Running)).await;
        tracker.add(record("b", 1, 4.0, InstanceState::Stopped)).await;

        let total = tracker.total_allocated().await;
        assert_eq!(total.cpu_cores, 2.0);
        assert_eq!(total.memory_bytes, 1024);
        assert_eq!(total.running, 1);

        assert!(tracker.update_state("b", InstanceState::Running).await);
        assert_eq!(tracker.total_allocated().await.cpu_cores, 6.0);
        assert!(!tracker.update_state("missing", InstanceState::Running).await);
    }

    #[tokio::test]
    async fn test_user_allocation_excludes_instance() {
        let tracker = ResourceTracker::new();
        tracker.add(record("a", 1, 2.0, InstanceState::Running)).await;
        tracker.add(record("b", 1, 1.0, InstanceState::Running)).await;
        tracker.add(record("c", 2, 8.0, InstanceState::Running)).await;

        let mine = tracker.user_allocation(1, None).await;
        assert_eq!(mine.instances, 2);
        assert_eq!(mine.running.cpu_cores, 3.0);

        let without_a = tracker.user_allocation(1, Some("a")).await;
        assert_eq!(without_a.instances, 1);
        assert_eq!(without_a.running.cpu_cores, 1.0);
    }

    #[tokio::test]
    async fn test_remove_and_replace() {
        let tracker = ResourceTracker::new();
        tracker.add(record("a", 1, 2.0, InstanceState::Running)).await;
        assert!(tracker.remove("a").await.is_some());
        assert!(tracker.is_empty().await);

        tracker
            .replace_all(vec![
                record("x", 1, 1.0, InstanceState::Running),
                record("y", 1, 1.0, InstanceState::Paused),
            ])
            .await;
        assert_eq!(tracker.len().await, 2);
        assert_eq!(tracker.total_allocated().await.running, 1);
    }
}
