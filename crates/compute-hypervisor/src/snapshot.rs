//! Per-instance snapshot forest. Nodes live in an arena keyed by snapshot id
//! and refer to each other only by id.

use chrono::Utc;
use compute_common::{Snapshot, SnapshotParams, SnapshotState, SnapshotTree};
use std::collections::{HashMap, HashSet};

use crate::client::SnapshotInfo;
use crate::error::{HypervisorError, Result};

#[derive(Debug, Clone, Default)]
pub struct SnapshotForest {
    instance_id: String,
    nodes: HashMap<String, Snapshot>,
    /// Creation order; list and tree output follow it.
    order: Vec<String>,
    current: Option<String>,
}

impl SnapshotForest {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.current.as_ref().and_then(|id| self.nodes.get(id))
    }

    /// Find by id, then by name.
    pub fn resolve(&self, key: &str) -> Option<&Snapshot> {
        self.nodes
            .get(key)
            .or_else(|| self.nodes.values().find(|s| s.name == key))
    }

    fn resolve_id(&self, key: &str) -> Result<String> {
        self.resolve(key)
            .map(|s| s.id.clone())
            .ok_or_else(|| HypervisorError::SnapshotNotFound(key.to_string()))
    }

    /// Record a new snapshot under `params.parent`, or under the current
    /// snapshot when no parent is given. The new snapshot becomes current.
    pub fn insert(
        &mut self,
        params: &SnapshotParams,
        state: SnapshotState,
        size_bytes: u64,
    ) -> Result<Snapshot> {
        if self.nodes.values().any(|s| s.name == params.name) {
            return Err(HypervisorError::SnapshotExists(params.name.clone()));
        }
        let parent_id = match params.parent.as_deref() {
            Some(parent) => Some(self.resolve_id(parent)?),
            None => self.current.clone(),
        };

        let snapshot = Snapshot {
            id: uuid::Uuid::new_v4().to_string(),
            name: params.name.clone(),
            description: params.description.clone(),
            instance_id: self.instance_id.clone(),
            parent_id: parent_id.clone(),
            children: Vec::new(),
            state,
            size_bytes,
            is_current: false,
            has_memory: params.include_memory,
            created_at: Utc::now(),
            metadata: params.metadata.clone(),
        };

        if let Some(parent) = parent_id.as_ref().and_then(|id| self.nodes.get_mut(id)) {
            parent.children.push(snapshot.id.clone());
        }
        let id = snapshot.id.clone();
        self.nodes.insert(id.clone(), snapshot);
        self.order.push(id.clone());
        self.set_current_id(Some(id.clone()));
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| HypervisorError::SnapshotNotFound(id))
    }

    /// Rebuild the forest from the hypervisor's listing. Snapshots already
    /// known keep their id, description, size and metadata; the rest get
    /// fresh ids. Parents missing from the listing leave their children as
    /// roots.
    pub fn sync(&mut self, listing: &[SnapshotInfo]) {
        let known: HashMap<String, (usize, Snapshot)> = self
            .order
            .iter()
            .enumerate()
            .filter_map(|(i, id)| self.nodes.get(id).map(|s| (s.name.clone(), (i, s.clone()))))
            .collect();

        let mut entries: Vec<&SnapshotInfo> = listing.iter().collect();
        entries.sort_by(|a, b| {
            let rank = |e: &SnapshotInfo| known.get(&e.name).map_or(usize::MAX, |(i, _)| *i);
            rank(a)
                .cmp(&rank(b))
                .then(a.created_at.cmp(&b.created_at))
                .then(a.name.cmp(&b.name))
        });

        let ids: HashMap<&str, String> = entries
            .iter()
            .map(|e| {
                let id = known
                    .get(&e.name)
                    .map(|(_, s)| s.id.clone())
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                (e.name.as_str(), id)
            })
            .collect();

        let mut nodes = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());
        let mut current = None;
        for entry in &entries {
            let id = ids[entry.name.as_str()].clone();
            let previous = known.get(&entry.name).map(|(_, s)| s);
            let parent_id = entry
                .parent
                .as_deref()
                .and_then(|p| ids.get(p))
                .filter(|pid| **pid != id)
                .cloned();
            if entry.is_current {
                current = Some(id.clone());
            }
            nodes.insert(
                id.clone(),
                Snapshot {
                    id: id.clone(),
                    name: entry.name.clone(),
                    description: previous.map(|s| s.description.clone()).unwrap_or_default(),
                    instance_id: self.instance_id.clone(),
                    parent_id,
                    children: Vec::new(),
                    state: entry
                        .state
                        .or_else(|| previous.map(|s| s.state))
                        .unwrap_or(SnapshotState::Shutoff),
                    size_bytes: previous.map_or(0, |s| s.size_bytes),
                    is_current: false,
                    has_memory: entry.has_memory(),
                    created_at: entry
                        .created_at
                        .or_else(|| previous.map(|s| s.created_at))
                        .unwrap_or_else(Utc::now),
                    metadata: previous.map(|s| s.metadata.clone()).unwrap_or_default(),
                },
            );
            order.push(id);
        }
        for id in &order {
            let parent = nodes.get(id).and_then(|s: &Snapshot| s.parent_id.clone());
            if let Some(parent) = parent.and_then(|pid| nodes.get_mut(&pid)) {
                parent.children.push(id.clone());
            }
        }

        self.nodes = nodes;
        self.order = order;
        self.set_current_id(current);
    }

    /// Remove a snapshot; its children are re-parented to its parent.
    pub fn remove(&mut self, key: &str) -> Result<Snapshot> {
        let id = self.resolve_id(key)?;
        let removed = self
            .nodes
            .remove(&id)
            .ok_or_else(|| HypervisorError::SnapshotNotFound(key.to_string()))?;
        self.order.retain(|o| o != &id);

        for child_id in &removed.children {
            if let Some(child) = self.nodes.get_mut(child_id) {
                child.parent_id = removed.parent_id.clone();
            }
        }
        if let Some(parent) = removed
            .parent_id
            .as_ref()
            .and_then(|pid| self.nodes.get_mut(pid))
        {
            parent.children.retain(|c| c != &id);
            parent.children.extend(removed.children.iter().cloned());
        }

        if self.current.as_deref() == Some(id.as_str()) {
            self.set_current_id(removed.parent_id.clone());
        }
        Ok(removed)
    }

    pub fn set_current(&mut self, key: &str) -> Result<Snapshot> {
        let id = self.resolve_id(key)?;
        self.set_current_id(Some(id.clone()));
        self.nodes
            .get(&id)
            .cloned()
            .ok_or_else(|| HypervisorError::SnapshotNotFound(id))
    }

    fn set_current_id(&mut self, id: Option<String>) {
        for node in self.nodes.values_mut() {
            node.is_current = Some(&node.id) == id.as_ref();
        }
        self.current = id;
    }

    /// Flat list in creation order.
    pub fn list(&self) -> Vec<Snapshot> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .cloned()
            .collect()
    }

    pub fn roots(&self) -> Vec<&Snapshot> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .filter(|s| s.parent_id.is_none())
            .collect()
    }

    pub fn tree(&self) -> Vec<SnapshotTree> {
        let mut visited = HashSet::new();
        self.roots()
            .into_iter()
            .filter_map(|root| self.subtree(&root.id, &mut visited))
            .collect()
    }

    fn subtree(&self, id: &str, visited: &mut HashSet<String>) -> Option<SnapshotTree> {
        if !visited.insert(id.to_string()) {
            return None;
        }
        let snapshot = self.nodes.get(id)?.clone();
        let nodes = snapshot
            .children
            .iter()
            .filter_map(|child| self.subtree(child, visited))
            .collect();
        Some(SnapshotTree { snapshot, nodes })
    }

    /// Every node reaches a root by following parents, and every parent exists.
    pub fn is_acyclic(&self) -> bool {
        self.nodes.values().all(|node| {
            let mut seen = HashSet::new();
            let mut cursor = Some(node);
            while let Some(n) = cursor {
                if !seen.insert(n.id.as_str()) {
                    return false;
                }
                cursor = match &n.parent_id {
                    Some(pid) => match self.nodes.get(pid) {
                        Some(parent) => Some(parent),
                        None => return false,
                    },
                    None => None,
                };
            }
            true
        })
    }
}
