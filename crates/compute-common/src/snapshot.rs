use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Domain state captured by a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotState {
    Running,
    Paused,
    Shutoff,
    Crashed,
}

/// Node in a per-instance snapshot forest. Edges are snapshot ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub instance_id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub state: SnapshotState,
    pub size_bytes: u64,
    pub is_current: bool,
    pub has_memory: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotParams {
    pub name: String,
    pub description: String,
    pub include_memory: bool,
    pub quiesce: bool,
    /// Parent snapshot name or id; defaults to the current snapshot.
    pub parent: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Owned tree view of a snapshot forest, built on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotTree {
    #[serde(flatten)]
    pub snapshot: Snapshot,
    pub nodes: Vec<SnapshotTree>,
}
