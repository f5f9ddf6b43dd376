use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use super::ExportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Qcow2,
    Vmdk,
    Vdi,
    Ova,
    Raw,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 5] = [
        ExportFormat::Qcow2,
        ExportFormat::Vmdk,
        ExportFormat::Vdi,
        ExportFormat::Ova,
        ExportFormat::Raw,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Qcow2 => "qcow2",
            ExportFormat::Vmdk => "vmdk",
            ExportFormat::Vdi => "vdi",
            ExportFormat::Ova => "ova",
            ExportFormat::Raw => "raw",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|f| f.as_str() == lower)
            .ok_or_else(|| ExportError::UnsupportedFormat(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Canceled)
    }

    /// pending -> running -> {completed, failed, canceled}; pending may also
    /// be canceled directly.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Running)
                | (JobState::Pending, JobState::Canceled)
                | (JobState::Running, JobState::Completed)
                | (JobState::Running, JobState::Failed)
                | (JobState::Running, JobState::Canceled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportJob {
    pub id: String,
    /// Instance id of the exported VM; export events are keyed by it.
    #[serde(default)]
    pub instance_id: String,
    pub vm_name: String,
    #[serde(default)]
    pub user_id: u64,
    pub format: ExportFormat,
    pub state: JobState,
    pub progress: u8,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub output_path: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExportJob {
    pub fn new(
        vm_name: impl Into<String>,
        format: ExportFormat,
        options: HashMap<String, String>,
        user_id: u64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: String::new(),
            vm_name: vm_name.into(),
            user_id,
            format,
            state: JobState::Pending,
            progress: 0,
            start_time: Utc::now(),
            end_time: None,
            output_path: String::new(),
            options,
            error: None,
        }
    }

    /// Apply a state change if legal. Terminal states also stamp `end_time`.
    pub fn transition(&mut self, next: JobState) -> bool {
        if !self.state.can_transition_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.end_time = Some(Utc::now());
        }
        true
    }

    /// Progress never moves backwards.
    pub fn advance(&mut self, progress: u8) {
        self.progress = self.progress.max(progress.min(100));
    }
}

/// Who requested an export and which instance it belongs to.
#[derive(Debug, Clone, Default)]
pub struct JobOwner {
    pub user_id: u64,
    /// Name recorded on export events.
    pub actor: String,
    /// Defaults to the VM's UUID.
    pub instance_id: Option<String>,
}

impl From<u64> for JobOwner {
    fn from(user_id: u64) -> Self {
        Self {
            user_id,
            actor: user_id.to_string(),
            instance_id: None,
        }
    }
}

/// Body of an export request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportParams {
    /// Empty means the configured default format.
    pub format: String,
    pub file_name: Option<String>,
    pub options: HashMap<String, String>,
}

impl ExportParams {
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            ..Default::default()
        }
    }
}
