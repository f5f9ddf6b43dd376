use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Lifecycle,
    Resource,
    Error,
    Info,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::Resource => "resource",
            Self::Error => "error",
            Self::Info => "info",
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lifecycle" => Ok(Self::Lifecycle),
            "resource" => Ok(Self::Resource),
            "error" => Ok(Self::Error),
            "info" => Ok(Self::Info),
            _ => Err(format!("Invalid event type: {s}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceEvent {
    pub id: String,
    pub instance_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub action: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub user: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl InstanceEvent {
    pub fn new(
        instance_id: impl Into<String>,
        event_type: EventType,
        action: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            instance_id: instance_id.into(),
            event_type,
            action: action.into(),
            status: status.into(),
            message: String::new(),
            user: String::new(),
            timestamp: Utc::now(),
            details: HashMap::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// History selection for replay subscriptions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventFilter {
    pub types: Vec<EventType>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub follow: bool,
}

impl EventFilter {
    pub fn matches(&self, event: &InstanceEvent) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        if self.since.is_some_and(|since| event.timestamp < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.timestamp > until) {
            return false;
        }
        true
    }
}
