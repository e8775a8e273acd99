//! Event bus and state-change detection.
//!
//! Collectors, the change detector, and the operation manager publish typed
//! [`Event`]s; WebSocket sessions and the invalidation router subscribe.
//! Subscribers match on the event topic or on its source domain, so a
//! subscription to `"storage"` receives every storage-domain event while a
//! subscription to `"cpu_usage_change"` receives only those.

pub mod bus;
pub mod detector;

pub use bus::{EventBus, EventStream};
pub use detector::ChangeDetector;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Domain a given event originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    System,
    Docker,
    Vm,
    Storage,
    Sensor,
    Network,
    Operation,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Docker => "docker",
            Self::Vm => "vm",
            Self::Storage => "storage",
            Self::Sensor => "sensor",
            Self::Network => "network",
            Self::Operation => "operation",
        }
    }
}

/// Well-known event topics.
pub mod topics {
    pub const CPU_USAGE_CHANGE: &str = "cpu_usage_change";
    pub const MEMORY_USAGE_CHANGE: &str = "memory_usage_change";
    pub const CONTAINER_COUNT_CHANGE: &str = "container_count_change";
    pub const CONTAINER_STATE_CHANGE: &str = "container_state_change";
    pub const VM_COUNT_CHANGE: &str = "vm_count_change";
    pub const VM_STATE_CHANGE: &str = "vm_state_change";
    pub const DISK_USAGE_CHANGE: &str = "disk_usage_change";
    pub const ARRAY_STATUS_CHANGE: &str = "array_status_change";
    pub const RESOURCE_ALERT: &str = "resource_alert";
    pub const DISK_ADDED: &str = "disk_added";
    pub const DISK_REMOVED: &str = "disk_removed";
    pub const OPERATION_STARTED: &str = "operation_started";
    pub const OPERATION_COMPLETED: &str = "operation_completed";
    pub const OPERATION_FAILED: &str = "operation_failed";
    pub const OPERATION_CANCELLED: &str = "operation_cancelled";
    pub const PARITY_CHECK_COMPLETED: &str = "parity_check_completed";
}

/// A single bus event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Topic name, e.g. `cpu_usage_change`.
    pub topic: String,
    pub source: EventSource,
    /// Resource-level action, used by invalidation strategies. Defaults to
    /// the topic; refined where a topic covers several actions (a
    /// `container_state_change` carries `container_started` or
    /// `container_stopped`).
    pub action: String,
    /// Name of the resource the event concerns (disk, container, vm).
    pub resource: Option<String>,
    pub payload: Value,
    /// Epoch seconds.
    pub timestamp: i64,
}

impl Event {
    pub fn new(source: EventSource, topic: impl Into<String>, payload: Value) -> Self {
        let topic = topic.into();
        Self {
            action: topic.clone(),
            topic,
            source,
            resource: None,
            payload,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    /// Wire form pushed to WebSocket clients: `{type, payload, timestamp}`.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.topic,
            "payload": self.payload,
            "timestamp": self.timestamp,
        })
    }

    /// Whether a subscription naming `filter` should receive this event.
    pub fn matches(&self, filter: &str) -> bool {
        self.topic == filter || self.source.as_str() == filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_matches_topic_and_source() {
        let event = Event::new(
            EventSource::Storage,
            topics::DISK_REMOVED,
            json!({"disk": "sda"}),
        )
        .with_resource("sda");

        assert!(event.matches("disk_removed"));
        assert!(event.matches("storage"));
        assert!(!event.matches("docker"));
    }

    #[test]
    fn wire_form_is_type_payload_timestamp() {
        let event = Event::new(EventSource::System, topics::CPU_USAGE_CHANGE, json!({}));
        let wire = event.to_wire();
        assert_eq!(wire["type"], "cpu_usage_change");
        assert!(wire.get("payload").is_some());
        assert!(wire.get("timestamp").is_some());
        assert!(wire.get("action").is_none());
    }
}
