//! Lifecycle events and the delivery seam.
//!
//! Events are published fire-and-forget: callers spawn the publish on a
//! detached task so request latency never depends on the delivery bus.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;
use uuid::Uuid;

/// Event structure version.
pub const STRUCTURE_VERSION: &str = "v2";

// Volume lifecycle events.
pub const VOLUME_CREATED: &str = "volume.created";
pub const VOLUME_DELETED: &str = "volume.deleted";
pub const VOLUME_ATTACHED: &str = "volume.attached";
pub const VOLUME_DETACHED: &str = "volume.detached";

// Volume mount events.
pub const VOLUME_MOUNT_STARTED: &str = "volume.mount.started";
pub const VOLUME_MOUNT_COMPLETED: &str = "volume.mount.completed";
pub const VOLUME_MOUNT_FAILED: &str = "volume.mount.failed";

// Sandbox shutdown volume unmount events.
pub const SHUTDOWN_UNMOUNT_STARTED: &str = "sandbox.shutdown.volume_unmount.started";
pub const SHUTDOWN_UNMOUNT_COMPLETED: &str = "sandbox.shutdown.volume_unmount.completed";
pub const SHUTDOWN_UNMOUNT_FAILED: &str = "sandbox.shutdown.volume_unmount.failed";

// Sandbox run events consumed by the run-ledger projection.
pub const SANDBOX_CREATED: &str = "sandbox.created";
pub const SANDBOX_KILLED: &str = "sandbox.killed";
pub const SANDBOX_PAUSED: &str = "sandbox.paused";
pub const SANDBOX_RESUMED: &str = "sandbox.resumed";

/// Analytics event for volume operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeEvent {
    pub id: Uuid,
    pub version: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    pub volume_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_team_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount_path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_data: Option<HashMap<String, Value>>,
}

impl VolumeEvent {
    /// Create a new event with common fields initialized.
    pub fn new(event_type: &str, volume_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            version: STRUCTURE_VERSION.to_string(),
            event_type: event_type.to_string(),
            timestamp: OffsetDateTime::now_utc(),
            volume_id: volume_id.to_string(),
            volume_name: None,
            sandbox_id: None,
            sandbox_team_id: None,
            mount_path: None,
            error_message: None,
            error_code: None,
            event_data: None,
        }
    }

    pub fn with_volume_name(mut self, name: &str) -> Self {
        self.volume_name = Some(name.to_string());
        self
    }

    pub fn with_team(mut self, team_id: Uuid) -> Self {
        self.sandbox_team_id = Some(team_id);
        self
    }

    pub fn with_sandbox(mut self, sandbox_id: &str) -> Self {
        self.sandbox_id = Some(sandbox_id.to_string());
        self
    }

    pub fn with_mount_path(mut self, mount_path: &str) -> Self {
        self.mount_path = Some(mount_path.to_string());
        self
    }

    pub fn with_error(mut self, message: &str, code: &str) -> Self {
        self.error_message = Some(message.to_string());
        self.error_code = Some(code.to_string());
        self
    }
}

/// Sandbox lifecycle event as carried on the event stream.
///
/// Delivered at least once; consumers must apply it idempotently.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub sandbox_id: String,
    pub sandbox_team_id: Uuid,
    pub sandbox_template_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_build_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_data: Option<HashMap<String, Value>>,
}

impl SandboxEvent {
    /// The `end_reason` carried in the event data, if any.
    pub fn end_reason(&self) -> Option<&str> {
        self.event_data
            .as_ref()
            .and_then(|data| data.get("end_reason"))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Delivery bus for lifecycle events.
///
/// Implementations must be safe to call from detached tasks; callers do not
/// wait for the result.
#[async_trait]
pub trait EventDelivery: Send + Sync + 'static {
    /// Publish one event under a delivery key (typically the team id).
    async fn publish(&self, key: &str, event: &VolumeEvent) -> crate::Result<()>;
}

/// Delivery that drops events. Used when no bus is configured.
pub struct NoopDelivery;

#[async_trait]
impl EventDelivery for NoopDelivery {
    async fn publish(&self, _key: &str, _event: &VolumeEvent) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_event_serializes_without_empty_fields() {
        let event = VolumeEvent::new(VOLUME_CREATED, "vol_abc").with_volume_name("data");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], VOLUME_CREATED);
        assert_eq!(json["volume_id"], "vol_abc");
        assert_eq!(json["volume_name"], "data");
        assert!(json.get("mount_path").is_none());
        assert!(json.get("error_code").is_none());
    }

    #[test]
    fn sandbox_event_end_reason() {
        let payload = serde_json::json!({
            "type": SANDBOX_KILLED,
            "sandbox_id": "sbx1",
            "sandbox_team_id": Uuid::new_v4(),
            "sandbox_template_id": "tmpl",
            "event_data": {"end_reason": "timeout"},
        });
        let event: SandboxEvent = serde_json::from_value(payload).unwrap();
        assert_eq!(event.end_reason(), Some("timeout"));

        let bare = serde_json::json!({
            "type": SANDBOX_KILLED,
            "sandbox_id": "sbx1",
            "sandbox_team_id": Uuid::new_v4(),
            "sandbox_template_id": "tmpl",
        });
        let event: SandboxEvent = serde_json::from_value(bare).unwrap();
        assert_eq!(event.end_reason(), None);
    }
}
