//! Events carried by the hub and their wire envelope.
//!
//! Both transports deliver the same JSON envelope, `{"type": ..., "data": ...}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::project::ProjectId;

use super::subscriber::TransportKind;

/// Kind of a [`StreamEvent`]; serialized as the envelope's `type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Connected,
    Heartbeat,
    /// Chat message or streamed chat tokens from an agent.
    Message,
    ToolUpdate,
    PreviewStatus,
    /// Status changes of agent CLI processes.
    ProcessStatus,
    Error,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Message => "message",
            EventKind::ToolUpdate => "tool-update",
            EventKind::PreviewStatus => "preview-status",
            EventKind::ProcessStatus => "process-status",
            EventKind::Error => "error",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event published to the subscribers of one project.
///
/// Built at publish time and never stored: the hub has no replay buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub kind: EventKind,
    pub project_id: ProjectId,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    data: &'a serde_json::Value,
}

impl StreamEvent {
    pub fn new(kind: EventKind, project_id: ProjectId, payload: serde_json::Value) -> Self {
        Self {
            kind,
            project_id,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Convenience constructor for producers that already hold a serializable payload.
    pub fn from_serialize<T: Serialize>(
        kind: EventKind,
        project_id: ProjectId,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(kind, project_id, serde_json::to_value(payload)?))
    }

    pub fn connected(project_id: ProjectId, transport: TransportKind) -> Self {
        let timestamp = Utc::now();
        let payload = serde_json::json!({
            "projectId": project_id,
            "timestamp": timestamp.to_rfc3339(),
            "transport": transport,
        });
        Self {
            kind: EventKind::Connected,
            project_id,
            payload,
            timestamp,
        }
    }

    pub fn heartbeat(project_id: ProjectId) -> Self {
        let timestamp = Utc::now();
        Self {
            kind: EventKind::Heartbeat,
            project_id,
            payload: serde_json::json!({ "timestamp": timestamp.to_rfc3339() }),
            timestamp,
        }
    }

    /// Serialize into the `{type, data}` envelope.
    pub fn to_json(&self) -> String {
        let envelope = Envelope {
            kind: self.kind,
            data: &self.payload,
        };
        // A `Value` payload with a unit-enum tag cannot fail to serialize.
        serde_json::to_string(&envelope).unwrap_or_else(|_| {
            format!("{{\"type\":\"{}\",\"data\":null}}", self.kind.as_str())
        })
    }
}
