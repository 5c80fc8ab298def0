//! Subscriber handles and the receiving side handed to transports.

use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::project::ProjectId;

use super::StreamHub;
use super::event::StreamEvent;

/// Unique identifier of one subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SubscriberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a subscriber is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    /// One-way HTTP event stream (SSE).
    PushChannel,
    /// Bidirectional WebSocket.
    Socket,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::PushChannel => "push-channel",
            TransportKind::Socket => "socket",
        }
    }
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry entry owned by the hub. Events are pushed into `sink`; the
/// transport task on the other end writes them to the connection.
#[derive(Debug, Clone)]
pub struct SubscriberHandle {
    pub(super) id: SubscriberId,
    pub(super) project_id: ProjectId,
    pub(super) transport: TransportKind,
    pub(super) sink: mpsc::Sender<Arc<StreamEvent>>,
    pub(super) connected_at: DateTime<Utc>,
    pub(super) last_activity_at: DateTime<Utc>,
}

impl SubscriberHandle {
    pub fn new(
        id: SubscriberId,
        project_id: ProjectId,
        transport: TransportKind,
        sink: mpsc::Sender<Arc<StreamEvent>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            project_id,
            transport,
            sink,
            connected_at: now,
            last_activity_at: now,
        }
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }
}

/// Receiving end of a registered subscriber.
///
/// Dropping the subscription unregisters its handle, so a transport that
/// goes away (client abort, socket close) leaves nothing behind in the hub.
#[derive(Debug)]
pub struct Subscription {
    pub(super) id: SubscriberId,
    pub(super) project_id: ProjectId,
    pub(super) transport: TransportKind,
    pub(super) receiver: mpsc::Receiver<Arc<StreamEvent>>,
    pub(super) hub: Weak<StreamHub>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn project_id(&self) -> &ProjectId {
        &self.project_id
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Next event, or `None` once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.receiver.recv().await
    }

    /// Record inbound activity from the client (pong, client message).
    pub fn touch(&self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.touch(&self.project_id, &self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = Arc<StreamEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_stream(&self.project_id, &self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_id_display_is_uuid() {
        let id = SubscriberId::new();
        assert_eq!(format!("{}", id).len(), 36);
        assert_ne!(id, SubscriberId::new());
    }

    #[test]
    fn transport_kind_serializes_kebab_case() {
        assert_eq!(
            serde_json::to_string(&TransportKind::PushChannel).unwrap(),
            "\"push-channel\""
        );
        assert_eq!(TransportKind::Socket.to_string(), "socket");
    }

    #[test]
    fn new_handle_starts_with_activity_at_connect_time() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = SubscriberHandle::new(
            SubscriberId::new(),
            ProjectId::new("demo").unwrap(),
            TransportKind::Socket,
            tx,
        );
        assert_eq!(handle.connected_at(), handle.last_activity_at());
        assert_eq!(handle.transport(), TransportKind::Socket);
    }
}
