//! Socket transport: WebSocket upgrades routed to the hub by project id.
//!
//! Upgrade requests under the configured prefix (default `/api/chat`) are
//! accepted; the trailing non-empty path segment names the project. Other
//! paths never reach this handler, so other upgrade consumers mounted on the
//! same router are unaffected.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use tokio::time::Instant;

use crate::errors::HubError;
use crate::project::ProjectId;

use super::{StreamHub, Subscription, TransportKind};

#[derive(Debug, Clone)]
pub struct SocketSettings {
    /// Path prefix handled by the router, without trailing slash.
    pub path_prefix: String,
    /// Time allowed between upgrade and the `connected` frame being written.
    pub handshake_timeout: Duration,
    /// How often to send WebSocket Ping frames.
    pub ping_interval: Duration,
    /// How long to wait for a Pong before considering the connection dead.
    pub pong_timeout: Duration,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            path_prefix: "/api/chat".to_string(),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

/// Installs the socket upgrade route on a router, once.
#[derive(Debug)]
pub struct SocketUpgradeRouter {
    settings: Arc<SocketSettings>,
    installed: AtomicBool,
}

impl SocketUpgradeRouter {
    pub fn new(mut settings: SocketSettings) -> Self {
        let trimmed = settings.path_prefix.trim_end_matches('/');
        settings.path_prefix = if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        };
        Self {
            settings: Arc::new(settings),
            installed: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &SocketSettings {
        &self.settings
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Add the upgrade route to `router`.
    ///
    /// Only the first call installs the route; later calls return `router`
    /// unchanged.
    pub fn mount<S>(&self, router: Router<S>, hub: Arc<StreamHub>) -> Router<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        if self.installed.swap(true, Ordering::SeqCst) {
            tracing::debug!(prefix = %self.settings.path_prefix, "Socket router already installed");
            return router;
        }

        let path = format!("{}/{{*rest}}", self.settings.path_prefix);
        tracing::debug!(path = %path, "Installing socket upgrade route");
        let settings = Arc::clone(&self.settings);
        router.route(
            &path,
            get(move |Path(rest): Path<String>, ws: WebSocketUpgrade| {
                let hub = Arc::clone(&hub);
                let settings = Arc::clone(&settings);
                async move { upgrade(ws, rest, hub, settings) }
            }),
        )
    }
}

/// Trailing non-empty segment of the path remainder after the prefix.
pub fn project_id_from_path(rest: &str) -> Option<&str> {
    rest.rsplit('/').find(|segment| !segment.is_empty())
}

fn upgrade(
    ws: WebSocketUpgrade,
    rest: String,
    hub: Arc<StreamHub>,
    settings: Arc<SocketSettings>,
) -> Response {
    let project_id = match project_id_from_path(&rest).map(ProjectId::new) {
        Some(Ok(id)) => id,
        Some(Err(e)) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
        None => return (StatusCode::BAD_REQUEST, "Missing project id").into_response(),
    };

    // Reject before upgrading so the client sees a plain HTTP error.
    if !hub.has_capacity() {
        tracing::warn!(project_id = %project_id, "Rejecting socket upgrade: subscriber limit reached");
        return (StatusCode::SERVICE_UNAVAILABLE, "Subscriber limit reached").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, hub, project_id, settings))
}

async fn handle_socket(
    socket: WebSocket,
    hub: Arc<StreamHub>,
    project_id: ProjectId,
    settings: Arc<SocketSettings>,
) {
    let (mut sender, receiver) = socket.split();

    // Capacity may have been taken between the check and the upgrade.
    let mut subscription = match hub.subscribe(project_id.clone(), TransportKind::Socket) {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(project_id = %project_id, "Closing socket: {}", e);
            let (code, reason) = match e {
                HubError::CapacityExceeded { .. } => (close_code::AGAIN, "subscriber limit reached"),
                HubError::Closed => (close_code::AWAY, "server shutting down"),
            };
            let _ = sender
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    let greeting = async {
        let connected = subscription.recv().await?;
        sender
            .send(Message::Text(connected.to_json().into()))
            .await
            .ok()
    };
    match tokio::time::timeout(settings.handshake_timeout, greeting).await {
        Ok(Some(())) => {}
        Ok(None) => return,
        Err(_) => {
            tracing::warn!(
                project_id = %project_id,
                timeout_secs = settings.handshake_timeout.as_secs(),
                "Socket handshake timed out"
            );
            return;
        }
    }

    tracing::info!(project_id = %project_id, subscriber = %subscription.id(), "Socket connected");
    run_socket_loop(sender, receiver, &mut subscription, &settings).await;
    tracing::info!(project_id = %project_id, subscriber = %subscription.id(), "Socket disconnected");
}

/// Forward hub events to the socket while keeping the connection alive.
///
/// Exits when the client closes, a write fails, the hub drops the
/// subscriber, or no Pong arrives within the pong timeout.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    subscription: &mut Subscription,
    settings: &SocketSettings,
) {
    let mut ping_interval = tokio::time::interval(settings.ping_interval);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > settings.pong_timeout {
                    tracing::debug!(subscriber = %subscription.id(), "Pong timeout");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            event = subscription.recv() => {
                let Some(event) = event else {
                    // Unregistered by the hub (delivery failure or sweep).
                    break;
                };
                if sender.send(Message::Text(event.to_json().into())).await.is_err() {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                        subscription.touch();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // Inbound chat traffic goes through the HTTP API; any
                        // frame still counts as activity.
                        subscription.touch();
                    }
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}
