//! Event Broadcast Hub: live fan-out of project events to browser sessions.
//!
//! ## Overview
//!
//! ```text
//!  producers                         StreamHub                    transports
//! ┌──────────────┐  publish()  ┌──────────────────────┐  mpsc  ┌──────────────┐
//! │ agent runs   │ ──────────> │ project-a            │ ─────> │ SSE stream   │
//! │ supervisor   │             │   ├── handle 1 (sse) │        └──────────────┘
//! └──────────────┘             │   └── handle 2 (ws)  │ ─────> ┌──────────────┐
//!                              │ project-b            │        │ socket loop  │
//!                              │   └── handle 3 (sse) │        └──────────────┘
//!                              └──────────────────────┘
//!                                 ▲ heartbeat task (30s)
//!                                 ▲ cleanup sweep (5m)
//! ```
//!
//! Delivery is best-effort and at-most-once: an event published while a
//! project has no subscribers is dropped, and nothing is kept for late
//! subscribers. Each handle owns a bounded channel; a closed or full channel
//! counts as a delivery failure and the handle is unregistered on the spot
//! without affecting the other handles of that publish call.
//!
//! All registry mutations and every `publish` run under one lock, so events
//! of a project reach each subscriber in the order `publish` was called.

pub mod backoff;
pub mod event;
pub mod socket;
pub mod sse;
pub mod subscriber;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

use crate::errors::HubError;
use crate::project::ProjectId;

pub use backoff::ReconnectPolicy;
pub use event::{EventKind, StreamEvent};
pub use socket::{SocketSettings, SocketUpgradeRouter};
pub use subscriber::{SubscriberHandle, SubscriberId, Subscription, TransportKind};

/// Tuning knobs for the hub.
#[derive(Debug, Clone)]
pub struct HubConfig {
    pub heartbeat_interval: Duration,
    pub cleanup_interval: Duration,
    /// Handles idle for longer than this are removed by the sweep.
    pub idle_timeout: Duration,
    /// Maximum number of concurrently registered handles across all projects.
    pub max_subscribers: usize,
    /// Per-handle channel capacity.
    pub subscriber_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(3600),
            max_subscribers: 100,
            subscriber_buffer: 256,
        }
    }
}

/// Per-transport subscriber counts of a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriberCounts {
    pub push_channel: usize,
    pub socket: usize,
}

type Registry = HashMap<ProjectId, HashMap<SubscriberId, SubscriberHandle>>;

pub struct StreamHub {
    config: HubConfig,
    streams: Mutex<Registry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl StreamHub {
    /// Create a hub without background tasks. See [`StreamHub::start`].
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Create a hub and spawn its heartbeat and cleanup tasks.
    ///
    /// The tasks only hold a weak reference and are aborted when the hub is
    /// dropped.
    pub fn start(config: HubConfig) -> Arc<Self> {
        let hub = Arc::new(Self::new(config));
        let heartbeat = spawn_periodic(&hub, hub.config.heartbeat_interval, |hub| {
            hub.send_heartbeats();
        });
        let sweep = spawn_periodic(&hub, hub.config.cleanup_interval, |hub| {
            hub.sweep_idle(Utc::now());
        });
        lock(&hub.tasks).extend([heartbeat, sweep]);
        hub
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// Register a new subscriber for `project_id` and return its receiving end.
    pub fn subscribe(
        self: &Arc<Self>,
        project_id: ProjectId,
        transport: TransportKind,
    ) -> Result<Subscription, HubError> {
        let (sink, receiver) = mpsc::channel(self.config.subscriber_buffer.max(1));
        let id = SubscriberId::new();
        let handle = SubscriberHandle::new(id, project_id.clone(), transport, sink);
        self.add_stream(handle)?;
        Ok(Subscription {
            id,
            project_id,
            transport,
            receiver,
            hub: Arc::downgrade(self),
        })
    }

    /// Register `handle` and send it the initial `connected` event.
    ///
    /// Registering a handle whose id is already present is a no-op. Fails
    /// with [`HubError::CapacityExceeded`] once `max_subscribers` handles are
    /// registered; existing subscribers are never evicted. Fails with
    /// [`HubError::Closed`] after [`StreamHub::close_all`].
    pub fn add_stream(&self, handle: SubscriberHandle) -> Result<(), HubError> {
        let mut streams = lock(&self.streams);
        if self.closed.load(Ordering::SeqCst) {
            return Err(HubError::Closed);
        }
        if streams
            .get(&handle.project_id)
            .is_some_and(|handles| handles.contains_key(&handle.id))
        {
            return Ok(());
        }

        let total: usize = streams.values().map(HashMap::len).sum();
        if total >= self.config.max_subscribers {
            tracing::warn!(
                project_id = %handle.project_id,
                limit = self.config.max_subscribers,
                "Rejecting stream registration: subscriber limit reached"
            );
            return Err(HubError::CapacityExceeded {
                limit: self.config.max_subscribers,
                project_id: handle.project_id.clone(),
            });
        }

        let connected = Arc::new(StreamEvent::connected(
            handle.project_id.clone(),
            handle.transport,
        ));
        if let Err(e) = handle.sink.try_send(connected) {
            // Receiver already gone; nothing to register.
            tracing::debug!(subscriber = %handle.id, "Subscriber vanished before registration: {}", e);
            return Ok(());
        }

        tracing::debug!(
            project_id = %handle.project_id,
            subscriber = %handle.id,
            transport = %handle.transport,
            "Stream registered"
        );
        streams
            .entry(handle.project_id.clone())
            .or_default()
            .insert(handle.id, handle);
        Ok(())
    }

    /// Unregister a handle. Unknown or already removed handles are ignored.
    pub fn remove_stream(&self, project_id: &ProjectId, id: &SubscriberId) {
        let mut streams = lock(&self.streams);
        let Some(handles) = streams.get_mut(project_id) else {
            return;
        };
        if handles.remove(id).is_some() {
            tracing::debug!(project_id = %project_id, subscriber = %id, "Stream removed");
        }
        if handles.is_empty() {
            streams.remove(project_id);
        }
    }

    /// Deliver `event` to every subscriber of its project.
    ///
    /// Returns how many handles accepted the event. Never fails: handles
    /// whose delivery fails are logged and unregistered.
    pub fn publish(&self, event: StreamEvent) -> usize {
        let mut streams = lock(&self.streams);
        let Some(handles) = streams.get_mut(&event.project_id) else {
            return 0;
        };

        let project_id = event.project_id.clone();
        let event = Arc::new(event);
        let delivered = deliver(handles, &event, |_| true);
        if handles.is_empty() {
            streams.remove(&project_id);
        }
        delivered
    }

    /// Shorthand for `publish(StreamEvent::new(kind, project_id, payload))`.
    pub fn emit(&self, project_id: &ProjectId, kind: EventKind, payload: serde_json::Value) -> usize {
        self.publish(StreamEvent::new(kind, project_id.clone(), payload))
    }

    /// Send a heartbeat to every push-channel handle. Returns the number sent.
    pub fn send_heartbeats(&self) -> usize {
        let mut streams = lock(&self.streams);
        let mut sent = 0;
        for (project_id, handles) in streams.iter_mut() {
            let heartbeat = Arc::new(StreamEvent::heartbeat(project_id.clone()));
            sent += deliver(handles, &heartbeat, |h| {
                h.transport == TransportKind::PushChannel
            });
        }
        streams.retain(|_, handles| !handles.is_empty());
        sent
    }

    /// Remove handles idle for longer than `idle_timeout` as of `now`, plus
    /// handles whose receiver is already gone. Returns the number removed.
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let idle_timeout = self.config.idle_timeout;
        let mut streams = lock(&self.streams);
        let mut removed = 0;
        for handles in streams.values_mut() {
            handles.retain(|id, handle| {
                let stale = handle.sink.is_closed()
                    || now
                        .signed_duration_since(handle.last_activity_at)
                        .to_std()
                        .is_ok_and(|idle| idle > idle_timeout);
                if stale {
                    tracing::info!(
                        project_id = %handle.project_id,
                        subscriber = %id,
                        last_activity = %handle.last_activity_at,
                        "Sweeping idle stream"
                    );
                    removed += 1;
                }
                !stale
            });
        }
        streams.retain(|_, handles| !handles.is_empty());
        removed
    }

    /// Unregister every handle and refuse new ones.
    ///
    /// Dropping the sinks ends each subscriber's stream, which lets open
    /// push channels and sockets finish so the server can shut down.
    /// Returns the number of handles removed.
    pub fn close_all(&self) -> usize {
        let mut streams = lock(&self.streams);
        self.closed.store(true, Ordering::SeqCst);
        let removed: usize = streams.values().map(HashMap::len).sum();
        streams.clear();
        if removed > 0 {
            tracing::info!(removed, "Closed all streams");
        }
        removed
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Mark a handle as active.
    pub fn touch(&self, project_id: &ProjectId, id: &SubscriberId) {
        let mut streams = lock(&self.streams);
        if let Some(handle) = streams.get_mut(project_id).and_then(|h| h.get_mut(id)) {
            handle.last_activity_at = Utc::now();
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.total_subscribers() < self.config.max_subscribers
    }

    pub fn subscriber_count(&self, project_id: &ProjectId) -> usize {
        lock(&self.streams).get(project_id).map_or(0, HashMap::len)
    }

    pub fn subscriber_counts(&self, project_id: &ProjectId) -> SubscriberCounts {
        let streams = lock(&self.streams);
        let mut counts = SubscriberCounts::default();
        for handle in streams.get(project_id).into_iter().flat_map(HashMap::values) {
            match handle.transport {
                TransportKind::PushChannel => counts.push_channel += 1,
                TransportKind::Socket => counts.socket += 1,
            }
        }
        counts
    }

    pub fn total_subscribers(&self) -> usize {
        lock(&self.streams).values().map(HashMap::len).sum()
    }

    /// Projects with at least one subscriber.
    pub fn active_projects(&self) -> Vec<ProjectId> {
        lock(&self.streams).keys().cloned().collect()
    }

    /// Snapshot of the handles registered for a project.
    pub fn handles(&self, project_id: &ProjectId) -> Vec<SubscriberHandle> {
        lock(&self.streams)
            .get(project_id)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl Drop for StreamHub {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Try to hand `event` to every handle matching `filter`, dropping the ones
/// that fail. Returns the number of successful deliveries.
fn deliver(
    handles: &mut HashMap<SubscriberId, SubscriberHandle>,
    event: &Arc<StreamEvent>,
    filter: impl Fn(&SubscriberHandle) -> bool,
) -> usize {
    let mut delivered = 0;
    let now = Utc::now();
    handles.retain(|id, handle| {
        if !filter(handle) {
            return true;
        }
        match handle.sink.try_send(Arc::clone(event)) {
            Ok(()) => {
                handle.last_activity_at = now;
                delivered += 1;
                true
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(
                    project_id = %handle.project_id,
                    subscriber = %id,
                    kind = %event.kind,
                    "Subscriber closed; unregistering"
                );
                false
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    project_id = %handle.project_id,
                    subscriber = %id,
                    kind = %event.kind,
                    "Subscriber is not keeping up; unregistering"
                );
                false
            }
        }
    });
    delivered
}

fn spawn_periodic(
    hub: &Arc<StreamHub>,
    period: Duration,
    tick: impl Fn(&StreamHub) + Send + 'static,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(hub);
    let period = period.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately; consume it so the first real
        // run happens after one full period.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(hub) = weak.upgrade() else {
                break;
            };
            tick(&hub);
        }
    })
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
