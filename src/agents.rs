//! Registry of agent CLI processes spawned by chat sessions.
//!
//! Producers that launch an agent CLI hand the `Child` over here so the
//! application can stop it later (user pressed stop, project deleted, server
//! shutting down). Status changes are published to the project's
//! subscribers as `process-status` events.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;

use crate::hub::{EventKind, StreamHub};
use crate::project::ProjectId;

/// Time between SIGTERM and a forced kill.
pub const DEFAULT_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// A tracked agent process.
pub struct AgentHandle {
    pub project_id: ProjectId,
    pub process: Child,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProcessInfo {
    pub session_id: String,
    pub project_id: ProjectId,
    pub pid: Option<u32>,
    pub registered_at: DateTime<Utc>,
}

pub struct AgentProcessRegistry {
    hub: Arc<StreamHub>,
    grace: Duration,
    running: Mutex<HashMap<String, AgentHandle>>,
}

impl AgentProcessRegistry {
    pub fn new(hub: Arc<StreamHub>) -> Self {
        Self {
            hub,
            grace: DEFAULT_TERMINATE_GRACE,
            running: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Track `process` under `session_id`, replacing any process previously
    /// registered for that session. Returns the pid.
    pub async fn register(
        &self,
        session_id: impl Into<String>,
        project_id: ProjectId,
        process: Child,
    ) -> Option<u32> {
        let session_id = session_id.into();
        let pid = process.id();
        let handle = AgentHandle {
            project_id: project_id.clone(),
            process,
            registered_at: Utc::now(),
        };
        if self.running.lock().await.insert(session_id.clone(), handle).is_some() {
            tracing::warn!(session = %session_id, "Replaced an agent process that was still registered");
        }
        tracing::info!(session = %session_id, project_id = %project_id, ?pid, "Registered agent process");
        self.announce(&project_id, &session_id, pid, "running");
        pid
    }

    /// Stop tracking a session without signalling its process.
    pub async fn unregister(&self, session_id: &str) -> bool {
        let removed = self.running.lock().await.remove(session_id).is_some();
        if removed {
            tracing::info!(session = %session_id, "Unregistered agent process");
        }
        removed
    }

    /// Terminate the process of `session_id`: SIGTERM, then a kill once the
    /// grace period runs out. Returns `false` if no process was registered
    /// for the session or it could not be killed.
    pub async fn terminate(&self, session_id: &str) -> bool {
        let Some(mut handle) = self.running.lock().await.remove(session_id) else {
            tracing::warn!(session = %session_id, "No agent process registered");
            return false;
        };
        let pid = handle.process.id();
        tracing::info!(session = %session_id, ?pid, "Terminating agent process");

        let terminated = stop_child(&mut handle.process, self.grace).await;
        if terminated {
            self.announce(&handle.project_id, session_id, pid, "terminated");
        } else {
            tracing::error!(session = %session_id, ?pid, "Failed to terminate agent process");
        }
        terminated
    }

    /// Terminate every process of `project_id`. Returns how many were stopped.
    pub async fn terminate_project(&self, project_id: &ProjectId) -> usize {
        let sessions: Vec<String> = self
            .running
            .lock()
            .await
            .iter()
            .filter(|(_, handle)| &handle.project_id == project_id)
            .map(|(session, _)| session.clone())
            .collect();

        let mut terminated = 0;
        for session in sessions {
            if self.terminate(&session).await {
                terminated += 1;
            }
        }
        tracing::info!(project_id = %project_id, terminated, "Terminated project agent processes");
        terminated
    }

    /// Processes still alive. Entries whose process has exited are dropped.
    pub async fn running(&self) -> Vec<AgentProcessInfo> {
        let mut running = self.running.lock().await;
        reap(&mut running);
        let mut infos: Vec<AgentProcessInfo> = running
            .iter()
            .map(|(session, handle)| AgentProcessInfo {
                session_id: session.clone(),
                project_id: handle.project_id.clone(),
                pid: handle.process.id(),
                registered_at: handle.registered_at,
            })
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Drop entries whose process already exited. Returns how many.
    pub async fn cleanup_ended(&self) -> usize {
        let ended = reap(&mut *self.running.lock().await);
        if ended > 0 {
            tracing::info!(ended, "Cleaned up ended agent processes");
        }
        ended
    }

    /// Terminate everything; used on server shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<String> = self.running.lock().await.keys().cloned().collect();
        for session in sessions {
            self.terminate(&session).await;
        }
    }

    fn announce(&self, project_id: &ProjectId, session_id: &str, pid: Option<u32>, status: &str) {
        self.hub.emit(
            project_id,
            EventKind::ProcessStatus,
            serde_json::json!({
                "sessionId": session_id,
                "pid": pid,
                "status": status,
            }),
        );
    }
}

fn reap(running: &mut HashMap<String, AgentHandle>) -> usize {
    let before = running.len();
    running.retain(|session, handle| match handle.process.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            tracing::debug!(session = %session, %status, "Agent process ended");
            false
        }
        Err(e) => {
            tracing::warn!(session = %session, "Could not query agent process: {}", e);
            false
        }
    });
    before - running.len()
}

async fn stop_child(child: &mut Child, grace: Duration) -> bool {
    if let Ok(Some(_)) = child.try_wait() {
        return true;
    }

    #[cfg(unix)]
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(pid, "SIGTERM failed: {}", e);
        }
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return true;
        }
        tracing::warn!(pid, "Graceful termination failed; killing");
    }
    #[cfg(not(unix))]
    let _ = grace;

    match child.kill().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Kill failed: {}", e);
            matches!(child.try_wait(), Ok(Some(_)))
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::hub::{HubConfig, TransportKind};
    use tokio::process::Command;

    fn sh(script: &str) -> Child {
        Command::new("/bin/sh")
            .args(["-c", script])
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    fn registry() -> (Arc<StreamHub>, AgentProcessRegistry) {
        let hub = Arc::new(StreamHub::new(HubConfig::default()));
        let registry = AgentProcessRegistry::new(Arc::clone(&hub)).with_grace(Duration::from_millis(500));
        (hub, registry)
    }

    fn project(name: &str) -> ProjectId {
        ProjectId::new(name).unwrap()
    }

    #[tokio::test]
    async fn test_register_and_list_running() {
        let (_hub, registry) = registry();
        let pid = registry
            .register("demo-chat-1", project("demo"), sh("exec sleep 30"))
            .await;
        assert!(pid.is_some());

        let running = registry.running().await;
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].session_id, "demo-chat-1");
        assert_eq!(running[0].pid, pid);

        registry.shutdown().await;
        assert!(registry.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_unknown_session_is_false() {
        let (_hub, registry) = registry();
        assert!(!registry.terminate("nope").await);
    }

    #[tokio::test]
    async fn test_terminate_removes_and_announces() {
        let (hub, registry) = registry();
        let demo = project("demo");
        let mut sub = hub.subscribe(demo.clone(), TransportKind::Socket).unwrap();
        sub.recv().await.unwrap();

        registry.register("s1", demo.clone(), sh("exec sleep 30")).await;
        assert!(registry.terminate("s1").await);
        assert!(!registry.terminate("s1").await);

        let registered = sub.recv().await.unwrap();
        assert_eq!(registered.kind, EventKind::ProcessStatus);
        assert_eq!(registered.payload["status"], "running");
        let terminated = sub.recv().await.unwrap();
        assert_eq!(terminated.payload["status"], "terminated");
        assert_eq!(terminated.payload["sessionId"], "s1");
    }

    #[tokio::test]
    async fn test_terminate_kills_process_ignoring_sigterm() {
        let (_hub, registry) = registry();
        registry
            .register("stubborn", project("demo"), sh("trap '' TERM; while true; do sleep 0.1; done"))
            .await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.terminate("stubborn").await);
        assert!(registry.running().await.is_empty());
    }

    #[tokio::test]
    async fn test_terminate_project_only_hits_that_project() {
        let (_hub, registry) = registry();
        registry.register("a1", project("a"), sh("exec sleep 30")).await;
        registry.register("a2", project("a"), sh("exec sleep 30")).await;
        registry.register("b1", project("b"), sh("exec sleep 30")).await;

        assert_eq!(registry.terminate_project(&project("a")).await, 2);
        let remaining: Vec<String> = registry
            .running()
            .await
            .into_iter()
            .map(|info| info.session_id)
            .collect();
        assert_eq!(remaining, vec!["b1"]);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_ended_processes_are_cleaned_up() {
        let (_hub, registry) = registry();
        registry.register("quick", project("demo"), sh("exit 0")).await;
        registry.register("slow", project("demo"), sh("exec sleep 30")).await;

        let mut ended = 0;
        for _ in 0..50 {
            ended += registry.cleanup_ended().await;
            if ended > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(ended, 1);
        assert_eq!(registry.running().await.len(), 1);

        assert!(registry.unregister("slow").await);
        assert!(!registry.unregister("slow").await);
    }
}
