//! Preview lifecycle state machine and the status snapshot handed to callers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::PreviewError;
use crate::project::ProjectId;

/// Lifecycle state of a project's dev server.
///
/// ```text
/// stopped  -> starting           start
/// starting -> running | error    readiness probe answered / timed out
/// running  -> error              process exited on its own
/// error    -> starting           retry
/// starting | running | error -> stopped   stop
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreviewState {
    Stopped,
    Starting,
    Running,
    Error,
}

impl PreviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreviewState::Stopped => "stopped",
            PreviewState::Starting => "starting",
            PreviewState::Running => "running",
            PreviewState::Error => "error",
        }
    }

    /// Whether a process (or an in-flight start) exists in this state.
    pub fn is_active(&self) -> bool {
        matches!(self, PreviewState::Starting | PreviewState::Running)
    }

    pub fn can_transition_to(&self, next: PreviewState) -> bool {
        use PreviewState::*;
        matches!(
            (self, next),
            (Stopped, Starting)
                | (Starting, Running)
                | (Starting, Error)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Error)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl std::fmt::Display for PreviewState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last known state of a project's preview. Cloned out to callers; the
/// supervisor holds the only mutable copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewStatus {
    pub project_id: ProjectId,
    pub state: PreviewState,
    pub pid: Option<u32>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Tail of the process output captured when the preview failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub log_excerpt: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl PreviewStatus {
    pub fn stopped(project_id: ProjectId) -> Self {
        Self {
            project_id,
            state: PreviewState::Stopped,
            pid: None,
            port: None,
            url: None,
            started_at: None,
            last_error: None,
            log_excerpt: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    ///
    /// Entering `starting` clears the previous error; entering `stopped` or
    /// `error` clears the process details, since the port lease is gone.
    pub fn transition(&mut self, next: PreviewState) -> Result<(), PreviewError> {
        if !self.state.can_transition_to(next) {
            return Err(PreviewError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        match next {
            PreviewState::Starting => {
                self.last_error = None;
                self.log_excerpt.clear();
                self.started_at = Some(Utc::now());
            }
            PreviewState::Stopped | PreviewState::Error => {
                self.pid = None;
                self.port = None;
                self.url = None;
            }
            PreviewState::Running => {}
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == PreviewState::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> PreviewStatus {
        PreviewStatus::stopped(ProjectId::new("demo").unwrap())
    }

    #[test]
    fn test_allowed_transitions() {
        use PreviewState::*;
        let allowed = [
            (Stopped, Starting),
            (Starting, Running),
            (Starting, Error),
            (Starting, Stopped),
            (Running, Stopped),
            (Running, Error),
            (Error, Starting),
            (Error, Stopped),
        ];
        for from in [Stopped, Starting, Running, Error] {
            for to in [Stopped, Starting, Running, Error] {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_invalid_transition_is_rejected_without_change() {
        let mut status = status();
        let err = status.transition(PreviewState::Running).unwrap_err();
        assert!(matches!(
            err,
            PreviewError::InvalidTransition {
                from: PreviewState::Stopped,
                to: PreviewState::Running
            }
        ));
        assert_eq!(status.state, PreviewState::Stopped);
    }

    #[test]
    fn test_restart_after_error_clears_failure() {
        let mut status = status();
        status.transition(PreviewState::Starting).unwrap();
        status.port = Some(3100);
        status.transition(PreviewState::Error).unwrap();
        assert_eq!(status.port, None);
        status.last_error = Some("timed out".into());
        status.log_excerpt = vec!["boom".into()];

        status.transition(PreviewState::Starting).unwrap();
        assert_eq!(status.last_error, None);
        assert!(status.log_excerpt.is_empty());
    }

    #[test]
    fn test_stop_clears_process_details() {
        let mut status = status();
        status.transition(PreviewState::Starting).unwrap();
        status.pid = Some(42);
        status.port = Some(3100);
        status.transition(PreviewState::Running).unwrap();
        status.url = Some("http://localhost:3100".into());

        status.transition(PreviewState::Stopped).unwrap();
        assert_eq!((status.pid, status.port, status.url), (None, None, None));
        assert!(status.started_at.is_some());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let mut status = status();
        status.transition(PreviewState::Starting).unwrap();
        status.port = Some(3100);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["projectId"], "demo");
        assert_eq!(json["state"], "starting");
        assert_eq!(json["port"], 3100);
        assert!(json.get("lastError").is_some());
        assert!(json.get("logExcerpt").is_none());
    }
}
