//! Typed error hierarchy for stagehand.
//!
//! Three top-level enums cover the three subsystems:
//! - `HubError`: subscriber registration failures
//! - `PortError`: port allocation failures
//! - `PreviewError`: preview supervisor and installer failures

use thiserror::Error;

use crate::preview::PreviewState;
use crate::project::ProjectId;

/// Rejected project identifiers.
#[derive(Debug, Error)]
pub enum ProjectIdError {
    #[error("Project id must not be empty")]
    Empty,

    #[error("Project id is {len} characters long (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Project id '{0}' contains characters outside [A-Za-z0-9_.-]")]
    InvalidCharacters(String),
}

/// Errors from the event broadcast hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Subscriber limit of {limit} reached; rejecting stream for project {project_id}")]
    CapacityExceeded { limit: usize, project_id: ProjectId },

    #[error("Stream hub is shutting down")]
    Closed,
}

/// Errors from the port allocator.
#[derive(Debug, Error)]
pub enum PortError {
    #[error("No free port in range {start}-{end}")]
    Exhausted { start: u16, end: u16 },

    #[error("Invalid port range {start}-{end}")]
    InvalidRange { start: u16, end: u16 },
}

/// Errors from the preview supervisor.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Port allocation failed: {0}")]
    Allocation(#[from] PortError),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Dev server on port {port} did not become ready within {waited:?}")]
    ReadinessTimeout {
        port: u16,
        waited: std::time::Duration,
    },

    #[error("Dev server exited before becoming ready ({status})")]
    ExitedBeforeReady { status: String },

    #[error("Dev server exited unexpectedly ({status})")]
    ProcessExited { status: String },

    #[error("Workspace for project {project_id} is not ready at {path}")]
    WorkspaceNotReady {
        project_id: ProjectId,
        path: std::path::PathBuf,
    },

    #[error("Dependency install timed out after {timeout_secs}s")]
    InstallTimeout { timeout_secs: u64, output: String },

    #[error("Invalid preview transition {from} -> {to}")]
    InvalidTransition { from: PreviewState, to: PreviewState },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
