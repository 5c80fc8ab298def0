//! Where a project's source tree lives on disk.

use std::path::{Path, PathBuf};

use crate::errors::PreviewError;
use crate::project::ProjectId;

/// Supplies the working directory a project's processes run in.
pub trait WorkspaceResolver: Send + Sync {
    fn resolve(&self, project_id: &ProjectId) -> Result<PathBuf, PreviewError>;
}

/// Projects materialized as `<root>/<project id>/repo`.
#[derive(Debug, Clone)]
pub struct ProjectsRoot {
    root: PathBuf,
}

impl ProjectsRoot {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repo_path(&self, project_id: &ProjectId) -> PathBuf {
        self.root.join(project_id.as_str()).join("repo")
    }
}

impl WorkspaceResolver for ProjectsRoot {
    fn resolve(&self, project_id: &ProjectId) -> Result<PathBuf, PreviewError> {
        let path = self.repo_path(project_id);
        if path.is_dir() {
            Ok(path)
        } else {
            Err(PreviewError::WorkspaceNotReady {
                project_id: project_id.clone(),
                path,
            })
        }
    }
}
