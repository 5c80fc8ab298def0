//! Project identifiers shared by the hub, the preview supervisor and the API.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ProjectIdError;

const MAX_PROJECT_ID_LEN: usize = 128;

/// Identifier of a generated project.
///
/// Project ids end up in filesystem paths (the project's workspace) and in
/// URL path segments, so only `[A-Za-z0-9_.-]` is accepted and the dot-only
/// names `.` and `..` are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProjectId(String);

impl ProjectId {
    pub fn new(raw: impl Into<String>) -> Result<Self, ProjectIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(ProjectIdError::Empty);
        }
        if raw.len() > MAX_PROJECT_ID_LEN {
            return Err(ProjectIdError::TooLong {
                len: raw.len(),
                max: MAX_PROJECT_ID_LEN,
            });
        }
        if raw == "." || raw == ".." {
            return Err(ProjectIdError::InvalidCharacters(raw));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        {
            return Err(ProjectIdError::InvalidCharacters(raw));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ProjectId {
    type Err = ProjectIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ProjectId {
    type Error = ProjectIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ProjectId> for String {
    fn from(id: ProjectId) -> Self {
        id.0
    }
}

impl AsRef<str> for ProjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        for raw in ["demo", "proj-123", "a_b.c", "0f8c2b7e-1d2a-4c55-9a61-1c1e3a5b7d90"] {
            assert!(ProjectId::new(raw).is_ok(), "{raw} should be accepted");
        }
    }

    #[test]
    fn rejects_empty_and_traversal() {
        assert!(matches!(ProjectId::new(""), Err(ProjectIdError::Empty)));
        assert!(ProjectId::new("..").is_err());
        assert!(ProjectId::new(".").is_err());
        assert!(ProjectId::new("../etc").is_err());
        assert!(ProjectId::new("a/b").is_err());
        assert!(ProjectId::new("with space").is_err());
    }

    #[test]
    fn rejects_overlong_ids() {
        let raw = "x".repeat(MAX_PROJECT_ID_LEN + 1);
        match ProjectId::new(raw) {
            Err(ProjectIdError::TooLong { len, max }) => {
                assert_eq!(len, MAX_PROJECT_ID_LEN + 1);
                assert_eq!(max, MAX_PROJECT_ID_LEN);
            }
            other => panic!("Expected TooLong, got {:?}", other),
        }
    }

    #[test]
    fn serde_uses_plain_string() {
        let id = ProjectId::new("demo").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"demo\"");
        let back: ProjectId = serde_json::from_str("\"demo\"").unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ProjectId>("\"../x\"").is_err());
    }
}
