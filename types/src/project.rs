use std::fmt;
use std::path::{Path, PathBuf};

/// Identity of a project session: its root directory.
///
/// Callers that want symlink-insensitive keys canonicalize before
/// constructing (the registry in `tether-supervisor` does).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProjectKey(PathBuf);

impl ProjectKey {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self(root.into())
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for ProjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

impl From<&Path> for ProjectKey {
    fn from(root: &Path) -> Self {
        Self::new(root)
    }
}

impl From<PathBuf> for ProjectKey {
    fn from(root: PathBuf) -> Self {
        Self(root)
    }
}
