//! Build-system file handles and the factory that mints them.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::{contains_uplevel, normalize_path};

/// Handle for a file that may participate in scanning: a source file, a
/// generated output, or a symlink-tree entry.
///
/// Equality and hashing consider the exec path only; two handles with the
/// same exec path denote the same artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    exec_path: PathBuf,
    root_relative: PathBuf,
    source: bool,
}

impl Artifact {
    /// Source artifact in the main tree, whose root-relative path equals its
    /// exec path.
    pub fn source(exec_path: impl Into<PathBuf>) -> Self {
        let exec_path = exec_path.into();
        Self {
            root_relative: exec_path.clone(),
            exec_path,
            source: true,
        }
    }

    /// Source artifact under a root that does not coincide with the exec
    /// root (external repositories, symlink-tree entries).
    pub fn source_with_root_relative(
        exec_path: impl Into<PathBuf>,
        root_relative: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exec_path: exec_path.into(),
            root_relative: root_relative.into(),
            source: true,
        }
    }

    /// Output artifact produced by an upstream action.
    pub fn output(exec_path: impl Into<PathBuf>, root_relative: impl Into<PathBuf>) -> Self {
        Self {
            exec_path: exec_path.into(),
            root_relative: root_relative.into(),
            source: false,
        }
    }

    /// Path relative to the exec root (absolute for files outside it).
    pub fn exec_path(&self) -> &Path {
        &self.exec_path
    }

    /// Path relative to the artifact's own root.
    pub fn root_relative(&self) -> &Path {
        &self.root_relative
    }

    pub fn is_source(&self) -> bool {
        self.source
    }
}

impl PartialEq for Artifact {
    fn eq(&self, other: &Self) -> bool {
        self.exec_path == other.exec_path
    }
}

impl Eq for Artifact {}

impl Hash for Artifact {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.exec_path.hash(state);
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.exec_path.display())
    }
}

/// Resolves logical paths to artifact handles.
pub trait ArtifactFactory: Send + Sync {
    /// Resolve an exec-root-relative path to a source artifact in the main
    /// tree. `None` when the owning package is not loaded.
    fn resolve_source(&self, exec_path: &Path) -> Option<Arc<Artifact>>;

    /// Resolve the include name `name` as written, against the directory of
    /// `includer` and under the includer's root. `None` when the name
    /// escapes that root.
    fn resolve_source_for_includer(&self, name: &Path, includer: &Artifact)
        -> Option<Arc<Artifact>>;

    /// Handle for an include that resolved to an absolute path outside the
    /// exec root.
    fn absolute_source(&self, path: &Path) -> Arc<Artifact>;
}

/// [`ArtifactFactory`] over a single source tree laid out at the exec root.
///
/// Handles are interned, so repeated resolution of one path yields the same
/// allocation.
#[derive(Default)]
pub struct SourceTreeArtifactFactory {
    interned: RwLock<HashMap<PathBuf, Arc<Artifact>>>,
}

impl SourceTreeArtifactFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&self, artifact: Artifact) -> Arc<Artifact> {
        if let Some(existing) = self.interned.read().unwrap().get(artifact.exec_path()) {
            return existing.clone();
        }
        let mut interned = self.interned.write().unwrap();
        interned
            .entry(artifact.exec_path().to_path_buf())
            .or_insert_with(|| Arc::new(artifact))
            .clone()
    }
}

impl ArtifactFactory for SourceTreeArtifactFactory {
    fn resolve_source(&self, exec_path: &Path) -> Option<Arc<Artifact>> {
        Some(self.intern(Artifact::source(normalize_path(exec_path))))
    }

    fn resolve_source_for_includer(
        &self,
        name: &Path,
        includer: &Artifact,
    ) -> Option<Arc<Artifact>> {
        let dir = includer.exec_path().parent().unwrap_or(Path::new(""));
        let exec_path = normalize_path(&dir.join(name));
        let rel_dir = includer.root_relative().parent().unwrap_or(Path::new(""));
        let root_relative = normalize_path(&rel_dir.join(name));
        if contains_uplevel(&root_relative) {
            return None;
        }
        Some(self.intern(Artifact::source_with_root_relative(exec_path, root_relative)))
    }

    fn absolute_source(&self, path: &Path) -> Arc<Artifact> {
        self.intern(Artifact::source_with_root_relative(path, path))
    }
}
