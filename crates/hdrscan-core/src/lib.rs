//! Transitive `#include` scanning for hermetic C/C++ compilation.
//!
//! The scanner computes, for a set of translation units, the closed set of
//! header files participating in their compilation, without running a real
//! preprocessor: it extracts textual `#include` / `#include_next` directives
//! from each file, resolves them against a configured search path, and
//! recurses over the resulting DAG on a bounded pool.
//!
//! The entry point is [`scanner::IncludeScanner`]. Collaborators the outer
//! build framework supplies (the artifact factory, the inclusion extractor,
//! the hint database, the action environment) are trait seams with default
//! implementations suitable for standalone use and tests.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub mod artifact;
mod error;
pub mod hints;
pub mod inclusion;
pub mod parse;
mod path_cache;
pub mod scanner;

pub use artifact::{Artifact, ArtifactFactory, SourceTreeArtifactFactory};
pub use error::ScanError;
pub use hints::{ActionEnv, Hints, HintsRegistry, ReadyEnv};
pub use inclusion::{
    IncludeKind, Inclusion, InclusionWithContext, LocateResult, SearchFlavor, RELATIVE_POS,
    TOP_LEVEL_POS,
};
pub use parse::{InclusionExtractor, ParseCache, TextIncludeExtractor};
pub use path_cache::PathExistenceCache;
pub use scanner::{
    CancelFlag, HeaderData, IncludeScanner, IncludeSet, ScanStrategy, ScannerConfig, SearchPaths,
};

/// Abstraction for file system access so the scanner can run against an
/// in-memory tree in tests.
pub trait FileSystem: Send + Sync {
    /// Read the contents of the file at `path`.
    fn read_file(&self, path: &Path) -> Result<String, ScanError>;

    /// Whether `path` names an existing regular file.
    fn is_file(&self, path: &Path) -> bool;

    /// Whether `path` names an existing directory.
    fn is_directory(&self, path: &Path) -> bool;
}

impl<T: FileSystem + ?Sized> FileSystem for Arc<T> {
    fn read_file(&self, path: &Path) -> Result<String, ScanError> {
        (**self).read_file(path)
    }

    fn is_file(&self, path: &Path) -> bool {
        (**self).is_file(path)
    }

    fn is_directory(&self, path: &Path) -> bool {
        (**self).is_directory(path)
    }
}

/// [`FileSystem`] backed by the real file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl FileSystem for OsFileSystem {
    fn read_file(&self, path: &Path) -> Result<String, ScanError> {
        std::fs::read_to_string(path).map_err(|e| ScanError::io(path, e.to_string()))
    }

    fn is_file(&self, path: &Path) -> bool {
        path.is_file()
    }

    fn is_directory(&self, path: &Path) -> bool {
        path.is_dir()
    }
}

/// In-memory [`FileSystem`]. Directories are implied by the stored file
/// paths.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileSystem {
    files: HashMap<PathBuf, String>,
}

impl InMemoryFileSystem {
    pub fn new(files: HashMap<String, String>) -> Self {
        Self {
            files: files
                .into_iter()
                .map(|(path, contents)| (PathBuf::from(path), contents))
                .collect(),
        }
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl FileSystem for InMemoryFileSystem {
    fn read_file(&self, path: &Path) -> Result<String, ScanError> {
        self.files
            .get(path)
            .cloned()
            .ok_or_else(|| ScanError::io(path, "file not found"))
    }

    fn is_file(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    fn is_directory(&self, path: &Path) -> bool {
        self.files
            .keys()
            .any(|file| file != path && file.starts_with(path))
    }
}

/// Normalize a path by resolving `..` and `.` components lexically.
///
/// Uplevel components that cannot be absorbed (at the front of a relative
/// path, or at the root of an absolute one) are kept.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
            Component::RootDir => normalized.push("/"),
            Component::ParentDir => {
                if !ends_with_normal(&normalized) || !normalized.pop() {
                    normalized.push("..");
                }
            }
            Component::Normal(name) => normalized.push(name),
            Component::CurDir => {}
        }
    }
    normalized
}

fn ends_with_normal(path: &Path) -> bool {
    matches!(path.components().next_back(), Some(Component::Normal(_)))
}

/// Whether any `..` component is present.
pub fn contains_uplevel(path: &Path) -> bool {
    path.components()
        .any(|component| matches!(component, Component::ParentDir))
}
