//! Memoized existence checks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::{normalize_path, FileSystem};

/// Thread-safe, append-only memo of file and directory stats.
///
/// Paths are resolved against the exec root before statting, so callers pass
/// exec paths directly. Deep include paths share directory prefixes;
/// memoizing the directory checks keeps repeated misses cheap.
pub struct PathExistenceCache {
    fs: Arc<dyn FileSystem>,
    exec_root: PathBuf,
    files: RwLock<HashMap<PathBuf, bool>>,
    dirs: RwLock<HashMap<PathBuf, bool>>,
}

impl PathExistenceCache {
    pub fn new(fs: Arc<dyn FileSystem>, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            exec_root: exec_root.into(),
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(HashMap::new()),
        }
    }

    fn on_disk(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            normalize_path(path)
        } else {
            normalize_path(&self.exec_root.join(path))
        }
    }

    /// Whether `path` names an existing regular file. `is_source` mirrors the
    /// caller's root bookkeeping; both flavors stat against the exec root.
    pub fn file_exists(&self, path: &Path, _is_source: bool) -> bool {
        let key = self.on_disk(path);
        if let Some(&known) = self.files.read().unwrap().get(&key) {
            return known;
        }
        let exists = self.fs.is_file(&key);
        self.files.write().unwrap().insert(key, exists);
        exists
    }

    pub fn directory_exists(&self, path: &Path) -> bool {
        let key = self.on_disk(path);
        if let Some(&known) = self.dirs.read().unwrap().get(&key) {
            return known;
        }
        let exists = self.fs.is_directory(&key);
        self.dirs.write().unwrap().insert(key, exists);
        exists
    }
}
