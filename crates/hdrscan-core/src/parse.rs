//! Textual inclusion extraction and the shared per-file parse memo.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;

use crate::artifact::Artifact;
use crate::inclusion::{IncludeKind, Inclusion};
use crate::{normalize_path, FileSystem, ScanError};

/// Extracts the textual inclusion directives of a single file.
///
/// Implementations own their strategy for generated files (for example
/// delegating to a helper process) and surface such failures as
/// [`ScanError::Exec`].
#[async_trait]
pub trait InclusionExtractor: Send + Sync {
    async fn extract(
        &self,
        file: &Artifact,
        treat_as_generated: bool,
    ) -> Result<Vec<Inclusion>, ScanError>;
}

/// Line-oriented extractor recognizing `#include` and `#include_next`.
///
/// Preprocessor conditionals and macro expansion are not evaluated; a
/// computed include (`#include FOO`) is skipped.
pub struct TextIncludeExtractor {
    fs: Arc<dyn FileSystem>,
    exec_root: PathBuf,
}

impl TextIncludeExtractor {
    pub fn new(fs: Arc<dyn FileSystem>, exec_root: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            exec_root: exec_root.into(),
        }
    }

    /// Extract directives from already-loaded contents.
    pub fn extract_from(contents: &str) -> Vec<Inclusion> {
        contents.lines().filter_map(parse_line).collect()
    }
}

#[async_trait]
impl InclusionExtractor for TextIncludeExtractor {
    async fn extract(
        &self,
        file: &Artifact,
        treat_as_generated: bool,
    ) -> Result<Vec<Inclusion>, ScanError> {
        let path = if file.exec_path().is_absolute() {
            file.exec_path().to_path_buf()
        } else {
            self.exec_root.join(file.exec_path())
        };
        let contents = self.fs.read_file(&normalize_path(&path))?;
        let inclusions = Self::extract_from(&contents);
        log::debug!(
            "extracted {} inclusions from {}{}",
            inclusions.len(),
            file,
            if treat_as_generated { " (generated)" } else { "" },
        );
        Ok(inclusions)
    }
}

fn parse_line(line: &str) -> Option<Inclusion> {
    let rest = line.trim_start().strip_prefix('#')?.trim_start();
    let (rest, next) = match rest.strip_prefix("include_next") {
        Some(rest) => (rest, true),
        None => (rest.strip_prefix("include")?, false),
    };
    // Reject identifiers that merely start with "include".
    if rest.starts_with(|c: char| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let rest = rest.trim_start();
    if let Some(body) = rest.strip_prefix('"') {
        let name = &body[..body.find('"')?];
        if name.is_empty() {
            return None;
        }
        let kind = if next {
            IncludeKind::NextQuote
        } else {
            IncludeKind::Quote
        };
        Some(Inclusion::new(kind, name))
    } else if let Some(body) = rest.strip_prefix('<') {
        let name = &body[..body.find('>')?];
        if name.is_empty() {
            return None;
        }
        let kind = if next {
            IncludeKind::NextAngle
        } else {
            IncludeKind::Angle
        };
        Some(Inclusion::new(kind, name))
    } else {
        None
    }
}

/// A completed or in-flight extraction, shared by every waiter.
pub(crate) type ParseFuture =
    Shared<BoxFuture<'static, Result<Arc<Vec<Inclusion>>, ScanError>>>;

/// Shared memo of per-file extraction futures.
///
/// Owned outside the scanner and shared across scanners, so each file is
/// parsed once per process. Exactly one caller creates the future for a
/// file; everyone else awaits the same one. Failed entries are evicted so a
/// retry can repopulate them.
#[derive(Default)]
pub struct ParseCache {
    entries: Mutex<HashMap<Arc<Artifact>, ParseFuture>>,
}

impl ParseCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn future_for<F>(&self, file: &Arc<Artifact>, make: F) -> ParseFuture
    where
        F: FnOnce() -> BoxFuture<'static, Result<Arc<Vec<Inclusion>>, ScanError>>,
    {
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(file.clone())
            .or_insert_with(|| make().shared())
            .clone()
    }

    /// Whether extraction for `file` has already completed.
    pub(crate) fn is_ready(&self, file: &Arc<Artifact>) -> bool {
        self.entries
            .lock()
            .unwrap()
            .get(file)
            .is_some_and(|entry| entry.peek().is_some())
    }

    /// Drop `failed` so a later attempt can repopulate the entry. No-op when
    /// the entry was already replaced by a newer future.
    pub(crate) fn evict(&self, file: &Arc<Artifact>, failed: &ParseFuture) {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .get(file)
            .is_some_and(|current| current.ptr_eq(failed))
        {
            entries.remove(file);
        }
    }
}
