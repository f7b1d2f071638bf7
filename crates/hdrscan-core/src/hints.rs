//! Hint-driven implicit inclusions.
//!
//! Hints inject headers the textual scan cannot see: path-level hints add
//! implicit headers for whole search-path directories, file-level hints add
//! them whenever a given artifact takes part in a scan.

use std::path::PathBuf;
use std::sync::Arc;

use globset::{Glob, GlobMatcher};

use crate::artifact::Artifact;

/// Signals whether upstream values this scan depends on are available yet.
pub trait ActionEnv: Send + Sync {
    fn values_missing(&self) -> bool;
}

/// [`ActionEnv`] for standalone scans with every input present.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadyEnv;

impl ActionEnv for ReadyEnv {
    fn values_missing(&self) -> bool {
        false
    }
}

/// External annotations injecting implicit inclusions.
pub trait Hints: Send + Sync {
    /// Implicit headers for whole search-path directories. May consult
    /// `env`; the scanner checks [`ActionEnv::values_missing`] afterwards
    /// and aborts with a missing-dependency signal when set.
    fn path_level_hints(
        &self,
        quote_search_paths: &[PathBuf],
        env: &dyn ActionEnv,
    ) -> Vec<Arc<Artifact>>;

    /// Implicit headers injected whenever `artifact` is part of the scan.
    fn file_level_hints(&self, artifact: &Artifact) -> Vec<Arc<Artifact>>;
}

/// Glob-rule table implementation of [`Hints`].
#[derive(Default)]
pub struct HintsRegistry {
    path_rules: Vec<(GlobMatcher, Vec<Arc<Artifact>>)>,
    file_rules: Vec<(GlobMatcher, Vec<Arc<Artifact>>)>,
}

impl HintsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject `headers` whenever a search-path directory matches `pattern`.
    pub fn add_path_rule(
        &mut self,
        pattern: &str,
        headers: Vec<Arc<Artifact>>,
    ) -> Result<(), globset::Error> {
        self.path_rules
            .push((Glob::new(pattern)?.compile_matcher(), headers));
        Ok(())
    }

    /// Inject `headers` whenever a visited artifact's exec path matches
    /// `pattern`.
    pub fn add_file_rule(
        &mut self,
        pattern: &str,
        headers: Vec<Arc<Artifact>>,
    ) -> Result<(), globset::Error> {
        self.file_rules
            .push((Glob::new(pattern)?.compile_matcher(), headers));
        Ok(())
    }
}

impl Hints for HintsRegistry {
    fn path_level_hints(
        &self,
        quote_search_paths: &[PathBuf],
        _env: &dyn ActionEnv,
    ) -> Vec<Arc<Artifact>> {
        let mut hinted = Vec::new();
        for dir in quote_search_paths {
            for (matcher, headers) in &self.path_rules {
                if matcher.is_match(dir) {
                    hinted.extend(headers.iter().cloned());
                }
            }
        }
        if !hinted.is_empty() {
            log::debug!("{} path-level hinted inclusions", hinted.len());
        }
        hinted
    }

    fn file_level_hints(&self, artifact: &Artifact) -> Vec<Arc<Artifact>> {
        self.file_rules
            .iter()
            .filter(|(matcher, _)| matcher.is_match(artifact.exec_path()))
            .flat_map(|(_, headers)| headers.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn artifact(path: &str) -> Arc<Artifact> {
        Arc::new(Artifact::source(path))
    }

    #[test]
    fn path_rules_match_search_directories() {
        let mut registry = HintsRegistry::new();
        registry
            .add_path_rule("third_party/tcl*", vec![artifact("third_party/tcl/tcl.h")])
            .unwrap();
        let hinted = registry.path_level_hints(
            &[PathBuf::from("third_party/tcl8"), PathBuf::from("lib")],
            &ReadyEnv,
        );
        assert_eq!(hinted.len(), 1);
        assert_eq!(hinted[0].exec_path(), Path::new("third_party/tcl/tcl.h"));
    }

    #[test]
    fn file_rules_match_visited_artifacts() {
        let mut registry = HintsRegistry::new();
        registry
            .add_file_rule("gen/*.h", vec![artifact("gen/impl.h")])
            .unwrap();
        assert_eq!(
            registry.file_level_hints(&Artifact::source("gen/api.h")).len(),
            1
        );
        assert!(registry
            .file_level_hints(&Artifact::source("lib/api.h"))
            .is_empty());
    }
}
