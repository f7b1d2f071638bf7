//! Inclusion directives and the context-carrying keys derived from them.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::artifact::Artifact;

/// Context position recorded for top-level sources.
pub const TOP_LEVEL_POS: i32 = -1;

/// Include position reserved for files reached through relative resolution.
pub const RELATIVE_POS: i32 = 0;

/// Which search-path list an include resolves against: the quote list is the
/// full `-iquote`, `-I`, `-isystem` sequence, the angle list its suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchFlavor {
    Quote,
    Angle,
}

/// The four textual inclusion directives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IncludeKind {
    Quote,
    Angle,
    NextQuote,
    NextAngle,
}

impl IncludeKind {
    /// `#include_next` variants resume searching after the search-path entry
    /// on which the includer itself was found.
    pub fn is_next(self) -> bool {
        matches!(self, IncludeKind::NextQuote | IncludeKind::NextAngle)
    }

    pub fn flavor(self) -> SearchFlavor {
        match self {
            IncludeKind::Quote | IncludeKind::NextQuote => SearchFlavor::Quote,
            IncludeKind::Angle | IncludeKind::NextAngle => SearchFlavor::Angle,
        }
    }
}

/// One inclusion directive as written in a file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Inclusion {
    pub kind: IncludeKind,
    pub path: PathBuf,
}

impl Inclusion {
    pub fn new(kind: IncludeKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
        }
    }

    pub fn quote(path: impl Into<PathBuf>) -> Self {
        Self::new(IncludeKind::Quote, path)
    }

    pub fn angle(path: impl Into<PathBuf>) -> Self {
        Self::new(IncludeKind::Angle, path)
    }
}

impl fmt::Display for Inclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let directive = if self.kind.is_next() {
            "#include_next"
        } else {
            "#include"
        };
        match self.kind.flavor() {
            SearchFlavor::Quote => write!(f, "{directive} \"{}\"", self.path.display()),
            SearchFlavor::Angle => write!(f, "{directive} <{}>", self.path.display()),
        }
    }
}

/// An inclusion together with how its includer was itself resolved.
///
/// Plain includes store their own flavor; `_next` forms inherit the
/// includer's, because they continue the includer's search. The pair with
/// the context position makes this the resolution-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InclusionWithContext {
    inclusion: Inclusion,
    context_path_pos: i32,
    context_kind: Option<SearchFlavor>,
}

impl InclusionWithContext {
    pub fn new(
        inclusion: Inclusion,
        context_path_pos: i32,
        context_kind: Option<SearchFlavor>,
    ) -> Self {
        let context_kind = if inclusion.kind.is_next() {
            context_kind
        } else {
            Some(inclusion.kind.flavor())
        };
        Self {
            inclusion,
            context_path_pos,
            context_kind,
        }
    }

    pub fn inclusion(&self) -> &Inclusion {
        &self.inclusion
    }

    /// Search-path index at which the includer was found; [`TOP_LEVEL_POS`]
    /// for top-level files.
    pub fn context_path_pos(&self) -> i32 {
        self.context_path_pos
    }

    pub fn context_kind(&self) -> Option<SearchFlavor> {
        self.context_kind
    }
}

/// Outcome of a search-path resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocateResult {
    /// The located artifact, or `None` on a miss.
    pub artifact: Option<Arc<Artifact>>,
    /// 1-based index of the matching search-path entry; [`RELATIVE_POS`]
    /// marks relative resolution.
    pub include_pos: i32,
    /// Whether resolution stepped past an output-tree path that is not a
    /// declared output. Such misses must not be memoized.
    pub viewed_illegal_output: bool,
}

impl LocateResult {
    pub fn found(artifact: Arc<Artifact>, include_pos: i32, viewed_illegal_output: bool) -> Self {
        Self {
            artifact: Some(artifact),
            include_pos,
            viewed_illegal_output,
        }
    }

    pub fn not_found(viewed_illegal_output: bool) -> Self {
        Self {
            artifact: None,
            include_pos: 0,
            viewed_illegal_output,
        }
    }

    pub fn is_found(&self) -> bool {
        self.artifact.is_some()
    }
}
