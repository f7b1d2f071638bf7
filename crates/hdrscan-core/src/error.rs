use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by a scan.
///
/// The enum is `Clone` so results can fan out through shared parse futures;
/// I/O and exec failures carry their message text rather than the underlying
/// error value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScanError {
    /// Reading or statting a file failed.
    #[error("I/O error on {}: {message}", .path.display())]
    Io { path: PathBuf, message: String },

    /// The extraction helper for generated files failed to run.
    #[error("inclusion extraction failed on {}: {message}", .path.display())]
    Exec { path: PathBuf, message: String },

    /// The scan was cancelled at a cooperative checkpoint.
    #[error("interrupted during {operation} of {}", .file.display())]
    Interrupted {
        operation: &'static str,
        file: PathBuf,
    },

    /// Upstream dependencies of this action have not been computed yet; the
    /// caller should restart the action once they are.
    #[error("scan requires upstream values that are not yet computed")]
    MissingDeps,
}

impl ScanError {
    pub(crate) fn io(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        ScanError::Io {
            path: path.into(),
            message: message.into(),
        }
    }

    pub(crate) fn interrupted(operation: &'static str, file: impl Into<PathBuf>) -> Self {
        ScanError::Interrupted {
            operation,
            file: file.into(),
        }
    }
}
