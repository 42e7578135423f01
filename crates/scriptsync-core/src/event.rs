//! File change events produced by the watcher

use std::path::{Path, PathBuf};

/// URI scheme of events that come from a real file on disk
pub const FILE_SCHEME: &str = "file";

/// Kind of change reported by the watcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// File appeared (created or renamed into place)
    Created,
    /// Existing file contents changed
    Changed,
}

/// A single "file changed" notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub scheme: String,
    pub path: PathBuf,
    pub kind: ChangeKind,
}

impl FileEvent {
    /// Create an event for a file on disk
    pub fn file(path: impl Into<PathBuf>, kind: ChangeKind) -> Self {
        FileEvent {
            scheme: FILE_SCHEME.to_string(),
            path: path.into(),
            kind,
        }
    }

    /// Whether this event is sourced from a real file
    pub fn is_file(&self) -> bool {
        self.scheme == FILE_SCHEME
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
