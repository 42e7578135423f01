//! Watch targets: an explicit script file or an auto-detect glob

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};

/// Glob used in auto-detect mode
pub const DEFAULT_AUTO_PATTERN: &str = "**/*.user.js";

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("invalid glob pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        source: glob::PatternError,
    },
}

/// What a process is currently watching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchTarget {
    /// A single user-selected file
    Explicit(PathBuf),
    /// Every file under `root` whose relative path matches `pattern`
    AutoDetect { root: PathBuf, pattern: String },
}

impl WatchTarget {
    pub fn explicit(path: impl Into<PathBuf>) -> Self {
        WatchTarget::Explicit(path.into())
    }

    /// Auto-detect mode with the default `**/*.user.js` pattern
    pub fn auto_detect(root: impl Into<PathBuf>) -> Self {
        WatchTarget::AutoDetect {
            root: root.into(),
            pattern: DEFAULT_AUTO_PATTERN.to_string(),
        }
    }

    /// Directory handed to the file watcher
    pub fn watch_root(&self) -> &Path {
        match self {
            WatchTarget::Explicit(path) => path.parent().unwrap_or(path),
            WatchTarget::AutoDetect { root, .. } => root,
        }
    }

    pub fn is_recursive(&self) -> bool {
        matches!(self, WatchTarget::AutoDetect { .. })
    }

    /// Compile the path filter for this target
    pub fn matcher(&self) -> Result<TargetMatcher, TargetError> {
        match self {
            WatchTarget::Explicit(path) => Ok(TargetMatcher::Exact(path.clone())),
            WatchTarget::AutoDetect { root, pattern } => {
                let compiled =
                    Pattern::new(pattern).map_err(|source| TargetError::InvalidPattern {
                        pattern: pattern.clone(),
                        source,
                    })?;
                Ok(TargetMatcher::Glob {
                    root: root.clone(),
                    pattern: compiled,
                })
            }
        }
    }
}

impl std::fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchTarget::Explicit(path) => write!(f, "{}", path.display()),
            WatchTarget::AutoDetect { root, pattern } => {
                write!(f, "{} in {}", pattern, root.display())
            }
        }
    }
}

/// Compiled path filter for a [`WatchTarget`]
#[derive(Debug, Clone)]
pub enum TargetMatcher {
    Exact(PathBuf),
    Glob { root: PathBuf, pattern: Pattern },
}

impl TargetMatcher {
    /// Whether a watcher-reported absolute path belongs to the target
    pub fn matches(&self, path: &Path) -> bool {
        match self {
            TargetMatcher::Exact(target) => path == target,
            TargetMatcher::Glob { root, pattern } => match path.strip_prefix(root) {
                Ok(relative) => pattern.matches_path_with(relative, MATCH_OPTIONS),
                Err(_) => false,
            },
        }
    }
}
