//! Mailbox: TTL-bounded file drop for processes that do not own the channel
//!
//! Followers serialize each change message into its own file in a shared,
//! well-known directory. Entry names embed the creation time in epoch
//! milliseconds plus a random fraction, so concurrent writers in different
//! processes never collide. Every entry gets a one-shot cleanup task that
//! deletes it after the TTL unless an external reader consumed it first.
//!
//! Delivery is at-most-once: a failed write drops the message, and nothing
//! guarantees an entry is read before it expires.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Subdirectory of the platform temp dir shared by every process
pub const SHARED_DIR_NAME: &str = "scriptcat-vscode";

/// Default lifetime of an unconsumed entry
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

const ENTRY_PREFIX: &str = "message-";
const ENTRY_SUFFIX: &str = ".json";

/// Well-known shared directory under the platform temp root
pub fn default_shared_dir() -> PathBuf {
    std::env::temp_dir().join(SHARED_DIR_NAME)
}

#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("failed to create mailbox directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write mailbox entry {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },
}

/// A message file written to the mailbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxEntry {
    pub path: PathBuf,
    pub created_at_ms: i64,
}

/// Entry file name: `message-<epoch-millis>-<random-fraction>.json`
pub fn entry_file_name(created_at_ms: i64, fraction: f64) -> String {
    format!("{ENTRY_PREFIX}{created_at_ms}-{fraction}{ENTRY_SUFFIX}")
}

/// Creation time embedded in an entry file name
pub fn parse_entry_timestamp(file_name: &str) -> Option<i64> {
    let stem = file_name
        .strip_prefix(ENTRY_PREFIX)?
        .strip_suffix(ENTRY_SUFFIX)?;
    let (millis, _fraction) = stem.split_once('-')?;
    millis.parse().ok()
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    dir: PathBuf,
    ttl: Duration,
}

impl Mailbox {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Create the shared directory and any missing parents
    pub async fn ensure_dir(&self) -> Result<(), MailboxError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| MailboxError::CreateDir {
                path: self.dir.clone(),
                source,
            })
    }

    /// Live check that the shared directory exists
    pub async fn dir_exists(&self) -> bool {
        tokio::fs::try_exists(&self.dir).await.unwrap_or(false)
    }

    /// Write `message` as a new entry and schedule its deletion
    ///
    /// The entry is staged under a hidden name and renamed into place, so a
    /// reader never sees a partially written `message-*.json`.
    pub async fn write<T: Serialize>(&self, message: &T) -> Result<MailboxEntry, MailboxError> {
        self.ensure_dir().await?;
        let payload = serde_json::to_vec(message)?;

        let created_at_ms = Utc::now().timestamp_millis();
        let name = entry_file_name(created_at_ms, rand::random::<f64>());
        let path = self.dir.join(&name);
        let staging = self.dir.join(format!(".{name}.tmp"));

        if let Err(source) = tokio::fs::write(&staging, &payload).await {
            return Err(MailboxError::Write { path, source });
        }
        if let Err(source) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(MailboxError::Write { path, source });
        }
        debug!(path = ?path, bytes = payload.len(), "mailbox: entry written");

        self.schedule_cleanup(path.clone());
        Ok(MailboxEntry {
            path,
            created_at_ms,
        })
    }

    fn schedule_cleanup(&self, path: PathBuf) {
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            remove_entry(&path).await;
        });
    }

    /// Delete entries older than the TTL left behind by exited processes
    ///
    /// Returns the number of entries removed.
    pub async fn sweep_stale(&self) -> usize {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
            Err(e) => {
                warn!(dir = ?self.dir, error = %e, "mailbox: failed to scan for stale entries");
                return 0;
            }
        };

        let cutoff = Utc::now().timestamp_millis() - self.ttl.as_millis() as i64;
        let mut removed = 0;
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "mailbox: directory scan interrupted");
                    break;
                }
            };
            let name = entry.file_name();
            let Some(created) = name.to_str().and_then(parse_entry_timestamp) else {
                continue;
            };
            if created <= cutoff && remove_entry(&entry.path()).await {
                removed += 1;
            }
        }

        if removed > 0 {
            info!(removed, "mailbox: swept stale entries");
        }
        removed
    }
}

/// Delete an entry; an already-consumed entry counts as done
///
/// Returns whether this call removed the file.
pub async fn remove_entry(path: &Path) -> bool {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = ?path, "mailbox: entry expired and removed");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = ?path, "mailbox: entry already consumed");
            false
        }
        Err(e) => {
            warn!(path = ?path, error = %e, "mailbox: failed to remove entry");
            false
        }
    }
}
