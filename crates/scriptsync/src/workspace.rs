//! Per-workspace persisted state
//!
//! Stores the pinned target script and the set of files whose "synced"
//! notice the operator muted. The file lives under the platform data dir,
//! keyed by a digest of the workspace path, and is rewritten atomically on
//! every change.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceData {
    /// Explicitly selected target script
    pub target: Option<PathBuf>,
    /// Files whose "synced" notice is suppressed
    pub muted: BTreeSet<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to write workspace state {}: {source}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("failed to serialize workspace state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Short stable key for a workspace directory
pub fn workspace_key(workspace: &Path) -> String {
    let digest = Sha256::digest(workspace.to_string_lossy().as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Default state file location for a workspace
pub fn default_state_file(workspace: &Path) -> Option<PathBuf> {
    let base = dirs::data_local_dir()?;
    Some(
        base.join("scriptsync")
            .join("workspaces")
            .join(format!("{}.json", workspace_key(workspace))),
    )
}

#[derive(Debug)]
pub struct WorkspaceState {
    path: PathBuf,
    data: Mutex<WorkspaceData>,
    write_lock: tokio::sync::Mutex<()>,
}

impl WorkspaceState {
    /// Load state from `path`
    ///
    /// A missing file yields defaults. An unreadable or corrupt file is
    /// logged and replaced by defaults on the next write.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let data = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<WorkspaceData>(&bytes) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = ?path, error = %e, "workspace state is corrupt, using defaults");
                    WorkspaceData::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => WorkspaceData::default(),
            Err(e) => {
                warn!(path = ?path, error = %e, "failed to read workspace state, using defaults");
                WorkspaceData::default()
            }
        };
        Self {
            path,
            data: Mutex::new(data),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> MutexGuard<'_, WorkspaceData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn target(&self) -> Option<PathBuf> {
        self.data().target.clone()
    }

    pub async fn set_target(&self, target: Option<PathBuf>) -> Result<(), StateError> {
        self.data().target = target;
        self.persist().await
    }

    pub fn is_muted(&self, key: &str) -> bool {
        self.data().muted.contains(key)
    }

    /// Suppress future "synced" notices for `key`
    pub async fn mute(&self, key: impl Into<String>) -> Result<(), StateError> {
        let inserted = self.data().muted.insert(key.into());
        if !inserted {
            return Ok(());
        }
        self.persist().await
    }

    /// Write the current data to disk
    ///
    /// Writers are serialized and the snapshot is taken under the write
    /// lock, so the last rename always carries the newest data.
    async fn persist(&self) -> Result<(), StateError> {
        let _write = self.write_lock.lock().await;
        let bytes = serde_json::to_vec_pretty(&*self.data())?;
        let write_err = |source| StateError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, &bytes).await.map_err(write_err)?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(write_err)?;
        debug!(path = ?self.path, "workspace state saved");
        Ok(())
    }
}
