//! Channel ownership state and the operator debug snapshot

use serde::{Deserialize, Serialize};

/// Outcome of this process's attempt to own the shared channel port
///
/// Set once when the bind attempt resolves. At most one process per machine
/// is ever `Owner` for a given port; the OS port namespace enforces this.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Bind has not been attempted yet
    Unbound,
    /// This process bound the port and serves the channel
    Owner(u16),
    /// Another process holds the port
    NonOwner,
    /// Bind failed for a reason other than contention
    BindError(String),
}

impl ChannelState {
    pub fn is_owner(&self) -> bool {
        matches!(self, ChannelState::Owner(_))
    }

    /// Bound port, if this process is the owner
    pub fn port(&self) -> Option<u16> {
        match self {
            ChannelState::Owner(port) => Some(*port),
            _ => None,
        }
    }

    /// Short role name for logs
    pub fn role(&self) -> &'static str {
        match self {
            ChannelState::Unbound => "unbound",
            ChannelState::Owner(_) => "main",
            ChannelState::NonOwner => "secondary",
            ChannelState::BindError(_) => "error",
        }
    }
}

/// Read-only projection of the coordination state
///
/// Field names are the JSON keys operators already know.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSnapshot {
    pub is_web_socket_owner: bool,
    pub ws_manager_running: bool,
    /// Bound port, or 0 when this process does not own the channel
    pub ws_manager_port: u16,
    pub shared_dir: String,
    pub shared_dir_exists: bool,
}
