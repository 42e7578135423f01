//! scriptsync-core: Shared types for scriptsync
//!
//! This crate provides the wire message written to the broadcast channel and
//! the mailbox, the channel ownership state, the debug snapshot, and the
//! watch target types used by the scriptsync process.

pub mod event;
pub mod message;
pub mod state;
pub mod target;

pub use event::{ChangeKind, FILE_SCHEME, FileEvent};
pub use message::{ChangeData, ChangeMessage, ON_CHANGE_ACTION, file_uri};
pub use state::{ChannelState, DebugSnapshot};
pub use target::{DEFAULT_AUTO_PATTERN, TargetError, TargetMatcher, WatchTarget};
