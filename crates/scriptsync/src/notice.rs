//! Operator notices
//!
//! The host surface that shows messages to the operator sits behind
//! [`Notifier`]. The console implementation logs each notice and mirrors it
//! as a JSON line on the control output.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Operator answer to a "changes have been synced" notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncedChoice {
    Dismissed,
    /// "Don't show again for this file"
    Mute,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);

    /// Tell the operator that changes to `file` were synced and offer to
    /// mute future notices for it
    async fn synced(&self, file: &str) -> SyncedChoice;
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum NoticeLine<'a> {
    Notice { level: &'static str, message: &'a str },
    Synced { file: &'a str, message: String },
}

/// Notifier that logs and writes JSON lines to the control output
pub struct ConsoleNotifier {
    out: mpsc::UnboundedSender<String>,
}

impl ConsoleNotifier {
    pub fn new(out: mpsc::UnboundedSender<String>) -> Self {
        Self { out }
    }

    fn emit(&self, line: &NoticeLine<'_>) {
        if let Ok(json) = serde_json::to_string(line) {
            let _ = self.out.send(json);
        }
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    fn info(&self, message: &str) {
        info!("{}", message);
        self.emit(&NoticeLine::Notice {
            level: "info",
            message,
        });
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
        self.emit(&NoticeLine::Notice {
            level: "warning",
            message,
        });
    }

    fn error(&self, message: &str) {
        error!("{}", message);
        self.emit(&NoticeLine::Notice {
            level: "error",
            message,
        });
    }

    async fn synced(&self, file: &str) -> SyncedChoice {
        info!(file, "changes synced");
        self.emit(&NoticeLine::Synced {
            file,
            message: format!("{file} changes have been synced"),
        });
        // The console cannot wait for an answer; muting arrives as a
        // separate `mute` control command.
        SyncedChoice::Dismissed
    }
}
