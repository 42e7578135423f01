use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use scriptsync_core::WatchTarget;

use crate::dispatcher::ChangeDispatcher;

/// Control command read from stdin, one JSON object per line
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    /// Pin a single target script
    SelectTarget { path: PathBuf },
    /// Return to auto-detect mode
    AutoTarget,
    Debug,
    /// Suppress the "synced" notice for a file
    Mute { path: PathBuf },
    Shutdown,
}

/// What the control loop acts on
pub struct ControlContext {
    pub dispatcher: Arc<ChangeDispatcher>,
    pub workspace_root: PathBuf,
    pub auto_target: WatchTarget,
}

/// Line-oriented control reader
pub struct ControlReader<R> {
    reader: R,
}

impl<R: AsyncBufRead + Unpin> ControlReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read commands until shutdown, EOF, or cancellation
    ///
    /// EOF is treated as a shutdown request.
    pub async fn run_recv_loop(
        mut self,
        ctx: ControlContext,
        response_tx: mpsc::UnboundedSender<String>,
        shutdown: CancellationToken,
    ) {
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = shutdown.cancelled() => return,
                read = self.reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => {
                    info!("control: input closed (EOF), shutting down");
                    shutdown.cancel();
                    return;
                }
                Ok(_) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<ControlMessage>(&line) {
                        Ok(ControlMessage::Shutdown) => {
                            info!("control: shutdown requested");
                            let _ = response_tx.send(make_result("shutdown", true, None));
                            shutdown.cancel();
                            return;
                        }
                        Ok(msg) => {
                            let response = handle_message(&ctx, msg).await;
                            let _ = response_tx.send(response);
                        }
                        Err(e) => {
                            info!("control: failed to parse message: {}", e);
                        }
                    }
                }
                Err(e) => {
                    warn!("control: read error: {}", e);
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}

async fn handle_message(ctx: &ControlContext, msg: ControlMessage) -> String {
    match msg {
        ControlMessage::SelectTarget { path } => {
            let path = ctx.workspace_root.join(path);
            let is_file = tokio::fs::metadata(&path)
                .await
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                let err = format!("{} is not a file", path.display());
                return make_result("select_target", false, Some(&err));
            }

            if let Err(e) = ctx
                .dispatcher
                .change_target_script(WatchTarget::explicit(&path))
            {
                return make_result("select_target", false, Some(&e.to_string()));
            }
            if let Err(e) = ctx.dispatcher.workspace().set_target(Some(path.clone())).await {
                warn!(error = %e, "failed to persist target");
            }
            info!(target = ?path, "target script selected");
            make_target_result("select_target", &path.display().to_string())
        }
        ControlMessage::AutoTarget => {
            if let Err(e) = ctx.dispatcher.change_target_script(ctx.auto_target.clone()) {
                return make_result("auto_target", false, Some(&e.to_string()));
            }
            if let Err(e) = ctx.dispatcher.workspace().set_target(None).await {
                warn!(error = %e, "failed to persist target");
            }
            info!(target = %ctx.auto_target, "auto-detect mode");
            make_target_result("auto_target", &ctx.auto_target.to_string())
        }
        ControlMessage::Debug => {
            let snapshot = ctx.dispatcher.debug_info().await;
            serde_json::json!({
                "type": "debug_result",
                "ok": true,
                "snapshot": snapshot
            })
            .to_string()
        }
        ControlMessage::Mute { path } => {
            let key = ctx.workspace_root.join(path).display().to_string();
            match ctx.dispatcher.workspace().mute(key).await {
                Ok(()) => make_result("mute", true, None),
                Err(e) => make_result("mute", false, Some(&e.to_string())),
            }
        }
        ControlMessage::Shutdown => make_result("shutdown", true, None),
    }
}

/// Serialize a `<command>_result` response line
pub(crate) fn make_result(command: &str, ok: bool, error: Option<&str>) -> String {
    let kind = format!("{command}_result");
    if let Some(err) = error {
        serde_json::json!({
            "type": kind,
            "ok": ok,
            "error": err
        })
        .to_string()
    } else {
        serde_json::json!({
            "type": kind,
            "ok": ok
        })
        .to_string()
    }
}

fn make_target_result(command: &str, target: &str) -> String {
    serde_json::json!({
        "type": format!("{command}_result"),
        "ok": true,
        "target": target
    })
    .to_string()
}
