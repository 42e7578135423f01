//! Process assembly: channel, mailbox, state, dispatcher and initial watcher

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scriptsync_core::WatchTarget;

use crate::channel::{ChannelError, ChannelOwner};
use crate::config::Settings;
use crate::control::ControlContext;
use crate::dispatcher::ChangeDispatcher;
use crate::mailbox::Mailbox;
use crate::notice::Notifier;
use crate::watcher::{TaggedEvent, WatchError};
use crate::workspace::WorkspaceState;

/// A started sync process
pub struct App {
    pub channel: ChannelOwner,
    pub dispatcher: Arc<ChangeDispatcher>,
    pub auto_target: WatchTarget,
    workspace_root: std::path::PathBuf,
    cancel: CancellationToken,
    dispatch_task: JoinHandle<()>,
}

impl App {
    /// Claim or follow the channel, then install the initial watcher
    pub async fn start(settings: &Settings, notifier: Arc<dyn Notifier>) -> Result<Self, WatchError> {
        let channel = ChannelOwner::new(settings.host.clone(), settings.port);
        let mailbox = Mailbox::new(settings.mailbox_dir.clone(), settings.mailbox_ttl);

        match channel.start().await {
            Ok(port) => notifier.info(&format!(
                "ScriptCat service started on port {port} (main window)"
            )),
            Err(ChannelError::AddressInUse(_)) => {
                notifier.info(
                    "ScriptCat service is running in another window, \
                     file communication mode (secondary window)",
                );
                let swept = mailbox.sweep_stale().await;
                debug!(
                    dir = ?mailbox.dir(),
                    ttl_ms = mailbox.ttl().as_millis() as u64,
                    swept,
                    "mailbox fallback ready"
                );
            }
            Err(e) => notifier.error(&format!("Failed to start ScriptCat service: {e}")),
        }

        let workspace = Arc::new(WorkspaceState::load(settings.state_file.clone()).await);
        debug!(path = ?workspace.path(), "workspace state loaded");
        let auto_target = WatchTarget::AutoDetect {
            root: settings.workspace.clone(),
            pattern: settings.auto_pattern.clone(),
        };
        let initial = initial_target(settings, &workspace, &auto_target).await;

        let (dispatcher, events_rx) = ChangeDispatcher::new(
            channel.clone(),
            mailbox,
            workspace,
            notifier.clone(),
            settings.debounce,
        );
        if let Err(e) = dispatcher.change_target_script(initial.clone()) {
            dispatcher.close();
            channel.dispose();
            return Err(e);
        }
        match &initial {
            WatchTarget::Explicit(path) => {
                notifier.info(&format!("Watching target script {}", path.display()))
            }
            WatchTarget::AutoDetect { .. } => info!(target = %initial, "auto-detect mode"),
        }

        let cancel = CancellationToken::new();
        let dispatch_task = spawn_dispatch(dispatcher.clone(), events_rx, cancel.clone());

        Ok(Self {
            channel,
            dispatcher,
            auto_target,
            workspace_root: settings.workspace.clone(),
            cancel,
            dispatch_task,
        })
    }

    /// Context for the control loop
    pub fn control_context(&self) -> ControlContext {
        ControlContext {
            dispatcher: self.dispatcher.clone(),
            workspace_root: self.workspace_root.clone(),
            auto_target: self.auto_target.clone(),
        }
    }

    /// Release the watcher, the channel server and the dispatch loop
    pub async fn shutdown(self) {
        self.dispatcher.close();
        self.channel.dispose();
        self.cancel.cancel();
        if let Err(e) = self.dispatch_task.await {
            warn!(error = %e, "dispatch task failed");
        }
        self.channel.stopped().await;
        debug!("shutdown complete");
    }
}

fn spawn_dispatch(
    dispatcher: Arc<ChangeDispatcher>,
    events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(dispatcher.run(events_rx, cancel))
}

/// `--target` wins, then a persisted target that still exists, then auto-detect
async fn initial_target(
    settings: &Settings,
    workspace: &WorkspaceState,
    auto_target: &WatchTarget,
) -> WatchTarget {
    if let Some(target) = &settings.target {
        if let Err(e) = workspace.set_target(Some(target.clone())).await {
            warn!(error = %e, "failed to persist target");
        }
        return WatchTarget::explicit(target);
    }

    if let Some(persisted) = workspace.target() {
        if tokio::fs::try_exists(&persisted).await.unwrap_or(false) {
            return WatchTarget::explicit(persisted);
        }
        info!(path = ?persisted, "persisted target is gone, using auto-detect");
    }
    auto_target.clone()
}
