//! Change dispatcher
//!
//! Receives file events from the active script watcher and routes each one
//! to the broadcast channel (when this process owns it and the server is
//! alive) or to the mailbox. The route is chosen per event from the live
//! channel state, so an owner whose listener died falls back to the mailbox
//! on the next change.
//!
//! Target switches install the new watcher, then swap it into the single
//! active slot and bump the active generation in one step. Events still
//! queued from the old watcher carry a stale generation and are dropped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scriptsync_core::{
    ChangeKind, ChangeMessage, ChannelState, DebugSnapshot, FileEvent, WatchTarget, file_uri,
};

use crate::channel::{ChannelError, ChannelOwner, HandlerId};
use crate::mailbox::{Mailbox, MailboxEntry, MailboxError};
use crate::notice::{Notifier, SyncedChoice};
use crate::watcher::{ScriptWatcher, TaggedEvent, WatchError};
use crate::workspace::WorkspaceState;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to read {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Broadcast(#[from] ChannelError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),

    /// Bind malfunction: neither channel nor mailbox is used this run
    #[error("no channel available: {0}")]
    NoChannel(String),
}

/// Where a change event ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Not sourced from a real file
    Ignored,
    /// Sent to the connected channel clients
    Broadcast { clients: usize },
    /// Written to the mailbox
    Mailbox(MailboxEntry),
}

pub struct ChangeDispatcher {
    channel: ChannelOwner,
    mailbox: Mailbox,
    workspace: Arc<WorkspaceState>,
    notifier: Arc<dyn Notifier>,
    debounce: Duration,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    active: Mutex<Option<ScriptWatcher>>,
    active_generation: AtomicU64,
    next_generation: AtomicU64,
    handler_id: HandlerId,
}

impl ChangeDispatcher {
    /// Create a dispatcher and the receiver its [`run`](Self::run) loop consumes
    pub fn new(
        channel: ChannelOwner,
        mailbox: Mailbox,
        workspace: Arc<WorkspaceState>,
        notifier: Arc<dyn Notifier>,
        debounce: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TaggedEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handler_id = channel.add_message_handler(Arc::new(|value: &serde_json::Value| {
            debug!(message = %value, "inbound channel message");
        }));

        let dispatcher = Arc::new(Self {
            channel,
            mailbox,
            workspace,
            notifier,
            debounce,
            events_tx,
            active: Mutex::new(None),
            active_generation: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            handler_id,
        });
        (dispatcher, events_rx)
    }

    fn slot(&self) -> MutexGuard<'_, Option<ScriptWatcher>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn workspace(&self) -> &WorkspaceState {
        &self.workspace
    }

    /// Consume watcher events in order until cancelled
    pub async fn run(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = events_rx.recv() => {
                    let Some((generation, event)) = received else { break };
                    if generation != self.active_generation() {
                        debug!(generation, path = ?event.path, "dropping event from disposed watcher");
                        continue;
                    }
                    // Failures are reported inside on_change
                    let _ = self.on_change(&event).await;
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Handle one change event
    pub async fn on_change(&self, event: &FileEvent) -> Result<Delivery, DispatchError> {
        if !event.is_file() {
            debug!(scheme = %event.scheme, "ignoring non-file event");
            return Ok(Delivery::Ignored);
        }

        let bytes = tokio::fs::read(&event.path).await.map_err(|source| {
            warn!(path = ?event.path, error = %source, "failed to read changed script");
            DispatchError::Read {
                path: event.path.clone(),
                source,
            }
        })?;
        let message = ChangeMessage::new(
            String::from_utf8_lossy(&bytes).into_owned(),
            file_uri(&event.path),
        );

        let result = self.deliver(&message).await;
        let role = self.channel.state().role();
        match &result {
            Ok(Delivery::Broadcast { clients }) => {
                info!(path = ?event.path, role, clients, "script change broadcast")
            }
            Ok(Delivery::Mailbox(entry)) => info!(
                path = ?event.path,
                role,
                entry = ?entry.path,
                created_at_ms = entry.created_at_ms,
                "script change written to mailbox"
            ),
            Ok(Delivery::Ignored) | Err(_) => {}
        }

        // A failed mailbox write was already reported and still gets the notice
        let attempted = matches!(result, Ok(_) | Err(DispatchError::Mailbox(_)));
        if attempted && event.kind == ChangeKind::Changed {
            self.offer_synced_notice(&event.path);
        }
        result
    }

    async fn deliver(&self, message: &ChangeMessage) -> Result<Delivery, DispatchError> {
        if self.channel.is_running() {
            let clients = self.channel.broadcast(message)?;
            return Ok(Delivery::Broadcast { clients });
        }

        if let ChannelState::BindError(cause) = self.channel.state() {
            debug!(cause = %cause, "channel unavailable, change dropped");
            return Err(DispatchError::NoChannel(cause));
        }

        match self.mailbox.write(message).await {
            Ok(entry) => Ok(Delivery::Mailbox(entry)),
            Err(e) => {
                self.notifier.warn(&format!("File communication failed: {e}"));
                Err(e.into())
            }
        }
    }

    /// Show the "synced" notice unless muted; muting never affects delivery
    fn offer_synced_notice(&self, path: &Path) {
        let key = path.display().to_string();
        if self.workspace.is_muted(&key) {
            return;
        }

        let notifier = self.notifier.clone();
        let workspace = self.workspace.clone();
        tokio::spawn(async move {
            if notifier.synced(&key).await == SyncedChoice::Mute {
                if let Err(e) = workspace.mute(key).await {
                    warn!(error = %e, "failed to persist muted file");
                }
            }
        });
    }

    /// Replace the active watcher with one for `target`
    ///
    /// If the new watcher cannot be created the current one stays active.
    pub fn change_target_script(&self, target: WatchTarget) -> Result<(), WatchError> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let watcher = ScriptWatcher::spawn(target, generation, self.debounce, self.events_tx.clone())?;

        let previous = {
            let mut slot = self.slot();
            self.active_generation.store(generation, Ordering::SeqCst);
            slot.replace(watcher)
        };
        if let Some(old) = previous {
            debug!(from = old.generation(), to = generation, "watcher replaced");
        }
        Ok(())
    }

    /// Dispose the active watcher; a second call is a no-op
    pub fn dispose_watcher(&self) -> bool {
        let previous = {
            let mut slot = self.slot();
            self.active_generation.store(0, Ordering::SeqCst);
            slot.take()
        };
        previous.is_some()
    }

    /// Target of the active watcher
    pub fn active_target(&self) -> Option<WatchTarget> {
        self.slot().as_ref().map(|w| w.target().clone())
    }

    pub fn active_generation(&self) -> u64 {
        self.active_generation.load(Ordering::SeqCst)
    }

    /// Snapshot of the coordination state, computed now
    pub async fn debug_info(&self) -> DebugSnapshot {
        let state = self.channel.state();
        DebugSnapshot {
            is_web_socket_owner: state.is_owner(),
            ws_manager_running: self.channel.is_running(),
            ws_manager_port: state.port().unwrap_or(0),
            shared_dir: self.mailbox.dir().display().to_string(),
            shared_dir_exists: self.mailbox.dir_exists().await,
        }
    }

    /// Release the channel handler and the active watcher
    pub fn close(&self) {
        self.channel.remove_message_handler(self.handler_id);
        self.dispose_watcher();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::tests::reserve_port;
    use crate::notice::tests::RecordingNotifier;
    use crate::watcher::DEFAULT_DEBOUNCE;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        dispatcher: Arc<ChangeDispatcher>,
        events_rx: Option<mpsc::UnboundedReceiver<TaggedEvent>>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        async fn new(channel: ChannelOwner, choice: SyncedChoice, ttl: Duration) -> Self {
            let temp = TempDir::new().unwrap();
            fs::create_dir_all(temp.path().join("ws")).unwrap();
            let mailbox = Mailbox::new(temp.path().join("mailbox"), ttl);
            let workspace = Arc::new(WorkspaceState::load(temp.path().join("state.json")).await);
            let notifier = Arc::new(RecordingNotifier::new(choice));
            let (dispatcher, events_rx) = ChangeDispatcher::new(
                channel,
                mailbox,
                workspace,
                notifier.clone(),
                DEFAULT_DEBOUNCE,
            );
            Self {
                temp,
                dispatcher,
                events_rx: Some(events_rx),
                notifier,
            }
        }

        fn ws(&self) -> PathBuf {
            self.temp.path().join("ws")
        }

        fn script(&self, name: &str, contents: &str) -> PathBuf {
            let path = self.ws().join(name);
            fs::write(&path, contents).unwrap();
            path
        }

        fn mailbox_files(&self) -> Vec<PathBuf> {
            match fs::read_dir(self.temp.path().join("mailbox")) {
                Ok(rd) => rd.map(|e| e.unwrap().path()).collect(),
                Err(_) => vec![],
            }
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_owner_broadcasts_without_mailbox() {
        let channel = ChannelOwner::new("127.0.0.1", 0);
        channel.start().await.unwrap();
        let fx = Fixture::new(channel.clone(), SyncedChoice::Dismissed, Duration::from_secs(5)).await;
        let script = fx.script("foo.user.js", "// owner");

        let delivery = fx
            .dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await
            .unwrap();

        assert_eq!(delivery, Delivery::Broadcast { clients: 0 });
        assert!(fx.mailbox_files().is_empty());
        channel.dispose();
    }

    #[tokio::test]
    async fn test_follower_writes_mailbox_entry() {
        let port = reserve_port();
        let owner = ChannelOwner::new("127.0.0.1", port);
        owner.start().await.unwrap();
        let follower = ChannelOwner::new("127.0.0.1", port);
        assert!(follower.start().await.is_err());

        let fx = Fixture::new(follower, SyncedChoice::Dismissed, Duration::from_millis(200)).await;
        let script = fx.script("foo.user.js", "// follower");

        let delivery = fx
            .dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await
            .unwrap();

        let Delivery::Mailbox(entry) = delivery else {
            panic!("expected mailbox delivery, got {delivery:?}");
        };
        let written: ChangeMessage =
            serde_json::from_slice(&fs::read(&entry.path).unwrap()).unwrap();
        assert_eq!(written, ChangeMessage::new("// follower", file_uri(&script)));

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!entry.path.exists());
        owner.dispose();
    }

    #[tokio::test]
    async fn test_non_file_event_is_ignored() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let event = FileEvent {
            scheme: "untitled".to_string(),
            path: PathBuf::from("Untitled-1"),
            kind: ChangeKind::Changed,
        };

        assert_eq!(fx.dispatcher.on_change(&event).await.unwrap(), Delivery::Ignored);
        assert!(fx.mailbox_files().is_empty());
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 0);
    }

    #[tokio::test]
    async fn test_dead_listener_falls_back_to_mailbox() {
        let channel = ChannelOwner::new("127.0.0.1", 0);
        channel.start().await.unwrap();
        let fx = Fixture::new(channel.clone(), SyncedChoice::Dismissed, Duration::from_secs(5)).await;
        let script = fx.script("foo.user.js", "// after death");

        channel.dispose();
        channel.stopped().await;
        assert!(!channel.is_running());

        let delivery = fx
            .dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await
            .unwrap();
        assert!(matches!(delivery, Delivery::Mailbox(_)));
        assert_eq!(fx.mailbox_files().len(), 1);
    }

    #[tokio::test]
    async fn test_bind_error_drops_change() {
        let channel = ChannelOwner::new("203.0.113.7", 0);
        assert!(channel.start().await.is_err());
        let fx = Fixture::new(channel, SyncedChoice::Dismissed, Duration::from_secs(5)).await;
        let script = fx.script("foo.user.js", "// nowhere");

        let result = fx
            .dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await;
        assert!(matches!(result, Err(DispatchError::NoChannel(_))));
        assert!(fx.mailbox_files().is_empty());
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 0);
    }

    #[tokio::test]
    async fn test_missing_file_reports_read_error() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let gone = fx.ws().join("gone.user.js");

        let result = fx
            .dispatcher
            .on_change(&FileEvent::file(&gone, ChangeKind::Changed))
            .await;
        assert!(matches!(result, Err(DispatchError::Read { .. })));
    }

    #[tokio::test]
    async fn test_mailbox_failure_warns_operator() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        // Occupy the mailbox path with a regular file
        fs::write(fx.temp.path().join("mailbox"), "blocked").unwrap();
        let script = fx.script("foo.user.js", "// dropped");

        let result = fx
            .dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await;
        assert!(matches!(result, Err(DispatchError::Mailbox(_))));
        assert_eq!(fx.notifier.count("warning"), 1);

        // The failed write was still an attempt to sync, so the notice follows
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 1);
    }

    #[tokio::test]
    async fn test_synced_notice_only_for_changes() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let script = fx.script("foo.user.js", "// x");

        fx.dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Created))
            .await
            .unwrap();
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 0);

        fx.dispatcher
            .on_change(&FileEvent::file(&script, ChangeKind::Changed))
            .await
            .unwrap();
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 1);
    }

    #[tokio::test]
    async fn test_mute_suppresses_notice_not_delivery() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Mute,
            Duration::from_secs(5),
        )
        .await;
        let script = fx.script("foo.user.js", "// x");
        let event = FileEvent::file(&script, ChangeKind::Changed);

        fx.dispatcher.on_change(&event).await.unwrap();
        settle().await;
        assert_eq!(fx.notifier.count("synced"), 1);
        assert!(fx.dispatcher.workspace().is_muted(&script.display().to_string()));

        let delivery = fx.dispatcher.on_change(&event).await.unwrap();
        settle().await;
        assert!(matches!(delivery, Delivery::Mailbox(_)));
        assert_eq!(fx.notifier.count("synced"), 1);
        assert_eq!(fx.mailbox_files().len(), 2);
    }

    #[tokio::test]
    async fn test_change_target_keeps_single_watcher() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let debug_script = fx.script("debug.user.js", "// debug");

        assert_eq!(fx.dispatcher.active_target(), None);
        let mut last = 0;
        for i in 0..5 {
            let target = if i % 2 == 0 {
                WatchTarget::auto_detect(fx.ws())
            } else {
                WatchTarget::explicit(&debug_script)
            };
            fx.dispatcher.change_target_script(target.clone()).unwrap();

            let generation = fx.dispatcher.active_generation();
            assert!(generation > last);
            last = generation;
            assert_eq!(fx.dispatcher.active_target(), Some(target));
        }

        assert!(fx.dispatcher.dispose_watcher());
        assert!(!fx.dispatcher.dispose_watcher());
        assert_eq!(fx.dispatcher.active_target(), None);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_previous_watcher() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let auto = WatchTarget::auto_detect(fx.ws());
        fx.dispatcher.change_target_script(auto.clone()).unwrap();
        let generation = fx.dispatcher.active_generation();

        let missing = WatchTarget::explicit(fx.temp.path().join("no/such/dir/x.user.js"));
        assert!(fx.dispatcher.change_target_script(missing).is_err());
        assert_eq!(fx.dispatcher.active_target(), Some(auto));
        assert_eq!(fx.dispatcher.active_generation(), generation);
    }

    #[tokio::test]
    async fn test_run_drops_stale_generation_events() {
        let mut fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let script = fx.script("foo.user.js", "// x");

        fx.dispatcher
            .change_target_script(WatchTarget::auto_detect(fx.ws()))
            .unwrap();
        let stale = fx.dispatcher.active_generation();
        fx.dispatcher
            .change_target_script(WatchTarget::explicit(&script))
            .unwrap();
        let current = fx.dispatcher.active_generation();

        let cancel = CancellationToken::new();
        let run = tokio::spawn(
            fx.dispatcher
                .clone()
                .run(fx.events_rx.take().unwrap(), cancel.clone()),
        );

        let event = FileEvent::file(&script, ChangeKind::Created);
        fx.dispatcher.events_tx.send((stale, event.clone())).unwrap();
        fx.dispatcher.events_tx.send((current, event)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(fx.mailbox_files().len(), 1);
        cancel.cancel();
        run.await.unwrap();
    }

    #[tokio::test]
    async fn test_debug_info_checks_dir_live() {
        let port = reserve_port();
        let channel = ChannelOwner::new("127.0.0.1", port);
        channel.start().await.unwrap();
        let fx = Fixture::new(channel.clone(), SyncedChoice::Dismissed, Duration::from_secs(5)).await;

        let snap = fx.dispatcher.debug_info().await;
        assert!(snap.is_web_socket_owner);
        assert!(snap.ws_manager_running);
        assert_eq!(snap.ws_manager_port, port);
        assert!(snap.shared_dir.ends_with("mailbox"));
        assert!(!snap.shared_dir_exists);

        fs::create_dir_all(fx.temp.path().join("mailbox")).unwrap();
        assert!(fx.dispatcher.debug_info().await.shared_dir_exists);
        channel.dispose();
    }

    #[tokio::test]
    async fn test_debug_info_follower() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        let snap = fx.dispatcher.debug_info().await;
        assert!(!snap.is_web_socket_owner);
        assert!(!snap.ws_manager_running);
        assert_eq!(snap.ws_manager_port, 0);
    }

    #[tokio::test]
    async fn test_close_is_repeatable() {
        let fx = Fixture::new(
            ChannelOwner::new("127.0.0.1", 0),
            SyncedChoice::Dismissed,
            Duration::from_secs(5),
        )
        .await;
        fx.dispatcher
            .change_target_script(WatchTarget::auto_detect(fx.ws()))
            .unwrap();
        fx.dispatcher.close();
        fx.dispatcher.close();
        assert_eq!(fx.dispatcher.active_target(), None);
    }
}
