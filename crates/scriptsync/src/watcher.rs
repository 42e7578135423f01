//! Script watcher
//!
//! Turns `notify` events into [`FileEvent`]s for one [`WatchTarget`]. An
//! explicit target watches its parent directory and keeps only events for
//! that exact path; auto-detect watches the workspace recursively, keeps
//! paths matching the glob, and honors the workspace `.gitignore`.
//!
//! Raw events are coalesced with a quiet-period debounce: one save usually
//! produces several notify events, which collapse into one event per path in
//! first-seen order. Every event is tagged with the generation of the
//! watcher that produced it so the dispatcher can drop events from a watcher
//! that has since been replaced.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use scriptsync_core::{ChangeKind, FileEvent, TargetError, TargetMatcher, WatchTarget};

/// Quiet period used to coalesce raw watcher events
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

/// A file event tagged with its watcher generation
pub type TaggedEvent = (u64, FileEvent);

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("failed to create file watcher: {0}")]
    Create(notify::Error),

    #[error("failed to watch {}: {source}", path.display())]
    Watch { path: PathBuf, source: notify::Error },
}

/// An installed watcher; dropping it unregisters the notify subscription
pub struct ScriptWatcher {
    generation: u64,
    target: WatchTarget,
    _watcher: RecommendedWatcher,
}

impl ScriptWatcher {
    /// Start watching `target`, forwarding coalesced events to `events`
    pub fn spawn(
        target: WatchTarget,
        generation: u64,
        debounce: Duration,
        events: mpsc::UnboundedSender<TaggedEvent>,
    ) -> Result<Self, WatchError> {
        let filter = EventFilter::new(&target)?;

        // Bridge notify's sync callback into the tokio world.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                let _ = raw_tx.send(res);
            })
            .map_err(WatchError::Create)?;

        let root = target.watch_root().to_path_buf();
        let mode = if target.is_recursive() {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(&root, mode)
            .map_err(|source| WatchError::Watch {
                path: root.clone(),
                source,
            })?;

        tokio::spawn(forward_events(raw_rx, filter, generation, debounce, events));
        info!(target = %target, generation, "watcher installed");

        Ok(Self {
            generation,
            target,
            _watcher: watcher,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }
}

impl Drop for ScriptWatcher {
    fn drop(&mut self) {
        debug!(target = %self.target, generation = self.generation, "watcher disposed");
    }
}

struct EventFilter {
    matcher: TargetMatcher,
    root: PathBuf,
    gitignore: Option<Gitignore>,
}

impl EventFilter {
    fn new(target: &WatchTarget) -> Result<Self, TargetError> {
        let gitignore = match target {
            WatchTarget::AutoDetect { root, .. } => Some(build_gitignore(root)),
            WatchTarget::Explicit(_) => None,
        };
        Ok(Self {
            matcher: target.matcher()?,
            root: target.watch_root().to_path_buf(),
            gitignore,
        })
    }

    fn accepts(&self, path: &Path) -> bool {
        if !self.matcher.matches(path) {
            return false;
        }
        match &self.gitignore {
            Some(gi) => !is_ignored(path, &self.root, gi),
            None => true,
        }
    }
}

/// Build gitignore matcher from .gitignore file in the workspace root
fn build_gitignore(root: &Path) -> Gitignore {
    let mut builder = GitignoreBuilder::new(root);
    let gitignore_path = root.join(".gitignore");

    if gitignore_path.exists() {
        if let Some(err) = builder.add(&gitignore_path) {
            warn!(path = ?gitignore_path, error = %err, "failed to load .gitignore");
        }
    }

    builder.build().unwrap_or_else(|e| {
        warn!(error = %e, "failed to build gitignore matcher, ignoring nothing");
        Gitignore::empty()
    })
}

/// Check a path and its parent directories against gitignore rules
fn is_ignored(path: &Path, root: &Path, gitignore: &Gitignore) -> bool {
    let relative = path.strip_prefix(root).unwrap_or(path);

    if gitignore.matched(relative, false).is_ignore() {
        return true;
    }
    relative
        .ancestors()
        .skip(1)
        .take_while(|a| *a != Path::new(""))
        .any(|a| gitignore.matched(a, true).is_ignore())
}

/// Map a notify event to the change kind it represents, with affected paths
fn convert_event(event: &Event) -> Vec<(PathBuf, ChangeKind)> {
    let all = |kind: ChangeKind| -> Vec<(PathBuf, ChangeKind)> {
        event.paths.iter().map(|p| (p.clone(), kind)).collect()
    };

    match &event.kind {
        EventKind::Create(_) => all(ChangeKind::Created),
        // Safe-write editors save by renaming a temp file over the script
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => all(ChangeKind::Changed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .get(1)
            .map(|p| vec![(p.clone(), ChangeKind::Changed)])
            .unwrap_or_default(),
        EventKind::Modify(ModifyKind::Data(_)) | EventKind::Modify(ModifyKind::Any) => {
            all(ChangeKind::Changed)
        }
        _ => vec![],
    }
}

/// Append accepted events to `pending`, keeping one entry per path
fn collect(event: &Event, filter: &EventFilter, pending: &mut Vec<FileEvent>) {
    for (path, kind) in convert_event(event) {
        if !filter.accepts(&path) || pending.iter().any(|p| p.path == path) {
            continue;
        }
        pending.push(FileEvent::file(path, kind));
    }
}

/// Debounce raw notify events and forward them in first-seen order
async fn forward_events(
    mut raw_rx: mpsc::UnboundedReceiver<Result<Event, notify::Error>>,
    filter: EventFilter,
    generation: u64,
    debounce: Duration,
    events: mpsc::UnboundedSender<TaggedEvent>,
) {
    let mut pending: Vec<FileEvent> = Vec::new();
    loop {
        // Phase 1: wait for the first relevant event
        match raw_rx.recv().await {
            Some(Ok(event)) => collect(&event, &filter, &mut pending),
            Some(Err(e)) => warn!(error = %e, "file watcher error"),
            None => return,
        }
        if pending.is_empty() {
            continue;
        }

        // Phase 2: keep consuming until the quiet period passes
        if !debounce.is_zero() {
            loop {
                match tokio::time::timeout(debounce, raw_rx.recv()).await {
                    Ok(Some(Ok(event))) => collect(&event, &filter, &mut pending),
                    Ok(Some(Err(e))) => warn!(error = %e, "file watcher error"),
                    Ok(None) => return,
                    Err(_) => break,
                }
            }
        }

        // Phase 3: flush
        for event in pending.drain(..) {
            if events.send((generation, event)).is_err() {
                return;
            }
        }
    }
}
