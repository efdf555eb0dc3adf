//! Folder notifications.

use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Keeps the OS watches alive and forwards ready files to the event loop.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
}

impl FolderWatcher {
    /// Watch each folder (non-recursively) and send the path of every file
    /// that becomes ready in it.
    pub fn start(folders: &[&Path], ready: UnboundedSender<PathBuf>) -> notify::Result<Self> {
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| match result {
            Ok(event) => {
                for path in ready_paths(&event) {
                    if ready.send(path).is_err() {
                        return;
                    }
                }
            }
            Err(error) => warn!(%error, "watch error"),
        })?;

        for folder in folders {
            watcher.watch(folder, RecursiveMode::NonRecursive)?;
            debug!(folder = %folder.display(), "watching");
        }
        Ok(Self { _watcher: watcher })
    }
}

/// Files a notification marks as complete: closed after writing, or
/// renamed into the folder.
pub fn ready_paths(event: &Event) -> Vec<PathBuf> {
    match event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event.paths.clone(),
        _ => Vec::new(),
    }
}
