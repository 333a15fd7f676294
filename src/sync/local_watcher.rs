use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use notify::event::{CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// A change event from the local filesystem watcher.
///
/// `is_dir` on delete events is a hint only: the entity is gone from disk
/// by the time the event arrives, so the reconciler falls back to its own
/// tables when the kind is ambiguous.
#[derive(Debug, Clone)]
pub enum LocalEvent {
    Added { path: PathBuf, is_dir: bool },
    Modified { path: PathBuf },
    Deleted { path: PathBuf, is_dir: bool },
    Moved {
        old: PathBuf,
        new: PathBuf,
        is_dir: bool,
    },
}

/// Keeps the notify watcher alive and accepts additional watch roots for
/// remotely-created directories. Drop to stop watching.
pub struct LocalWatcher {
    watcher: Mutex<RecommendedWatcher>,
}

impl LocalWatcher {
    /// Start watching `root` recursively. Translated events arrive on the
    /// returned channel. Bursts are not coalesced here; the transfer
    /// manager's debounce absorbs them.
    pub fn start(root: &Path) -> Result<(Self, mpsc::UnboundedReceiver<LocalEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<Event, notify::Error>| match result {
                Ok(event) => {
                    for translated in translate(event) {
                        let _ = tx.send(translated);
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "local watcher error");
                }
            },
        )
        .context("Failed to create file watcher")?;

        watcher
            .watch(root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch sync root: {}", root.display()))?;
        tracing::info!(root = %root.display(), "watching for local changes");

        Ok((
            Self {
                watcher: Mutex::new(watcher),
            },
            rx,
        ))
    }

    /// Cover a directory created from the remote side. Recursive watches on
    /// the sync root already include it on inotify platforms; the extra
    /// watch is harmless there and required where recursion is emulated.
    pub fn add_recursive_watch(&self, path: &Path) {
        let mut watcher = self.watcher.lock().unwrap();
        if let Err(e) = watcher.watch(path, RecursiveMode::Recursive) {
            tracing::debug!(path = %path.display(), error = %e, "add_recursive_watch failed");
        }
    }
}

/// Map a raw notify event onto the watcher contract.
fn translate(event: Event) -> Vec<LocalEvent> {
    let mut out = Vec::new();
    match event.kind {
        EventKind::Create(kind) => {
            if let Some(path) = event.paths.first() {
                let is_dir = matches!(kind, CreateKind::Folder) || path.is_dir();
                out.push(LocalEvent::Added {
                    path: path.clone(),
                    is_dir,
                });
            }
        }

        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if let [old, new] = event.paths.as_slice() {
                out.push(LocalEvent::Moved {
                    old: old.clone(),
                    new: new.clone(),
                    is_dir: new.is_dir(),
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
            if let Some(path) = event.paths.first() {
                out.push(LocalEvent::Deleted {
                    path: path.clone(),
                    is_dir: false,
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            if let Some(path) = event.paths.first() {
                out.push(LocalEvent::Added {
                    path: path.clone(),
                    is_dir: path.is_dir(),
                });
            }
        }
        EventKind::Modify(ModifyKind::Name(_)) => {
            // Unpaired rename of unknown direction: resolve against disk.
            if let Some(path) = event.paths.first() {
                if path.exists() {
                    out.push(LocalEvent::Added {
                        path: path.clone(),
                        is_dir: path.is_dir(),
                    });
                } else {
                    out.push(LocalEvent::Deleted {
                        path: path.clone(),
                        is_dir: false,
                    });
                }
            }
        }
        EventKind::Modify(_) => {
            for path in &event.paths {
                // Directory mtime churn is noise; only file contents matter.
                if path.is_file() {
                    out.push(LocalEvent::Modified { path: path.clone() });
                }
            }
        }

        EventKind::Remove(kind) => {
            if let Some(path) = event.paths.first() {
                out.push(LocalEvent::Deleted {
                    path: path.clone(),
                    is_dir: matches!(kind, RemoveKind::Folder),
                });
            }
        }

        EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Drain events until quiet, so assertions are not order-sensitive.
    async fn drain(rx: &mut mpsc::UnboundedReceiver<LocalEvent>) -> Vec<LocalEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv()).await {
                Ok(Some(ev)) => events.push(ev),
                _ => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn create_write_and_remove_are_observed() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) = LocalWatcher::start(dir.path()).unwrap();

        let file = dir.path().join("note.txt");
        tokio::fs::write(&file, b"hello").await.unwrap();
        let created = drain(&mut rx).await;
        assert!(
            created.iter().any(|e| matches!(
                e,
                LocalEvent::Added { path, is_dir: false } | LocalEvent::Modified { path }
                if path == &file
            )),
            "no create/write event for {file:?}: {created:?}"
        );

        tokio::fs::remove_file(&file).await.unwrap();
        let removed = drain(&mut rx).await;
        assert!(
            removed
                .iter()
                .any(|e| matches!(e, LocalEvent::Deleted { path, .. } if path == &file)),
            "no delete event for {file:?}: {removed:?}"
        );
    }

    #[tokio::test]
    async fn new_directory_is_observed() {
        let dir = tempfile::tempdir().unwrap();
        let (_watcher, mut rx) = LocalWatcher::start(dir.path()).unwrap();

        let sub = dir.path().join("sub");
        tokio::fs::create_dir(&sub).await.unwrap();
        let events = drain(&mut rx).await;
        assert!(
            events
                .iter()
                .any(|e| matches!(e, LocalEvent::Added { path, is_dir: true } if path == &sub)),
            "no dir-added event for {sub:?}: {events:?}"
        );
    }
}
