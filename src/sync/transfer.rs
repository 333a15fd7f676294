use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{RemoteApi, SafeFile};

/// Debounce window measured from the most recent enqueue for a path.
pub const DEBOUNCE: Duration = Duration::from_millis(2000);

/// What a queued transfer will do once its debounce timer expires.
#[derive(Debug, Clone)]
enum TransferKind {
    Upload { parent_remote_id: String },
    Download { source_remote_id: String },
}

/// Completion notification delivered back to the reconciliation loop.
/// Superseded (cancelled) transfers never produce one.
#[derive(Debug)]
pub enum TransferDone {
    Upload {
        absolute_path: PathBuf,
        /// The uploaded object's props; `None` when the RPC failed.
        uploaded: Option<SafeFile>,
    },
    Download {
        absolute_path: PathBuf,
        source_remote_id: String,
        ok: bool,
    },
}

struct Entry {
    id: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Maps {
    next_id: u64,
    pending: HashMap<PathBuf, Entry>,
    active: HashMap<PathBuf, Entry>,
}

/// Debounced, de-duplicated transfer queue keyed by absolute local path.
///
/// A newer enqueue for the same path always supersedes an older pending or
/// active transfer. There is no retry queue: failures are logged and
/// forgotten; the next reconciliation pass re-derives the need if the
/// divergence persists.
#[derive(Clone)]
pub struct TransferManager {
    api: Arc<dyn RemoteApi>,
    done_tx: mpsc::UnboundedSender<TransferDone>,
    maps: Arc<Mutex<Maps>>,
}

impl TransferManager {
    pub fn new(api: Arc<dyn RemoteApi>, done_tx: mpsc::UnboundedSender<TransferDone>) -> Self {
        Self {
            api,
            done_tx,
            maps: Arc::new(Mutex::new(Maps::default())),
        }
    }

    pub fn enqueue_upload(&self, parent_remote_id: &str, absolute_path: &Path) {
        self.enqueue(
            TransferKind::Upload {
                parent_remote_id: parent_remote_id.to_string(),
            },
            absolute_path,
        );
    }

    pub fn enqueue_download(&self, source_remote_id: &str, absolute_path: &Path) {
        self.enqueue(
            TransferKind::Download {
                source_remote_id: source_remote_id.to_string(),
            },
            absolute_path,
        );
    }

    fn enqueue(&self, kind: TransferKind, absolute_path: &Path) {
        let path = absolute_path.to_path_buf();
        let token = CancellationToken::new();
        let id;

        {
            let mut maps = self.maps.lock().unwrap();
            if let Some(old) = maps.active.remove(&path) {
                tracing::debug!(path = %path.display(), "superseding active transfer");
                old.token.cancel();
            }
            if let Some(old) = maps.pending.remove(&path) {
                old.token.cancel();
            }
            id = maps.next_id;
            maps.next_id += 1;
            maps.pending.insert(
                path.clone(),
                Entry {
                    id,
                    token: token.clone(),
                },
            );
        }

        let mgr = self.clone();
        tokio::spawn(async move {
            mgr.run_transfer(kind, path, id, token).await;
        });
    }

    /// Cancel any pending or active transfer for a path (e.g. the file was
    /// deleted before the timer fired).
    pub fn cancel(&self, absolute_path: &Path) {
        let mut maps = self.maps.lock().unwrap();
        if let Some(old) = maps.pending.remove(absolute_path) {
            old.token.cancel();
        }
        if let Some(old) = maps.active.remove(absolute_path) {
            old.token.cancel();
        }
    }

    /// Cancel everything (logout).
    pub fn cancel_all(&self) {
        let mut maps = self.maps.lock().unwrap();
        for (_, entry) in maps.pending.drain() {
            entry.token.cancel();
        }
        for (_, entry) in maps.active.drain() {
            entry.token.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.maps.lock().unwrap().active.len()
    }

    pub fn pending_count(&self) -> usize {
        self.maps.lock().unwrap().pending.len()
    }

    async fn run_transfer(
        &self,
        kind: TransferKind,
        path: PathBuf,
        id: u64,
        token: CancellationToken,
    ) {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(DEBOUNCE) => {}
        }

        // Promote pending -> active, unless a newer enqueue replaced us.
        {
            let mut maps = self.maps.lock().unwrap();
            match maps.pending.get(&path) {
                Some(entry) if entry.id == id => {
                    let entry = maps.pending.remove(&path).unwrap();
                    maps.active.insert(path.clone(), entry);
                }
                _ => return,
            }
        }

        let done = match &kind {
            TransferKind::Upload { parent_remote_id } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                tracing::info!(path = %path.display(), parent = %parent_remote_id, "uploading");
                let result = tokio::select! {
                    _ = token.cancelled() => None,
                    r = self.api.push_file(parent_remote_id, &path, &name) => Some(r),
                };
                match result {
                    None => None, // cancelled mid-flight, completion is a no-op
                    Some(Ok(file)) => Some(TransferDone::Upload {
                        absolute_path: path.clone(),
                        uploaded: Some(file),
                    }),
                    Some(Err(e)) => {
                        tracing::warn!(path = %path.display(), error = %e, "upload failed");
                        Some(TransferDone::Upload {
                            absolute_path: path.clone(),
                            uploaded: None,
                        })
                    }
                }
            }
            TransferKind::Download { source_remote_id } => {
                tracing::info!(path = %path.display(), id = %source_remote_id, "downloading");
                let result = tokio::select! {
                    _ = token.cancelled() => None,
                    r = self.api.pull_file(source_remote_id, &path) => Some(r),
                };
                match result {
                    None => None,
                    Some(r) => {
                        if let Err(ref e) = r {
                            tracing::warn!(path = %path.display(), error = %e, "download failed");
                        }
                        Some(TransferDone::Download {
                            absolute_path: path.clone(),
                            source_remote_id: source_remote_id.clone(),
                            ok: r.is_ok(),
                        })
                    }
                }
            }
        };

        {
            let mut maps = self.maps.lock().unwrap();
            if maps.active.get(&path).map(|e| e.id) == Some(id) {
                maps.active.remove(&path);
            }
        }

        if let Some(done) = done {
            let _ = self.done_tx.send(done);
        }
    }
}
