use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{RemoteApi, RemoteEvent};

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const ERROR_BACKOFF: Duration = Duration::from_secs(30);

/// What the remote watcher delivers to the daemon loop.
#[derive(Debug)]
pub enum RemoteWatcherMsg {
    Event(RemoteEvent),
    /// The cursor advanced past a fully drained batch; the daemon persists
    /// this to `last_updated`.
    Cursor(i64),
}

/// Start the remote event watcher.
///
/// Polls the event feed from the given cursor and forwards typed events.
/// Runs until the cancellation token fires.
pub fn start_remote_watcher(
    api: Arc<dyn RemoteApi>,
    since: i64,
    cancel: CancellationToken,
) -> mpsc::UnboundedReceiver<RemoteWatcherMsg> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        poll_loop(api, since, tx, cancel).await;
        tracing::debug!("remote watcher stopped");
    });

    rx
}

async fn poll_loop(
    api: Arc<dyn RemoteApi>,
    mut cursor: i64,
    tx: mpsc::UnboundedSender<RemoteWatcherMsg>,
    cancel: CancellationToken,
) {
    loop {
        match api.events_since(cursor).await {
            Ok(batch) => {
                if !batch.events.is_empty() {
                    tracing::info!(count = batch.events.len(), "received remote change events");
                }
                for event in batch.events {
                    tracing::debug!(?event, "remote event");
                    if tx.send(RemoteWatcherMsg::Event(event)).is_err() {
                        return;
                    }
                }
                if batch.cursor > cursor {
                    cursor = batch.cursor;
                    if tx.send(RemoteWatcherMsg::Cursor(cursor)).is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch remote events, backing off");
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(ERROR_BACKOFF) => continue,
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}
