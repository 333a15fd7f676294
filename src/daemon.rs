use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{Quota, RemoteApi, SafeClient, WEB_LINK_PREFIX};
use crate::control::{self, ControlRequest, ControlServer};
use crate::db::{self, LOCAL_STATE_DATABASE, REMOTE_STATE_DATABASE};
use crate::settings::Settings;
use crate::sync::local_watcher::{LocalEvent, LocalWatcher};
use crate::sync::reconciler::{Reconciler, SyncState};
use crate::sync::remote_watcher::{start_remote_watcher, RemoteWatcherMsg};
use crate::sync::store::StateStore;
use crate::sync::transfer::{TransferDone, TransferManager};
use crate::util::path::PathModel;

/// An authenticated sync session: everything torn down on logout.
struct Session {
    api: Arc<dyn RemoteApi>,
    reconciler: Reconciler,
    cancel: CancellationToken,
}

/// Composes settings, control surface, reconciler and watchers, and owns
/// the authentication transitions. `session == None` is the `Unauth`
/// state of the bootstrap machine.
pub struct Daemon {
    settings: Settings,
    quota: Quota,
    notifications: VecDeque<Value>,
    session: Option<Session>,
}

impl Daemon {
    pub fn new(settings_path: Option<&Path>) -> Result<Self> {
        let path = match settings_path {
            Some(p) => p.to_path_buf(),
            None => Settings::default_path()?,
        };
        let settings = Settings::load(&path)?;
        Ok(Self {
            settings,
            quota: Quota::default(),
            notifications: VecDeque::new(),
            session: None,
        })
    }

    pub async fn run(mut self) -> Result<()> {
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let server_cancel = CancellationToken::new();
        match control::socket_path().and_then(|p| ControlServer::bind(&p)) {
            Ok(server) => {
                server.spawn(control_tx, server_cancel.clone());
            }
            Err(e) => {
                // Error kind 5: keep running without a control surface.
                tracing::warn!(error = format!("{e:#}"), "control socket unavailable");
            }
        }

        // Session-independent channels: watcher tasks of the current
        // session hold clones of the senders; events from a torn-down
        // session drain harmlessly while `session` is `None`.
        let (local_tx, mut local_rx) = mpsc::unbounded_channel::<LocalEvent>();
        let (remote_tx, mut remote_rx) = mpsc::unbounded_channel::<RemoteWatcherMsg>();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<TransferDone>();

        if self.settings.has_credentials() {
            if let Err(e) = self.login(&local_tx, &remote_tx, &done_tx).await {
                tracing::error!(error = format!("{e:#}"), "startup login failed");
            }
        } else {
            tracing::info!("no stored credentials, waiting for login");
        }

        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                    break;
                }

                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                    break;
                }

                Some(request) = control_rx.recv() => {
                    self.handle_control(request, &local_tx, &remote_tx, &done_tx).await;
                }

                Some(event) = local_rx.recv() => {
                    if let Some(session) = &self.session {
                        session.reconciler.handle_local_event(event).await;
                    }
                }

                Some(msg) = remote_rx.recv() => {
                    match msg {
                        RemoteWatcherMsg::Event(event) => {
                            if let Some(session) = &self.session {
                                session.reconciler.handle_remote_event(event).await;
                            }
                        }
                        RemoteWatcherMsg::Cursor(ts) => {
                            self.settings.last_updated = ts;
                            if let Err(e) = self.settings.save() {
                                tracing::error!(error = %e, "failed to persist event cursor");
                            }
                        }
                    }
                }

                Some(done) = done_rx.recv() => {
                    if let Some(session) = &self.session {
                        session.reconciler.handle_transfer_done(done).await;
                        match session.api.disk_quota().await {
                            Ok(quota) => self.quota = quota,
                            Err(e) => tracing::warn!(error = %e, "failed to fetch quota"),
                        }
                    }
                }
            }
        }

        // Watchers go down before RPC resources.
        self.teardown_session();
        server_cancel.cancel();
        tracing::info!("safesyncd stopped");
        Ok(())
    }

    /// Authenticate with the stored credentials and run the bootstrap
    /// sequence: quota, fresh indices, remote index, cursor snap, local
    /// index, live watchers.
    async fn login(
        &mut self,
        local_tx: &mpsc::UnboundedSender<LocalEvent>,
        remote_tx: &mpsc::UnboundedSender<RemoteWatcherMsg>,
        done_tx: &mpsc::UnboundedSender<TransferDone>,
    ) -> Result<()> {
        if !self.settings.has_credentials() {
            tracing::debug!("unauthorized, credentials missing");
            return Ok(());
        }
        // A login over a live session replaces it.
        self.teardown_session();

        let api: Arc<dyn RemoteApi> = Arc::new(SafeClient::new());
        match api.auth(&self.settings.login, &self.settings.password).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("authentication failed");
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = format!("{e:#}"), "authentication attempt failed");
                return Ok(());
            }
        }

        match api.disk_quota().await {
            Ok(quota) => self.quota = quota,
            Err(e) => tracing::warn!(error = %e, "failed to fetch quota"),
        }

        // Fresh, empty state stores for this session.
        db::purge_db(LOCAL_STATE_DATABASE)?;
        db::purge_db(REMOTE_STATE_DATABASE)?;
        let local = StateStore::open(db::open_db(LOCAL_STATE_DATABASE).await?).await?;
        let remote = StateStore::open(db::open_db(REMOTE_STATE_DATABASE).await?).await?;

        let root = self.settings.filesystem_path()?;
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create sync root: {}", root.display()))?;

        let transfers = TransferManager::new(api.clone(), done_tx.clone());
        let mut reconciler = Reconciler::new(
            PathModel::new(&root),
            local,
            remote,
            api.clone(),
            transfers,
        );

        reconciler.index_remote().await?;

        // Events from here on are covered by the live watcher.
        self.settings.last_updated = chrono::Utc::now().timestamp();
        self.settings.save()?;

        reconciler.index_local(self.settings.init).await?;

        // The full index succeeded; subsequent logins take the fast path.
        self.settings.init = false;
        self.settings.save()?;

        let (watcher, mut watcher_rx) = LocalWatcher::start(&root)?;
        // The reconciler holds the only long-lived handle: dropping the
        // session drops the watcher, which closes this forwarder.
        reconciler.attach_watcher(Arc::new(watcher));
        let forward_local = local_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = watcher_rx.recv().await {
                if forward_local.send(event).is_err() {
                    break;
                }
            }
        });

        let cancel = CancellationToken::new();
        let mut events_rx =
            start_remote_watcher(api.clone(), self.settings.last_updated, cancel.clone());
        let forward_remote = remote_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = events_rx.recv().await {
                if forward_remote.send(msg).is_err() {
                    break;
                }
            }
        });

        self.session = Some(Session {
            api,
            reconciler,
            cancel,
        });
        tracing::info!(login = %self.settings.login, "authenticated, sync is live");
        Ok(())
    }

    fn sync_state(&self) -> SyncState {
        self.session
            .as_ref()
            .map(|s| s.reconciler.state())
            .unwrap_or(SyncState::Unauth)
    }

    /// Cancel transfers and watchers; the reconciler and its stores drop
    /// with the session.
    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.reconciler.transfers().cancel_all();
            session.cancel.cancel();
        }
    }

    /// Full deauthentication: purge indices and require a fresh full
    /// index on the next login.
    fn deauth(&mut self) {
        self.teardown_session();
        if let Err(e) = db::purge_db(LOCAL_STATE_DATABASE) {
            tracing::warn!(error = %e, "failed to purge local state db");
        }
        if let Err(e) = db::purge_db(REMOTE_STATE_DATABASE) {
            tracing::warn!(error = %e, "failed to purge remote state db");
        }
        self.settings.init = true;
        if let Err(e) = self.settings.save() {
            tracing::error!(error = %e, "failed to persist settings");
        }
    }

    async fn handle_control(
        &mut self,
        request: ControlRequest,
        local_tx: &mpsc::UnboundedSender<LocalEvent>,
        remote_tx: &mpsc::UnboundedSender<RemoteWatcherMsg>,
        done_tx: &mpsc::UnboundedSender<TransferDone>,
    ) {
        match request {
            ControlRequest::GetSettings { fields, reply } => {
                let value = control::settings_reply(&fields, |f| self.settings.value_of(f));
                let _ = reply.send(value);
            }

            ControlRequest::SetSettings { args } => {
                for (key, value) in &args {
                    let value = match value.as_str() {
                        Some(s) => s.to_string(),
                        None => value.to_string(),
                    };
                    self.settings.set_value(key, &value);
                }
                if let Err(e) = self.settings.save() {
                    tracing::error!(error = %e, "failed to persist settings");
                }
            }

            ControlRequest::Login { login, password } => {
                self.settings.login = login;
                self.settings.password = password;
                if let Err(e) = self.settings.save() {
                    tracing::error!(error = %e, "failed to persist credentials");
                }
                if let Err(e) = self.login(local_tx, remote_tx, done_tx).await {
                    tracing::error!(error = format!("{e:#}"), "login failed");
                }
            }

            ControlRequest::Logout => {
                self.deauth();
                self.settings.login.clear();
                self.settings.password.clear();
                if let Err(e) = self.settings.save() {
                    tracing::error!(error = %e, "failed to persist settings");
                }
                tracing::info!("logged out");
            }

            ControlRequest::Chdir { dir } => {
                if !dir_is_usable(&dir) {
                    tracing::warn!(dir, "chdir target is not a readable directory");
                    return;
                }
                self.settings.root_name = dir;
                self.deauth();
                if let Err(e) = self.login(local_tx, remote_tx, done_tx).await {
                    tracing::error!(error = format!("{e:#}"), "re-login after chdir failed");
                }
            }

            ControlRequest::GetPublicLink { file, reply } => {
                let link = match &self.session {
                    Some(session) => session.reconciler.public_link(Path::new(&file)).await,
                    None => String::new(),
                };
                let _ = reply.send(link);
            }

            ControlRequest::OpenInBrowser { file, reply } => {
                let link = match &self.session {
                    Some(session) => {
                        session
                            .reconciler
                            .folder_link(Path::new(&file), WEB_LINK_PREFIX)
                            .await
                    }
                    None => String::new(),
                };
                let _ = reply.send(link);
            }

            ControlRequest::Noop { reply } => {
                tracing::debug!(state = ?self.sync_state(), "status ping");
                let active = self
                    .session
                    .as_ref()
                    .map(|s| s.reconciler.transfers().active_count())
                    .unwrap_or(0);
                self.notifications.push_back(quota_event(self.quota));
                self.notifications
                    .push_back(sync_event(active, self.settings.last_updated));
                self.notifications
                    .push_back(auth_event(self.session.is_some(), &self.settings.login));

                let value = drain_queue(&mut self.notifications);
                let _ = reply.send(value);
            }
        }
    }
}

fn dir_is_usable(dir: &str) -> bool {
    let path = Path::new(dir);
    path.is_dir() && std::fs::read_dir(path).is_ok()
}

fn quota_event(quota: Quota) -> Value {
    json!({
        "type": "event",
        "category": "disk_quota",
        "values": { "used_bytes": quota.used_bytes, "total_bytes": quota.total_bytes },
    })
}

fn sync_event(active_transfers: usize, last_updated: i64) -> Value {
    json!({
        "type": "event",
        "category": "sync",
        "values": { "count": active_transfers, "timestamp": last_updated },
    })
}

fn auth_event(authorized: bool, login: &str) -> Value {
    json!({
        "type": "event",
        "category": "auth",
        "values": { "authorized": authorized, "login": login },
    })
}

fn drain_queue(queue: &mut VecDeque<Value>) -> Value {
    if queue.is_empty() {
        json!({ "type": "noop" })
    } else {
        let messages: Vec<Value> = queue.drain(..).collect();
        json!({ "type": "queue", "messages": messages })
    }
}
