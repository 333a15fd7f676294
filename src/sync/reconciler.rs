use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::api::{PropsTarget, RemoteApi, RemoteEvent, SafeFile, SYSTEM_ID, TRASH_ID};
use crate::sync::local_watcher::{LocalEvent, LocalWatcher};
use crate::sync::store::StateStore;
use crate::sync::transfer::{TransferDone, TransferManager};
use crate::util::hash;
use crate::util::path::{join_rel, split_rel, PathModel, ROOT_REL};

/// Bootstrap phases. The daemon is in `Unauth` whenever no reconciler
/// exists; a freshly constructed reconciler is mid-authentication and
/// [`Reconciler::bootstrap`] advances it to `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unauth,
    Authenticating,
    RemoteIndexing,
    LocalIndexing,
    Live,
}

/// Translates filesystem and remote events into state mutations and
/// transfer intents. All handlers run on the daemon's event loop and never
/// let an error escape: failures are logged and the divergence resurfaces
/// on a later event or reindex.
pub struct Reconciler {
    paths: PathModel,
    local: StateStore,
    remote: StateStore,
    api: Arc<dyn RemoteApi>,
    transfers: TransferManager,
    watcher: Option<Arc<LocalWatcher>>,
    state: SyncState,
}

impl Reconciler {
    pub fn new(
        paths: PathModel,
        local: StateStore,
        remote: StateStore,
        api: Arc<dyn RemoteApi>,
        transfers: TransferManager,
    ) -> Self {
        Self {
            paths,
            local,
            remote,
            api,
            transfers,
            watcher: None,
            state: SyncState::Authenticating,
        }
    }

    /// Hook up the live watcher so remote directory creation can extend
    /// the watched tree.
    pub fn attach_watcher(&mut self, watcher: Arc<LocalWatcher>) {
        self.watcher = Some(watcher);
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn transfers(&self) -> &TransferManager {
        &self.transfers
    }

    // ── Bootstrap ───────────────────────────────────────────────────

    /// Index both sides: full remote traversal, then the local walk (or
    /// the differential fast path when `full` is false). Leaves the
    /// reconciler in `Live`; the caller starts the watchers.
    ///
    /// The daemon calls [`Self::index_remote`] and [`Self::index_local`]
    /// separately so it can persist the event cursor in between.
    pub async fn bootstrap(&mut self, full: bool) -> Result<()> {
        self.index_remote().await?;
        self.index_local(full).await?;
        Ok(())
    }

    pub async fn index_remote(&mut self) -> Result<()> {
        self.state = SyncState::RemoteIndexing;
        self.full_remote_index().await
    }

    pub async fn index_local(&mut self, full: bool) -> Result<()> {
        self.state = SyncState::LocalIndexing;
        if full {
            self.full_local_index().await?;
        } else {
            self.check_index().await;
        }
        self.download_missing().await?;

        self.state = SyncState::Live;
        Ok(())
    }

    /// Traverse the remote tree breadth-first. One outstanding listing per
    /// unexplored directory; a failed listing skips that subtree, since a
    /// partial remote index re-surfaces as live events.
    async fn full_remote_index(&self) -> Result<()> {
        let root = self
            .api
            .get_props(PropsTarget::Path(ROOT_REL.to_string()))
            .await
            .context("Failed to resolve the remote root")?;
        self.remote
            .insert_dir(ROOT_REL, ROOT_REL, 0, Some(&root.id))
            .await?;

        let mut outstanding = std::collections::VecDeque::new();
        outstanding.push_back((root.id, ROOT_REL.to_string()));
        let mut files = 0usize;
        let mut dirs = 0usize;

        while let Some((dir_id, dir_rel)) = outstanding.pop_front() {
            let listing = match self.api.list_dir(&dir_id).await {
                Ok(l) => l,
                Err(e) => {
                    tracing::warn!(dir = %dir_rel, error = %e, "remote listing failed, skipping subtree");
                    continue;
                }
            };

            for file in &listing.files {
                if file.is_trash {
                    continue;
                }
                let rel = join_rel(&dir_rel, &file.name);
                self.remote
                    .insert_file(&dir_rel, &rel, &file.name, file.mtime, &file.chksum, Some(&file.id))
                    .await?;
                files += 1;
            }

            for dir in &listing.dirs {
                if dir.is_trash
                    || !dir.special_dir.is_empty()
                    || dir.id == TRASH_ID
                    || dir.id == SYSTEM_ID
                {
                    continue;
                }
                let rel = join_rel(&dir_rel, &dir.name);
                self.remote
                    .insert_dir(&rel, &dir.name, dir.mtime, Some(&dir.id))
                    .await?;
                outstanding.push_back((dir.id.clone(), rel));
                dirs += 1;
            }
        }

        tracing::info!(files, dirs, "finished remote indexing");
        Ok(())
    }

    /// Walk the sync root, hashing every file into the local index and
    /// emitting synthetic added events for entities unknown to both sides.
    async fn full_local_index(&self) -> Result<()> {
        let root = self.paths.root().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("Failed to create sync root: {}", root.display()))?;

        struct DirAcc {
            name: String,
            mtime: i64,
            known: bool,
        }

        let mut dir_accs: HashMap<String, DirAcc> = HashMap::new();
        let mut new_files = Vec::new();
        let mut stack = vec![root];
        let mut file_count = 0usize;

        while let Some(dir) = stack.pop() {
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(rd) => rd,
                Err(e) => {
                    tracing::warn!(path = %dir.display(), error = %e, "cannot read dir, skipping");
                    continue;
                }
            };

            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if PathModel::is_hidden(&path) {
                    continue;
                }
                let meta = match tokio::fs::symlink_metadata(&path).await {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "cannot stat, skipping");
                        continue;
                    }
                };
                if meta.is_symlink() {
                    tracing::debug!(path = %path.display(), "skipping symlink");
                    continue;
                }
                let Some(rel) = self.paths.relative(&path) else {
                    continue;
                };

                if meta.is_dir() {
                    let known = self.local.exists_dir(&rel).await?
                        || self.remote.exists_dir(&rel).await?;
                    dir_accs.insert(
                        rel,
                        DirAcc {
                            name: entry.file_name().to_string_lossy().into_owned(),
                            mtime: meta_mtime(&meta),
                            known,
                        },
                    );
                    stack.push(path);
                } else if meta.is_file() {
                    let mtime = meta_mtime(&meta);
                    let content_hash = hash::hash_file(&path).await;
                    let known = self.local.exists_file(&rel).await?
                        || self.remote.exists_file(&rel).await?;
                    let (parent_rel, name) = split_rel(&rel);
                    self.local
                        .insert_file(parent_rel, &rel, name, mtime, &content_hash, None)
                        .await?;
                    if let Some(acc) = dir_accs.get_mut(parent_rel) {
                        if mtime > acc.mtime {
                            acc.mtime = mtime;
                        }
                    }
                    if !known {
                        new_files.push(path);
                    }
                    file_count += 1;
                }
            }
        }

        // Unknown directories first, shallowest first, so remote ancestors
        // exist before their children.
        let mut ordered: Vec<String> = dir_accs.keys().cloned().collect();
        ordered.sort_by_key(|rel| rel.matches('/').count());
        for rel in &ordered {
            if !dir_accs[rel].known {
                let abs = self.paths.absolute(rel);
                if let Err(e) = self.added_inner(&abs, true, false).await {
                    tracing::warn!(path = %rel, error = %e, "failed to publish new directory");
                }
            }
        }

        // Directory rows deepest-first: each hash folds in the already
        // computed hashes of its children.
        for rel in ordered.iter().rev() {
            let acc = &dir_accs[rel];
            self.local
                .insert_dir(rel, &acc.name, acc.mtime, None)
                .await?;
            self.local.update_dir_hash(rel).await?;
        }

        for path in &new_files {
            if let Err(e) = self.added_inner(path, false, false).await {
                tracing::warn!(path = %path.display(), error = %e, "failed to publish new file");
            }
        }

        tracing::info!(
            files = file_count,
            dirs = dir_accs.len(),
            new = new_files.len(),
            "finished local indexing"
        );
        Ok(())
    }

    /// Differential re-scan placeholder: live events carry the delta.
    async fn check_index(&self) {
        tracing::debug!("differential index skipped, relying on live events");
    }

    /// Mirror remote-only entities down: create missing directories on
    /// disk and queue downloads for files absent from the local index.
    async fn download_missing(&self) -> Result<()> {
        for rel in self.remote.dir_paths().await? {
            if rel == ROOT_REL || self.local.exists_dir(&rel).await? {
                continue;
            }
            let abs = self.paths.absolute(&rel);
            tokio::fs::create_dir_all(&abs)
                .await
                .with_context(|| format!("Failed to create dir: {}", abs.display()))?;
            if let Some(record) = self.remote.dir_record(&rel).await? {
                self.local
                    .insert_dir(&rel, &record.name, record.mtime, record.remote_id.as_deref())
                    .await?;
            }
        }

        let mut queued = 0usize;
        for rel in self.remote.file_paths().await? {
            if self.local.exists_file(&rel).await? {
                continue;
            }
            let Some(id) = self.remote.file_id(&rel).await? else {
                continue;
            };
            self.transfers.enqueue_download(&id, &self.paths.absolute(&rel));
            queued += 1;
        }
        if queued > 0 {
            tracing::info!(count = queued, "queued downloads for remote-only files");
        }
        Ok(())
    }

    // ── Local events ────────────────────────────────────────────────

    pub async fn handle_local_event(&self, event: LocalEvent) {
        let result = match &event {
            LocalEvent::Added { path, is_dir } => self.added_inner(path, *is_dir, true).await,
            LocalEvent::Modified { path } => self.local_modified(path).await,
            LocalEvent::Deleted { path, is_dir } => self.local_deleted(path, *is_dir).await,
            LocalEvent::Moved { old, new, is_dir } => self.local_moved(old, new, *is_dir).await,
        };
        if let Err(e) = result {
            tracing::error!(?event, error = format!("{e:#}"), "local event handler failed");
        }
    }

    async fn added_inner(&self, path: &Path, is_dir: bool, recurse: bool) -> Result<()> {
        if PathModel::is_hidden(path) {
            tracing::debug!(path = %path.display(), "ignoring hidden entry");
            return Ok(());
        }
        let Some(rel) = self.paths.relative(path) else {
            return Ok(());
        };
        if rel == ROOT_REL {
            return Ok(());
        }
        let (parent_rel, name) = split_rel(&rel);
        let (parent_rel, name) = (parent_rel.to_string(), name.to_string());

        if is_dir {
            if self.remote.exists_dir(&rel).await? || self.local.exists_dir(&rel).await? {
                return Ok(());
            }
            tracing::debug!(path = %rel, "directory added");

            if parent_rel != ROOT_REL && !self.remote.exists_dir(&parent_rel).await? {
                self.prepare_tree(path).await?;
            }
            let Some(parent_id) = self.fetch_dir_id(&parent_rel).await? else {
                tracing::warn!(path = %rel, "no remote id for parent, dropping dir add");
                return Ok(());
            };

            let mtime = entry_mtime(path).await;
            let id = match self.api.make_dir(&parent_id, &name).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "failed to create remote directory");
                    return Ok(());
                }
            };
            self.remote.insert_dir(&rel, &name, mtime, Some(&id)).await?;
            self.local.insert_dir(&rel, &name, mtime, Some(&id)).await?;

            if recurse {
                // Catch contents that existed before the watch began.
                self.index_new_dir(path).await?;
            }
            return Ok(());
        }

        let mtime = entry_mtime(path).await;
        let content_hash = hash::hash_file(path).await;
        self.local
            .insert_file(&parent_rel, &rel, &name, mtime, &content_hash, None)
            .await?;
        self.local.update_dir_hash(&parent_rel).await?;

        if self.remote.exists_file(&rel).await? {
            // Defer: a subsequent modified or a remote event decides.
            return Ok(());
        }

        tracing::debug!(path = %rel, "file added");
        if let Err(e) = self.prepare_tree(path).await {
            tracing::warn!(path = %rel, error = %e, "cannot prepare remote tree, dropping upload");
            return Ok(());
        }
        let Some(parent_id) = self.fetch_dir_id(&parent_rel).await? else {
            tracing::warn!(path = %rel, "no remote id for parent, dropping upload");
            return Ok(());
        };
        self.transfers.enqueue_upload(&parent_id, path);
        Ok(())
    }

    /// Recurse into a directory that just became tracked.
    fn index_new_dir<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut read_dir = tokio::fs::read_dir(dir)
                .await
                .with_context(|| format!("Failed to read dir: {}", dir.display()))?;

            while let Some(entry) = read_dir.next_entry().await? {
                let path = entry.path();
                if PathModel::is_hidden(&path) {
                    continue;
                }
                let meta = match tokio::fs::symlink_metadata(&path).await {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                if meta.is_symlink() {
                    continue;
                }
                self.added_inner(&path, meta.is_dir(), true).await?;
            }
            Ok(())
        })
    }

    async fn local_modified(&self, path: &Path) -> Result<()> {
        if PathModel::is_hidden(path) {
            return Ok(());
        }
        let Some(rel) = self.paths.relative(path) else {
            return Ok(());
        };
        let (parent_rel, name) = split_rel(&rel);
        let (parent_rel, name) = (parent_rel.to_string(), name.to_string());

        let mtime = entry_mtime(path).await;
        let content_hash = hash::hash_file(path).await;
        self.local
            .insert_file(&parent_rel, &rel, &name, mtime, &content_hash, None)
            .await?;
        self.local.update_dir_hash(&parent_rel).await?;

        if let Some(remote) = self.remote.file_record(&rel).await? {
            // An empty local hash means the content is unknown: force the
            // transfer. Otherwise matching content or an older local mtime
            // ends it here.
            if !content_hash.is_empty() {
                if content_hash == remote.content_hash {
                    return Ok(());
                }
                if mtime <= remote.mtime {
                    return Ok(());
                }
            }
        }

        tracing::debug!(path = %rel, "file modified");
        if let Err(e) = self.prepare_tree(path).await {
            tracing::warn!(path = %rel, error = %e, "cannot prepare remote tree, dropping upload");
            return Ok(());
        }
        let Some(parent_id) = self.fetch_dir_id(&parent_rel).await? else {
            tracing::warn!(path = %rel, "no remote id for parent, dropping upload");
            return Ok(());
        };
        self.transfers.enqueue_upload(&parent_id, path);
        Ok(())
    }

    async fn local_deleted(&self, path: &Path, is_dir_hint: bool) -> Result<()> {
        if PathModel::is_hidden(path) {
            return Ok(());
        }
        let Some(rel) = self.paths.relative(path) else {
            return Ok(());
        };

        // Only act when the local table knows the entity; the hint from
        // the watcher cannot be trusted once the path is gone from disk.
        if self.local.exists_dir(&rel).await? {
            tracing::debug!(path = %rel, "directory deleted");
            self.transfers.cancel(path);
            self.local.remove_dir_recursive(&rel).await?;

            if let Some(id) = self.remote.dir_id(&rel).await? {
                match self.api.remove_dir(&id, true, true).await {
                    Ok(()) => self.remote.remove_dir_recursive(&rel).await?,
                    Err(e) => {
                        tracing::warn!(path = %rel, error = %e, "failed to remove remote directory");
                    }
                }
            }
            return Ok(());
        }

        if self.local.exists_file(&rel).await? {
            tracing::debug!(path = %rel, is_dir_hint, "file deleted");
            self.transfers.cancel(path);

            if let Some(id) = self.remote.file_id(&rel).await? {
                match self.api.remove_file(&id, true).await {
                    Ok(()) => {
                        self.remote.remove_file(&rel).await?;
                        let (parent_rel, _) = split_rel(&rel);
                        self.remote.update_dir_hash(parent_rel).await?;
                    }
                    Err(e) => {
                        tracing::warn!(path = %rel, error = %e, "failed to remove remote file");
                    }
                }
            }

            self.local.remove_file(&rel).await?;
            let (parent_rel, _) = split_rel(&rel);
            self.local.update_dir_hash(parent_rel).await?;
        }
        Ok(())
    }

    /// No remote rename RPC exists: a move is a delete of the old path and
    /// a re-add of the new one, except when the destination is already
    /// tracked, which is just a content change there.
    async fn local_moved(&self, old: &Path, new: &Path, is_dir: bool) -> Result<()> {
        tracing::debug!(old = %old.display(), new = %new.display(), "moved");

        if !is_dir && !PathModel::is_hidden(new) {
            if let Some(rel_new) = self.paths.relative(new) {
                if self.local.exists_file(&rel_new).await? {
                    self.local_deleted(old, is_dir).await?;
                    self.local_modified(new).await?;
                    return Ok(());
                }
            }
        }

        self.local_deleted(old, is_dir).await?;
        self.added_inner(new, is_dir, true).await?;
        Ok(())
    }

    /// Walk up from `abs`, pushing ancestors missing from the remote index
    /// onto a stack, then create them top-down.
    async fn prepare_tree(&self, abs: &Path) -> Result<()> {
        let Some(mut rel) = self.paths.parent_rel(abs) else {
            return Ok(());
        };

        let mut stack = Vec::new();
        while rel != ROOT_REL && !self.remote.exists_dir(&rel).await? {
            stack.push(rel.clone());
            rel = split_rel(&rel).0.to_string();
        }

        while let Some(rel) = stack.pop() {
            let (parent_rel, name) = split_rel(&rel);
            let Some(parent_id) = self.remote.dir_id(parent_rel).await? else {
                anyhow::bail!("parent directory '{parent_rel}' missing from the remote index");
            };
            let id = self
                .api
                .make_dir(&parent_id, name)
                .await
                .with_context(|| format!("Failed to create remote directory {rel}"))?;
            tracing::debug!(path = %rel, id = %id, "prepared remote directory");
            let mtime = entry_mtime(&self.paths.absolute(&rel)).await;
            self.remote.insert_dir(&rel, name, mtime, Some(&id)).await?;
        }
        Ok(())
    }

    /// Remote id of a directory: the remote index first, a props lookup by
    /// path as fallback.
    async fn fetch_dir_id(&self, rel: &str) -> Result<Option<String>> {
        if let Some(id) = self.remote.dir_id(rel).await? {
            return Ok(Some(id));
        }
        match self.api.get_props(PropsTarget::Path(rel.to_string())).await {
            Ok(props) => Ok(Some(props.id)),
            Err(e) => {
                tracing::warn!(path = rel, error = %e, "failed to resolve remote dir id");
                Ok(None)
            }
        }
    }

    // ── Remote events ───────────────────────────────────────────────

    pub async fn handle_remote_event(&self, event: RemoteEvent) {
        let result = match &event {
            RemoteEvent::FileAdded { id, parent_id, name } => {
                self.remote_file_added(id, parent_id, name).await
            }
            RemoteEvent::FileDeleted { id, parent_id, name } => {
                self.remote_file_deleted(id, parent_id, name).await
            }
            RemoteEvent::FileMoved {
                id,
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => {
                self.remote_file_moved(id, old_parent, old_name, new_parent, new_name)
                    .await
            }
            RemoteEvent::DirCreated { id, parent_id, name } => {
                self.remote_dir_created(id, parent_id, name).await
            }
            RemoteEvent::DirDeleted { id, .. } => self.remote_dir_deleted(id).await,
            RemoteEvent::DirMoved {
                id,
                new_parent,
                new_name,
                ..
            } => self.remote_dir_moved(id, new_parent, new_name).await,
        };
        if let Err(e) = result {
            tracing::error!(?event, error = format!("{e:#}"), "remote event handler failed");
        }
    }

    async fn remote_file_added(&self, id: &str, parent_id: &str, name: &str) -> Result<()> {
        tracing::debug!(name, "remote file added");
        let Some(dir) = self.remote.dir_path_by_id(parent_id).await? else {
            tracing::debug!(parent_id, "unknown remote parent, skipping");
            return Ok(());
        };
        let rel = join_rel(&dir, name);
        let abs = self.paths.absolute(&rel);
        if PathModel::is_hidden(&abs) {
            return Ok(());
        }

        let (mtime, chksum) = match self.api.get_props(PropsTarget::Id(id.to_string())).await {
            Ok(p) => (p.mtime, p.chksum),
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "props fetch failed, content unknown");
                (0, String::new())
            }
        };
        self.remote
            .insert_file(&dir, &rel, name, mtime, &chksum, Some(id))
            .await?;
        self.remote.update_dir_hash(&dir).await?;

        if let Some(local) = self.local.file_record(&rel).await? {
            if !chksum.is_empty() && local.content_hash == chksum {
                // Already converged; just remember the id.
                self.local.set_file_remote_id(&rel, id).await?;
                return Ok(());
            }
            // Newer mtime wins; the local side wins ties.
            if local.mtime >= mtime {
                return Ok(());
            }
        }

        self.transfers.enqueue_download(id, &abs);
        Ok(())
    }

    async fn remote_file_deleted(&self, _id: &str, parent_id: &str, name: &str) -> Result<()> {
        tracing::debug!(name, "remote file deleted");
        let Some(dir) = self.remote.dir_path_by_id(parent_id).await? else {
            return Ok(());
        };
        let rel = join_rel(&dir, name);
        self.remote.remove_file(&rel).await?;
        self.remote.update_dir_hash(&dir).await?;

        if self.local.exists_file(&rel).await? {
            let abs = self.paths.absolute(&rel);
            self.transfers.cancel(&abs);
            self.local.remove_file(&rel).await?;
            self.local.update_dir_hash(&dir).await?;
            match tokio::fs::remove_file(&abs).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "failed to remove local file");
                }
            }
        }
        Ok(())
    }

    async fn remote_dir_created(&self, id: &str, parent_id: &str, name: &str) -> Result<()> {
        tracing::debug!(name, "remote directory created");
        let Some(dir) = self.remote.dir_path_by_id(parent_id).await? else {
            tracing::debug!(parent_id, "unknown remote parent, skipping");
            return Ok(());
        };
        let rel = join_rel(&dir, name);
        let abs = self.paths.absolute(&rel);
        if PathModel::is_hidden(&abs) {
            return Ok(());
        }

        let mtime = match self.api.get_props(PropsTarget::Id(id.to_string())).await {
            Ok(p) => p.mtime,
            Err(_) => chrono::Utc::now().timestamp(),
        };
        self.remote.insert_dir(&rel, name, mtime, Some(id)).await?;
        if !self.local.exists_dir(&rel).await? {
            self.local.insert_dir(&rel, name, mtime, Some(id)).await?;
        }

        // create_dir_all: ancestors may not have hit the disk yet when
        // nested creates arrive out of order.
        tokio::fs::create_dir_all(&abs)
            .await
            .with_context(|| format!("Failed to create dir: {}", abs.display()))?;
        if let Some(watcher) = &self.watcher {
            watcher.add_recursive_watch(&abs);
        }
        Ok(())
    }

    async fn remote_dir_deleted(&self, id: &str) -> Result<()> {
        let Some(rel) = self.remote.dir_path_by_id(id).await? else {
            return Ok(());
        };
        tracing::debug!(path = %rel, "remote directory deleted");
        self.remote.remove_dir_by_id_recursive(id).await?;

        if self.local.exists_dir(&rel).await? {
            self.local.remove_dir_recursive(&rel).await?;
        }

        if rel != ROOT_REL {
            let abs = self.paths.absolute(&rel);
            match tokio::fs::remove_dir_all(&abs).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %rel, error = %e, "failed to remove local directory");
                }
            }
        }
        Ok(())
    }

    async fn remote_file_moved(
        &self,
        id: &str,
        old_parent: &str,
        old_name: &str,
        new_parent: &str,
        new_name: &str,
    ) -> Result<()> {
        let old_rel = match self.remote.dir_path_by_id(old_parent).await? {
            Some(dir) => Some(join_rel(&dir, old_name)),
            None => None,
        };
        let Some(new_dir) = self.remote.dir_path_by_id(new_parent).await? else {
            tracing::debug!(new_parent, "unknown move target parent, skipping");
            return Ok(());
        };
        let new_rel = join_rel(&new_dir, new_name);
        tracing::debug!(old = ?old_rel, new = %new_rel, "remote file moved");

        self.remote.remove_file_by_id(id).await?;
        let (mtime, chksum) = match self.api.get_props(PropsTarget::Id(id.to_string())).await {
            Ok(p) => (p.mtime, p.chksum),
            Err(_) => (0, String::new()),
        };
        self.remote
            .insert_file(&new_dir, &new_rel, new_name, mtime, &chksum, Some(id))
            .await?;
        self.remote.update_dir_hash(&new_dir).await?;

        let new_abs = self.paths.absolute(&new_rel);
        let mut renamed = false;
        if let Some(old_rel) = &old_rel {
            if self.local.exists_file(old_rel).await? {
                self.local.remove_file(old_rel).await?;
                let (old_parent_rel, _) = split_rel(old_rel);
                self.local.update_dir_hash(old_parent_rel).await?;
                self.remote.update_dir_hash(old_parent_rel).await?;
            }
            let old_abs = self.paths.absolute(old_rel);
            if tokio::fs::symlink_metadata(&old_abs).await.is_ok() {
                if let Some(parent) = new_abs.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                match tokio::fs::rename(&old_abs, &new_abs).await {
                    Ok(()) => renamed = true,
                    Err(e) => {
                        tracing::warn!(old = %old_abs.display(), error = %e, "rename failed");
                    }
                }
            }
        }

        if renamed {
            self.local
                .insert_file(&new_dir, &new_rel, new_name, mtime, &chksum, Some(id))
                .await?;
            self.local.update_dir_hash(&new_dir).await?;
        } else {
            // Old copy was never on disk; fetch the content instead.
            self.transfers.enqueue_download(id, &new_abs);
        }
        Ok(())
    }

    async fn remote_dir_moved(&self, id: &str, new_parent: &str, new_name: &str) -> Result<()> {
        let old_rel = self.remote.dir_path_by_id(id).await?;
        let Some(new_dir) = self.remote.dir_path_by_id(new_parent).await? else {
            tracing::debug!(new_parent, "unknown move target parent, skipping");
            return Ok(());
        };
        let new_rel = join_rel(&new_dir, new_name);
        tracing::debug!(old = ?old_rel, new = %new_rel, "remote directory moved");

        // Descendant records are dropped with the old prefix; live events
        // and the next reindex repopulate them under the new one.
        if let Some(old_rel) = &old_rel {
            self.remote.remove_dir_recursive(old_rel).await?;
            if self.local.exists_dir(old_rel).await? {
                self.local.remove_dir_recursive(old_rel).await?;
            }
        }

        let mtime = match self.api.get_props(PropsTarget::Id(id.to_string())).await {
            Ok(p) => p.mtime,
            Err(_) => chrono::Utc::now().timestamp(),
        };
        self.remote
            .insert_dir(&new_rel, new_name, mtime, Some(id))
            .await?;
        self.local
            .insert_dir(&new_rel, new_name, mtime, Some(id))
            .await?;

        let new_abs = self.paths.absolute(&new_rel);
        if let Some(old_rel) = &old_rel {
            let old_abs = self.paths.absolute(old_rel);
            if tokio::fs::symlink_metadata(&old_abs).await.is_ok() {
                if let Some(parent) = new_abs.parent() {
                    tokio::fs::create_dir_all(parent).await.ok();
                }
                if let Err(e) = tokio::fs::rename(&old_abs, &new_abs).await {
                    tracing::warn!(old = %old_abs.display(), error = %e, "rename failed");
                }
            }
        }
        if let Some(watcher) = &self.watcher {
            watcher.add_recursive_watch(&new_abs);
        }
        Ok(())
    }

    // ── Transfer completions ────────────────────────────────────────

    pub async fn handle_transfer_done(&self, done: TransferDone) {
        let result = match done {
            TransferDone::Upload {
                absolute_path,
                uploaded: Some(file),
            } => self.upload_finished(&absolute_path, file).await,
            TransferDone::Upload { uploaded: None, .. } => Ok(()),
            TransferDone::Download {
                absolute_path,
                source_remote_id,
                ok: true,
            } => self.download_finished(&absolute_path, &source_remote_id).await,
            TransferDone::Download { ok: false, .. } => Ok(()),
        };
        if let Err(e) = result {
            tracing::error!(error = format!("{e:#}"), "transfer completion failed");
        }
    }

    async fn upload_finished(&self, path: &Path, file: SafeFile) -> Result<()> {
        let Some(rel) = self.paths.relative(path) else {
            return Ok(());
        };
        let (parent_rel, _) = split_rel(&rel);
        let parent_rel = parent_rel.to_string();

        let local = self.local.file_record(&rel).await?;
        let mtime = if file.mtime > 0 {
            file.mtime
        } else {
            local.as_ref().map(|r| r.mtime).unwrap_or(0)
        };
        let chksum = if !file.chksum.is_empty() {
            file.chksum.clone()
        } else {
            local.map(|r| r.content_hash).unwrap_or_default()
        };

        self.remote
            .insert_file(&parent_rel, &rel, &file.name, mtime, &chksum, Some(&file.id))
            .await?;
        self.remote.update_dir_hash(&parent_rel).await?;
        self.local.set_file_remote_id(&rel, &file.id).await?;
        tracing::info!(path = %rel, "uploaded");
        Ok(())
    }

    async fn download_finished(&self, path: &Path, remote_id: &str) -> Result<()> {
        let Some(rel) = self.paths.relative(path) else {
            return Ok(());
        };
        let (parent_rel, name) = split_rel(&rel);
        let (parent_rel, name) = (parent_rel.to_string(), name.to_string());

        let mtime = entry_mtime(path).await;
        let content_hash = hash::hash_file(path).await;
        self.local
            .insert_file(&parent_rel, &rel, &name, mtime, &content_hash, Some(remote_id))
            .await?;
        self.local.update_dir_hash(&parent_rel).await?;
        tracing::info!(path = %rel, "downloaded");
        Ok(())
    }

    // ── Control surface lookups ─────────────────────────────────────

    /// Public share URL for a synced path; empty when unknown.
    pub async fn public_link(&self, abs: &Path) -> String {
        let Some(rel) = self.paths.relative(abs) else {
            return String::new();
        };
        let id = match self.remote.dir_id(&rel).await {
            Ok(Some(id)) => Some(id),
            _ => self.remote.file_id(&rel).await.ok().flatten(),
        };
        let Some(id) = id else {
            return String::new();
        };
        match self.api.public_object(&id).await {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!(path = %rel, error = %e, "failed to get public link");
                String::new()
            }
        }
    }

    /// Web folder URL for a synced path; empty when the parent is unknown.
    pub async fn folder_link(&self, abs: &Path, web_prefix: &str) -> String {
        let Some(parent_rel) = self.paths.parent_rel(abs) else {
            return String::new();
        };
        let Some(pid) = self.remote.dir_id(&parent_rel).await.ok().flatten() else {
            return String::new();
        };
        let name = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        format!("{web_prefix}{pid}/{name}")
    }
}

fn meta_mtime(meta: &std::fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

async fn entry_mtime(path: &Path) -> i64 {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) => {
            let mtime = meta_mtime(&meta);
            if mtime > 0 {
                mtime
            } else {
                chrono::Utc::now().timestamp()
            }
        }
        Err(_) => chrono::Utc::now().timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use crate::api::{ApiError, DirListing, EventBatch, ObjectProps, Quota, SafeDir};
    use crate::db::open_db_in_memory;

    struct FakeObj {
        parent: String,
        name: String,
        is_dir: bool,
        mtime: i64,
        chksum: String,
        data: Vec<u8>,
    }

    /// In-memory 2safe: a flat id -> object map rooted at "ROOT".
    struct FakeApi {
        objects: Mutex<HashMap<String, FakeObj>>,
        next_id: AtomicU64,
        uploads: AtomicUsize,
        removed_files: Mutex<Vec<String>>,
        removed_dirs: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn new() -> Self {
            let mut objects = HashMap::new();
            objects.insert(
                "ROOT".to_string(),
                FakeObj {
                    parent: String::new(),
                    name: String::new(),
                    is_dir: true,
                    mtime: 0,
                    chksum: String::new(),
                    data: Vec::new(),
                },
            );
            Self {
                objects: Mutex::new(objects),
                next_id: AtomicU64::new(1),
                uploads: AtomicUsize::new(0),
                removed_files: Mutex::new(Vec::new()),
                removed_dirs: Mutex::new(Vec::new()),
            }
        }

        fn seed_dir(&self, id: &str, parent: &str, name: &str) {
            self.objects.lock().unwrap().insert(
                id.to_string(),
                FakeObj {
                    parent: parent.to_string(),
                    name: name.to_string(),
                    is_dir: true,
                    mtime: 10,
                    chksum: String::new(),
                    data: Vec::new(),
                },
            );
        }

        fn seed_file(&self, id: &str, parent: &str, name: &str, mtime: i64, data: &[u8]) {
            self.objects.lock().unwrap().insert(
                id.to_string(),
                FakeObj {
                    parent: parent.to_string(),
                    name: name.to_string(),
                    is_dir: false,
                    mtime,
                    chksum: hash::hash_bytes(data),
                    data: data.to_vec(),
                },
            );
        }

        fn contains(&self, id: &str) -> bool {
            self.objects.lock().unwrap().contains_key(id)
        }

        fn resolve_path(&self, path: &str) -> Option<String> {
            if path == ROOT_REL || path.is_empty() {
                return Some("ROOT".to_string());
            }
            let objects = self.objects.lock().unwrap();
            let mut current = "ROOT".to_string();
            for segment in path.trim_matches('/').split('/') {
                let child = objects
                    .iter()
                    .find(|(_, o)| o.parent == current && o.name == segment)?;
                current = child.0.clone();
            }
            Some(current)
        }
    }

    fn not_found() -> anyhow::Error {
        ApiError {
            code: 404,
            text: "object not found".to_string(),
        }
        .into()
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn auth(&self, _login: &str, _password: &str) -> Result<bool> {
            Ok(true)
        }

        async fn disk_quota(&self) -> Result<Quota> {
            Ok(Quota::default())
        }

        async fn list_dir(&self, dir_id: &str) -> Result<DirListing> {
            let objects = self.objects.lock().unwrap();
            if !objects.contains_key(dir_id) {
                return Err(not_found());
            }
            let mut dirs = Vec::new();
            let mut files = Vec::new();
            for (id, obj) in objects.iter() {
                if obj.parent != dir_id {
                    continue;
                }
                if obj.is_dir {
                    dirs.push(SafeDir {
                        id: id.clone(),
                        name: obj.name.clone(),
                        mtime: obj.mtime,
                        is_trash: false,
                        special_dir: String::new(),
                    });
                } else {
                    files.push(SafeFile {
                        id: id.clone(),
                        name: obj.name.clone(),
                        mtime: obj.mtime,
                        chksum: obj.chksum.clone(),
                        size: obj.data.len() as u64,
                        is_trash: false,
                    });
                }
            }
            Ok(DirListing {
                id: dir_id.to_string(),
                tree: String::new(),
                dirs,
                files,
            })
        }

        async fn get_props(&self, target: PropsTarget) -> Result<ObjectProps> {
            let id = match &target {
                PropsTarget::Id(id) => id.clone(),
                PropsTarget::Path(path) => self.resolve_path(path).ok_or_else(not_found)?,
            };
            let objects = self.objects.lock().unwrap();
            let obj = objects.get(&id).ok_or_else(not_found)?;
            Ok(ObjectProps {
                id,
                name: obj.name.clone(),
                mtime: obj.mtime,
                chksum: obj.chksum.clone(),
                is_dir: obj.is_dir,
            })
        }

        async fn make_dir(&self, parent_id: &str, name: &str) -> Result<String> {
            let id = format!("d{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.objects.lock().unwrap().insert(
                id.clone(),
                FakeObj {
                    parent: parent_id.to_string(),
                    name: name.to_string(),
                    is_dir: true,
                    mtime: 10,
                    chksum: String::new(),
                    data: Vec::new(),
                },
            );
            Ok(id)
        }

        async fn remove_dir(&self, id: &str, _recursive: bool, _purge: bool) -> Result<()> {
            let mut objects = self.objects.lock().unwrap();
            let mut doomed = vec![id.to_string()];
            while let Some(current) = doomed.pop() {
                let children: Vec<String> = objects
                    .iter()
                    .filter(|(_, o)| o.parent == current)
                    .map(|(cid, _)| cid.clone())
                    .collect();
                doomed.extend(children);
                objects.remove(&current);
            }
            self.removed_dirs.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn push_file(&self, parent_id: &str, local: &Path, name: &str) -> Result<SafeFile> {
            let data = tokio::fs::read(local).await?;
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = format!("f{n}");
            let mtime = entry_mtime(local).await;
            let chksum = hash::hash_bytes(&data);
            self.objects.lock().unwrap().insert(
                id.clone(),
                FakeObj {
                    parent: parent_id.to_string(),
                    name: name.to_string(),
                    is_dir: false,
                    mtime,
                    chksum: chksum.clone(),
                    data: data.clone(),
                },
            );
            self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(SafeFile {
                id,
                name: name.to_string(),
                mtime,
                chksum,
                size: data.len() as u64,
                is_trash: false,
            })
        }

        async fn pull_file(&self, source_id: &str, dest: &Path) -> Result<()> {
            let data = {
                let objects = self.objects.lock().unwrap();
                objects.get(source_id).ok_or_else(not_found)?.data.clone()
            };
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(dest, data).await?;
            Ok(())
        }

        async fn remove_file(&self, id: &str, _purge: bool) -> Result<()> {
            self.objects.lock().unwrap().remove(id);
            self.removed_files.lock().unwrap().push(id.to_string());
            Ok(())
        }

        async fn public_object(&self, id: &str) -> Result<String> {
            Ok(format!("https://www.2safe.com/public/{id}"))
        }

        async fn events_since(&self, cursor: i64) -> Result<EventBatch> {
            Ok(EventBatch {
                events: Vec::new(),
                cursor,
            })
        }
    }

    struct Harness {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        local: StateStore,
        remote: StateStore,
        api: Arc<FakeApi>,
        rec: Reconciler,
        done_rx: mpsc::UnboundedReceiver<TransferDone>,
    }

    impl Harness {
        async fn new() -> Self {
            let tmp = tempfile::tempdir().unwrap();
            let root = tmp.path().join("2safe");
            std::fs::create_dir_all(&root).unwrap();

            let local = StateStore::open(open_db_in_memory().await.unwrap())
                .await
                .unwrap();
            let remote = StateStore::open(open_db_in_memory().await.unwrap())
                .await
                .unwrap();
            let api = Arc::new(FakeApi::new());
            let (done_tx, done_rx) = mpsc::unbounded_channel();
            let transfers = TransferManager::new(api.clone(), done_tx);
            let rec = Reconciler::new(
                PathModel::new(&root),
                local.clone(),
                remote.clone(),
                api.clone(),
                transfers,
            );

            Self {
                _tmp: tmp,
                root,
                local,
                remote,
                api,
                rec,
                done_rx,
            }
        }

        /// Wait for the next transfer to finish and feed it back.
        async fn settle_one(&mut self) {
            let done = self.done_rx.recv().await.expect("transfer completion");
            self.rec.handle_transfer_done(done).await;
        }
    }

    #[tokio::test]
    async fn new_local_file_is_uploaded_and_recorded() {
        let mut h = Harness::new().await;
        tokio::fs::write(h.root.join("notes.txt"), b"a kilobyte of notes")
            .await
            .unwrap();

        h.rec.bootstrap(true).await.unwrap();
        assert_eq!(h.rec.state(), SyncState::Live);
        h.settle_one().await;

        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 1);
        let expected = hash::hash_bytes(b"a kilobyte of notes");
        let local = h.local.file_record("notes.txt").await.unwrap().unwrap();
        assert_eq!(local.content_hash, expected);
        let remote = h.remote.file_record("notes.txt").await.unwrap().unwrap();
        assert_eq!(remote.content_hash, expected);
        assert_eq!(local.remote_id, remote.remote_id);
        assert!(remote.remote_id.is_some());
    }

    #[tokio::test]
    async fn cold_bootstrap_downloads_remote_only_file() {
        let mut h = Harness::new().await;
        h.api.seed_dir("d-a", "ROOT", "a");
        h.api.seed_file("f-b", "d-a", "b.txt", 500, b"remote bytes");

        h.rec.bootstrap(true).await.unwrap();
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 0, "nothing to upload");
        h.settle_one().await;

        let local = h.local.file_record("a/b.txt").await.unwrap().unwrap();
        assert_eq!(local.remote_id.as_deref(), Some("f-b"));
        assert_eq!(local.content_hash, hash::hash_bytes(b"remote bytes"));
        let on_disk = tokio::fs::read(h.root.join("a/b.txt")).await.unwrap();
        assert_eq!(on_disk, b"remote bytes");
    }

    #[tokio::test]
    async fn rapid_edits_coalesce_into_one_upload() {
        let mut h = Harness::new().await;
        h.rec.bootstrap(true).await.unwrap();

        let file = h.root.join("b.txt");
        for content in [&b"one"[..], b"two", b"three"] {
            tokio::fs::write(&file, content).await.unwrap();
            h.rec
                .handle_local_event(LocalEvent::Modified { path: file.clone() })
                .await;
        }

        h.settle_one().await;
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(h.rec.transfers().pending_count(), 0);

        let remote = h.remote.file_record("b.txt").await.unwrap().unwrap();
        assert_eq!(remote.content_hash, hash::hash_bytes(b"three"));
    }

    #[tokio::test]
    async fn remote_delete_removes_local_copy() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        h.remote
            .insert_file("/", "b.txt", "b.txt", 100, "aaa", Some("f1"))
            .await
            .unwrap();
        h.local
            .insert_file("/", "b.txt", "b.txt", 100, "aaa", Some("f1"))
            .await
            .unwrap();
        tokio::fs::write(h.root.join("b.txt"), b"bytes").await.unwrap();

        h.rec
            .handle_remote_event(RemoteEvent::FileDeleted {
                id: "f1".into(),
                parent_id: "ROOT".into(),
                name: "b.txt".into(),
            })
            .await;

        assert!(!h.local.exists_file("b.txt").await.unwrap());
        assert!(!h.remote.exists_file("b.txt").await.unwrap());
        assert!(!h.root.join("b.txt").exists());
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 0);
        assert_eq!(h.rec.transfers().pending_count(), 0);
    }

    #[tokio::test]
    async fn local_rename_is_delete_plus_reupload() {
        let mut h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        h.remote.insert_dir("a", "a", 0, Some("d-a")).await.unwrap();
        h.api.seed_dir("d-a", "ROOT", "a");
        h.api.seed_file("f1", "d-a", "b.txt", 100, b"payload");
        h.remote
            .insert_file("a", "a/b.txt", "b.txt", 100, &hash::hash_bytes(b"payload"), Some("f1"))
            .await
            .unwrap();
        h.local
            .insert_file("a", "a/b.txt", "b.txt", 100, &hash::hash_bytes(b"payload"), Some("f1"))
            .await
            .unwrap();

        // The rename already happened on disk by the time the event fires.
        tokio::fs::create_dir_all(h.root.join("a")).await.unwrap();
        tokio::fs::write(h.root.join("a/c.txt"), b"payload").await.unwrap();

        h.rec
            .handle_local_event(LocalEvent::Moved {
                old: h.root.join("a/b.txt"),
                new: h.root.join("a/c.txt"),
                is_dir: false,
            })
            .await;
        h.settle_one().await;

        assert_eq!(h.api.removed_files.lock().unwrap().as_slice(), ["f1"]);
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 1);
        assert!(!h.remote.exists_file("a/b.txt").await.unwrap());
        assert!(h.remote.exists_file("a/c.txt").await.unwrap());
        assert!(!h.local.exists_file("a/b.txt").await.unwrap());
        assert!(h.local.exists_file("a/c.txt").await.unwrap());
    }

    #[tokio::test]
    async fn hidden_paths_are_ignored() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        let hidden = h.root.join(".secret");
        tokio::fs::write(&hidden, b"shh").await.unwrap();

        h.rec
            .handle_local_event(LocalEvent::Added {
                path: hidden.clone(),
                is_dir: false,
            })
            .await;
        h.rec
            .handle_local_event(LocalEvent::Modified {
                path: hidden.clone(),
            })
            .await;
        h.rec
            .handle_local_event(LocalEvent::Deleted {
                path: hidden,
                is_dir: false,
            })
            .await;

        assert!(!h.local.exists_file(".secret").await.unwrap());
        assert!(h.remote.file_paths().await.unwrap().is_empty());
        assert_eq!(h.rec.transfers().pending_count(), 0);
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn matching_content_produces_no_transfer() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        let content = b"identical on both sides";
        tokio::fs::write(h.root.join("same.txt"), content).await.unwrap();
        h.remote
            .insert_file(
                "/",
                "same.txt",
                "same.txt",
                i64::MAX,
                &hash::hash_bytes(content),
                Some("f1"),
            )
            .await
            .unwrap();

        h.rec
            .handle_local_event(LocalEvent::Modified {
                path: h.root.join("same.txt"),
            })
            .await;

        assert_eq!(h.rec.transfers().pending_count(), 0);
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reindex_after_quiescence_is_quiet() {
        let mut h = Harness::new().await;
        tokio::fs::create_dir_all(h.root.join("docs")).await.unwrap();
        tokio::fs::write(h.root.join("docs/x.txt"), b"x").await.unwrap();
        tokio::fs::write(h.root.join("top.txt"), b"top").await.unwrap();

        h.rec.bootstrap(true).await.unwrap();
        h.settle_one().await;
        h.settle_one().await;
        let uploads = h.api.uploads.load(Ordering::SeqCst);
        assert_eq!(uploads, 2);

        h.rec.full_local_index().await.unwrap();
        assert_eq!(h.rec.transfers().pending_count(), 0, "no new transfers");
        assert_eq!(h.api.uploads.load(Ordering::SeqCst), uploads);
    }

    #[tokio::test]
    async fn remote_dir_created_materializes_on_disk() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        h.api.seed_dir("d-docs", "ROOT", "docs");

        h.rec
            .handle_remote_event(RemoteEvent::DirCreated {
                id: "d-docs".into(),
                parent_id: "ROOT".into(),
                name: "docs".into(),
            })
            .await;

        assert!(h.root.join("docs").is_dir());
        assert!(h.local.exists_dir("docs").await.unwrap());
        assert_eq!(
            h.remote.dir_id("docs").await.unwrap().as_deref(),
            Some("d-docs")
        );
    }

    #[tokio::test]
    async fn local_dir_delete_cascades_everywhere() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        h.remote.insert_dir("d", "d", 0, Some("d-id")).await.unwrap();
        h.remote
            .insert_file("d", "d/a.txt", "a.txt", 1, "h1", Some("f1"))
            .await
            .unwrap();
        h.local.insert_dir("d", "d", 0, Some("d-id")).await.unwrap();
        h.local
            .insert_file("d", "d/a.txt", "a.txt", 1, "h1", Some("f1"))
            .await
            .unwrap();
        h.api.seed_dir("d-id", "ROOT", "d");
        h.api.seed_file("f1", "d-id", "a.txt", 1, b"a");

        h.rec
            .handle_local_event(LocalEvent::Deleted {
                path: h.root.join("d"),
                is_dir: true,
            })
            .await;

        assert_eq!(h.api.removed_dirs.lock().unwrap().as_slice(), ["d-id"]);
        assert!(!h.api.contains("d-id"));
        assert!(!h.api.contains("f1"));
        assert!(!h.local.exists_dir("d").await.unwrap());
        assert!(!h.local.exists_file("d/a.txt").await.unwrap());
        assert!(!h.remote.exists_dir("d").await.unwrap());
        assert!(!h.remote.exists_file("d/a.txt").await.unwrap());
    }

    #[tokio::test]
    async fn remote_wins_when_newer() {
        let mut h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        tokio::fs::write(h.root.join("doc.txt"), b"old local").await.unwrap();
        h.local
            .insert_file("/", "doc.txt", "doc.txt", 100, &hash::hash_bytes(b"old local"), None)
            .await
            .unwrap();
        h.api.seed_file("f9", "ROOT", "doc.txt", i64::MAX, b"newer remote");

        h.rec
            .handle_remote_event(RemoteEvent::FileAdded {
                id: "f9".into(),
                parent_id: "ROOT".into(),
                name: "doc.txt".into(),
            })
            .await;
        h.settle_one().await;

        let on_disk = tokio::fs::read(h.root.join("doc.txt")).await.unwrap();
        assert_eq!(on_disk, b"newer remote");
        let local = h.local.file_record("doc.txt").await.unwrap().unwrap();
        assert_eq!(local.remote_id.as_deref(), Some("f9"));
    }

    #[tokio::test]
    async fn local_wins_mtime_ties() {
        let h = Harness::new().await;
        h.remote.insert_dir("/", "/", 0, Some("ROOT")).await.unwrap();
        tokio::fs::write(h.root.join("doc.txt"), b"local").await.unwrap();
        h.local
            .insert_file("/", "doc.txt", "doc.txt", 500, &hash::hash_bytes(b"local"), None)
            .await
            .unwrap();
        h.api.seed_file("f9", "ROOT", "doc.txt", 500, b"remote");

        h.rec
            .handle_remote_event(RemoteEvent::FileAdded {
                id: "f9".into(),
                parent_id: "ROOT".into(),
                name: "doc.txt".into(),
            })
            .await;

        // Tie: the local side keeps its content, no download queued.
        assert_eq!(h.rec.transfers().pending_count(), 0);
        let on_disk = tokio::fs::read(h.root.join("doc.txt")).await.unwrap();
        assert_eq!(on_disk, b"local");
    }
}
