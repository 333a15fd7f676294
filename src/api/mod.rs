mod client;
pub mod types;

use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

pub use client::{SafeClient, WEB_LINK_PREFIX};
pub use types::{
    ApiError, DirListing, EventBatch, ObjectProps, PropsTarget, Quota, RemoteEvent, SafeDir,
    SafeFile, ROOT_ID, SYSTEM_ID, TRASH_ID,
};

/// RPC surface of the 2safe object store.
///
/// The reconciler only ever talks to this trait, so tests drive it with an
/// in-memory fake and the daemon plugs in [`SafeClient`].
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Authenticate. `Ok(false)` means the credentials were rejected;
    /// `Err` means the attempt itself failed.
    async fn auth(&self, login: &str, password: &str) -> Result<bool>;

    async fn disk_quota(&self) -> Result<Quota>;

    /// One level of the remote tree (not recursive).
    async fn list_dir(&self, dir_id: &str) -> Result<DirListing>;

    async fn get_props(&self, target: PropsTarget) -> Result<ObjectProps>;

    /// Create a directory, returning its new id.
    async fn make_dir(&self, parent_id: &str, name: &str) -> Result<String>;

    async fn remove_dir(&self, id: &str, recursive: bool, purge: bool) -> Result<()>;

    /// Upload a local file into `parent_id` under `name`.
    async fn push_file(&self, parent_id: &str, local: &Path, name: &str) -> Result<SafeFile>;

    /// Download an object to `dest` (atomically: temp file, then rename).
    async fn pull_file(&self, source_id: &str, dest: &Path) -> Result<()>;

    async fn remove_file(&self, id: &str, purge: bool) -> Result<()>;

    /// Public share URL for an object.
    async fn public_object(&self, id: &str) -> Result<String>;

    /// Events since the given cursor, with the advanced cursor.
    async fn events_since(&self, cursor: i64) -> Result<EventBatch>;
}
