use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::types::{
    ApiError, DirListing, EventBatch, ObjectProps, PropsTarget, Quota, RemoteEvent, SafeDir,
    SafeFile,
};
use super::RemoteApi;

pub const API_HOST: &str = "https://api.2safe.com";
pub const WEB_LINK_PREFIX: &str = "https://www.2safe.com/web/";

/// Event names on the wire.
const DIR_CREATED_EVENT: &str = "dir_created";
const DIR_MOVED_EVENT: &str = "dir_moved";
const DIR_REMOVED_EVENT: &str = "dir_removed";
const FILE_UPLOADED_EVENT: &str = "file_uploaded";
const FILE_MOVED_EVENT: &str = "file_moved";
const FILE_REMOVED_EVENT: &str = "file_removed";

/// HTTP client for the 2safe API. Holds the session token acquired by
/// `auth`; all other calls attach it automatically.
pub struct SafeClient {
    http: reqwest::Client,
    host: String,
    token: Mutex<Option<String>>,
}

impl SafeClient {
    pub fn new() -> Self {
        Self::with_host(API_HOST)
    }

    pub fn with_host(host: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build HTTP client");

        Self {
            http,
            host: host.to_string(),
            token: Mutex::new(None),
        }
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{path}", self.host);
        let mut builder = self.http.request(method, &url);
        if let Some(token) = self.token.lock().unwrap().as_deref() {
            builder = builder.header("X-Safe-Token", token);
        }
        builder
    }

    /// Send with retry on rate-limit (429) and typed error decoding.
    async fn send(&self, mut builder: RequestBuilder) -> Result<Response> {
        const MAX_RETRIES: u32 = 5;

        for attempt in 0..=MAX_RETRIES {
            let retry_builder = builder.try_clone();

            let resp = builder.send().await.context("HTTP request failed")?;

            match resp.status() {
                s if s.is_success() => return Ok(resp),

                StatusCode::TOO_MANY_REQUESTS if attempt < MAX_RETRIES => {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .unwrap_or(2);
                    let wait = Duration::from_secs(retry_after) + jitter();
                    tracing::warn!(
                        retry_after,
                        attempt = attempt + 1,
                        "rate limited, waiting {wait:?}"
                    );
                    tokio::time::sleep(wait).await;

                    match retry_builder {
                        Some(b) => {
                            builder = b;
                            continue;
                        }
                        None => {
                            anyhow::bail!("Rate limited — cannot retry request with streamed body")
                        }
                    }
                }

                StatusCode::TOO_MANY_REQUESTS => {
                    anyhow::bail!("Rate limited — exhausted {MAX_RETRIES} retries");
                }

                status => {
                    let body = resp.text().await.unwrap_or_default();
                    if let Ok(err) = serde_json::from_str::<ApiError>(&body) {
                        return Err(err.into());
                    }
                    anyhow::bail!("2safe API error ({status}): {body}");
                }
            }
        }

        unreachable!()
    }
}

impl Default for SafeClient {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(Deserialize)]
struct ListDirResponse {
    object: DirObject,
    #[serde(default)]
    dirs: Vec<SafeDir>,
    #[serde(default)]
    files: Vec<SafeFile>,
}

#[derive(Deserialize)]
struct DirObject {
    id: String,
    /// The service quotes the tree path with surrounding separators
    /// (`/a/b/`); empty or `/` means the root.
    #[serde(default)]
    tree: String,
}

#[derive(Deserialize)]
struct PropsResponse {
    object: ObjectProps,
}

#[derive(Deserialize)]
struct MakeDirResponse {
    id: String,
}

#[derive(Deserialize)]
struct PushFileResponse {
    object: SafeFile,
}

#[derive(Deserialize)]
struct PublicObjectResponse {
    link: String,
}

#[derive(Deserialize)]
struct EventsResponse {
    timestamp: i64,
    #[serde(default)]
    events: Vec<WireEvent>,
}

#[derive(Deserialize)]
struct WireEvent {
    event: String,
    id: String,
    #[serde(default)]
    parent_id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    old_parent_id: String,
    #[serde(default)]
    old_name: String,
}

#[async_trait]
impl RemoteApi for SafeClient {
    async fn auth(&self, login: &str, password: &str) -> Result<bool> {
        let builder = self
            .request(Method::POST, "/auth")
            .form(&[("login", login), ("password", password)]);

        let resp = builder.send().await.context("Auth request failed")?;
        if resp.status() == StatusCode::UNAUTHORIZED || resp.status() == StatusCode::FORBIDDEN {
            *self.token.lock().unwrap() = None;
            return Ok(false);
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("2safe API error ({status}): {body}");
        }

        let auth: AuthResponse = resp.json().await.context("Failed to parse auth response")?;
        *self.token.lock().unwrap() = Some(auth.token);
        Ok(true)
    }

    async fn disk_quota(&self) -> Result<Quota> {
        let resp = self
            .send(self.request(Method::GET, "/disk_quota"))
            .await
            .context("Failed to fetch disk quota")?;
        resp.json().await.context("Failed to parse quota response")
    }

    async fn list_dir(&self, dir_id: &str) -> Result<DirListing> {
        let resp = self
            .send(
                self.request(Method::GET, "/list_dir")
                    .query(&[("id", dir_id)]),
            )
            .await
            .with_context(|| format!("Failed to list directory {dir_id}"))?;

        let listing: ListDirResponse = resp
            .json()
            .await
            .context("Failed to parse list_dir response")?;

        Ok(DirListing {
            id: listing.object.id,
            tree: listing.object.tree.trim_matches('/').to_string(),
            dirs: listing.dirs,
            files: listing.files,
        })
    }

    async fn get_props(&self, target: PropsTarget) -> Result<ObjectProps> {
        let builder = match &target {
            PropsTarget::Id(id) => self
                .request(Method::GET, "/get_props")
                .query(&[("id", id.as_str())]),
            PropsTarget::Path(path) => self
                .request(Method::GET, "/get_props")
                .query(&[("path", path.as_str())]),
        };

        let resp = self
            .send(builder)
            .await
            .with_context(|| format!("Failed to fetch props for {target:?}"))?;

        let props: PropsResponse = resp
            .json()
            .await
            .context("Failed to parse props response")?;
        Ok(props.object)
    }

    async fn make_dir(&self, parent_id: &str, name: &str) -> Result<String> {
        let resp = self
            .send(
                self.request(Method::POST, "/make_dir")
                    .form(&[("parent_id", parent_id), ("name", name)]),
            )
            .await
            .with_context(|| format!("Failed to create directory {name} in {parent_id}"))?;

        let created: MakeDirResponse = resp
            .json()
            .await
            .context("Failed to parse make_dir response")?;
        Ok(created.id)
    }

    async fn remove_dir(&self, id: &str, recursive: bool, purge: bool) -> Result<()> {
        self.send(self.request(Method::POST, "/remove_dir").form(&[
            ("id", id),
            ("recursive", if recursive { "1" } else { "0" }),
            ("purge", if purge { "1" } else { "0" }),
        ]))
        .await
        .with_context(|| format!("Failed to remove directory {id}"))?;
        Ok(())
    }

    async fn push_file(&self, parent_id: &str, local: &Path, name: &str) -> Result<SafeFile> {
        let bytes = tokio::fs::read(local)
            .await
            .with_context(|| format!("Failed to read {}", local.display()))?;

        let form = reqwest::multipart::Form::new()
            .text("dir_id", parent_id.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(bytes).file_name(name.to_string()),
            );

        let resp = self
            .send(self.request(Method::POST, "/push_file").multipart(form))
            .await
            .with_context(|| format!("Failed to upload {}", local.display()))?;

        let pushed: PushFileResponse = resp
            .json()
            .await
            .context("Failed to parse push_file response")?;
        Ok(pushed.object)
    }

    async fn pull_file(&self, source_id: &str, dest: &Path) -> Result<()> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent dir: {}", parent.display()))?;
        }

        let resp = self
            .send(
                self.request(Method::GET, "/pull_file")
                    .query(&[("id", source_id)]),
            )
            .await
            .with_context(|| format!("Failed to download object {source_id}"))?;

        let tmp_path = dest.with_extension("safesyncd.tmp");
        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .with_context(|| format!("Failed to create temp file: {}", tmp_path.display()))?;

        let bytes = resp.bytes().await.context("Failed to read download body")?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, dest)
            .await
            .with_context(|| format!("Failed to rename temp file to {}", dest.display()))?;

        Ok(())
    }

    async fn remove_file(&self, id: &str, purge: bool) -> Result<()> {
        self.send(
            self.request(Method::POST, "/remove_file")
                .form(&[("id", id), ("purge", if purge { "1" } else { "0" })]),
        )
        .await
        .with_context(|| format!("Failed to remove file {id}"))?;
        Ok(())
    }

    async fn public_object(&self, id: &str) -> Result<String> {
        let resp = self
            .send(
                self.request(Method::GET, "/public_object")
                    .query(&[("id", id)]),
            )
            .await
            .with_context(|| format!("Failed to publish object {id}"))?;

        let published: PublicObjectResponse = resp
            .json()
            .await
            .context("Failed to parse public_object response")?;
        Ok(published.link)
    }

    async fn events_since(&self, cursor: i64) -> Result<EventBatch> {
        let since = cursor.to_string();
        let resp = self
            .send(
                self.request(Method::GET, "/events")
                    .query(&[("since", since.as_str())]),
            )
            .await
            .context("Failed to fetch events")?;

        let wire: EventsResponse = resp
            .json()
            .await
            .context("Failed to parse events response")?;

        let events = wire
            .events
            .into_iter()
            .filter_map(translate_event)
            .collect();

        Ok(EventBatch {
            events,
            cursor: wire.timestamp,
        })
    }
}

fn translate_event(e: WireEvent) -> Option<RemoteEvent> {
    match e.event.as_str() {
        FILE_UPLOADED_EVENT => Some(RemoteEvent::FileAdded {
            id: e.id,
            parent_id: e.parent_id,
            name: e.name,
        }),
        FILE_REMOVED_EVENT => Some(RemoteEvent::FileDeleted {
            id: e.id,
            parent_id: e.parent_id,
            name: e.name,
        }),
        FILE_MOVED_EVENT => Some(RemoteEvent::FileMoved {
            id: e.id,
            old_parent: e.old_parent_id,
            old_name: e.old_name,
            new_parent: e.parent_id,
            new_name: e.name,
        }),
        DIR_CREATED_EVENT => Some(RemoteEvent::DirCreated {
            id: e.id,
            parent_id: e.parent_id,
            name: e.name,
        }),
        DIR_REMOVED_EVENT => Some(RemoteEvent::DirDeleted {
            id: e.id,
            parent_id: e.parent_id,
            name: e.name,
        }),
        DIR_MOVED_EVENT => Some(RemoteEvent::DirMoved {
            id: e.id,
            old_parent: e.old_parent_id,
            old_name: e.old_name,
            new_parent: e.parent_id,
            new_name: e.name,
        }),
        other => {
            tracing::debug!(event = other, "ignoring unknown remote event type");
            None
        }
    }
}

fn jitter() -> Duration {
    let ms: u64 = rand::random::<u64>() % 1000;
    Duration::from_millis(ms)
}
