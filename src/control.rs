use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub const SAFE_DIR: &str = ".2safe";
pub const SOCKET_FILE: &str = "control.sock";

/// A timed-out client connection is closed with no action.
const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Message types of the control protocol.
const GET_SETTINGS_TYPE: &str = "get_settings";
const SET_SETTINGS_TYPE: &str = "set_settings";
const ACTION_TYPE: &str = "action";
const NOOP_TYPE: &str = "noop";

/// A parsed client request, dispatched to the daemon loop. Requests that
/// produce a reply carry a oneshot the daemon answers on.
#[derive(Debug)]
pub enum ControlRequest {
    GetSettings {
        fields: Vec<String>,
        reply: oneshot::Sender<Value>,
    },
    SetSettings {
        args: serde_json::Map<String, Value>,
    },
    Login {
        login: String,
        password: String,
    },
    Logout,
    Chdir {
        dir: String,
    },
    GetPublicLink {
        file: String,
        reply: oneshot::Sender<String>,
    },
    OpenInBrowser {
        file: String,
        reply: oneshot::Sender<String>,
    },
    Noop {
        reply: oneshot::Sender<Value>,
    },
}

/// Default socket path: `$HOME/.2safe/control.sock`.
pub fn socket_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(SAFE_DIR).join(SOCKET_FILE))
}

/// Local IPC endpoint for the companion UI.
pub struct ControlServer {
    listener: UnixListener,
}

impl ControlServer {
    /// Bind the control socket. A failed bind unlinks what is assumed to
    /// be a stale socket file and retries once.
    pub fn bind(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create socket dir: {}", parent.display()))?;
        }

        let listener = match UnixListener::bind(path) {
            Ok(l) => l,
            Err(first) => {
                tracing::debug!(
                    path = %path.display(),
                    error = %first,
                    "bind failed, removing stale socket"
                );
                std::fs::remove_file(path).with_context(|| {
                    format!("Unable to remove stale socket: {}", path.display())
                })?;
                UnixListener::bind(path)
                    .with_context(|| format!("Unable to bind socket to {}", path.display()))?
            }
        };

        tracing::info!(path = %path.display(), "control socket bound");
        Ok(Self { listener })
    }

    /// Accept clients until cancelled. One JSON message per connection.
    pub fn spawn(
        self,
        tx: mpsc::UnboundedSender<ControlRequest>,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = self.listener.accept() => {
                        match accepted {
                            Ok((stream, _addr)) => {
                                let tx = tx.clone();
                                tokio::spawn(async move {
                                    handle_connection(stream, tx).await;
                                });
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "control socket accept failed");
                            }
                        }
                    }
                }
            }
            tracing::debug!("control server stopped");
        })
    }
}

async fn handle_connection(mut stream: UnixStream, tx: mpsc::UnboundedSender<ControlRequest>) {
    let (read_half, mut write_half) = stream.split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    match tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut line)).await {
        Ok(Ok(n)) if n > 0 => {}
        Ok(Ok(_)) => {
            tracing::debug!("client closed without sending data");
            return;
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "control socket read failed");
            return;
        }
        Err(_) => {
            tracing::warn!("control client timed out");
            return;
        }
    }

    let message: Value = match serde_json::from_str(line.trim()) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "malformed control message");
            return;
        }
    };
    let Some(obj) = message.as_object() else {
        tracing::warn!("control message is not an object");
        return;
    };

    let msg_type = obj.get("type").and_then(Value::as_str).unwrap_or("");
    match msg_type {
        GET_SETTINGS_TYPE => {
            let fields = obj
                .get("fields")
                .and_then(Value::as_array)
                .map(|a| {
                    a.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx
                .send(ControlRequest::GetSettings {
                    fields,
                    reply: reply_tx,
                })
                .is_err()
            {
                return;
            }
            if let Ok(reply) = reply_rx.await {
                write_json(&mut write_half, &reply).await;
            }
        }

        SET_SETTINGS_TYPE => {
            if let Some(args) = obj.get("args").and_then(Value::as_object) {
                let _ = tx.send(ControlRequest::SetSettings { args: args.clone() });
            }
        }

        ACTION_TYPE => {
            let verb = obj.get("verb").and_then(Value::as_str).unwrap_or("");
            let args = obj.get("args").and_then(Value::as_object);
            let arg = |key: &str| -> String {
                args.and_then(|a| a.get(key))
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string()
            };

            match verb {
                "login" => {
                    let login = arg("login");
                    let password = arg("password");
                    if login.is_empty() || password.is_empty() {
                        return;
                    }
                    let _ = tx.send(ControlRequest::Login { login, password });
                }
                "logout" => {
                    let _ = tx.send(ControlRequest::Logout);
                }
                "chdir" => {
                    let dir = arg("dir");
                    if !dir.is_empty() {
                        let _ = tx.send(ControlRequest::Chdir { dir });
                    }
                }
                "get_public_link" => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx
                        .send(ControlRequest::GetPublicLink {
                            file: arg("file"),
                            reply: reply_tx,
                        })
                        .is_err()
                    {
                        return;
                    }
                    if let Ok(link) = reply_rx.await {
                        write_text(&mut write_half, &link).await;
                    }
                }
                "open_in_browser" => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if tx
                        .send(ControlRequest::OpenInBrowser {
                            file: arg("file"),
                            reply: reply_tx,
                        })
                        .is_err()
                    {
                        return;
                    }
                    if let Ok(link) = reply_rx.await {
                        write_text(&mut write_half, &link).await;
                    }
                }
                other => {
                    tracing::warn!(verb = other, "unknown control action");
                }
            }
        }

        NOOP_TYPE => {
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(ControlRequest::Noop { reply: reply_tx }).is_err() {
                return;
            }
            if let Ok(reply) = reply_rx.await {
                write_json(&mut write_half, &reply).await;
            }
        }

        other => {
            tracing::warn!(msg_type = other, "got control message of unknown type");
        }
    }
}

async fn write_json(write_half: &mut tokio::net::unix::WriteHalf<'_>, value: &Value) {
    let mut out = value.to_string();
    out.push('\n');
    if let Err(e) = write_half.write_all(out.as_bytes()).await {
        tracing::debug!(error = %e, "failed to write control reply");
    }
}

async fn write_text(write_half: &mut tokio::net::unix::WriteHalf<'_>, text: &str) {
    let mut out = text.to_string();
    out.push('\n');
    if let Err(e) = write_half.write_all(out.as_bytes()).await {
        tracing::debug!(error = %e, "failed to write control reply");
    }
}

/// Build the `{type:"settings", values:{...}}` reply, keeping only
/// non-empty values.
pub fn settings_reply(fields: &[String], value_of: impl Fn(&str) -> String) -> Value {
    let mut values = serde_json::Map::new();
    for field in fields {
        let value = value_of(field);
        if !value.is_empty() {
            values.insert(field.clone(), Value::String(value));
        }
    }
    json!({ "type": "settings", "values": values })
}
