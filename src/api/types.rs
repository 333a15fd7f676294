use serde::Deserialize;

/// Well-known object ids on the 2safe service.
pub const ROOT_ID: &str = "227930033757";
pub const TRASH_ID: &str = "227931033757";
pub const SYSTEM_ID: &str = "227932033757";

/// API error response. Every RPC may fail with `(code, text)`; the
/// reconciler treats any failure as a dropped transfer.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    #[serde(rename = "error_code", default)]
    pub code: u16,
    #[serde(rename = "error_text", default)]
    pub text: String,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "2safe API error {}: {}", self.code, self.text)
    }
}

impl std::error::Error for ApiError {}

/// A file object as the service reports it.
#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct SafeFile {
    pub id: String,
    pub name: String,
    /// Unix seconds.
    #[serde(default)]
    pub mtime: i64,
    /// MD5 of the contents, hex.
    #[serde(default)]
    pub chksum: String,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub is_trash: bool,
}

/// A directory object as the service reports it.
#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct SafeDir {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub is_trash: bool,
    /// Non-empty for service-managed directories (trash, system).
    #[serde(default)]
    pub special_dir: String,
}

/// One level of the remote tree from `list_dir`.
#[derive(Debug, Clone)]
pub struct DirListing {
    /// Id of the listed directory.
    pub id: String,
    /// Relative path of the listed directory; empty for the root.
    pub tree: String,
    pub dirs: Vec<SafeDir>,
    pub files: Vec<SafeFile>,
}

/// Properties of a single remote object.
#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
pub struct ObjectProps {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub chksum: String,
    #[serde(default)]
    pub is_dir: bool,
}

/// Props lookups address an object either by its opaque id or by its
/// relative path.
#[derive(Debug, Clone)]
pub enum PropsTarget {
    Id(String),
    Path(String),
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Quota {
    pub used_bytes: u64,
    pub total_bytes: u64,
}

/// A change on the remote side, translated from the wire event stream.
#[derive(Debug, Clone)]
pub enum RemoteEvent {
    FileAdded {
        id: String,
        parent_id: String,
        name: String,
    },
    FileDeleted {
        id: String,
        parent_id: String,
        name: String,
    },
    FileMoved {
        id: String,
        old_parent: String,
        old_name: String,
        new_parent: String,
        new_name: String,
    },
    DirCreated {
        id: String,
        parent_id: String,
        name: String,
    },
    DirDeleted {
        id: String,
        parent_id: String,
        name: String,
    },
    DirMoved {
        id: String,
        old_parent: String,
        old_name: String,
        new_parent: String,
        new_name: String,
    },
}

/// A drained batch of remote events plus the advanced cursor.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub events: Vec<RemoteEvent>,
    /// Monotonic timestamp (unix seconds) covering everything delivered.
    pub cursor: i64,
}
