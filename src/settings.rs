use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROOT_NAME: &str = "2safe";

fn default_root_name() -> String {
    DEFAULT_ROOT_NAME.to_string()
}

fn default_init() -> bool {
    true
}

/// Persisted daemon settings, the Rust rendition of the old
/// organization/application settings store. String-typed values from the
/// control protocol's point of view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub login: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_root_name")]
    pub root_name: String,
    /// Remote event cursor (unix seconds): the last fully consumed batch.
    #[serde(default)]
    pub last_updated: i64,
    /// True until an initial full index has completed successfully.
    #[serde(default = "default_init")]
    pub init: bool,

    #[serde(skip)]
    path: PathBuf,
}

impl Settings {
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir().context("Could not determine config directory")?;
        Ok(dir.join("safesyncd").join("settings.toml"))
    }

    /// Load settings from `path`, falling back to defaults when the file
    /// does not exist yet.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings: Settings = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content)
                .with_context(|| format!("Failed to parse settings: {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Settings {
                login: String::new(),
                password: String::new(),
                root_name: default_root_name(),
                last_updated: 0,
                init: true,
                path: PathBuf::new(),
            },
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read settings: {}", path.display()));
            }
        };
        settings.path = path.to_path_buf();
        Ok(settings)
    }

    /// Persist to disk atomically (write temp file, then rename).
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize settings")?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write settings: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to rename settings into place: {}", self.path.display()))?;
        Ok(())
    }

    /// Absolute path of the sync root: `$HOME/<root_name>`, or `root_name`
    /// itself when it is already absolute (set via the `chdir` action).
    pub fn filesystem_path(&self) -> Result<PathBuf> {
        let root = Path::new(&self.root_name);
        if root.is_absolute() {
            return Ok(root.to_path_buf());
        }
        let home = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home.join(root))
    }

    pub fn has_credentials(&self) -> bool {
        !self.login.is_empty() && !self.password.is_empty()
    }

    /// String value of a settings field for the control protocol.
    /// Unknown fields and unset values yield an empty string.
    pub fn value_of(&self, field: &str) -> String {
        match field {
            "login" => self.login.clone(),
            "password" => self.password.clone(),
            "root_name" => self.root_name.clone(),
            "last_updated" => {
                if self.last_updated > 0 {
                    self.last_updated.to_string()
                } else {
                    String::new()
                }
            }
            "init" => self.init.to_string(),
            _ => String::new(),
        }
    }

    /// Apply a string-typed settings write from the control protocol.
    /// Unknown keys are logged and dropped.
    pub fn set_value(&mut self, key: &str, value: &str) {
        match key {
            "login" => self.login = value.to_string(),
            "password" => self.password = value.to_string(),
            "root_name" => self.root_name = value.to_string(),
            "last_updated" => self.last_updated = value.parse().unwrap_or(0),
            "init" => self.init = value == "true",
            _ => tracing::warn!(key, "ignoring unknown settings key"),
        }
    }
}
