use std::path::PathBuf;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

pub const LOCAL_STATE_DATABASE: &str = "local.db";
pub const REMOTE_STATE_DATABASE: &str = "remote.db";

/// Resolve the path of a state database file under
/// `$XDG_DATA_HOME/safesyncd/`.
pub fn state_db_path(name: &str) -> Result<PathBuf> {
    let dir = dirs::data_dir().context("Could not determine data directory")?;
    Ok(dir.join("safesyncd").join(name))
}

/// Remove a state database file. Bootstrap recreates the indices from
/// scratch, so a missing file is not an error.
pub fn purge_db(name: &str) -> Result<()> {
    let path = state_db_path(name)?;
    match std::fs::remove_file(&path) {
        Ok(()) => {
            tracing::debug!(path = %path.display(), "purged state database");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => {
            Err(e).with_context(|| format!("Failed to remove database: {}", path.display()))
        }
    }
}

/// Open (creating if needed) a state database.
///
/// A single connection keeps every operation on the store serialized,
/// which is all the consistency the reconciler needs.
pub async fn open_db(name: &str) -> Result<SqlitePool> {
    let db_path = state_db_path(name)?;

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create data directory: {}", parent.display()))?;
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());
    tracing::debug!(path = %db_path.display(), "opening state database");

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    Ok(pool)
}

/// Open an in-memory database (tests).
#[cfg(test)]
pub async fn open_db_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .context("Failed to open in-memory database")?;
    Ok(pool)
}
