use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::util::hash;
use crate::util::path::{split_rel, ROOT_REL};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    relative_dir  TEXT NOT NULL,
    relative_path TEXT NOT NULL PRIMARY KEY,
    name          TEXT NOT NULL,
    mtime         INTEGER NOT NULL,
    content_hash  TEXT NOT NULL,
    remote_id     TEXT
);
CREATE INDEX IF NOT EXISTS idx_files_relative_dir ON files(relative_dir);
CREATE TABLE IF NOT EXISTS dirs (
    relative_path TEXT NOT NULL PRIMARY KEY,
    name          TEXT NOT NULL,
    mtime         INTEGER NOT NULL,
    dir_hash      TEXT NOT NULL DEFAULT '',
    remote_id     TEXT
);
"#;

/// A row from the files table.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub relative_dir: String,
    pub relative_path: String,
    pub name: String,
    pub mtime: i64,
    pub content_hash: String,
    pub remote_id: Option<String>,
}

impl FileRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            relative_dir: row.get("relative_dir"),
            relative_path: row.get("relative_path"),
            name: row.get("name"),
            mtime: row.get("mtime"),
            content_hash: row.get("content_hash"),
            remote_id: row.get("remote_id"),
        }
    }
}

/// A row from the dirs table.
#[derive(Debug, Clone)]
pub struct DirRecord {
    pub relative_path: String,
    pub name: String,
    pub mtime: i64,
    pub dir_hash: String,
    pub remote_id: Option<String>,
}

impl DirRecord {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        Self {
            relative_path: row.get("relative_path"),
            name: row.get("name"),
            mtime: row.get("mtime"),
            dir_hash: row.get("dir_hash"),
            remote_id: row.get("remote_id"),
        }
    }
}

/// One side of the two-sided state model: a files table and a dirs table,
/// keyed by relative path. Two instances exist: local (authoritative for
/// disk) and remote (authoritative for the server).
///
/// The single-connection pool serializes every operation; cross-store
/// consistency is the reconciler's concern, not the store's.
#[derive(Clone)]
pub struct StateStore {
    pool: SqlitePool,
}

impl StateStore {
    pub async fn open(pool: SqlitePool) -> Result<Self> {
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("Failed to create state store schema")?;
        Ok(Self { pool })
    }

    /// Insert a file row, overwriting any existing row with the same path.
    /// A `None` remote_id keeps an already-recorded link (the remote table
    /// stays authoritative for ids).
    pub async fn insert_file(
        &self,
        relative_dir: &str,
        relative_path: &str,
        name: &str,
        mtime: i64,
        content_hash: &str,
        remote_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO files (relative_dir, relative_path, name, mtime, content_hash, remote_id)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(relative_path) DO UPDATE SET
                relative_dir = excluded.relative_dir,
                name = excluded.name,
                mtime = excluded.mtime,
                content_hash = excluded.content_hash,
                remote_id = COALESCE(excluded.remote_id, files.remote_id)"#,
        )
        .bind(relative_dir)
        .bind(relative_path)
        .bind(name)
        .bind(mtime)
        .bind(content_hash)
        .bind(remote_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert file record")?;
        Ok(())
    }

    /// Insert a directory row. Idempotent; an existing dir_hash survives.
    pub async fn insert_dir(
        &self,
        relative_path: &str,
        name: &str,
        mtime: i64,
        remote_id: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO dirs (relative_path, name, mtime, remote_id)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(relative_path) DO UPDATE SET
                name = excluded.name,
                mtime = excluded.mtime,
                remote_id = COALESCE(excluded.remote_id, dirs.remote_id)"#,
        )
        .bind(relative_path)
        .bind(name)
        .bind(mtime)
        .bind(remote_id)
        .execute(&self.pool)
        .await
        .context("Failed to insert dir record")?;
        Ok(())
    }

    /// No-op if the path is absent.
    pub async fn remove_file(&self, relative_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE relative_path = ?")
            .bind(relative_path)
            .execute(&self.pool)
            .await
            .context("Failed to remove file record")?;
        Ok(())
    }

    pub async fn remove_file_by_id(&self, remote_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE remote_id = ?")
            .bind(remote_id)
            .execute(&self.pool)
            .await
            .context("Failed to remove file record by id")?;
        Ok(())
    }

    /// No-op if the path is absent. Does not cascade; use
    /// [`Self::remove_dir_recursive`] to drop a subtree.
    pub async fn remove_dir(&self, relative_path: &str) -> Result<()> {
        sqlx::query("DELETE FROM dirs WHERE relative_path = ?")
            .bind(relative_path)
            .execute(&self.pool)
            .await
            .context("Failed to remove dir record")?;
        Ok(())
    }

    /// Remove the directory row and every file and directory under it.
    pub async fn remove_dir_recursive(&self, relative_path: &str) -> Result<()> {
        let prefix = format!("{relative_path}/");
        let len = prefix.len() as i64;

        sqlx::query(
            "DELETE FROM files WHERE relative_path = ? OR substr(relative_path, 1, ?) = ?",
        )
        .bind(relative_path)
        .bind(len)
        .bind(&prefix)
        .execute(&self.pool)
        .await
        .context("Failed to remove files under dir")?;

        sqlx::query("DELETE FROM dirs WHERE relative_path = ? OR substr(relative_path, 1, ?) = ?")
            .bind(relative_path)
            .bind(len)
            .bind(&prefix)
            .execute(&self.pool)
            .await
            .context("Failed to remove dirs under dir")?;

        Ok(())
    }

    /// Same cascade, addressed by remote id.
    pub async fn remove_dir_by_id_recursive(&self, remote_id: &str) -> Result<()> {
        if let Some(path) = self.dir_path_by_id(remote_id).await? {
            self.remove_dir_recursive(&path).await?;
        }
        Ok(())
    }

    pub async fn exists_file(&self, relative_path: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM files WHERE relative_path = ?")
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query file existence")?;
        Ok(row.is_some())
    }

    pub async fn exists_dir(&self, relative_path: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM dirs WHERE relative_path = ?")
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query dir existence")?;
        Ok(row.is_some())
    }

    pub async fn file_id(&self, relative_path: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT remote_id FROM files WHERE relative_path = ?")
                .bind(relative_path)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query file id")?;
        Ok(row.and_then(|r| r.0))
    }

    pub async fn dir_id(&self, relative_path: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT remote_id FROM dirs WHERE relative_path = ?")
                .bind(relative_path)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query dir id")?;
        Ok(row.and_then(|r| r.0))
    }

    /// Translate a remote directory id back to its path (`/` for the root).
    pub async fn dir_path_by_id(&self, remote_id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT relative_path FROM dirs WHERE remote_id = ?")
                .bind(remote_id)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query dir path by id")?;
        Ok(row.map(|r| r.0))
    }

    pub async fn file_record(&self, relative_path: &str) -> Result<Option<FileRecord>> {
        let row = sqlx::query("SELECT * FROM files WHERE relative_path = ?")
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch file record")?;
        Ok(row.as_ref().map(FileRecord::from_row))
    }

    pub async fn dir_record(&self, relative_path: &str) -> Result<Option<DirRecord>> {
        let row = sqlx::query("SELECT * FROM dirs WHERE relative_path = ?")
            .bind(relative_path)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch dir record")?;
        Ok(row.as_ref().map(DirRecord::from_row))
    }

    pub async fn set_file_remote_id(&self, relative_path: &str, remote_id: &str) -> Result<()> {
        sqlx::query("UPDATE files SET remote_id = ? WHERE relative_path = ?")
            .bind(remote_id)
            .bind(relative_path)
            .execute(&self.pool)
            .await
            .context("Failed to link file to remote id")?;
        Ok(())
    }

    /// Recompute a directory's hash from the current hashes of its
    /// immediate children (files and subdirectories), sorted so the result
    /// depends only on the multiset of child hashes.
    ///
    /// Stops at the root. Returns the parent's relative path so the caller
    /// can decide whether to propagate.
    pub async fn update_dir_hash(&self, relative_dir: &str) -> Result<Option<String>> {
        if relative_dir == ROOT_REL {
            return Ok(None);
        }

        let mut hashes: Vec<String> =
            sqlx::query_as::<_, (String,)>("SELECT content_hash FROM files WHERE relative_dir = ?")
                .bind(relative_dir)
                .fetch_all(&self.pool)
                .await
                .context("Failed to fetch child file hashes")?
                .into_iter()
                .map(|r| r.0)
                .collect();

        let prefix = format!("{relative_dir}/");
        let len = prefix.len() as i64;
        let subdir_hashes: Vec<(String,)> = sqlx::query_as(
            "SELECT dir_hash FROM dirs \
             WHERE substr(relative_path, 1, ?) = ? \
             AND instr(substr(relative_path, ? + 1), '/') = 0",
        )
        .bind(len)
        .bind(&prefix)
        .bind(len)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch child dir hashes")?;
        hashes.extend(subdir_hashes.into_iter().map(|r| r.0));

        hashes.sort();
        let dir_hash = hash::hash_string(&hashes.concat());

        sqlx::query("UPDATE dirs SET dir_hash = ? WHERE relative_path = ?")
            .bind(&dir_hash)
            .bind(relative_dir)
            .execute(&self.pool)
            .await
            .context("Failed to update dir hash")?;

        Ok(Some(split_rel(relative_dir).0.to_string()))
    }

    /// All file paths in the table, sorted (tests and status reporting).
    pub async fn file_paths(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT relative_path FROM files ORDER BY relative_path")
                .fetch_all(&self.pool)
                .await
                .context("Failed to list file paths")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// All dir paths, sorted shallow-first so parents come before children.
    pub async fn dir_paths(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT relative_path FROM dirs \
             ORDER BY length(relative_path) - length(replace(relative_path, '/', '')), \
             relative_path",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list dir paths")?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_db_in_memory;

    async fn store() -> StateStore {
        StateStore::open(open_db_in_memory().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn insert_overwrites_on_same_path() {
        let s = store().await;
        s.insert_file("/", "a.txt", "a.txt", 10, "aaa", None)
            .await
            .unwrap();
        s.insert_file("/", "a.txt", "a.txt", 20, "bbb", Some("id1"))
            .await
            .unwrap();

        let rec = s.file_record("a.txt").await.unwrap().unwrap();
        assert_eq!(rec.mtime, 20);
        assert_eq!(rec.content_hash, "bbb");
        assert_eq!(rec.remote_id.as_deref(), Some("id1"));

        // A later upsert without an id keeps the link
        s.insert_file("/", "a.txt", "a.txt", 30, "ccc", None)
            .await
            .unwrap();
        let rec = s.file_record("a.txt").await.unwrap().unwrap();
        assert_eq!(rec.remote_id.as_deref(), Some("id1"));
    }

    #[tokio::test]
    async fn remove_is_noop_when_absent() {
        let s = store().await;
        s.remove_file("nope.txt").await.unwrap();
        s.remove_dir("nope").await.unwrap();
        assert!(!s.exists_file("nope.txt").await.unwrap());
    }

    #[tokio::test]
    async fn recursive_remove_cascades() {
        let s = store().await;
        s.insert_dir("d", "d", 0, Some("d-id")).await.unwrap();
        s.insert_dir("d/sub", "sub", 0, None).await.unwrap();
        s.insert_file("d", "d/a.txt", "a.txt", 1, "h1", None)
            .await
            .unwrap();
        s.insert_file("d/sub", "d/sub/b.txt", "b.txt", 2, "h2", None)
            .await
            .unwrap();
        s.insert_file("/", "top.txt", "top.txt", 3, "h3", None)
            .await
            .unwrap();
        // Sibling whose name shares the prefix but not the subtree
        s.insert_file("/", "dx.txt", "dx.txt", 4, "h4", None)
            .await
            .unwrap();

        s.remove_dir_recursive("d").await.unwrap();

        assert!(!s.exists_dir("d").await.unwrap());
        assert!(!s.exists_dir("d/sub").await.unwrap());
        assert!(!s.exists_file("d/a.txt").await.unwrap());
        assert!(!s.exists_file("d/sub/b.txt").await.unwrap());
        assert!(s.exists_file("top.txt").await.unwrap());
        assert!(s.exists_file("dx.txt").await.unwrap());
    }

    #[tokio::test]
    async fn recursive_remove_by_id() {
        let s = store().await;
        s.insert_dir("d", "d", 0, Some("d-id")).await.unwrap();
        s.insert_file("d", "d/a.txt", "a.txt", 1, "h1", None)
            .await
            .unwrap();

        s.remove_dir_by_id_recursive("d-id").await.unwrap();
        assert!(!s.exists_dir("d").await.unwrap());
        assert!(!s.exists_file("d/a.txt").await.unwrap());

        // Unknown id is a no-op
        s.remove_dir_by_id_recursive("ghost").await.unwrap();
    }

    #[tokio::test]
    async fn dir_path_by_id_resolves_root() {
        let s = store().await;
        s.insert_dir("/", "/", 0, Some("root-id")).await.unwrap();
        assert_eq!(
            s.dir_path_by_id("root-id").await.unwrap().as_deref(),
            Some("/")
        );
        assert_eq!(s.dir_path_by_id("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dir_hash_depends_only_on_child_multiset() {
        let s = store().await;
        s.insert_dir("d", "d", 0, None).await.unwrap();
        s.insert_file("d", "d/a.txt", "a.txt", 1, "h-alpha", None)
            .await
            .unwrap();
        s.insert_file("d", "d/b.txt", "b.txt", 2, "h-beta", None)
            .await
            .unwrap();
        s.update_dir_hash("d").await.unwrap();
        let first = s.dir_record("d").await.unwrap().unwrap().dir_hash;

        // Re-insert the same children in the opposite order
        let s2 = store().await;
        s2.insert_dir("d", "d", 0, None).await.unwrap();
        s2.insert_file("d", "d/b.txt", "b.txt", 2, "h-beta", None)
            .await
            .unwrap();
        s2.insert_file("d", "d/a.txt", "a.txt", 1, "h-alpha", None)
            .await
            .unwrap();
        s2.update_dir_hash("d").await.unwrap();
        let second = s2.dir_record("d").await.unwrap().unwrap().dir_hash;

        assert_eq!(first, second);
        assert!(!first.is_empty());
    }

    #[tokio::test]
    async fn dir_hash_includes_immediate_subdirs_only() {
        let s = store().await;
        s.insert_dir("d", "d", 0, None).await.unwrap();
        s.insert_dir("d/sub", "sub", 0, None).await.unwrap();
        s.insert_dir("d/sub/deep", "deep", 0, None).await.unwrap();
        s.insert_file("d", "d/a.txt", "a.txt", 1, "h1", None)
            .await
            .unwrap();

        s.update_dir_hash("d/sub/deep").await.unwrap();
        let parent = s.update_dir_hash("d/sub").await.unwrap();
        assert_eq!(parent.as_deref(), Some("d"));
        let before = s.dir_record("d").await.unwrap().unwrap().dir_hash;

        s.update_dir_hash("d").await.unwrap();
        let after = s.dir_record("d").await.unwrap().unwrap().dir_hash;
        assert_ne!(before, after, "hash changes once recomputed with children");

        // Root is a stopping point
        assert_eq!(s.update_dir_hash("/").await.unwrap(), None);
    }
}
