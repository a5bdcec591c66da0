//! Local SQLite cache of paths known to exist in the repository, plus the
//! stat table writers use to skip unchanged files.

use crate::{CacheSettings, Error, ObjectId, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CACHE_VERSION: i64 = 2;

/// One row of the stat table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub path: String,
    pub mtime: i64,
    pub mode: u32,
    pub size: i64,
    pub id: ObjectId,
}

#[derive(Debug, Clone)]
pub struct LocalCache {
    pool: SqlitePool,
    path: PathBuf,
}

/// Cache file for the repository with this id. The file name is derived from
/// a hash of the id so the id itself never lands on disk.
pub fn cache_path(settings: &CacheSettings, repository_id: &[u8; 32]) -> Result<PathBuf> {
    let dir = match &settings.dir {
        Some(dir) => dir.clone(),
        None => directories::ProjectDirs::from("", "", "sealsnap")
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .ok_or_else(|| Error::Config("Cannot find user cache directory".to_string()))?,
    };

    let name = blake3::derive_key("sealsnap 2024 cache file name", repository_id);
    Ok(dir.join(format!("{}.db", hex::encode(name))))
}

impl LocalCache {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        // Single connection, writes are serialized
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let cache = Self {
            pool,
            path: path.to_path_buf(),
        };
        cache.migrate().await?;

        debug!(path = %path.display(), "Opened local cache");
        Ok(cache)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn migrate(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;

        if version > CACHE_VERSION {
            return Err(Error::Config(format!(
                "Cache schema is too recent ({}, expected {})",
                version, CACHE_VERSION
            )));
        }
        if version == CACHE_VERSION {
            return Ok(());
        }

        if version < 1 {
            sqlx::query(
                r#"
                CREATE TABLE objects (
                    key TEXT NOT NULL
                );
                CREATE UNIQUE INDEX objects_k ON objects (key);
                "#,
            )
            .execute(&mut *tx)
            .await?;
        }

        if version < 2 {
            sqlx::query(
                r#"
                CREATE TABLE stats (
                    path TEXT NOT NULL,
                    mtime INTEGER NOT NULL,
                    mode INTEGER NOT NULL,
                    size INTEGER NOT NULL,
                    id BLOB NOT NULL
                );
                CREATE UNIQUE INDEX stats_p ON stats (path);
                "#,
            )
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(&format!("PRAGMA user_version = {}", CACHE_VERSION))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(from = version, to = CACHE_VERSION, "Migrated local cache schema");
        Ok(())
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM objects WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    pub async fn insert(&self, key: &str) -> Result<()> {
        sqlx::query("INSERT INTO objects (key) VALUES (?1) ON CONFLICT DO NOTHING")
            .bind(key)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Replaces the whole object table in one transaction.
    pub async fn replace_all(&self, keys: &[String]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM objects").execute(&mut *tx).await?;
        for key in keys {
            sqlx::query("INSERT INTO objects (key) VALUES (?1) ON CONFLICT DO NOTHING")
                .bind(key)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM objects").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM stats").execute(&mut *tx).await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn put_stat(&self, stat: &FileStat) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stats (path, mtime, mode, size, id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (path) DO UPDATE SET mtime = excluded.mtime,
                                             mode = excluded.mode,
                                             size = excluded.size,
                                             id = excluded.id
            "#,
        )
        .bind(&stat.path)
        .bind(stat.mtime)
        .bind(stat.mode as i64)
        .bind(stat.size)
        .bind(stat.id.as_bytes().as_slice())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_stat(&self, path: &str) -> Result<Option<FileStat>> {
        let row = sqlx::query("SELECT mtime, mode, size, id FROM stats WHERE path = ?1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let id: Vec<u8> = row.try_get("id")?;
        let mode: i64 = row.try_get("mode")?;

        Ok(Some(FileStat {
            path: path.to_string(),
            mtime: row.try_get("mtime")?,
            mode: mode as u32,
            size: row.try_get("size")?,
            id: ObjectId::from_slice(&id)?,
        }))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(&temp.path().join("cache.db")).await.unwrap();

        assert!(!cache.contains("blobs/abc/abcdef").await.unwrap());
        cache.insert("blobs/abc/abcdef").await.unwrap();
        cache.insert("blobs/abc/abcdef").await.unwrap();

        assert!(cache.contains("blobs/abc/abcdef").await.unwrap());
        assert_eq!(cache.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_keeps_schema_and_data() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.db");

        let cache = LocalCache::open(&path).await.unwrap();
        cache.insert("tags/x").await.unwrap();
        cache.close().await;

        let cache = LocalCache::open(&path).await.unwrap();
        assert!(cache.contains("tags/x").await.unwrap());
    }

    #[tokio::test]
    async fn test_refuses_newer_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.db");

        let cache = LocalCache::open(&path).await.unwrap();
        sqlx::query("PRAGMA user_version = 99").execute(&cache.pool).await.unwrap();
        cache.close().await;

        assert!(matches!(LocalCache::open(&path).await, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_replace_and_clear() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(&temp.path().join("cache.db")).await.unwrap();

        cache.insert("old").await.unwrap();
        cache.replace_all(&["a".to_string(), "b".to_string()]).await.unwrap();
        assert!(!cache.contains("old").await.unwrap());
        assert_eq!(cache.count().await.unwrap(), 2);

        cache.clear().await.unwrap();
        assert_eq!(cache.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let temp = TempDir::new().unwrap();
        let cache = LocalCache::open(&temp.path().join("cache.db")).await.unwrap();

        let mut stat = FileStat {
            path: "/home/user/notes.txt".to_string(),
            mtime: 1_700_000_000_000,
            mode: 0o100644,
            size: 42,
            id: ObjectId::from_bytes([5; 32]),
        };
        cache.put_stat(&stat).await.unwrap();
        assert_eq!(cache.get_stat(&stat.path).await.unwrap(), Some(stat.clone()));

        stat.size = 43;
        cache.put_stat(&stat).await.unwrap();
        assert_eq!(cache.get_stat(&stat.path).await.unwrap().map(|s| s.size), Some(43));

        cache.clear().await.unwrap();
        assert!(cache.get_stat(&stat.path).await.unwrap().is_none());
    }

    #[test]
    fn test_cache_path_hides_id() {
        let settings = CacheSettings {
            dir: Some(PathBuf::from("/var/cache/sealsnap")),
            ..Default::default()
        };
        let id = [0xab; 32];

        let path = cache_path(&settings, &id).unwrap();
        assert!(path.starts_with("/var/cache/sealsnap"));
        assert!(!path.to_string_lossy().contains(&hex::encode(id)));
    }
}
