//! Path-based storage transports.
//!
//! Paths are relative, use `/` separators and never start with a slash:
//!
//! ```text
//! keys/<user>/{full,write}
//! tags/<random>
//! blobs/<3 hex>/<id hex>
//! tmp/                      scratch area for atomic writes
//! sealsnap                  repository secret
//! ```

pub mod local;

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;

pub use local::LocalBackend;

pub const TMP_DIR: &str = "tmp";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Sftp,
    S3,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => f.write_str("local"),
            BackendType::Sftp => f.write_str("sftp"),
            BackendType::S3 => f.write_str("s3"),
        }
    }
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Human readable location, used in logs.
    fn url(&self) -> String;

    /// Creates the repository layout. Fails if the target is not empty.
    async fn init(&self) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Returns `Error::NotFound` when nothing is stored at `path`.
    async fn read(&self, path: &str) -> Result<Bytes>;

    /// Replaces `path` atomically: readers see the old content or the new one,
    /// never a partial file. Returns the number of bytes stored.
    async fn write(&self, path: &str, data: Bytes) -> Result<u64>;

    /// Deleting something that does not exist is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Every file below `prefix` (recursive), as paths relative to the
    /// repository root. The scratch area is never listed.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn create_dir(&self, path: &str) -> Result<()>;

    /// Removes an empty directory.
    async fn delete_dir(&self, path: &str) -> Result<()>;

    fn backend_type(&self) -> BackendType;

    /// Worker pool size to use when the configuration does not say.
    fn default_threads(&self) -> usize {
        default_threads(self.backend_type())
    }
}

pub fn default_threads(backend_type: BackendType) -> usize {
    let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);

    match backend_type {
        BackendType::Local => cores * 2,
        BackendType::Sftp | BackendType::S3 => (4 * cores).max(32),
    }
}

/// Directories every transport creates on init, parents first.
pub fn layout_dirs() -> Vec<String> {
    let mut dirs = vec![
        "keys".to_string(),
        "keys/default".to_string(),
        "tags".to_string(),
        "blobs".to_string(),
    ];
    dirs.extend((0..4096).map(|i| format!("blobs/{:03x}", i)));
    dirs.push(TMP_DIR.to_string());
    dirs
}

/// Joins two relative paths, treating an empty prefix as the root.
pub fn join_path(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

pub fn is_tmp_path(path: &str) -> bool {
    path == TMP_DIR || path.starts_with("tmp/")
}
