use super::{is_tmp_path, layout_dirs, Backend, BackendType, TMP_DIR};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use walkdir::WalkDir;

pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, path: &str) -> PathBuf {
        self.base_path.join(path)
    }

    fn transport_error(action: &str, path: &str, err: std::io::Error) -> Error {
        if err.kind() == ErrorKind::NotFound {
            Error::NotFound { path: path.to_string() }
        } else {
            Error::Transport(format!("Failed to {} '{}': {}", action, path, err))
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn url(&self) -> String {
        self.base_path.display().to_string()
    }

    async fn init(&self) -> Result<()> {
        if self.base_path.exists() {
            let mut entries = fs::read_dir(&self.base_path).await?;
            if entries.next_entry().await?.is_some() {
                return Err(Error::AlreadyExists { path: self.url() });
            }
        }

        fs::create_dir_all(&self.base_path).await?;
        for dir in layout_dirs() {
            fs::create_dir(self.full_path(&dir)).await?;
        }

        debug!(path = %self.base_path.display(), "Initialized local repository layout");
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        fs::try_exists(self.full_path(path))
            .await
            .map_err(|e| Self::transport_error("stat", path, e))
    }

    async fn read(&self, path: &str) -> Result<Bytes> {
        let data = fs::read(self.full_path(path))
            .await
            .map_err(|e| Self::transport_error("read", path, e))?;
        Ok(Bytes::from(data))
    }

    async fn write(&self, path: &str, data: Bytes) -> Result<u64> {
        let full_path = self.full_path(path);
        let tmp_dir = self.full_path(TMP_DIR);
        let display = path.to_string();

        tokio::task::spawn_blocking(move || -> Result<u64> {
            if let Some(parent) = full_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::create_dir_all(&tmp_dir)?;

            let mut tmp = tempfile::NamedTempFile::new_in(&tmp_dir)
                .map_err(|e| Self::transport_error("create temporary file for", &display, e))?;
            tmp.write_all(&data)
                .map_err(|e| Self::transport_error("write", &display, e))?;
            tmp.persist(&full_path)
                .map_err(|e| Self::transport_error("rename", &display, e.error))?;

            Ok(data.len() as u64)
        })
        .await
        .map_err(|e| Error::Other(format!("Write task failed: {}", e)))?
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::transport_error("delete", path, e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = self.base_path.clone();
        let start = self.full_path(prefix);

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let mut results = Vec::new();
            if !start.is_dir() {
                return Ok(results);
            }

            let walker = WalkDir::new(&start).min_depth(1).into_iter().filter_entry(|entry| {
                let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
                !is_tmp_path(&relative.to_string_lossy())
            });

            for entry in walker {
                let entry = entry.map_err(|e| Error::Transport(format!("Failed to enumerate files: {}", e)))?;
                if !entry.file_type().is_file() {
                    continue;
                }

                let relative = entry
                    .path()
                    .strip_prefix(&root)
                    .map_err(|e| Error::Other(e.to_string()))?;
                let parts: Vec<_> = relative.components().map(|c| c.as_os_str().to_string_lossy()).collect();
                results.push(parts.join("/"));
            }

            Ok(results)
        })
        .await
        .map_err(|e| Error::Other(format!("List task failed: {}", e)))?
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        match fs::create_dir(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Self::transport_error("create directory", path, e)),
        }
    }

    async fn delete_dir(&self, path: &str) -> Result<()> {
        match fs::remove_dir(self.full_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::transport_error("delete directory", path, e)),
        }
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }
}
