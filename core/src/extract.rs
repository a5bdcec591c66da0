//! Restores blobs to the local filesystem.
//!
//! Every chunk and every directory entry is extracted by its own task on the
//! disk's worker pool. Files are written with positioned writes into a
//! temporary file, which is renamed into place once its last chunk is written.
//! Directory metadata is applied after the last task below that directory has
//! finished, so that extracting children does not bump the restored mtime.

use crate::format::{self, ChunkRef, DirectoryObject, EntryKind, RawEntry};
use crate::pool::{Completion, TaskGroup};
use crate::{BlobType, Disk, Error, ObjectId, Result};
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tempfile::TempPath;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Default)]
pub struct GetSettings {
    /// Extract into non-empty directories and replace existing files.
    pub force: bool,
    /// Drop directory components of snapshot entries.
    pub flat: bool,
    /// Restore file owners (needs privileges).
    pub chown: bool,
}

/// State shared by all the tasks of one extraction.
#[derive(Clone)]
pub struct GetContext {
    disk: Arc<Disk>,
    settings: GetSettings,
    group: TaskGroup,
    extracted: Arc<AtomicI64>,
    #[cfg(test)]
    reverse_submission: bool,
}

/// Extracts the object `id` to `dest`, returns the number of bytes restored.
pub async fn get(disk: &Arc<Disk>, id: &ObjectId, settings: &GetSettings, dest: &Path) -> Result<i64> {
    GetContext::new(disk.clone(), settings.clone()).get(id, dest).await
}

impl GetContext {
    pub fn new(disk: Arc<Disk>, settings: GetSettings) -> Self {
        let group = TaskGroup::new(disk.pool());

        Self {
            disk,
            settings,
            group,
            extracted: Arc::new(AtomicI64::new(0)),
            #[cfg(test)]
            reverse_submission: false,
        }
    }

    /// Bytes of file content restored so far.
    pub fn extracted(&self) -> i64 {
        self.extracted.load(Ordering::Relaxed)
    }

    /// Shared handle on the byte counter, for progress reporting.
    pub fn progress(&self) -> Arc<AtomicI64> {
        self.extracted.clone()
    }

    pub async fn get(&self, id: &ObjectId, dest: &Path) -> Result<i64> {
        let (blob_type, data) = self.disk.read_blob(id).await?;

        let mut success = match blob_type {
            BlobType::Chunk | BlobType::File => {
                if !self.settings.force && dest.exists() && !is_empty_directory(dest) {
                    error!("File '{}' already exists", dest.display());
                    return Err(Error::AlreadyExists {
                        path: dest.display().to_string(),
                    });
                }

                let root = Completion::noop();
                let ok = self.extract_file(*id, blob_type, data, dest.to_path_buf(), None, &root).await;
                ok & root.release(true).await
            }

            BlobType::Directory => {
                self.prepare_directory(dest)?;

                let dir = format::decode_entries(&data, false)?;
                self.extract_entries(dir, false, false, dest.to_path_buf(), None, None).await
            }

            BlobType::Snapshot => {
                self.prepare_directory(dest)?;

                let snapshot = format::decode_snapshot(&data)?;
                let flat = self.settings.flat;
                self.extract_entries(snapshot.root, true, flat, dest.to_path_buf(), None, None).await
            }

            BlobType::Link => {
                let target = link_target(id, &data)?;
                create_symlink(&target, dest, self.settings.force)?;
                true
            }
        };

        success &= self.group.sync().await;
        if !success {
            return Err(Error::Other(format!("Failed to extract '{}'", id)));
        }

        Ok(self.extracted())
    }

    fn prepare_directory(&self, dest: &Path) -> Result<()> {
        if !self.settings.force && dest.is_dir() {
            if !is_empty_directory(dest) {
                error!("Directory '{}' exists and is not empty", dest.display());
                return Err(Error::AlreadyExists {
                    path: dest.display().to_string(),
                });
            }
            return Ok(());
        }

        let result = if self.settings.force {
            std::fs::create_dir_all(dest)
        } else {
            std::fs::create_dir(dest)
        };
        result.map_err(|e| {
            error!("Cannot create directory '{}': {}", dest.display(), e);
            Error::Io(e)
        })
    }

    /// Spawns one task per readable entry. `meta` is applied to `dest` once
    /// all of them are done.
    async fn extract_entries(
        &self,
        dir: DirectoryObject,
        allow_separators: bool,
        flat: bool,
        dest: PathBuf,
        meta: Option<RawEntry>,
        parent: Option<&Arc<Completion>>,
    ) -> bool {
        let chown = self.settings.chown;
        let dirname = dest.clone();
        let token = Completion::new(parent, move |_| async move {
            if let Some(meta) = meta {
                tokio::task::spawn_blocking(move || apply_directory_metadata(&dirname, &meta, chown))
                    .await
                    .ok();
            }
            true
        });

        let winners = if flat { flat_winners(&dir.entries) } else { HashMap::new() };

        let mut success = true;
        for (idx, entry) in dir.entries.into_iter().enumerate() {
            if !entry.is_readable() {
                debug!("Skipping unreadable entry '{}'", entry.name);
                continue;
            }

            let filename = if flat {
                let basename = flat_name(&entry.name);
                if winners.get(basename) != Some(&idx) {
                    warn!("Skipping '{}', another entry is extracted as '{}'", entry.name, basename);
                    continue;
                }
                dest.join(basename)
            } else {
                let filename = dest.join(&entry.name);
                if allow_separators {
                    if let Some(parent) = filename.parent() {
                        if let Err(e) = std::fs::create_dir_all(parent) {
                            error!("Cannot create directory '{}': {}", parent.display(), e);
                            success = false;
                            continue;
                        }
                    }
                }
                filename
            };

            let ctx = self.clone();
            let share = token.retain();
            self.group.spawn(async move {
                let ok = ctx.extract_entry(entry, filename, share.clone()).await;
                ok & share.release(true).await
            });
        }

        success & token.release(true).await
    }

    fn extract_entry(self, entry: RawEntry, filename: PathBuf, token: Arc<Completion>) -> BoxFuture<'static, bool> {
        Box::pin(async move {
            let Ok((blob_type, data)) = self.disk.read_blob(&entry.id).await else {
                return false;
            };

            match entry.kind {
                EntryKind::Directory => {
                    if blob_type != BlobType::Directory {
                        error!("Object '{}' is not a Directory", entry.id);
                        return false;
                    }
                    if let Err(e) = make_directory(&filename) {
                        error!("Cannot create directory '{}': {}", filename.display(), e);
                        return false;
                    }
                    let Ok(dir) = format::decode_entries(&data, false) else {
                        return false;
                    };

                    self.extract_entries(dir, false, false, filename, Some(entry), Some(&token))
                        .await
                }

                EntryKind::File => {
                    if blob_type != BlobType::File && blob_type != BlobType::Chunk {
                        error!("Object '{}' is not a File", entry.id);
                        return false;
                    }

                    let id = entry.id;
                    self.extract_file(id, blob_type, data, filename, Some(entry), &token)
                        .await
                }

                EntryKind::Link => {
                    if blob_type != BlobType::Link {
                        error!("Object '{}' is not a Link", entry.id);
                        return false;
                    }

                    link_target(&entry.id, &data)
                        .and_then(|target| create_symlink(&target, &filename, true))
                        .is_ok()
                }
            }
        })
    }

    /// Writes a File (or single Chunk) blob to `dest`. Chunks are fetched by
    /// separate tasks; the file is finalized by whichever finishes last.
    async fn extract_file(
        &self,
        id: ObjectId,
        blob_type: BlobType,
        data: Vec<u8>,
        dest: PathBuf,
        meta: Option<RawEntry>,
        parent: &Arc<Completion>,
    ) -> bool {
        let (chunks, total_len) = match blob_type {
            BlobType::File => match format::decode_file(&data) {
                Ok(object) => (object.chunks, object.total_len),
                Err(_) => {
                    error!("Malformed file object '{}'", id);
                    return false;
                }
            },
            _ => (Vec::new(), data.len() as i64),
        };

        let (file, tmp_path) = match create_temporary(&dest) {
            Ok(pair) => pair,
            Err(e) => {
                error!("Cannot create temporary file for '{}': {}", dest.display(), e);
                return false;
            }
        };

        if let Err(e) = file.set_len(total_len as u64) {
            error!("Failed to reserve file '{}': {}", dest.display(), e);
            return false;
        }
        if blob_type == BlobType::Chunk {
            if let Err(e) = write_at(&file, &data, 0) {
                error!("Failed to write to '{}': {}", dest.display(), e);
                return false;
            }
        }

        let file = Arc::new(file);
        let finalize = Finalize {
            id,
            file: file.clone(),
            tmp_path,
            dest: dest.clone(),
            meta,
            chown: self.settings.chown,
            total_len,
            last_end: chunks.last().map(|chunk| chunk.offset + chunk.len),
            extracted: self.extracted.clone(),
        };
        let token = Completion::new(Some(parent), move |ok| async move {
            // Failed chunks already logged, the temporary file goes away with `finalize`
            if !ok {
                return false;
            }
            tokio::task::spawn_blocking(move || finalize.run()).await.unwrap_or(false)
        });

        #[cfg(test)]
        let chunks: Vec<ChunkRef> = if self.reverse_submission {
            chunks.into_iter().rev().collect()
        } else {
            chunks
        };

        for chunk in chunks {
            let disk = self.disk.clone();
            let file = file.clone();
            let share = token.retain();
            let dest = dest.clone();

            self.group.spawn(async move {
                let ok = write_chunk(&disk, &chunk, file, &dest).await;
                ok & share.release(ok).await
            });
        }
        drop(file);

        token.release(true).await
    }
}

async fn write_chunk(disk: &Disk, chunk: &ChunkRef, file: Arc<File>, dest: &Path) -> bool {
    let Ok((blob_type, data)) = disk.read_blob(&chunk.id).await else {
        return false;
    };

    if blob_type != BlobType::Chunk {
        error!("Object '{}' is not a Chunk", chunk.id);
        return false;
    }
    if data.len() as i64 != chunk.len {
        error!("Chunk size mismatch for '{}'", chunk.id);
        return false;
    }

    let offset = chunk.offset as u64;
    let result = tokio::task::spawn_blocking(move || write_at(&file, &data, offset)).await;

    match result {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            error!("Failed to write to '{}': {}", dest.display(), e);
            false
        }
        Err(e) => {
            error!("Write task for '{}' failed: {}", dest.display(), e);
            false
        }
    }
}

/// Last step of a file extraction, run once every chunk is written.
struct Finalize {
    id: ObjectId,
    file: Arc<File>,
    tmp_path: TempPath,
    dest: PathBuf,
    meta: Option<RawEntry>,
    chown: bool,
    total_len: i64,
    last_end: Option<i64>,
    extracted: Arc<AtomicI64>,
}

impl Finalize {
    fn run(self) -> bool {
        if let Some(end) = self.last_end {
            if end != self.total_len {
                error!("File size mismatch for '{}'", self.id);
                return false;
            }
        }

        if let Err(e) = self.file.sync_all() {
            error!("Failed to flush '{}': {}", self.dest.display(), e);
            return false;
        }
        drop(self.file);

        if let Err(e) = self.tmp_path.persist(&self.dest) {
            error!("Failed to rename file to '{}': {}", self.dest.display(), e.error);
            return false;
        }

        let file = match OpenOptions::new().append(true).open(&self.dest) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to reopen '{}': {}", self.dest.display(), e);
                return false;
            }
        };
        if let Some(meta) = &self.meta {
            apply_file_metadata(&file, &self.dest, meta, self.chown);
        }

        self.extracted.fetch_add(self.total_len, Ordering::Relaxed);
        true
    }
}

/// Maps flattened names to the index of the entry that gets extracted under
/// that name: the one with the greatest source path.
fn flat_winners(entries: &[RawEntry]) -> HashMap<String, usize> {
    let mut winners: HashMap<String, usize> = HashMap::new();

    for (idx, entry) in entries.iter().enumerate() {
        if !entry.is_readable() {
            continue;
        }

        winners
            .entry(flat_name(&entry.name).to_string())
            .and_modify(|current| {
                if entry.name > entries[*current].name {
                    *current = idx;
                }
            })
            .or_insert(idx);
    }

    winners
}

fn flat_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

fn link_target(id: &ObjectId, data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec()).map_err(|_| {
        error!("Malformed link object '{}'", id);
        Error::malformed("link target is not valid UTF-8")
    })
}

fn is_empty_directory(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false)
}

fn make_directory(path: &Path) -> io::Result<()> {
    match std::fs::create_dir(path) {
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        result => result,
    }
}

/// Temporary file next to `dest`, removed on drop unless persisted.
fn create_temporary(dest: &Path) -> io::Result<(File, TempPath)> {
    let dir = dest.parent().unwrap_or_else(|| Path::new("."));
    let prefix = format!(
        ".{}.",
        dest.file_name().map(|name| name.to_string_lossy()).unwrap_or_default()
    );

    let tmp = tempfile::Builder::new().prefix(&prefix).tempfile_in(dir)?;
    Ok(tmp.into_parts())
}

#[cfg(unix)]
fn write_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;

    while !buf.is_empty() {
        let written = file.seek_write(buf, offset)?;
        if written == 0 {
            return Err(io::ErrorKind::WriteZero.into());
        }
        buf = &buf[written..];
        offset += written as u64;
    }
    Ok(())
}

fn create_symlink(target: &str, path: &Path, overwrite: bool) -> Result<()> {
    match make_symlink(target, path) {
        Ok(()) => Ok(()),
        Err(e) if overwrite && e.kind() == io::ErrorKind::AlreadyExists => {
            let is_link = path.symlink_metadata().map(|m| m.file_type().is_symlink()).unwrap_or(false);
            if !is_link {
                error!("Cannot replace '{}' with a symbolic link, it is not a link", path.display());
                return Err(Error::AlreadyExists {
                    path: path.display().to_string(),
                });
            }

            std::fs::remove_file(path)?;
            make_symlink(target, path).map_err(|e| {
                error!("Failed to create symbolic link '{}': {}", path.display(), e);
                Error::Io(e)
            })
        }
        Err(e) => {
            error!("Failed to create symbolic link '{}': {}", path.display(), e);
            Err(Error::Io(e))
        }
    }
}

#[cfg(unix)]
fn make_symlink(target: &str, path: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, path)
}

#[cfg(windows)]
fn make_symlink(target: &str, path: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, path)
}

fn mtime_of(meta: &RawEntry) -> filetime::FileTime {
    let secs = meta.mtime.div_euclid(1000);
    let nanos = (meta.mtime.rem_euclid(1000) * 1_000_000) as u32;
    filetime::FileTime::from_unix_time(secs, nanos)
}

fn apply_file_metadata(file: &File, path: &Path, meta: &RawEntry, chown: bool) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if chown {
            if let Err(e) = std::os::unix::fs::fchown(file, Some(meta.uid), Some(meta.gid)) {
                warn!("Failed to change owner of '{}' (ignoring): {}", path.display(), e);
            }
        }

        let permissions = std::fs::Permissions::from_mode(meta.mode & 0o7777);
        if let Err(e) = file.set_permissions(permissions) {
            warn!("Failed to set permissions of '{}' (ignoring): {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = chown;

    if let Err(e) = filetime::set_file_handle_times(file, None, Some(mtime_of(meta))) {
        warn!("Failed to set mtime of '{}' (ignoring): {}", path.display(), e);
    }
}

fn apply_directory_metadata(path: &Path, meta: &RawEntry, chown: bool) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        if chown {
            if let Err(e) = std::os::unix::fs::chown(path, Some(meta.uid), Some(meta.gid)) {
                warn!("Failed to change owner of '{}' (ignoring): {}", path.display(), e);
            }
        }

        let permissions = std::fs::Permissions::from_mode(meta.mode & 0o7777);
        if let Err(e) = std::fs::set_permissions(path, permissions) {
            warn!("Failed to set permissions of '{}' (ignoring): {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = chown;

    if let Err(e) = filetime::set_file_mtime(path, mtime_of(meta)) {
        warn!("Failed to set mtime of '{}' (ignoring): {}", path.display(), e);
    }
}
