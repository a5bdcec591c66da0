//! Listing of Directory and Snapshot objects without extracting anything.

use crate::format::{self, EntryKind, RawEntry};
use crate::pool::TaskGroup;
use crate::{BlobType, Disk, Error, ObjectId, Result};
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tracing::error;

#[derive(Debug, Clone, Default)]
pub struct TreeSettings {
    /// Deepest level listed, counting from 0. Unlimited when unset.
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    /// `children` stays at 0 for directories below the depth limit.
    Directory { children: usize },
    File { readable: bool },
    Link { target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: ObjectId,
    pub depth: usize,
    pub kind: FileKind,
    pub name: String,
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: i64,
}

impl FileInfo {
    fn new(entry: &RawEntry, depth: usize, kind: FileKind) -> Self {
        Self {
            id: entry.id,
            depth,
            kind,
            name: entry.name.clone(),
            mtime: entry.mtime,
            btime: entry.btime,
            mode: entry.mode,
            uid: entry.uid,
            gid: entry.gid,
            size: entry.size,
        }
    }
}

/// Lists the content of a Directory or Snapshot object, depth first. Only
/// Directory and Link objects are read, file contents never are.
pub async fn tree(disk: &Arc<Disk>, id: &ObjectId, settings: &TreeSettings) -> Result<Vec<FileInfo>> {
    let (blob_type, data) = disk.read_blob(id).await?;

    let entries = match blob_type {
        BlobType::Directory => format::decode_entries(&data, false)?.entries,
        BlobType::Snapshot => format::decode_snapshot(&data)?.root.entries,
        other => {
            error!("Expected snapshot or directory object, not '{}'", other);
            return Err(Error::Other(format!(
                "Object '{}' is a {}, not a snapshot or directory",
                id, other
            )));
        }
    };

    let mut files = Vec::new();
    recurse_entries(disk, entries, 0, settings, &mut files).await?;

    Ok(files)
}

fn recurse_entries<'a>(
    disk: &'a Arc<Disk>,
    entries: Vec<RawEntry>,
    depth: usize,
    settings: &'a TreeSettings,
    files: &'a mut Vec<FileInfo>,
) -> BoxFuture<'a, Result<()>> {
    Box::pin(async move {
        let descend = settings.max_depth.is_none_or(|max| depth < max);
        let objects = fetch_objects(disk, &entries, descend).await?;

        for (entry, object) in entries.iter().zip(objects) {
            match entry.kind {
                EntryKind::Directory => {
                    let idx = files.len();
                    files.push(FileInfo::new(entry, depth, FileKind::Directory { children: 0 }));

                    if let Some(data) = object {
                        let dir = format::decode_entries(&data, false)?;
                        let children = dir.entries.len();

                        recurse_entries(disk, dir.entries, depth + 1, settings, files).await?;
                        files[idx].kind = FileKind::Directory { children };
                    }
                }
                EntryKind::File => {
                    let kind = FileKind::File {
                        readable: entry.is_readable(),
                    };
                    files.push(FileInfo::new(entry, depth, kind));
                }
                EntryKind::Link => {
                    let target = object.map(|data| String::from_utf8_lossy(&data).into_owned()).unwrap_or_default();
                    files.push(FileInfo::new(entry, depth, FileKind::Link { target }));
                }
            }
        }

        Ok(())
    })
}

/// Reads the Directory (when descending) and Link objects of one level in
/// parallel, in entry order.
async fn fetch_objects(disk: &Arc<Disk>, entries: &[RawEntry], descend: bool) -> Result<Vec<Option<Vec<u8>>>> {
    let objects = Arc::new(Mutex::new(vec![None; entries.len()]));
    let group = TaskGroup::new(disk.pool());

    for (idx, entry) in entries.iter().enumerate() {
        let expect = match entry.kind {
            EntryKind::Directory if descend => BlobType::Directory,
            EntryKind::Link => BlobType::Link,
            _ => continue,
        };

        let disk = disk.clone();
        let id = entry.id;
        let objects = objects.clone();

        group.spawn(async move {
            let Ok((blob_type, data)) = disk.read_blob(&id).await else {
                return false;
            };
            if blob_type != expect {
                error!("Object '{}' is not a {}", id, expect);
                return false;
            }

            match objects.lock() {
                Ok(mut objects) => objects[idx] = Some(data),
                Err(poisoned) => poisoned.into_inner()[idx] = Some(data),
            }
            true
        });
    }

    if !group.sync().await {
        return Err(Error::Other("Failed to read directory content".to_string()));
    }

    let objects = match objects.lock() {
        Ok(mut objects) => std::mem::take(&mut *objects),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    Ok(objects)
}
