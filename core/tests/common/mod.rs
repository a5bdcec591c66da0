//! Shared setup for repository integration tests

#![allow(dead_code)]

use sealsnap_core::format::{self, ChunkRef, EntryKind, RawEntry, SnapshotHeader, FLAG_READABLE};
use sealsnap_core::{
    Backend, BlobType, CacheSettings, Disk, DiskConfig, KdfParams, LocalBackend, ObjectId,
};
use std::sync::Arc;
use tempfile::TempDir;

pub const FULL_PASSWORD: &str = "full-password";
pub const WRITE_PASSWORD: &str = "write-password";

pub fn test_config(temp: &TempDir, check_percent: u32) -> DiskConfig {
    DiskConfig {
        threads: Some(8),
        kdf: KdfParams::insecure_for_tests(),
        cache: CacheSettings {
            enabled: true,
            dir: Some(temp.path().join("cache")),
            check_percent,
        },
    }
}

/// Initialized repository in ReadWrite mode over the local transport.
pub async fn setup_disk() -> (Arc<Disk>, TempDir) {
    let temp = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
    let disk = init_disk(backend, test_config(&temp, 0)).await;

    (disk, temp)
}

pub async fn init_disk(backend: Arc<dyn Backend>, config: DiskConfig) -> Arc<Disk> {
    let mut disk = Disk::new(backend, config);
    disk.init(FULL_PASSWORD, WRITE_PASSWORD).await.unwrap();
    Arc::new(disk)
}

/// Deterministic pseudo-random content.
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    let mut state = seed as u32 + 1;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
            (state >> 16) as u8
        })
        .collect()
}

/// Writes objects the way a backup writer would, with fixed-size chunking.
pub struct Writer {
    pub disk: Arc<Disk>,
    salt: [u8; 32],
    pub chunk_size: usize,
}

impl Writer {
    pub fn new(disk: &Arc<Disk>) -> Self {
        Self {
            disk: disk.clone(),
            salt: disk.salt().unwrap(),
            chunk_size: 4096,
        }
    }

    pub async fn put(&self, blob_type: BlobType, data: &[u8]) -> ObjectId {
        let id = ObjectId::hash_blob(&self.salt, blob_type, data);
        self.disk.write_blob(&id, blob_type, data).await.unwrap();
        id
    }

    /// Stores `data` as a File object, or as a single Chunk when it fits.
    pub async fn file(&self, data: &[u8]) -> ObjectId {
        if !data.is_empty() && data.len() <= self.chunk_size {
            return self.put(BlobType::Chunk, data).await;
        }

        let mut chunks = Vec::new();
        for (idx, piece) in data.chunks(self.chunk_size).enumerate() {
            let id = self.put(BlobType::Chunk, piece).await;
            chunks.push(ChunkRef {
                id,
                offset: (idx * self.chunk_size) as i64,
                len: piece.len() as i64,
            });
        }

        self.put(BlobType::File, &format::encode_file(&chunks, data.len() as i64)).await
    }

    pub async fn directory(&self, entries: &[RawEntry]) -> ObjectId {
        let data = format::encode_directory(entries).unwrap();
        self.put(BlobType::Directory, &data).await
    }

    pub async fn link(&self, target: &str) -> ObjectId {
        self.put(BlobType::Link, target.as_bytes()).await
    }

    /// Writes the snapshot object and tags it.
    pub async fn snapshot(&self, name: &str, time: i64, entries: &[RawEntry]) -> ObjectId {
        let header = SnapshotHeader {
            name: name.to_string(),
            time,
            len: entries.iter().map(|e| e.size).sum(),
            stored: 0,
        };
        let data = format::encode_snapshot(&header, entries).unwrap();

        let id = self.put(BlobType::Snapshot, &data).await;
        self.disk.write_tag(&id).await.unwrap();
        id
    }
}

pub fn entry(kind: EntryKind, name: &str, id: ObjectId, size: i64) -> RawEntry {
    let mode = match kind {
        EntryKind::Directory => 0o755,
        EntryKind::File => 0o644,
        EntryKind::Link => 0o777,
    };

    RawEntry {
        id,
        kind,
        flags: FLAG_READABLE,
        name: name.to_string(),
        mtime: 1_600_000_000_000,
        btime: 1_600_000_000_000,
        mode,
        uid: 0,
        gid: 0,
        size,
    }
}

pub fn file_entry(name: &str, id: ObjectId, size: usize) -> RawEntry {
    entry(EntryKind::File, name, id, size as i64)
}

pub fn dir_entry(name: &str, id: ObjectId, size: i64) -> RawEntry {
    entry(EntryKind::Directory, name, id, size)
}

pub fn link_entry(name: &str, id: ObjectId) -> RawEntry {
    entry(EntryKind::Link, name, id, 0)
}
