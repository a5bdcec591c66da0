//! Integration tests for extraction of snapshots, directories and files

mod common;

use common::{dir_entry, file_entry, link_entry, Writer};
use sealsnap_core::format::{self, ChunkRef, EntryKind};
use sealsnap_core::{get, BlobType, Disk, DiskMode, Error, GetContext, GetSettings, LocalBackend};
use std::path::Path;
use std::sync::Arc;

const DIRECTORIES: usize = 4;
const FILES_PER_DIRECTORY: usize = 5;
const SIZES: [usize; FILES_PER_DIRECTORY] = [0, 100, 4096, 10_000, 21_000];

/// Builds `DIRECTORIES` directories of `FILES_PER_DIRECTORY` files each under
/// a snapshot, returns the snapshot id and the expected total size.
async fn build_snapshot(writer: &Writer) -> (sealsnap_core::ObjectId, i64) {
    let mut root = Vec::new();
    let mut total = 0i64;

    for d in 0..DIRECTORIES {
        let mut entries = Vec::new();
        let mut dir_size = 0i64;

        for (f, size) in SIZES.iter().enumerate() {
            let data = common::content((d * 10 + f) as u8, *size);
            let id = writer.file(&data).await;

            entries.push(file_entry(&format!("file{}.bin", f), id, *size));
            dir_size += *size as i64;
        }

        let id = writer.directory(&entries).await;
        root.push(dir_entry(&format!("dir{}", d), id, dir_size));
        total += dir_size;
    }

    let id = writer.snapshot("nightly", 1_700_000_000_000, &root).await;
    (id, total)
}

fn check_tree(dest: &Path) {
    for d in 0..DIRECTORIES {
        for (f, size) in SIZES.iter().enumerate() {
            let path = dest.join(format!("dir{}", d)).join(format!("file{}.bin", f));
            let data = std::fs::read(&path).unwrap();

            assert_eq!(data, common::content((d * 10 + f) as u8, *size), "{}", path.display());
        }
    }
}

#[tokio::test]
async fn test_get_snapshot_restores_content() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let (id, total) = build_snapshot(&writer).await;
    let dest = temp.path().join("restore");

    let extracted = get(&disk, &id, &GetSettings::default(), &dest).await.unwrap();

    assert_eq!(extracted, total);
    check_tree(&dest);
}

#[tokio::test]
async fn test_get_restores_metadata() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let (id, _) = build_snapshot(&writer).await;
    let dest = temp.path().join("restore");
    get(&disk, &id, &GetSettings::default(), &dest).await.unwrap();

    let file = std::fs::metadata(dest.join("dir0/file1.bin")).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&file);
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);

    // Applied once the children are written
    let dir = std::fs::metadata(dest.join("dir2")).unwrap();
    let mtime = filetime::FileTime::from_last_modification_time(&dir);
    assert_eq!(mtime.unix_seconds(), 1_600_000_000);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(file.permissions().mode() & 0o777, 0o644);
        assert_eq!(dir.permissions().mode() & 0o777, 0o755);
    }
}

#[tokio::test]
async fn test_get_many_small_chunks() {
    let (disk, temp) = common::setup_disk().await;
    let mut writer = Writer::new(&disk);
    writer.chunk_size = 1000;

    let data = common::content(7, 9_500);
    let id = writer.file(&data).await;

    let dest = temp.path().join("file.bin");
    let extracted = get(&disk, &id, &GetSettings::default(), &dest).await.unwrap();

    assert_eq!(extracted, data.len() as i64);
    assert_eq!(std::fs::read(&dest).unwrap(), data);
}

#[tokio::test]
async fn test_get_rejects_overflowing_chunk_reference() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let chunk = writer.put(BlobType::Chunk, b"x").await;
    let refs = [ChunkRef {
        id: chunk,
        offset: i64::MAX,
        len: 1,
    }];
    let id = writer.put(BlobType::File, &format::encode_file(&refs, 1)).await;

    let dest = temp.path().join("file.bin");
    assert!(get(&disk, &id, &GetSettings::default(), &dest).await.is_err());
    assert!(!dest.exists());
}

#[tokio::test]
async fn test_get_single_chunk_file() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let data = b"small file".to_vec();
    let id = writer.file(&data).await;
    let dir = writer.directory(&[file_entry("small.txt", id, data.len())]).await;

    let dest = temp.path().join("restore");
    get(&disk, &dir, &GetSettings::default(), &dest).await.unwrap();

    assert_eq!(std::fs::read(dest.join("small.txt")).unwrap(), data);
}

#[tokio::test]
async fn test_get_snapshot_with_separators() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let data = common::content(1, 300);
    let id = writer.file(&data).await;
    let snapshot = writer
        .snapshot("paths", 0, &[file_entry("home/user/notes.txt", id, data.len())])
        .await;

    let dest = temp.path().join("restore");
    get(&disk, &snapshot, &GetSettings::default(), &dest).await.unwrap();

    assert_eq!(std::fs::read(dest.join("home/user/notes.txt")).unwrap(), data);
}

#[tokio::test]
async fn test_get_flat_keeps_greatest_path() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let a = writer.file(b"from a").await;
    let b = writer.file(b"from b").await;
    let snapshot = writer
        .snapshot("flat", 0, &[file_entry("b/x.txt", b, 6), file_entry("a/x.txt", a, 6)])
        .await;

    let dest = temp.path().join("restore");
    let settings = GetSettings {
        flat: true,
        ..Default::default()
    };
    get(&disk, &snapshot, &settings, &dest).await.unwrap();

    assert_eq!(std::fs::read(dest.join("x.txt")).unwrap(), b"from b");
    assert!(!dest.join("a").exists());
    assert!(!dest.join("b").exists());
}

#[cfg(unix)]
#[tokio::test]
async fn test_get_links() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let link = writer.link("../target.txt").await;
    let dir = writer.directory(&[link_entry("shortcut", link)]).await;

    let dest = temp.path().join("restore");
    get(&disk, &dir, &GetSettings::default(), &dest).await.unwrap();

    assert_eq!(
        std::fs::read_link(dest.join("shortcut")).unwrap(),
        Path::new("../target.txt")
    );
}

#[tokio::test]
async fn test_get_skips_unreadable_entries() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let id = writer.file(b"visible").await;
    let mut hidden = file_entry("hidden.txt", id, 7);
    hidden.flags = 0;
    let dir = writer.directory(&[file_entry("visible.txt", id, 7), hidden]).await;

    let dest = temp.path().join("restore");
    get(&disk, &dir, &GetSettings::default(), &dest).await.unwrap();

    assert!(dest.join("visible.txt").exists());
    assert!(!dest.join("hidden.txt").exists());
}

#[tokio::test]
async fn test_get_refuses_non_empty_destination() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let id = writer.file(b"content").await;
    let dir = writer.directory(&[file_entry("a.txt", id, 7)]).await;

    let dest = temp.path().join("restore");
    std::fs::create_dir(&dest).unwrap();
    std::fs::write(dest.join("existing"), b"keep").unwrap();

    let result = get(&disk, &dir, &GetSettings::default(), &dest).await;
    assert!(matches!(result, Err(Error::AlreadyExists { .. })));

    let settings = GetSettings {
        force: true,
        ..Default::default()
    };
    get(&disk, &dir, &settings, &dest).await.unwrap();
    assert_eq!(std::fs::read(dest.join("a.txt")).unwrap(), b"content");
    assert_eq!(std::fs::read(dest.join("existing")).unwrap(), b"keep");
}

#[tokio::test]
async fn test_get_fails_on_wrong_chunk_type() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    // A File entry pointing to a Directory object
    let inner = writer.directory(&[]).await;
    let dir = writer
        .directory(&[common::entry(EntryKind::File, "broken", inner, 8)])
        .await;

    let dest = temp.path().join("restore");
    assert!(get(&disk, &dir, &GetSettings::default(), &dest).await.is_err());
    assert!(!dest.join("broken").exists());
}

#[tokio::test]
async fn test_get_progress_counter() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);

    let (id, total) = build_snapshot(&writer).await;

    let ctx = GetContext::new(disk.clone(), GetSettings::default());
    let progress = ctx.progress();
    ctx.get(&id, &temp.path().join("restore")).await.unwrap();

    assert_eq!(progress.load(std::sync::atomic::Ordering::Relaxed), total);
    assert_eq!(ctx.extracted(), total);
}

#[tokio::test]
async fn test_write_only_cannot_read() {
    let (disk, temp) = common::setup_disk().await;
    let writer = Writer::new(&disk);
    let (id, _) = build_snapshot(&writer).await;

    let backend = Arc::new(LocalBackend::new(temp.path().join("repo")));
    let mut write_only = Disk::new(backend, common::test_config(&temp, 0));
    write_only.authenticate("default", common::WRITE_PASSWORD).await.unwrap();
    assert_eq!(write_only.mode(), DiskMode::WriteOnly);

    // Writing is fine
    let salt = write_only.salt().unwrap();
    let chunk = sealsnap_core::ObjectId::hash_blob(&salt, BlobType::Chunk, b"new");
    write_only.write_blob(&chunk, BlobType::Chunk, b"new").await.unwrap();
    write_only.write_tag(&id).await.unwrap();

    let write_only = Arc::new(write_only);
    assert!(matches!(
        write_only.read_blob(&id).await,
        Err(Error::InsufficientMode { .. })
    ));
    assert!(matches!(
        write_only.list_tags().await,
        Err(Error::InsufficientMode { .. })
    ));

    let dest = temp.path().join("restore");
    assert!(matches!(
        get(&write_only, &id, &GetSettings::default(), &dest).await,
        Err(Error::InsufficientMode { .. })
    ));
}
