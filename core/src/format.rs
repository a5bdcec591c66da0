//! Binary layouts of the decrypted Directory, Snapshot, File and Link payloads.
//!
//! ```text
//! Directory = Entry* | total_len:i64
//! Entry     = id:32 | kind:i8 | flags:i8 | name_len:u16 | name | mtime:i64 | btime:i64
//!             | mode:u32 | uid:u32 | gid:u32 | size:i64
//! File      = ChunkRef* | total_len:i64
//! ChunkRef  = id:32 | offset:i64 | len:i64
//! Snapshot  = name:512 | time:i64 | len:i64 | stored:i64 | Directory
//! ```
//!
//! All integers are little-endian, times are Unix milliseconds.

use crate::{Error, ID_SIZE, ObjectId, Result};
use bytes::{Buf, BufMut};
use tracing::error;

pub const ENTRY_FIXED_SIZE: usize = ID_SIZE + 1 + 1 + 2 + 8 + 8 + 4 + 4 + 4 + 8;
pub const CHUNK_REF_SIZE: usize = ID_SIZE + 8 + 8;
pub const TRAILER_SIZE: usize = 8;

pub const SNAPSHOT_NAME_SIZE: usize = 512;
pub const SNAPSHOT_HEADER_SIZE: usize = SNAPSHOT_NAME_SIZE + 8 + 8 + 8;
/// Leaves room for the NUL terminator.
pub const MAX_SNAPSHOT_NAME: usize = SNAPSHOT_NAME_SIZE - 1;

pub const FLAG_READABLE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum EntryKind {
    Directory = 0,
    File = 1,
    Link = 2,
}

impl TryFrom<i8> for EntryKind {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            0 => Ok(EntryKind::Directory),
            1 => Ok(EntryKind::File),
            2 => Ok(EntryKind::Link),
            other => Err(Error::malformed(format!("unknown file kind 0x{:02x}", other as u8))),
        }
    }
}

/// One child record of a Directory or Snapshot blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub id: ObjectId,
    pub kind: EntryKind,
    pub flags: u8,
    pub name: String,
    pub mtime: i64,
    pub btime: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Logical size; for directories the size of the whole subtree.
    pub size: i64,
}

impl RawEntry {
    pub fn is_readable(&self) -> bool {
        self.flags & FLAG_READABLE != 0
    }

    fn encoded_len(&self) -> usize {
        ENTRY_FIXED_SIZE + self.name.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRef {
    pub id: ObjectId,
    pub offset: i64,
    pub len: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotHeader {
    pub name: String,
    pub time: i64,
    pub len: i64,
    pub stored: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryObject {
    pub entries: Vec<RawEntry>,
    pub total_len: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileObject {
    pub chunks: Vec<ChunkRef>,
    pub total_len: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotObject {
    pub header: SnapshotHeader,
    pub root: DirectoryObject,
}

fn put_entries(buf: &mut Vec<u8>, entries: &[RawEntry]) -> Result<i64> {
    let mut total_len = 0i64;

    for entry in entries {
        let name_len = u16::try_from(entry.name.len())
            .map_err(|_| Error::Other(format!("File name '{}' is too long", entry.name)))?;

        buf.reserve(entry.encoded_len());
        buf.put_slice(entry.id.as_bytes());
        buf.put_i8(entry.kind as i8);
        buf.put_u8(entry.flags);
        buf.put_u16_le(name_len);
        buf.put_slice(entry.name.as_bytes());
        buf.put_i64_le(entry.mtime);
        buf.put_i64_le(entry.btime);
        buf.put_u32_le(entry.mode);
        buf.put_u32_le(entry.uid);
        buf.put_u32_le(entry.gid);
        buf.put_i64_le(entry.size);

        total_len += entry.size;
    }

    Ok(total_len)
}

/// The trailer is the sum of the entry sizes, i.e. the logical subtree size.
pub fn encode_directory(entries: &[RawEntry]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(entries.iter().map(RawEntry::encoded_len).sum::<usize>() + TRAILER_SIZE);
    let total_len = put_entries(&mut buf, entries)?;
    buf.put_i64_le(total_len);
    Ok(buf)
}

pub fn encode_file(chunks: &[ChunkRef], total_len: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(chunks.len() * CHUNK_REF_SIZE + TRAILER_SIZE);

    for chunk in chunks {
        buf.put_slice(chunk.id.as_bytes());
        buf.put_i64_le(chunk.offset);
        buf.put_i64_le(chunk.len);
    }
    buf.put_i64_le(total_len);

    buf
}

pub fn encode_snapshot(header: &SnapshotHeader, entries: &[RawEntry]) -> Result<Vec<u8>> {
    if header.name.len() > MAX_SNAPSHOT_NAME {
        return Err(Error::Other(format!(
            "Snapshot name is too long (limit is {} bytes)",
            MAX_SNAPSHOT_NAME
        )));
    }
    if header.name.as_bytes().contains(&0) {
        return Err(Error::Other("Snapshot name must not contain NUL bytes".to_string()));
    }

    let mut buf = Vec::with_capacity(SNAPSHOT_HEADER_SIZE + TRAILER_SIZE);
    buf.put_slice(header.name.as_bytes());
    buf.put_bytes(0, SNAPSHOT_NAME_SIZE - header.name.len());
    buf.put_i64_le(header.time);
    buf.put_i64_le(header.len);
    buf.put_i64_le(header.stored);

    let total_len = put_entries(&mut buf, entries)?;
    buf.put_i64_le(total_len);

    Ok(buf)
}

/// Anything with a `..` component, an absolute path, an empty name or (unless
/// allowed) a path separator is refused.
pub fn check_entry_name(name: &str, allow_separators: bool) -> Result<()> {
    let is_separator = |c: char| c == '/' || c == '\\';

    let unsafe_name = name.is_empty()
        || name.split(is_separator).any(|part| part == "..")
        || name.starts_with(is_separator)
        || has_drive_prefix(name)
        || (!allow_separators && name.contains(is_separator));

    if unsafe_name {
        error!("Unsafe file name '{}'", name);
        return Err(Error::UnsafePath(name.to_string()));
    }

    Ok(())
}

fn has_drive_prefix(name: &str) -> bool {
    let bytes = name.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

fn malformed(what: &str) -> Error {
    error!("Malformed {}", what);
    Error::malformed(what)
}

fn split_trailer<'a>(data: &'a [u8], what: &str) -> Result<(&'a [u8], i64)> {
    if data.len() < TRAILER_SIZE {
        return Err(malformed(what));
    }

    let (body, mut trailer) = data.split_at(data.len() - TRAILER_SIZE);
    Ok((body, trailer.get_i64_le()))
}

fn decode_entry(buf: &mut &[u8], allow_separators: bool) -> Result<RawEntry> {
    if buf.len() < ENTRY_FIXED_SIZE {
        return Err(malformed("entry in directory object"));
    }

    let id = ObjectId::from_slice(&buf[..ID_SIZE])?;
    buf.advance(ID_SIZE);
    let kind = buf.get_i8();
    let flags = buf.get_u8();
    let name_len = buf.get_u16_le() as usize;

    if buf.len() < name_len + ENTRY_FIXED_SIZE - ID_SIZE - 4 {
        return Err(malformed("entry in directory object"));
    }
    let name = std::str::from_utf8(&buf[..name_len])
        .map_err(|_| malformed("entry name (invalid UTF-8)"))?
        .to_string();
    buf.advance(name_len);

    let kind = EntryKind::try_from(kind).inspect_err(|e| error!("{}", e))?;
    check_entry_name(&name, allow_separators)?;

    Ok(RawEntry {
        id,
        kind,
        flags,
        name,
        mtime: buf.get_i64_le(),
        btime: buf.get_i64_le(),
        mode: buf.get_u32_le(),
        uid: buf.get_u32_le(),
        gid: buf.get_u32_le(),
        size: buf.get_i64_le(),
    })
}

/// Decodes a Directory payload. Fails on the first bad entry.
pub fn decode_entries(data: &[u8], allow_separators: bool) -> Result<DirectoryObject> {
    let (mut body, total_len) = split_trailer(data, "directory object")?;

    let mut entries = Vec::new();
    while !body.is_empty() {
        entries.push(decode_entry(&mut body, allow_separators)?);
    }

    Ok(DirectoryObject { entries, total_len })
}

pub fn decode_file(data: &[u8]) -> Result<FileObject> {
    if data.len() % CHUNK_REF_SIZE != TRAILER_SIZE {
        return Err(malformed("file object"));
    }

    let (body, total_len) = split_trailer(data, "file object")?;
    if total_len < 0 {
        return Err(malformed("file object (negative length)"));
    }

    let chunks = body
        .chunks_exact(CHUNK_REF_SIZE)
        .map(|mut record| {
            let id = ObjectId::from_slice(&record[..ID_SIZE])?;
            record.advance(ID_SIZE);
            let offset = record.get_i64_le();
            let len = record.get_i64_le();

            if offset < 0 || len < 0 || offset.checked_add(len).is_none() {
                return Err(malformed("chunk reference in file object"));
            }
            Ok(ChunkRef { id, offset, len })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(FileObject { chunks, total_len })
}

pub fn decode_snapshot_header(data: &[u8]) -> Result<SnapshotHeader> {
    if data.len() < SNAPSHOT_HEADER_SIZE + TRAILER_SIZE {
        return Err(malformed("snapshot object"));
    }

    let (name, mut rest) = data.split_at(SNAPSHOT_NAME_SIZE);
    let end = name.iter().position(|&b| b == 0).unwrap_or(MAX_SNAPSHOT_NAME).min(MAX_SNAPSHOT_NAME);
    let name = String::from_utf8_lossy(&name[..end]).into_owned();

    Ok(SnapshotHeader {
        name,
        time: rest.get_i64_le(),
        len: rest.get_i64_le(),
        stored: rest.get_i64_le(),
    })
}

pub fn decode_snapshot(data: &[u8]) -> Result<SnapshotObject> {
    let header = decode_snapshot_header(data)?;
    let root = decode_entries(&data[SNAPSHOT_HEADER_SIZE..], true)?;

    Ok(SnapshotObject { header, root })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, kind: EntryKind, size: i64) -> RawEntry {
        RawEntry {
            id: ObjectId::from_bytes([name.len() as u8; ID_SIZE]),
            kind,
            flags: FLAG_READABLE,
            name: name.to_string(),
            mtime: 1_700_000_000_123,
            btime: 1_600_000_000_000,
            mode: 0o644,
            uid: 1000,
            gid: 100,
            size,
        }
    }

    fn trailer(data: &[u8]) -> i64 {
        let mut tail = &data[data.len() - TRAILER_SIZE..];
        tail.get_i64_le()
    }

    #[test]
    fn test_directory_roundtrip() {
        let entries = vec![
            entry("docs", EntryKind::Directory, 4096),
            entry("notes.txt", EntryKind::File, 12),
            entry("latest", EntryKind::Link, 0),
        ];

        let data = encode_directory(&entries).unwrap();
        let expected: usize = entries.iter().map(|e| ENTRY_FIXED_SIZE + e.name.len()).sum();
        assert_eq!(data.len(), expected + TRAILER_SIZE);
        assert_eq!(trailer(&data), 4108);

        let decoded = decode_entries(&data, false).unwrap();
        assert_eq!(decoded.entries, entries);
        assert_eq!(decoded.total_len, 4108);
    }

    #[test]
    fn test_empty_directory() {
        let data = encode_directory(&[]).unwrap();
        assert_eq!(data.len(), TRAILER_SIZE);

        let decoded = decode_entries(&data, false).unwrap();
        assert!(decoded.entries.is_empty());
        assert_eq!(decoded.total_len, 0);
    }

    #[test]
    fn test_file_roundtrip() {
        let chunks = vec![
            ChunkRef { id: ObjectId::from_bytes([1; ID_SIZE]), offset: 0, len: 100 },
            ChunkRef { id: ObjectId::from_bytes([2; ID_SIZE]), offset: 100, len: 50 },
        ];

        let data = encode_file(&chunks, 150);
        assert_eq!(data.len() % CHUNK_REF_SIZE, TRAILER_SIZE);
        assert_eq!(trailer(&data), 150);

        let decoded = decode_file(&data).unwrap();
        assert_eq!(decoded.chunks, chunks);
        assert_eq!(decoded.total_len, 150);
    }

    #[test]
    fn test_file_rejects_bad_length() {
        let data = encode_file(&[ChunkRef { id: ObjectId::from_bytes([1; ID_SIZE]), offset: 0, len: 1 }], 1);

        assert!(matches!(decode_file(&data[..data.len() - 1]), Err(Error::MalformedObject(_))));
        assert!(matches!(decode_file(&[]), Err(Error::MalformedObject(_))));
        assert!(matches!(decode_file(&encode_file(&[], -1)), Err(Error::MalformedObject(_))));
    }

    #[test]
    fn test_file_rejects_overflowing_reference() {
        let chunks = [ChunkRef { id: ObjectId::from_bytes([1; ID_SIZE]), offset: i64::MAX, len: 1 }];
        let data = encode_file(&chunks, 1);

        assert!(matches!(decode_file(&data), Err(Error::MalformedObject(_))));
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let header = SnapshotHeader {
            name: "nightly".to_string(),
            time: 1_700_000_000_000,
            len: 30,
            stored: 4242,
        };
        let entries = vec![entry("home/user", EntryKind::Directory, 10), entry("etc/hosts", EntryKind::File, 20)];

        let data = encode_snapshot(&header, &entries).unwrap();
        assert_eq!(trailer(&data), 30);

        let decoded = decode_snapshot(&data).unwrap();
        assert_eq!(decoded.header, header);
        assert_eq!(decoded.root.entries, entries);
        assert_eq!(decode_snapshot_header(&data).unwrap(), header);
    }

    #[test]
    fn test_snapshot_name_limits() {
        let mut header = SnapshotHeader { name: "x".repeat(MAX_SNAPSHOT_NAME), time: 0, len: 0, stored: 0 };
        let data = encode_snapshot(&header, &[]).unwrap();
        assert_eq!(decode_snapshot_header(&data).unwrap().name.len(), MAX_SNAPSHOT_NAME);

        header.name.push('x');
        assert!(encode_snapshot(&header, &[]).is_err());

        assert!(decode_snapshot_header(&data[..SNAPSHOT_HEADER_SIZE]).is_err());
    }

    #[test]
    fn test_rejects_unsafe_names() {
        for name in ["..", "a/../b", "", "/etc/passwd", "C:\\Windows", "..\\up"] {
            let data = encode_directory(&[entry(name, EntryKind::File, 1)]).unwrap();
            let err = decode_entries(&data, true).unwrap_err();
            assert!(matches!(err, Error::UnsafePath(_)), "'{}' was accepted", name);
        }

        let data = encode_directory(&[entry("a/b", EntryKind::File, 1)]).unwrap();
        assert!(matches!(decode_entries(&data, false), Err(Error::UnsafePath(_))));
        assert_eq!(decode_entries(&data, true).unwrap().entries[0].name, "a/b");
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let mut data = encode_directory(&[entry("file", EntryKind::File, 1)]).unwrap();
        data[ID_SIZE] = 7;

        assert!(matches!(decode_entries(&data, false), Err(Error::MalformedObject(_))));
    }

    #[test]
    fn test_rejects_truncated_entry() {
        let data = encode_directory(&[entry("file", EntryKind::File, 1)]).unwrap();
        let mut truncated = data[..data.len() - TRAILER_SIZE - 3].to_vec();
        truncated.extend_from_slice(&[0u8; TRAILER_SIZE]);

        assert!(matches!(decode_entries(&truncated, false), Err(Error::MalformedObject(_))));
        assert!(decode_entries(&[0u8; 4], false).is_err());
    }

    #[test]
    fn test_readable_flag() {
        let mut e = entry("f", EntryKind::File, 0);
        assert!(e.is_readable());
        e.flags = 0;
        assert!(!e.is_readable());
    }
}
