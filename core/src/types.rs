use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const ID_SIZE: usize = 32;

/// Content address of a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(blake3::Hash);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(blake3::Hash::from(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; ID_SIZE] = bytes
            .try_into()
            .map_err(|_| Error::malformed(format!("object id must be {} bytes", ID_SIZE)))?;
        Ok(Self::from_bytes(array))
    }

    /// Keyed BLAKE3 over `data`. The key is the repository salt with its last
    /// byte mixed with the blob type, so equal payloads of different types
    /// never share an id.
    pub fn hash_blob(salt: &[u8; ID_SIZE], blob_type: BlobType, data: &[u8]) -> Self {
        let mut key = *salt;
        key[31] ^= blob_type as u8;
        Self(blake3::keyed_hash(&key, data))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        self.0.as_bytes()
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }

    pub fn short_string(&self) -> String {
        self.to_hex().chars().take(8).collect()
    }

    /// Storage path, sharded on the first 12 bits of the id.
    pub fn blob_path(&self) -> String {
        let hex = self.to_hex();
        format!("blobs/{}/{}", &hex[..3], hex)
    }
}

impl FromStr for ObjectId {
    type Err = hex::FromHexError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_SIZE {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut array = [0u8; ID_SIZE];
        array.copy_from_slice(&bytes);
        Ok(Self::from_bytes(array))
    }
}

impl Serialize for ObjectId {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ObjectId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlobType {
    Chunk = 0,
    File = 1,
    Directory = 2,
    Snapshot = 3,
    Link = 4,
}

impl BlobType {
    pub fn name(&self) -> &'static str {
        match self {
            BlobType::Chunk => "Chunk",
            BlobType::File => "File",
            BlobType::Directory => "Directory",
            BlobType::Snapshot => "Snapshot",
            BlobType::Link => "Link",
        }
    }
}

impl TryFrom<i8> for BlobType {
    type Error = Error;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            0 => Ok(BlobType::Chunk),
            1 => Ok(BlobType::File),
            2 => Ok(BlobType::Directory),
            3 => Ok(BlobType::Snapshot),
            4 => Ok(BlobType::Link),
            other => Err(Error::malformed(format!("invalid blob type 0x{:02x}", other as u8))),
        }
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Capability of an opened disk. Ordered: `Secure < WriteOnly < ReadWrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DiskMode {
    Secure,
    WriteOnly,
    ReadWrite,
}

/// Argon2id cost parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    pub iterations: u32,
    /// Memory cost in KiB.
    pub memory: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // Interactive cost: fast enough for a prompt, still memory-hard
        Self {
            iterations: 2,
            memory: 65536,
            parallelism: 1,
        }
    }
}

impl KdfParams {
    pub fn insecure_for_tests() -> Self {
        Self {
            iterations: 1,
            memory: 64,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub enabled: bool,
    /// Override for the cache directory, defaults to the user cache dir.
    pub dir: Option<PathBuf>,
    /// Chance (in percent) that a cached answer is cross-checked remotely.
    pub check_percent: u32,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
            check_percent: 2,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Worker pool size, transport default when unset.
    pub threads: Option<usize>,
    pub kdf: KdfParams,
    pub cache: CacheSettings,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_path_uses_three_hex_prefix() {
        let id = ObjectId::from_bytes([0xab; ID_SIZE]);
        let path = id.blob_path();

        assert!(path.starts_with("blobs/aba/"));
        assert!(path.ends_with(&id.to_hex()));
    }

    #[test]
    fn test_hash_blob_depends_on_type() {
        let salt = [7u8; ID_SIZE];
        let a = ObjectId::hash_blob(&salt, BlobType::File, b"payload");
        let b = ObjectId::hash_blob(&salt, BlobType::Directory, b"payload");
        let c = ObjectId::hash_blob(&salt, BlobType::File, b"payload");

        assert_ne!(a, b);
        assert_eq!(a, c);
    }

    #[test]
    fn test_id_hex_roundtrip() {
        let id = ObjectId::from_bytes([3u8; ID_SIZE]);
        let parsed: ObjectId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("abcd".parse::<ObjectId>().is_err());
    }

    #[test]
    fn test_mode_ordering() {
        assert!(DiskMode::Secure < DiskMode::WriteOnly);
        assert!(DiskMode::WriteOnly < DiskMode::ReadWrite);
    }
}
