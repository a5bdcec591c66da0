use crate::types::DiskMode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    /// Wrong password or damaged key material. Carries no detail.
    #[error("Failed to open repository (wrong password or corrupt repository)")]
    Authentication,

    #[error("Malformed object: {0}")]
    MalformedObject(String),

    #[error("Unsafe file name '{0}'")]
    UnsafePath(String),

    /// The local cache claimed an object exists but the remote disagrees.
    /// Any backup produced while this was undetected may be incomplete.
    #[error("Local cache is out of sync with the repository, you must start over")]
    CacheInconsistency,

    #[error("Cannot find a free name under '{0}'")]
    NamespaceExhausted(String),

    #[error("'{path}' already exists")]
    AlreadyExists { path: String },

    #[error("'{path}' does not exist")]
    NotFound { path: String },

    #[error("Operation requires {required:?} mode but disk is in {actual:?} mode")]
    InsufficientMode { required: DiskMode, actual: DiskMode },

    #[error("Cache database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Fatal errors must not be retried; the whole operation has to restart.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::CacheInconsistency)
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedObject(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
