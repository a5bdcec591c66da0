pub mod backend;
pub mod cache;
pub mod codec;
pub mod crypto;
pub mod disk;
pub mod error;
pub mod extract;
pub mod format;
pub mod pool;
pub mod snapshot;
pub mod tree;
pub mod types;

pub use backend::{Backend, BackendType, LocalBackend};
pub use cache::{FileStat, LocalCache};
pub use disk::{Disk, Presence, UserInfo};
pub use error::{Error, Result};
pub use extract::{get, GetContext, GetSettings};
pub use snapshot::{list, SnapshotInfo};
pub use tree::{tree, FileInfo, FileKind, TreeSettings};
pub use types::*;
