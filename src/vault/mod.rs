//! Vault-level machinery: path translation, open files, and the facade.

pub mod chunks;
pub mod dir_id;
pub mod filesystem;
pub mod mapper;
pub mod open_file;
pub mod path;
pub mod registry;
pub mod stats;

pub use chunks::DEFAULT_CHUNK_CACHE_CAPACITY;
pub use dir_id::DEFAULT_DIR_ID_CACHE_CAPACITY;
pub use filesystem::{
    CryptoFileSystem, CryptoFsOptions, DirEntry, FileAttributes, FsError, OpenOptions,
};
pub use mapper::NodeKind;
pub use open_file::CleartextFileChannel;
pub use path::{DirId, VaultPath};
pub use stats::{Counter, CryptoFsStats};
