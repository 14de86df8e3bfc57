//! An encrypting virtual filesystem core.
//!
//! `veilfs` exposes a familiar hierarchical filesystem API - open, read,
//! write, move, delete, list, attributes - while persisting only encrypted
//! file contents, encrypted filenames, and an obfuscated directory structure
//! on a backing host filesystem.
//!
//! # Vault layout
//!
//! A vault is a host directory with a `d/` subtree. Directories are
//! addressed by opaque IDs rather than nesting: the contents of a directory
//! with ID *i* live at `d/XX/YYY…` where `XXYYY…` is a keyed hash of *i*.
//! File bodies are chunked and encrypted with AES-GCM under a per-file
//! content key wrapped in a 68-byte header; filenames are encrypted
//! deterministically with AES-SIV bound to the parent directory's ID.
//!
//! # Example
//!
//! ```no_run
//! use veilfs::{CryptoFileSystem, CryptoFsOptions, MasterKey, StaticMasterkeyLoader};
//!
//! let loader = StaticMasterkeyLoader::new(MasterKey::random());
//! let fs = CryptoFileSystem::open("/path/to/vault", &loader, CryptoFsOptions::default())?;
//!
//! fs.create_directory("/docs")?;
//! fs.write_file("/docs/hello.txt", b"hello world")?;
//! assert_eq!(fs.read_file("/docs/hello.txt")?, b"hello world");
//! # Ok::<(), veilfs::FsError>(())
//! ```

pub mod crypto;
pub mod error;
pub mod fs;
pub mod vault;

pub use crypto::{Cryptor, MasterKey, MasterkeyLoader, StaticMasterkeyLoader};
pub use vault::{
    CleartextFileChannel, CryptoFileSystem, CryptoFsOptions, DirEntry, DirId, FileAttributes,
    FsError, NodeKind, OpenOptions, VaultPath,
};
