//! Abstract remote filesystem contract.
//!
//! The sync engine is written entirely against [`RemoteFs`]; backends plug in
//! behind it. Three implementations live here:
//!
//! - [`MemoryRemote`] — in-memory store with operation counters, used by
//!   tests and local experiments
//! - [`OpendalRemote`] — production adapter over an `opendal::Operator`
//!   (S3-compatible object stores and everything else OpenDAL speaks)
//! - [`ReconnectingRemote`] — lazily-connecting wrapper that re-dials a
//!   backend after it reports a disconnect
//!
//! Errors distinguish "not found" from other failures; the engine relies on
//! that distinction for deletion detection.

use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

pub mod memory;
pub mod operator;
pub mod reconnect;
pub mod walk;

pub use memory::MemoryRemote;
pub use operator::{build_operator, OpendalRemote};
pub use reconnect::ReconnectingRemote;
pub use walk::{walk, WalkedEntry};

pub type RemoteResult<T> = Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RemoteError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RemoteError::NotFound(_))
    }
}

/// Metadata of one remote object or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMetadata {
    pub size: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone)]
pub struct RemoteEntry {
    /// Base name within the listed directory
    pub name: String,
    pub metadata: RemoteMetadata,
}

/// Sequential/positional read handle on one remote object.
#[async_trait]
pub trait RemoteReader: Send {
    /// Read up to `buf.len()` bytes at `offset`. Returns 0 at end of file.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> RemoteResult<usize>;
}

/// Streaming write handle creating/replacing one remote object.
///
/// Content becomes visible atomically at `close`; a dropped writer leaves
/// the previous object intact where the backend supports it.
#[async_trait]
pub trait RemoteWriter: Send {
    async fn write_all(&mut self, data: &[u8]) -> RemoteResult<()>;
    async fn close(&mut self) -> RemoteResult<()>;
}

/// Capability surface of a remote storage backend.
///
/// Paths are `/`-separated logical paths relative to the backend root, with
/// no leading separator; `""` names the root itself.
#[async_trait]
pub trait RemoteFs: Send + Sync {
    async fn stat(&self, path: &str) -> RemoteResult<RemoteMetadata>;

    async fn open_read(&self, path: &str) -> RemoteResult<Box<dyn RemoteReader>>;

    async fn open_write(&self, path: &str) -> RemoteResult<Box<dyn RemoteWriter>>;

    /// Whole-object read; used for small control objects such as sidecars.
    async fn read(&self, path: &str) -> RemoteResult<Vec<u8>>;

    /// Whole-object write; used for small control objects such as sidecars.
    async fn write(&self, path: &str, data: &[u8]) -> RemoteResult<()>;

    /// Idempotent recursive directory creation.
    async fn create_dir_all(&self, path: &str) -> RemoteResult<()>;

    async fn remove(&self, path: &str) -> RemoteResult<()>;

    /// Remove a file or a directory tree; absent paths are not an error.
    async fn remove_all(&self, path: &str) -> RemoteResult<()>;

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>>;

    async fn exists(&self, path: &str) -> RemoteResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
