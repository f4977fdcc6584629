//! Placeholder provider contract.
//!
//! The sync engine mutates local placeholder state and answers on-demand
//! content requests exclusively through [`SyncFilter`]; the OS-specific
//! plumbing stays behind that trait. Two providers live here:
//!
//! - [`DirectoryFilter`] — portable emulation on a plain directory, used on
//!   non-Windows hosts and by the engine's integration tests
//! - `CloudFilter` — the Windows Cloud Filter API provider, compiled only on
//!   `target_os = "windows"`
//!
//! The provider invokes exactly one callback, [`FetchHandler::fetch`],
//! registered once at connect time.

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use bitflags::bitflags;

pub mod portable;

#[cfg(target_os = "windows")]
pub mod win;

pub use portable::DirectoryFilter;

#[cfg(target_os = "windows")]
pub use win::CloudFilter;

bitflags! {
    /// Placeholder bit-state of one local entry, as tracked by the OS (or
    /// the portable emulation). Read-only from the engine's point of view;
    /// transitions happen through the [`SyncFilter`] mutation calls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PlaceholderState: u32 {
        /// The entry is a placeholder known to the provider
        const PLACEHOLDER       = 0x0000_0001;
        /// The entry is the registered sync root itself
        const SYNC_ROOT         = 0x0000_0002;
        /// Metadata is believed consistent with the remote source
        const IN_SYNC           = 0x0000_0008;
        /// Some but not all content ranges are materialized
        const PARTIALLY_ON_DISK = 0x0000_0010;
        /// Full content is materialized on disk
        const HYDRATED          = 0x0000_0020;
        /// State could not be determined
        const INVALID           = 0x8000_0000;
    }
}

impl PlaceholderState {
    pub fn is_placeholder(&self) -> bool {
        self.contains(PlaceholderState::PLACEHOLDER)
    }

    pub fn is_in_sync(&self) -> bool {
        self.contains(PlaceholderState::IN_SYNC)
    }

    pub fn is_hydrated(&self) -> bool {
        self.contains(PlaceholderState::HYDRATED)
    }
}

/// Metadata for creating or refreshing one placeholder.
#[derive(Debug, Clone)]
pub struct PlaceholderMeta {
    /// Base name within the parent directory
    pub name: String,
    /// Content size advertised to the OS (0 for directories)
    pub size: u64,
    /// Creation/access/write/change timestamps all carry this value
    pub mtime: SystemTime,
    pub is_dir: bool,
    /// Opaque identity the OS hands back in callbacks to correlate the
    /// placeholder with engine bookkeeping
    pub identity: Vec<u8>,
}

impl PlaceholderMeta {
    pub fn file(name: &str, size: u64, mtime: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            size,
            mtime,
            is_dir: false,
            identity: name.as_bytes().to_vec(),
        }
    }

    pub fn directory(name: &str, mtime: SystemTime) -> Self {
        Self {
            name: name.to_string(),
            size: 0,
            mtime,
            is_dir: true,
            identity: name.as_bytes().to_vec(),
        }
    }
}

/// Byte ranges of one on-demand fetch request.
///
/// The required range must be satisfied; the optional range is a prefetch
/// hint and replaces the required one when it is larger. Zero lengths mean
/// "to the end of the file".
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchRange {
    pub required_offset: u64,
    pub required_length: u64,
    pub optional_offset: u64,
    pub optional_length: u64,
}

impl FetchRange {
    /// The whole file from offset zero.
    pub fn whole() -> Self {
        Self::default()
    }

    pub fn required(offset: u64, length: u64) -> Self {
        Self {
            required_offset: offset,
            required_length: length,
            ..Self::default()
        }
    }
}

/// Receives fetched content; the provider copies the bytes into OS-owned
/// placeholder storage at the given offset.
pub trait TransferSink: Send {
    fn transfer(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Called once after the final `transfer`; providers use it to commit
    /// hydration state.
    fn complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// The one callback a provider dispatches: fetch content for a local
/// placeholder. Registered at connect time; fixed thereafter.
pub trait FetchHandler: Send + Sync {
    fn fetch(
        &self,
        local_path: &Path,
        range: FetchRange,
        sink: &mut dyn TransferSink,
    ) -> anyhow::Result<()>;
}

/// Provider contract binding a local directory tree to placeholder
/// semantics.
pub trait SyncFilter: Send + Sync {
    /// Register the sync root. Idempotent per identity.
    fn register(&self, root: &Path, identity: &SyncRootIdentity) -> anyhow::Result<()>;

    /// Connect the callback table and start serving fetch requests.
    fn connect(&self, root: &Path, handler: Arc<dyn FetchHandler>) -> anyhow::Result<()>;

    /// Stop serving callbacks. In-flight work is not interrupted.
    fn disconnect(&self) -> anyhow::Result<()>;

    /// Placeholder bit-state of one local entry. `ErrorKind::NotFound`
    /// distinguishes an absent entry from a query failure.
    fn placeholder_state(&self, local: &Path) -> io::Result<PlaceholderState>;

    /// Create a dehydrated placeholder inside `parent`.
    fn create_placeholder(&self, parent: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()>;

    /// Mark an entry in-sync, converting it to a placeholder first when it
    /// is a plain local file.
    fn set_in_sync(&self, local: &Path) -> anyhow::Result<()>;

    /// Refresh placeholder metadata to `meta`, clear the in-sync bit, and
    /// dehydrate so content re-fetches on next open.
    fn mark_dirty(&self, local: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()>;

    /// Open a content transfer into an existing placeholder, for explicit
    /// hydration outside an OS callback.
    fn begin_transfer(&self, local: &Path) -> anyhow::Result<Box<dyn TransferSink>>;
}

/// Stable identity of a sync root, persisted as 16 raw bytes in a hidden
/// `.virtualization` file at the root so re-registration reuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRootIdentity {
    id: uuid::Uuid,
}

pub const IDENTITY_FILE: &str = ".virtualization";

impl SyncRootIdentity {
    /// Load the identity stored at `root`, creating the root directory and
    /// a fresh identity if either does not exist yet.
    pub fn ensure_at(root: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(root)?;
        let marker = root.join(IDENTITY_FILE);

        if marker.exists() {
            let bytes = std::fs::read(&marker)?;
            let raw: [u8; 16] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("invalid virtualization info file: {}", marker.display()))?;
            return Ok(Self {
                id: uuid::Uuid::from_bytes(raw),
            });
        }

        let id = uuid::Uuid::new_v4();
        std::fs::write(&marker, id.as_bytes())?;
        Ok(Self { id })
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }
}

impl std::fmt::Display for SyncRootIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id.hyphenated())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_stable_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let first = SyncRootIdentity::ensure_at(dir.path()).unwrap();
        let second = SyncRootIdentity::ensure_at(dir.path()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn identity_rejects_truncated_marker() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), b"short").unwrap();
        assert!(SyncRootIdentity::ensure_at(dir.path()).is_err());
    }

    #[test]
    fn state_predicates() {
        let s = PlaceholderState::PLACEHOLDER | PlaceholderState::IN_SYNC;
        assert!(s.is_placeholder());
        assert!(s.is_in_sync());
        assert!(!s.is_hydrated());
    }
}
