use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Where a file currently is in its sync/hydration life cycle.
///
/// Every attempt (one hydration, one synchronization of one path) ends in
/// exactly one of `Done`, `Deleted`, or `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileSyncStatus {
    /// Known to the engine, nothing happening yet
    Pending,
    /// Local content is being streamed to the remote backend
    Uploading,
    /// Remote content is being streamed into the local placeholder
    Downloading,
    /// The last operation on this path completed
    Done,
    /// The local copy was removed because the remote copy disappeared
    Deleted,
    /// The placeholder was invalidated; content re-fetches on next open
    Dirty,
    /// The last operation on this path failed
    Error,
}

/// One state transition, emitted to the observer installed via
/// [`Virtualization::set_state_callbacks`].
///
/// Transitions are totally ordered per path and unordered across paths.
#[derive(Debug, Clone)]
pub struct FileSyncState {
    pub path: PathBuf,
    pub status: FileSyncStatus,
    /// Percent complete for `Uploading`/`Downloading`, when known
    pub progress: Option<u8>,
    /// Underlying cause for `Error`
    pub error: Option<String>,
}

/// Observer for file state transitions. Implementations must be cheap and
/// non-blocking; they are called while the instance lock is held.
pub trait StateCallbacks: Send + Sync {
    fn file_state(&self, state: FileSyncState);
}

/// Lifecycle contract of one mounted virtualization root.
#[async_trait::async_trait]
pub trait Virtualization: Send + Sync {
    /// Run one full reconciliation: remote→local, then local→remote.
    ///
    /// Returns the first hard error encountered; the pass it occurred in may
    /// have only partially completed.
    async fn perform_synchronization(&self) -> anyhow::Result<()>;

    /// Install (or replace) the notification sink. Notifications emitted
    /// before installation are not replayed.
    fn set_state_callbacks(&self, callbacks: Arc<dyn StateCallbacks>);

    /// Stop the watcher and disconnect from the OS. Fails with "not started"
    /// if the instance was never started or was already closed.
    async fn close(&self) -> anyhow::Result<()>;
}
