//! The stratus virtualization/synchronization engine.
//!
//! One [`VirtualizationInstance`] per mounted root binds together a remote
//! backend ([`stratus_remote::RemoteFs`]), a placeholder provider
//! ([`stratus_cloudfilter::SyncFilter`]), and the engine state:
//!
//! - [`PathMapper`] — local placeholder path ↔ remote logical path
//! - [`HashSidecars`] — last-observed remote content fingerprints, stored
//!   as hidden `.md5_*` objects beside the content
//! - fetch handler — answers on-demand content requests in 1 MiB chunks
//! - reconciliation — `perform_synchronization` runs the remote→local walk,
//!   then the local→remote walk, then streams the queued uploads
//! - deletion watcher — propagates local removals to the remote while the
//!   instance runs
//!
//! A single per-instance async mutex serializes every fetch and the whole
//! of a synchronization run; placeholder bit-state and the remote state
//! cache must never see interleaved mutation for one root.

use std::time::{SystemTime, UNIX_EPOCH};

pub mod cache;
pub mod instance;
pub mod path;

mod fetch;
mod filestate;
mod local_to_remote;
mod remote_to_local;
mod upload;
mod watch;

pub use cache::{HashSidecars, RemoteStateCache, SIDECAR_PREFIX};
pub use instance::{start_projecting, VirtualizationInstance};
pub use path::PathMapper;

/// Modification times are compared at second granularity, matching what
/// network filesystems reliably preserve.
pub(crate) fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
