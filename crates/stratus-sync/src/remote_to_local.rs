//! Remote → local reconciliation pass.

use std::io;

use anyhow::Context;
use tracing::debug;

use crate::fetch::placeholder_meta;
use crate::instance::VirtualizationInstance;
use crate::path::PathMapper;
use crate::unix_secs;

impl VirtualizationInstance {
    /// Walk the remote tree and materialize it locally: missing directories
    /// are created, missing files become dehydrated placeholders, and local
    /// entries older than their remote counterpart are invalidated so their
    /// content re-fetches on next open.
    ///
    /// Hidden (dot-prefixed) remote entries and their subtrees are the
    /// engine's own bookkeeping and never materialize locally. The first
    /// hard error aborts the pass.
    pub(crate) async fn sync_remote_to_local(&self) -> anyhow::Result<()> {
        let shared = &self.shared;
        let entries = stratus_remote::walk(shared.remote.as_ref(), "", true)
            .await
            .context("walking remote tree")?;

        for entry in entries {
            debug!(path = %entry.path, "syncing remote entry");
            let local_path = shared.mapper.remote_to_local(&entry.path);

            let state = match shared.filter.placeholder_state(&local_path) {
                Ok(state) => state,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    if entry.metadata.is_dir {
                        debug!(path = %local_path.display(), "creating local dir");
                        std::fs::create_dir_all(&local_path).with_context(|| {
                            format!("creating local dir: {}", local_path.display())
                        })?;
                    } else {
                        let parent = local_path
                            .parent()
                            .context("placeholder path has no parent")?;
                        let name = PathMapper::remote_file_name(&entry.path);
                        shared
                            .filter
                            .create_placeholder(parent, &placeholder_meta(name, &entry.metadata))
                            .with_context(|| {
                                format!("creating placeholder: {}", local_path.display())
                            })?;
                    }
                    continue;
                }
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "querying placeholder state: {}",
                        local_path.display()
                    )))
                }
            };
            debug!(path = %local_path.display(), ?state, "placeholder state");

            if entry.metadata.is_dir {
                continue;
            }

            let local_meta = std::fs::metadata(&local_path)
                .with_context(|| format!("stat local file: {}", local_path.display()))?;
            let local_mtime = local_meta.modified().map(unix_secs).unwrap_or(0);
            if local_mtime < unix_secs(entry.metadata.mtime) {
                debug!(path = %entry.path, "remote is newer, invalidating local copy");
                let name = PathMapper::remote_file_name(&entry.path);
                shared
                    .filter
                    .mark_dirty(&local_path, &placeholder_meta(name, &entry.metadata))
                    .with_context(|| {
                        format!("invalidating placeholder: {}", local_path.display())
                    })?;
                self.file_synchronizing(&local_path);
            }
        }
        Ok(())
    }
}
