//! Local deletion propagation.
//!
//! While the instance runs, a filesystem watcher forwards remove events to
//! an async task that deletes the corresponding remote object. Deletions
//! that happen while the instance is stopped are not observed by anything;
//! the remote→local pass will re-materialize such files on the next run
//! (documented, asymmetric behavior).

use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::instance::VirtualizationInstance;

impl VirtualizationInstance {
    pub(crate) fn start_watcher(&self) -> anyhow::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<PathBuf>();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Remove(_)) {
                        for path in event.paths {
                            // a dropped receiver just means the instance closed
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => warn!("watch error: {e}"),
            })?;
        watcher.watch(self.shared.mapper.root(), RecursiveMode::Recursive)?;
        *self.shared.watcher.lock().unwrap() = Some(watcher);

        let instance = self.clone();
        tokio::spawn(async move {
            debug!("watching for local deletions");
            while let Some(path) = rx.recv().await {
                instance.handle_deletion(&path).await;
            }
        });
        Ok(())
    }

    pub(crate) async fn handle_deletion(&self, local_path: &Path) {
        let Some(name) = local_path.file_name() else {
            return;
        };
        let name = name.to_string_lossy();
        // dot entries are engine bookkeeping, never remote content
        if name.starts_with('.') {
            return;
        }

        let shared = &self.shared;
        let _guard = shared.lock.lock().await;

        // The deleted path no longer exists, so long-path normalization can
        // only run on the surviving parent; append the basename afterwards.
        let Some(parent) = local_path.parent() else {
            return;
        };
        let parent_remote = shared.mapper.local_to_remote(parent);
        let remote_path = if parent_remote.is_empty() {
            name.into_owned()
        } else {
            format!("{parent_remote}/{name}")
        };

        info!(path = %remote_path, "propagating local deletion");
        if let Err(e) = shared.remote.remove_all(&remote_path).await {
            warn!(path = %remote_path, "failed to remove remote object: {e}");
        }
    }
}
