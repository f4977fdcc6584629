//! Local → remote reconciliation pass.

use std::io::{self, Read};
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::instance::VirtualizationInstance;
use crate::unix_secs;

struct LocalEntry {
    path: PathBuf,
    metadata: std::fs::Metadata,
}

/// Collect the local tree, parents before children, skipping hidden
/// (dot-prefixed) entries and their subtrees. The root itself is excluded —
/// it always exists on both sides.
fn walk_local(root: &Path) -> io::Result<Vec<LocalEntry>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut children: Vec<_> = std::fs::read_dir(&dir)?.collect::<io::Result<_>>()?;
        children.sort_by_key(|e| e.file_name());
        for child in children {
            if child.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            let metadata = child.metadata()?;
            if metadata.is_dir() {
                pending.push(child.path());
            }
            out.push(LocalEntry {
                path: child.path(),
                metadata,
            });
        }
    }
    Ok(out)
}

impl VirtualizationInstance {
    /// Walk the local tree and reconcile it against the remote: directories
    /// are mirrored, out-of-sync files are queued for upload (returned, not
    /// yet streamed) and marked in-sync, and files whose remote counterpart
    /// was deleted by another party are removed locally.
    ///
    /// The first hard error aborts the pass.
    pub(crate) async fn sync_local_to_remote(&self) -> anyhow::Result<Vec<String>> {
        let shared = &self.shared;
        let mut uploads = Vec::new();
        let entries = walk_local(shared.mapper.root()).context("walking local tree")?;

        for entry in entries {
            debug!(path = %entry.path.display(), "syncing local entry");
            let remote_path = shared.mapper.local_to_remote(&entry.path);
            if remote_path.is_empty() {
                continue;
            }

            if entry.metadata.is_dir() {
                match shared.remote.stat(&remote_path).await {
                    Ok(meta) if meta.is_dir => {}
                    Err(e) if !e.is_not_found() => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("stat remote dir: {remote_path}")))
                    }
                    _ => {
                        shared
                            .remote
                            .create_dir_all(&remote_path)
                            .await
                            .with_context(|| format!("creating remote dir: {remote_path}"))?;
                    }
                }
                continue;
            }

            let state = match shared.filter.placeholder_state(&entry.path) {
                Ok(state) => state,
                // vanished between the walk and now; nothing to reconcile
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(anyhow::Error::new(e).context(format!(
                        "querying placeholder state: {}",
                        entry.path.display()
                    )))
                }
            };
            debug!(path = %entry.path.display(), ?state, "local state");

            let deleted = self.is_deleted_remotely(&remote_path, &entry.path).await?;

            if !state.is_in_sync() && !deleted {
                // modified or brand-new locally; upload wins only when the
                // local copy is the newer one
                let local_is_newer = match shared.remote.stat(&remote_path).await {
                    Err(e) if e.is_not_found() => true,
                    Err(e) => {
                        return Err(anyhow::Error::new(e)
                            .context(format!("stat remote file: {remote_path}")))
                    }
                    Ok(remote_meta) => {
                        let local_mtime = entry.metadata.modified().map(unix_secs).unwrap_or(0);
                        local_mtime > unix_secs(remote_meta.mtime)
                    }
                };
                if local_is_newer {
                    uploads.push(remote_path);
                }
                shared
                    .filter
                    .set_in_sync(&entry.path)
                    .with_context(|| format!("marking in-sync: {}", entry.path.display()))?;
            } else if deleted {
                match std::fs::remove_file(&entry.path) {
                    Ok(()) => self.file_removed(&entry.path),
                    Err(e) => {
                        let e = anyhow::Error::new(e)
                            .context(format!("removing local file: {}", entry.path.display()));
                        self.file_error(&entry.path, &e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(uploads)
    }

    /// True only when the remote copy is gone, a hash was recorded for it,
    /// and the local content still matches that hash — i.e. the file was
    /// removed remotely and never touched locally since.
    pub(crate) async fn is_deleted_remotely(
        &self,
        remote_path: &str,
        local_path: &Path,
    ) -> anyhow::Result<bool> {
        match self.shared.remote.stat(remote_path).await {
            Ok(_) => Ok(false),
            Err(e) if e.is_not_found() => {
                let Some(known) = self.shared.cache.get_hash(remote_path).await? else {
                    // never synced; this is a new local file
                    return Ok(false);
                };
                if known.is_empty() {
                    return Ok(false);
                }
                match self.local_hash(local_path)? {
                    Some(local) => Ok(local.as_slice() == known.as_slice()),
                    // no local content to compare against
                    None => Ok(false),
                }
            }
            Err(e) => {
                Err(anyhow::Error::new(e)
                    .context(format!("stat for deletion detection: {remote_path}")))
            }
        }
    }

    /// MD5 of the local file content, or `None` when the content is not
    /// actually on disk (absent file or dehydrated placeholder).
    fn local_hash(&self, local_path: &Path) -> anyhow::Result<Option<[u8; 16]>> {
        let state = match self.shared.filter.placeholder_state(local_path) {
            Ok(state) => state,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if state.is_placeholder() && !state.is_hydrated() {
            return Ok(None);
        }

        let mut file = std::fs::File::open(local_path)
            .with_context(|| format!("opening local file: {}", local_path.display()))?;
        let mut ctx = md5::Context::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            ctx.consume(&buf[..n]);
        }
        Ok(Some(ctx.finalize().0))
    }
}
