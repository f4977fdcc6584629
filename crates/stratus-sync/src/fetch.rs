//! On-demand content fetch (hydration).

use std::path::Path;

use tracing::{debug, error, warn};

use stratus_cloudfilter::{FetchRange, PlaceholderMeta, TransferSink};
use stratus_remote::RemoteMetadata;

use crate::instance::VirtualizationInstance;

/// Remote content is streamed to the OS in chunks of this size.
pub(crate) const TRANSFER_CHUNK: usize = 1024 * 1024;

pub(crate) fn placeholder_meta(name: &str, meta: &RemoteMetadata) -> PlaceholderMeta {
    if meta.is_dir {
        PlaceholderMeta::directory(name, meta.mtime)
    } else {
        PlaceholderMeta::file(name, meta.size, meta.mtime)
    }
}

impl VirtualizationInstance {
    /// Satisfy one fetch request by streaming remote bytes into `sink`.
    ///
    /// The required range must be served; a larger optional range replaces
    /// it. A request spanning the whole file refreshes the remote state
    /// cache with a freshly computed content hash. Partial content is never
    /// reported as success: any read or transfer failure before the target
    /// length propagates (and reaches the OS as an I/O error).
    pub async fn fetch_data(
        &self,
        local_path: &Path,
        range: FetchRange,
        sink: &mut dyn TransferSink,
    ) -> anyhow::Result<()> {
        let shared = &self.shared;
        let _guard = shared.lock.lock().await;
        self.file_downloading(local_path, 0);

        let remote_path = shared.mapper.local_to_remote(local_path);
        let remote_meta = match shared.remote.stat(&remote_path).await {
            Ok(meta) => meta,
            Err(e) => {
                error!(path = %remote_path, "remote file is inaccessible: {e}");
                let e = anyhow::Error::new(e);
                self.file_error(local_path, &e);
                return Err(e);
            }
        };

        let mut offset = range.required_offset;
        let mut length = if range.required_length > 0 {
            range.required_length
        } else {
            remote_meta.size
        };
        if range.optional_length > range.required_length {
            offset = range.optional_offset;
            length = range.optional_length;
        }

        // A full hydration is the chance to refresh our record of the
        // remote content.
        let whole_file = offset == 0 && length == remote_meta.size;
        let mut hasher = whole_file.then(md5::Context::new);

        debug!(path = %remote_path, length, offset, "fetch data");
        let mut reader = match shared.remote.open_read(&remote_path).await {
            Ok(r) => r,
            Err(e) => {
                error!(path = %remote_path, "error opening remote file: {e}");
                let e = anyhow::Error::new(e);
                self.file_error(local_path, &e);
                return Err(e);
            }
        };

        let mut buf = vec![0u8; TRANSFER_CHUNK.min(length as usize)];
        let mut count: u64 = 0;
        while count < length {
            let want = buf.len().min((length - count) as usize);
            let n = match reader.read_at(&mut buf[..want], offset + count).await {
                Ok(n) => n,
                Err(e) => {
                    error!(path = %remote_path, "error reading remote file: {e}");
                    let e = anyhow::Error::new(e);
                    self.file_error(local_path, &e);
                    return Err(e);
                }
            };
            if n == 0 {
                debug!(path = %remote_path, count, "stream ended");
                break;
            }
            if let Err(e) = sink.transfer(offset + count, &buf[..n]) {
                error!(path = %remote_path, "error transferring content: {e:#}");
                self.file_error(local_path, &e);
                return Err(e);
            }
            if let Some(h) = hasher.as_mut() {
                h.consume(&buf[..n]);
            }
            count += n as u64;
            self.file_downloading(local_path, (100 * count / length.max(1)) as u8);
        }
        debug!(path = %remote_path, count, "read complete");

        if let Some(h) = hasher {
            let digest = h.finalize();
            // the content already reached the OS; the hash refresh is
            // opportunistic and must not fail the hydration
            if let Err(e) = shared.cache.update_hash(&remote_path, &digest.0).await {
                warn!(path = %remote_path, "error updating state cache: {e:#}");
            }
        }

        self.file_done(local_path);
        Ok(())
    }

    /// Placeholder metadata for every non-hidden entry of a remote
    /// directory, for providers that populate directories on demand.
    pub async fn placeholders_for(&self, remote_dir: &str) -> anyhow::Result<Vec<PlaceholderMeta>> {
        let entries = self.shared.remote.list(remote_dir).await?;
        Ok(entries
            .iter()
            .filter(|e| !e.name.starts_with('.'))
            .map(|e| placeholder_meta(&e.name, &e.metadata))
            .collect())
    }
}
