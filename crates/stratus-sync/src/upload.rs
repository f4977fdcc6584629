//! Streaming upload of one local file to the remote backend.

use std::io::Read;

use anyhow::Context;
use tracing::debug;

use crate::fetch::TRANSFER_CHUNK;
use crate::instance::VirtualizationInstance;

impl VirtualizationInstance {
    /// Stream the local counterpart of `remote_path` to the backend and
    /// record the freshly computed content hash in the remote state cache.
    pub(crate) async fn stream_local_to_remote(&self, remote_path: &str) -> anyhow::Result<()> {
        let shared = &self.shared;
        let local_path = shared.mapper.remote_to_local(remote_path);

        let mut file = std::fs::File::open(&local_path)
            .with_context(|| format!("opening local file: {}", local_path.display()))?;
        let mut writer = shared
            .remote
            .open_write(remote_path)
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("opening remote file: {remote_path}")))?;

        let mut hasher = md5::Context::new();
        let mut buf = vec![0u8; TRANSFER_CHUNK];
        loop {
            let n = file
                .read(&mut buf)
                .with_context(|| format!("reading local file: {}", local_path.display()))?;
            if n == 0 {
                break;
            }
            hasher.consume(&buf[..n]);
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| anyhow::Error::new(e).context(format!("uploading: {remote_path}")))?;
            debug!(path = %remote_path, bytes = n, "uploaded chunk");
        }
        writer
            .close()
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("finishing upload: {remote_path}")))?;
        debug!(path = %remote_path, "done uploading");

        let digest = hasher.finalize();
        self.shared
            .cache
            .update_hash(remote_path, &digest.0)
            .await
            .context("recording content hash")
    }
}
