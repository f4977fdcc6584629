//! Remote state cache: last-observed content fingerprints.
//!
//! One hidden sidecar object per tracked file, `.md5_<basename>` in the same
//! remote directory, holding exactly the raw 16-byte digest — no encoding,
//! no envelope. The cache is written after a full hydration or upload and
//! consulted only when a remote file has gone missing, to tell "deleted
//! remotely" apart from "never synced".

use std::sync::Arc;

use async_trait::async_trait;

use stratus_remote::RemoteFs;

pub const SIDECAR_PREFIX: &str = ".md5_";

/// Contract for tracking the remote content last seen by this replica.
#[async_trait]
pub trait RemoteStateCache: Send + Sync {
    /// Last recorded hash for `remote_path`; `None` when nothing was ever
    /// recorded (absence is not an error).
    async fn get_hash(&self, remote_path: &str) -> anyhow::Result<Option<Vec<u8>>>;

    async fn update_hash(&self, remote_path: &str, hash: &[u8]) -> anyhow::Result<()>;
}

/// Sidecar-file implementation layered on the remote backend itself.
pub struct HashSidecars {
    fs: Arc<dyn RemoteFs>,
}

impl HashSidecars {
    pub fn new(fs: Arc<dyn RemoteFs>) -> Self {
        Self { fs }
    }

    /// `docs/report.txt` → `docs/.md5_report.txt`
    pub fn sidecar_path(remote_path: &str) -> String {
        let trimmed = remote_path.trim_start_matches('/');
        match trimmed.rsplit_once('/') {
            Some((dir, name)) => format!("{dir}/{SIDECAR_PREFIX}{name}"),
            None => format!("{SIDECAR_PREFIX}{trimmed}"),
        }
    }
}

#[async_trait]
impl RemoteStateCache for HashSidecars {
    async fn get_hash(&self, remote_path: &str) -> anyhow::Result<Option<Vec<u8>>> {
        let sidecar = Self::sidecar_path(remote_path);
        match self.fs.read(&sidecar).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(anyhow::Error::new(e).context(format!("reading sidecar {sidecar}"))),
        }
    }

    async fn update_hash(&self, remote_path: &str, hash: &[u8]) -> anyhow::Result<()> {
        let sidecar = Self::sidecar_path(remote_path);
        self.fs
            .write(&sidecar, hash)
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("writing sidecar {sidecar}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_remote::MemoryRemote;

    #[test]
    fn sidecar_naming() {
        assert_eq!(HashSidecars::sidecar_path("test.txt"), ".md5_test.txt");
        assert_eq!(
            HashSidecars::sidecar_path("docs/report.txt"),
            "docs/.md5_report.txt"
        );
        assert_eq!(HashSidecars::sidecar_path("/test.txt"), ".md5_test.txt");
    }

    #[tokio::test]
    async fn missing_sidecar_is_none() {
        let fs = Arc::new(MemoryRemote::new());
        let cache = HashSidecars::new(fs);
        assert!(cache.get_hash("never/seen.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_then_get_round_trips_raw_bytes() {
        let fs = Arc::new(MemoryRemote::new());
        let cache = HashSidecars::new(fs.clone());

        let digest = md5::compute(b"something").0;
        cache.update_hash("dir/file.txt", &digest).await.unwrap();

        let stored = cache.get_hash("dir/file.txt").await.unwrap().unwrap();
        assert_eq!(stored, digest.to_vec());

        // stored beside the content, dot-prefixed, raw 16 bytes
        let raw = fs.read("dir/.md5_file.txt").await.unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[tokio::test]
    async fn update_overwrites_previous_hash() {
        let fs = Arc::new(MemoryRemote::new());
        let cache = HashSidecars::new(fs);

        cache.update_hash("f", &md5::compute(b"one").0).await.unwrap();
        cache.update_hash("f", &md5::compute(b"two").0).await.unwrap();

        let stored = cache.get_hash("f").await.unwrap().unwrap();
        assert_eq!(stored, md5::compute(b"two").0.to_vec());
    }
}
