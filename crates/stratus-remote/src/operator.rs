//! OpenDAL-backed remote filesystem.
//!
//! One adapter covers every backend OpenDAL speaks (S3-compatible object
//! stores, SFTP, plain HTTP, ...). The operator is built with retry and
//! logging layers; the engine itself never retries.

use std::time::SystemTime;

use anyhow::Context;
use async_trait::async_trait;
use opendal::Operator;

use crate::{
    RemoteEntry, RemoteError, RemoteFs, RemoteMetadata, RemoteReader, RemoteResult, RemoteWriter,
};

/// Build an OpenDAL Operator for an S3-compatible endpoint.
///
/// Uses path-style addressing (the opendal default), which SeaweedFS and
/// MinIO require. If `enforce_tls` is set and the endpoint is plaintext
/// HTTP, construction fails; otherwise a warning is logged.
pub fn build_operator(cfg: &stratus_core::config::StorageConfig) -> anyhow::Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled",
                cfg.endpoint
            );
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP — credentials are transmitted unencrypted"
        );
    }

    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(&cfg.access_key_id)
        .secret_access_key(&cfg.secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// [`RemoteFs`] adapter over an `opendal::Operator`.
#[derive(Clone)]
pub struct OpendalRemote {
    op: Operator,
}

impl OpendalRemote {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Convenience: build the S3 operator from config and wrap it.
    pub fn from_config(cfg: &stratus_core::config::StorageConfig) -> anyhow::Result<Self> {
        Ok(Self::new(build_operator(cfg)?))
    }
}

fn map_err(path: &str, e: opendal::Error) -> RemoteError {
    if e.kind() == opendal::ErrorKind::NotFound {
        RemoteError::NotFound(path.to_string())
    } else {
        RemoteError::Other(anyhow::Error::new(e).context(format!("backend op on {path}")))
    }
}

fn to_metadata(meta: &opendal::Metadata) -> RemoteMetadata {
    RemoteMetadata {
        size: meta.content_length(),
        mtime: meta
            .last_modified()
            .map(SystemTime::from)
            .unwrap_or(SystemTime::UNIX_EPOCH),
        is_dir: meta.mode().is_dir(),
    }
}

fn dir_key(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("{trimmed}/")
    }
}

#[async_trait]
impl RemoteFs for OpendalRemote {
    async fn stat(&self, path: &str) -> RemoteResult<RemoteMetadata> {
        let meta = self.op.stat(path).await.map_err(|e| map_err(path, e))?;
        Ok(to_metadata(&meta))
    }

    async fn open_read(&self, path: &str) -> RemoteResult<Box<dyn RemoteReader>> {
        // Size is captured up front so read_at can clamp ranges; OpenDAL
        // rejects ranges that run past the end of the object.
        let meta = self.op.stat(path).await.map_err(|e| map_err(path, e))?;
        let reader = self.op.reader(path).await.map_err(|e| map_err(path, e))?;
        Ok(Box::new(OpendalReader {
            path: path.to_string(),
            reader,
            size: meta.content_length(),
        }))
    }

    async fn open_write(&self, path: &str) -> RemoteResult<Box<dyn RemoteWriter>> {
        let writer = self.op.writer(path).await.map_err(|e| map_err(path, e))?;
        Ok(Box::new(OpendalWriter {
            path: path.to_string(),
            writer,
        }))
    }

    async fn read(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let buf = self.op.read(path).await.map_err(|e| map_err(path, e))?;
        Ok(buf.to_vec())
    }

    async fn write(&self, path: &str, data: &[u8]) -> RemoteResult<()> {
        self.op
            .write(path, data.to_vec())
            .await
            .map_err(|e| map_err(path, e))?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> RemoteResult<()> {
        let key = dir_key(path);
        if key == "/" {
            return Ok(());
        }
        self.op
            .create_dir(&key)
            .await
            .map_err(|e| map_err(path, e))
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        self.op.delete(path).await.map_err(|e| map_err(path, e))
    }

    async fn remove_all(&self, path: &str) -> RemoteResult<()> {
        self.op.remove_all(path).await.map_err(|e| map_err(path, e))
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let key = dir_key(path);
        let listed = self.op.list(&key).await.map_err(|e| map_err(path, e))?;

        let mut entries = Vec::with_capacity(listed.len());
        for entry in listed {
            // Listings include the directory marker itself; skip it.
            if entry.path().trim_matches('/') == key.trim_matches('/') {
                continue;
            }
            let name = entry.name().trim_end_matches('/').to_string();
            if name.is_empty() {
                continue;
            }
            entries.push(RemoteEntry {
                metadata: to_metadata(entry.metadata()),
                name,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

struct OpendalReader {
    path: String,
    reader: opendal::Reader,
    size: u64,
}

#[async_trait]
impl RemoteReader for OpendalReader {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> RemoteResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let end = (offset + buf.len() as u64).min(self.size);
        let data = self
            .reader
            .read(offset..end)
            .await
            .map_err(|e| map_err(&self.path, e))?;
        let bytes = data.to_bytes();
        buf[..bytes.len()].copy_from_slice(&bytes);
        Ok(bytes.len())
    }
}

struct OpendalWriter {
    path: String,
    writer: opendal::Writer,
}

#[async_trait]
impl RemoteWriter for OpendalWriter {
    async fn write_all(&mut self, data: &[u8]) -> RemoteResult<()> {
        self.writer
            .write(data.to_vec())
            .await
            .map_err(|e| map_err(&self.path, e))
    }

    async fn close(&mut self) -> RemoteResult<()> {
        self.writer
            .close()
            .await
            .map_err(|e| map_err(&self.path, e))?;
        Ok(())
    }
}
