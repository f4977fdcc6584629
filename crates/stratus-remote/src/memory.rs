//! In-memory remote backend.
//!
//! Backs the integration tests the way a memory-mapped afero filesystem or
//! an `opendal::services::Memory` operator would, with two additions the
//! engine tests need: modification times can be set explicitly, and content
//! reads/writes/removes are counted so idempotence is observable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::{
    RemoteEntry, RemoteError, RemoteFs, RemoteMetadata, RemoteReader, RemoteResult, RemoteWriter,
};

#[derive(Clone)]
struct Node {
    data: Vec<u8>,
    mtime: SystemTime,
    is_dir: bool,
}

#[derive(Default)]
struct Inner {
    nodes: Mutex<HashMap<String, Node>>,
    content_reads: AtomicU64,
    content_writes: AtomicU64,
    removes: AtomicU64,
}

/// Snapshot of the operation counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCounters {
    pub content_reads: u64,
    pub content_writes: u64,
    pub removes: u64,
}

#[derive(Clone, Default)]
pub struct MemoryRemote {
    inner: Arc<Inner>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the recorded modification time of an existing entry.
    pub fn set_mtime(&self, path: &str, mtime: SystemTime) -> RemoteResult<()> {
        let path = normalize(path);
        let mut nodes = self.inner.nodes.lock().unwrap();
        match nodes.get_mut(&path) {
            Some(node) => {
                node.mtime = mtime;
                Ok(())
            }
            None => Err(RemoteError::NotFound(path)),
        }
    }

    /// Current read/write/remove counts for content operations.
    ///
    /// Metadata operations (stat, list) are intentionally not counted.
    pub fn counters(&self) -> OpCounters {
        OpCounters {
            content_reads: self.inner.content_reads.load(Ordering::Relaxed),
            content_writes: self.inner.content_writes.load(Ordering::Relaxed),
            removes: self.inner.removes.load(Ordering::Relaxed),
        }
    }

    fn insert_parents(nodes: &mut HashMap<String, Node>, path: &str) {
        let mut prefix = String::new();
        for part in path.split('/') {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if prefix == path {
                break;
            }
            nodes.entry(prefix.clone()).or_insert(Node {
                data: Vec::new(),
                mtime: SystemTime::now(),
                is_dir: true,
            });
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

fn root_metadata() -> RemoteMetadata {
    RemoteMetadata {
        size: 0,
        mtime: SystemTime::UNIX_EPOCH,
        is_dir: true,
    }
}

#[async_trait]
impl RemoteFs for MemoryRemote {
    async fn stat(&self, path: &str) -> RemoteResult<RemoteMetadata> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(root_metadata());
        }
        let nodes = self.inner.nodes.lock().unwrap();
        nodes
            .get(&path)
            .map(|n| RemoteMetadata {
                size: n.data.len() as u64,
                mtime: n.mtime,
                is_dir: n.is_dir,
            })
            .ok_or(RemoteError::NotFound(path))
    }

    async fn open_read(&self, path: &str) -> RemoteResult<Box<dyn RemoteReader>> {
        let path = normalize(path);
        let nodes = self.inner.nodes.lock().unwrap();
        let node = nodes.get(&path).ok_or(RemoteError::NotFound(path))?;
        self.inner.content_reads.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryReader {
            data: node.data.clone(),
        }))
    }

    async fn open_write(&self, path: &str) -> RemoteResult<Box<dyn RemoteWriter>> {
        Ok(Box::new(MemoryWriter {
            inner: self.inner.clone(),
            path: normalize(path),
            buf: Vec::new(),
        }))
    }

    async fn read(&self, path: &str) -> RemoteResult<Vec<u8>> {
        let path = normalize(path);
        let nodes = self.inner.nodes.lock().unwrap();
        let node = nodes.get(&path).ok_or(RemoteError::NotFound(path))?;
        self.inner.content_reads.fetch_add(1, Ordering::Relaxed);
        Ok(node.data.clone())
    }

    async fn write(&self, path: &str, data: &[u8]) -> RemoteResult<()> {
        let path = normalize(path);
        let mut nodes = self.inner.nodes.lock().unwrap();
        Self::insert_parents(&mut nodes, &path);
        nodes.insert(
            path,
            Node {
                data: data.to_vec(),
                mtime: SystemTime::now(),
                is_dir: false,
            },
        );
        self.inner.content_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn create_dir_all(&self, path: &str) -> RemoteResult<()> {
        let path = normalize(path);
        if path.is_empty() {
            return Ok(());
        }
        let mut nodes = self.inner.nodes.lock().unwrap();
        Self::insert_parents(&mut nodes, &path);
        nodes.entry(path).or_insert(Node {
            data: Vec::new(),
            mtime: SystemTime::now(),
            is_dir: true,
        });
        Ok(())
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        let path = normalize(path);
        let mut nodes = self.inner.nodes.lock().unwrap();
        if nodes.remove(&path).is_none() {
            return Err(RemoteError::NotFound(path));
        }
        self.inner.removes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn remove_all(&self, path: &str) -> RemoteResult<()> {
        let path = normalize(path);
        let mut nodes = self.inner.nodes.lock().unwrap();
        let prefix = format!("{path}/");
        let before = nodes.len();
        nodes.retain(|k, _| k != &path && !k.starts_with(&prefix));
        if nodes.len() != before {
            self.inner.removes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let path = normalize(path);
        let nodes = self.inner.nodes.lock().unwrap();
        if !path.is_empty() {
            match nodes.get(&path) {
                Some(n) if n.is_dir => {}
                Some(_) => {
                    return Err(RemoteError::Other(anyhow::anyhow!(
                        "not a directory: {path}"
                    )))
                }
                None => return Err(RemoteError::NotFound(path)),
            }
        }
        let mut entries: Vec<RemoteEntry> = nodes
            .iter()
            .filter_map(|(key, node)| {
                let rel = if path.is_empty() {
                    key.as_str()
                } else {
                    key.strip_prefix(&format!("{path}/"))?
                };
                if rel.is_empty() || rel.contains('/') {
                    return None;
                }
                Some(RemoteEntry {
                    name: rel.to_string(),
                    metadata: RemoteMetadata {
                        size: node.data.len() as u64,
                        mtime: node.mtime,
                        is_dir: node.is_dir,
                    },
                })
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

struct MemoryReader {
    data: Vec<u8>,
}

#[async_trait]
impl RemoteReader for MemoryReader {
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> RemoteResult<usize> {
        let offset = offset as usize;
        if offset >= self.data.len() {
            return Ok(0);
        }
        let n = buf.len().min(self.data.len() - offset);
        buf[..n].copy_from_slice(&self.data[offset..offset + n]);
        Ok(n)
    }
}

struct MemoryWriter {
    inner: Arc<Inner>,
    path: String,
    buf: Vec<u8>,
}

#[async_trait]
impl RemoteWriter for MemoryWriter {
    async fn write_all(&mut self, data: &[u8]) -> RemoteResult<()> {
        self.buf.extend_from_slice(data);
        Ok(())
    }

    async fn close(&mut self) -> RemoteResult<()> {
        let mut nodes = self.inner.nodes.lock().unwrap();
        MemoryRemote::insert_parents(&mut nodes, &self.path);
        nodes.insert(
            self.path.clone(),
            Node {
                data: std::mem::take(&mut self.buf),
                mtime: SystemTime::now(),
                is_dir: false,
            },
        );
        self.inner.content_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read() {
        let fs = MemoryRemote::new();
        fs.write("dir/file.txt", b"payload").await.unwrap();
        assert_eq!(fs.read("dir/file.txt").await.unwrap(), b"payload");

        // parent directory materialized implicitly
        let meta = fs.stat("dir").await.unwrap();
        assert!(meta.is_dir);
    }

    #[tokio::test]
    async fn stat_missing_is_not_found() {
        let fs = MemoryRemote::new();
        let err = fs.stat("nope").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn list_is_single_level() {
        let fs = MemoryRemote::new();
        fs.write("a.txt", b"1").await.unwrap();
        fs.write("sub/b.txt", b"2").await.unwrap();

        let names: Vec<String> = fs
            .list("")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.txt", "sub"]);

        let names: Vec<String> = fs
            .list("sub")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["b.txt"]);
    }

    #[tokio::test]
    async fn streamed_write_visible_after_close() {
        let fs = MemoryRemote::new();
        let mut w = fs.open_write("big.bin").await.unwrap();
        w.write_all(b"part1-").await.unwrap();
        w.write_all(b"part2").await.unwrap();
        assert!(!fs.exists("big.bin").await.unwrap());
        w.close().await.unwrap();
        assert_eq!(fs.read("big.bin").await.unwrap(), b"part1-part2");
    }

    #[tokio::test]
    async fn read_at_clamps_to_eof() {
        let fs = MemoryRemote::new();
        fs.write("f", b"abcdef").await.unwrap();
        let mut r = fs.open_read("f").await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(r.read_at(&mut buf, 4).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(r.read_at(&mut buf, 6).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn counters_track_content_ops() {
        let fs = MemoryRemote::new();
        fs.write("f", b"x").await.unwrap();
        fs.read("f").await.unwrap();
        fs.stat("f").await.unwrap();
        fs.list("").await.unwrap();
        fs.remove("f").await.unwrap();

        let c = fs.counters();
        assert_eq!(
            (c.content_writes, c.content_reads, c.removes),
            (1, 1, 1),
            "stat/list must not count as content operations"
        );
    }

    #[tokio::test]
    async fn remove_all_is_recursive_and_tolerant() {
        let fs = MemoryRemote::new();
        fs.write("t/a", b"1").await.unwrap();
        fs.write("t/sub/b", b"2").await.unwrap();
        fs.remove_all("t").await.unwrap();
        assert!(!fs.exists("t").await.unwrap());
        assert!(!fs.exists("t/sub/b").await.unwrap());

        // absent target is fine
        fs.remove_all("t").await.unwrap();
    }
}
