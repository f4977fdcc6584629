//! Lazily-connecting wrapper around a remote backend.
//!
//! Session-oriented backends (SFTP, proxies) drop connections; this wrapper
//! dials on first use and re-dials after the backend signals a disconnect
//! through the notifier handed to the connect function. Callers never see
//! the reconnect cycle, only the errors of a failed dial.

use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    RemoteEntry, RemoteFs, RemoteMetadata, RemoteReader, RemoteResult, RemoteWriter,
};

/// Invoked by the backend (from any thread) when its connection dies; the
/// next operation will dial again.
pub type DisconnectNotifier = Arc<dyn Fn() + Send + Sync>;

/// Dial function producing a fresh backend.
pub type ConnectFn = Box<
    dyn Fn(DisconnectNotifier) -> BoxFuture<'static, RemoteResult<Arc<dyn RemoteFs>>>
        + Send
        + Sync,
>;

struct Inner {
    connect: ConnectFn,
    current: Mutex<Option<Arc<dyn RemoteFs>>>,
}

pub struct ReconnectingRemote {
    inner: Arc<Inner>,
}

impl ReconnectingRemote {
    pub fn new(connect: ConnectFn) -> Self {
        Self {
            inner: Arc::new(Inner {
                connect,
                current: Mutex::new(None),
            }),
        }
    }

    async fn acquire(&self) -> RemoteResult<Arc<dyn RemoteFs>> {
        if let Some(fs) = self.inner.current.lock().unwrap().clone() {
            return Ok(fs);
        }

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let notifier: DisconnectNotifier = Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.current.lock().unwrap().take();
            }
        });

        let fs = (self.inner.connect)(notifier).await?;
        *self.inner.current.lock().unwrap() = Some(fs.clone());
        Ok(fs)
    }
}

#[async_trait]
impl RemoteFs for ReconnectingRemote {
    async fn stat(&self, path: &str) -> RemoteResult<RemoteMetadata> {
        self.acquire().await?.stat(path).await
    }

    async fn open_read(&self, path: &str) -> RemoteResult<Box<dyn RemoteReader>> {
        self.acquire().await?.open_read(path).await
    }

    async fn open_write(&self, path: &str) -> RemoteResult<Box<dyn RemoteWriter>> {
        self.acquire().await?.open_write(path).await
    }

    async fn read(&self, path: &str) -> RemoteResult<Vec<u8>> {
        self.acquire().await?.read(path).await
    }

    async fn write(&self, path: &str, data: &[u8]) -> RemoteResult<()> {
        self.acquire().await?.write(path, data).await
    }

    async fn create_dir_all(&self, path: &str) -> RemoteResult<()> {
        self.acquire().await?.create_dir_all(path).await
    }

    async fn remove(&self, path: &str) -> RemoteResult<()> {
        self.acquire().await?.remove(path).await
    }

    async fn remove_all(&self, path: &str) -> RemoteResult<()> {
        self.acquire().await?.remove_all(path).await
    }

    async fn list(&self, path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.acquire().await?.list(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryRemote;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_connector(
        fs: MemoryRemote,
        dials: Arc<AtomicUsize>,
        notifier_slot: Arc<Mutex<Option<DisconnectNotifier>>>,
    ) -> ConnectFn {
        Box::new(move |notifier| {
            let fs = fs.clone();
            dials.fetch_add(1, Ordering::SeqCst);
            *notifier_slot.lock().unwrap() = Some(notifier);
            Box::pin(async move { Ok(Arc::new(fs) as Arc<dyn RemoteFs>) })
        })
    }

    #[tokio::test]
    async fn dials_once_until_disconnected() {
        let fs = MemoryRemote::new();
        fs.write("f", b"x").await.unwrap();

        let dials = Arc::new(AtomicUsize::new(0));
        let slot = Arc::new(Mutex::new(None));
        let remote =
            ReconnectingRemote::new(counting_connector(fs, dials.clone(), slot.clone()));

        remote.stat("f").await.unwrap();
        remote.read("f").await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 1);

        // backend reports a disconnect → next op re-dials
        let notify = slot.lock().unwrap().clone().unwrap();
        notify();
        remote.stat("f").await.unwrap();
        assert_eq!(dials.load(Ordering::SeqCst), 2);
    }
}
