//! Virtualization instance lifecycle.
//!
//! `start_projecting` registers the sync root (idempotent per identity),
//! connects the fetch callback, starts the local-deletion watcher, and runs
//! an initial synchronization. `close` stops the watcher and disconnects;
//! it does not interrupt work already in flight.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{info, warn};

use stratus_cloudfilter::{FetchHandler, FetchRange, SyncFilter, SyncRootIdentity, TransferSink};
use stratus_core::types::{StateCallbacks, Virtualization};
use stratus_remote::RemoteFs;

use crate::cache::{HashSidecars, RemoteStateCache};
use crate::path::PathMapper;

pub(crate) struct Shared {
    pub(crate) mapper: PathMapper,
    pub(crate) remote: Arc<dyn RemoteFs>,
    pub(crate) cache: Arc<dyn RemoteStateCache>,
    pub(crate) filter: Arc<dyn SyncFilter>,
    /// Serializes every fetch callback and the whole of a synchronization
    /// run for this root.
    pub(crate) lock: tokio::sync::Mutex<()>,
    pub(crate) callbacks: RwLock<Option<Arc<dyn StateCallbacks>>>,
    pub(crate) watcher: Mutex<Option<notify::RecommendedWatcher>>,
    pub(crate) started: AtomicBool,
}

/// One mounted root. Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct VirtualizationInstance {
    pub(crate) shared: Arc<Shared>,
}

/// Mount `root` over `remote` using the given placeholder provider and
/// return the running instance.
pub async fn start_projecting(
    root: &Path,
    remote: Arc<dyn RemoteFs>,
    filter: Arc<dyn SyncFilter>,
) -> anyhow::Result<VirtualizationInstance> {
    let identity = SyncRootIdentity::ensure_at(root)?;
    filter.register(root, &identity)?;

    let instance = VirtualizationInstance {
        shared: Arc::new(Shared {
            mapper: PathMapper::new(root),
            cache: Arc::new(HashSidecars::new(remote.clone())),
            remote,
            filter,
            lock: tokio::sync::Mutex::new(()),
            callbacks: RwLock::new(None),
            watcher: Mutex::new(None),
            started: AtomicBool::new(false),
        }),
    };

    info!(root = %root.display(), id = %identity, "connecting sync root");
    let bridge = FetchBridge {
        instance: instance.clone(),
        handle: tokio::runtime::Handle::current(),
    };
    instance.shared.filter.connect(root, Arc::new(bridge))?;
    instance.start_watcher()?;
    instance.shared.started.store(true, Ordering::SeqCst);

    if let Err(e) = instance.perform_synchronization().await {
        warn!("initial synchronization failed: {e:#}");
    }

    Ok(instance)
}

impl VirtualizationInstance {
    /// Reconcile both directions, then stream the uploads the local→remote
    /// pass queued. Holds the instance lock for the whole call.
    pub async fn perform_synchronization(&self) -> anyhow::Result<()> {
        let _guard = self.shared.lock.lock().await;

        self.sync_remote_to_local().await?;
        let uploads = self.sync_local_to_remote().await?;

        for remote_path in uploads {
            let local_path = self.shared.mapper.remote_to_local(&remote_path);
            self.file_uploading(&local_path, 0);
            info!(path = %remote_path, "updating remote file");
            match self.stream_local_to_remote(&remote_path).await {
                Ok(()) => self.file_done(&local_path),
                Err(e) => {
                    self.file_error(&local_path, &e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    pub fn set_state_callbacks(&self, callbacks: Arc<dyn StateCallbacks>) {
        *self.shared.callbacks.write().unwrap() = Some(callbacks);
    }

    /// Fully materialize one placeholder's content, outside any OS callback.
    pub async fn hydrate(&self, local_path: &Path) -> anyhow::Result<()> {
        let mut sink = self.shared.filter.begin_transfer(local_path)?;
        self.fetch_data(local_path, FetchRange::whole(), sink.as_mut())
            .await?;
        sink.complete()
    }

    pub async fn close(&self) -> anyhow::Result<()> {
        if !self.shared.started.swap(false, Ordering::SeqCst) {
            anyhow::bail!("not started");
        }
        // stop the watcher first so no further deletion events are forwarded
        self.shared.watcher.lock().unwrap().take();
        self.shared.filter.disconnect()?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Virtualization for VirtualizationInstance {
    async fn perform_synchronization(&self) -> anyhow::Result<()> {
        VirtualizationInstance::perform_synchronization(self).await
    }

    fn set_state_callbacks(&self, callbacks: Arc<dyn StateCallbacks>) {
        VirtualizationInstance::set_state_callbacks(self, callbacks)
    }

    async fn close(&self) -> anyhow::Result<()> {
        VirtualizationInstance::close(self).await
    }
}

/// Bridges the provider's synchronous callback threads into the async fetch
/// handler. Must only be invoked from threads outside the async executor
/// (OS callback pools, blocking threads) — which is where providers dispatch
/// their callbacks.
struct FetchBridge {
    instance: VirtualizationInstance,
    handle: tokio::runtime::Handle,
}

impl FetchHandler for FetchBridge {
    fn fetch(
        &self,
        local_path: &Path,
        range: FetchRange,
        sink: &mut dyn TransferSink,
    ) -> anyhow::Result<()> {
        self.handle
            .block_on(self.instance.fetch_data(local_path, range, sink))
    }
}
