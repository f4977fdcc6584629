//! Portable placeholder provider.
//!
//! Emulates the cloud-filter placeholder contract on a plain directory so
//! the engine runs unmodified on non-Windows hosts and under tests:
//!
//! - placeholder bit-state lives in a hidden `.placeholders.json` table at
//!   the sync root (it survives instance restarts, like driver state does)
//! - dehydrated placeholders are zero-length files carrying the advertised
//!   modification time
//! - local edits are detected by comparing the recorded size/mtime
//!   fingerprint against the file on disk; a drifted entry reports its
//!   in-sync bit cleared, which is what an in-sync-tracking policy does
//!
//! Hidden table and identity files are dot-prefixed on purpose: both sync
//! walks skip dot entries.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    FetchHandler, FetchRange, PlaceholderMeta, PlaceholderState, SyncFilter, SyncRootIdentity,
    TransferSink,
};

const TABLE_FILE: &str = ".placeholders.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    state: u32,
    size: u64,
    mtime_secs: u64,
}

#[derive(Default)]
struct FilterState {
    root: Option<PathBuf>,
    table: HashMap<String, Record>,
    handler: Option<Arc<dyn FetchHandler>>,
}

#[derive(Clone, Default)]
pub struct DirectoryFilter {
    inner: Arc<Mutex<FilterState>>,
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn fingerprint(meta: &std::fs::Metadata) -> (u64, u64) {
    let mtime = meta.modified().map(unix_secs).unwrap_or(0);
    (meta.len(), mtime)
}

impl DirectoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn rel_key(state: &FilterState, local: &Path) -> anyhow::Result<String> {
        let root = state
            .root
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("filter not connected"))?;
        let rel = local
            .strip_prefix(root)
            .map_err(|_| anyhow::anyhow!("path outside sync root: {}", local.display()))?;
        Ok(rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"))
    }

    fn save(state: &FilterState) -> anyhow::Result<()> {
        let root = state
            .root
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("filter not connected"))?;
        let json = serde_json::to_string_pretty(&state.table)?;
        let path = root.join(TABLE_FILE);
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(root: &Path) -> anyhow::Result<HashMap<String, Record>> {
        let path = root.join(TABLE_FILE);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Simulate the OS asking for content: route a whole-file fetch through
    /// the registered handler, the way an application open would.
    pub fn request_hydration(&self, local: &Path) -> anyhow::Result<()> {
        let handler = self
            .inner
            .lock()
            .unwrap()
            .handler
            .clone()
            .ok_or_else(|| anyhow::anyhow!("filter not connected"))?;
        let mut sink = self.begin_transfer(local)?;
        handler.fetch(local, FetchRange::whole(), sink.as_mut())?;
        sink.complete()
    }
}

impl SyncFilter for DirectoryFilter {
    fn register(&self, root: &Path, identity: &SyncRootIdentity) -> anyhow::Result<()> {
        std::fs::create_dir_all(root)?;
        debug!(root = %root.display(), id = %identity, "registered portable sync root");
        Ok(())
    }

    fn connect(&self, root: &Path, handler: Arc<dyn FetchHandler>) -> anyhow::Result<()> {
        let table = Self::load(root)?;
        let mut state = self.inner.lock().unwrap();
        state.root = Some(root.to_path_buf());
        state.table = table;
        state.handler = Some(handler);
        Ok(())
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.inner.lock().unwrap();
        if state.root.is_none() {
            anyhow::bail!("filter not connected");
        }
        Self::save(&state)?;
        state.handler = None;
        Ok(())
    }

    fn placeholder_state(&self, local: &Path) -> io::Result<PlaceholderState> {
        let state = self.inner.lock().unwrap();
        if state.root.as_deref() == Some(local) {
            return Ok(PlaceholderState::SYNC_ROOT);
        }

        let meta = std::fs::symlink_metadata(local)?;
        if meta.is_dir() {
            return Ok(PlaceholderState::empty());
        }

        let key = Self::rel_key(&state, local)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let Some(record) = state.table.get(&key) else {
            // a plain local file the provider has never seen
            return Ok(PlaceholderState::empty());
        };

        let mut bits = PlaceholderState::from_bits_retain(record.state);
        if fingerprint(&meta) != (record.size, record.mtime_secs) {
            // content drifted since the fingerprint was recorded
            bits.remove(PlaceholderState::IN_SYNC);
        }
        Ok(bits)
    }

    fn create_placeholder(&self, parent: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()> {
        let full = parent.join(&meta.name);
        if meta.is_dir {
            std::fs::create_dir_all(&full)?;
            return Ok(());
        }

        std::fs::create_dir_all(parent)?;
        let file = File::create(&full)?;
        file.set_modified(meta.mtime)?;
        drop(file);

        let mut state = self.inner.lock().unwrap();
        let key = Self::rel_key(&state, &full)?;
        let disk = std::fs::metadata(&full)?;
        let (size, mtime_secs) = fingerprint(&disk);
        state.table.insert(
            key,
            Record {
                state: (PlaceholderState::PLACEHOLDER | PlaceholderState::IN_SYNC).bits(),
                size,
                mtime_secs,
            },
        );
        Self::save(&state)
    }

    fn set_in_sync(&self, local: &Path) -> anyhow::Result<()> {
        let disk = std::fs::metadata(local)?;
        let (size, mtime_secs) = fingerprint(&disk);

        let mut state = self.inner.lock().unwrap();
        let key = Self::rel_key(&state, local)?;
        match state.table.get_mut(&key) {
            Some(record) => {
                let mut bits = PlaceholderState::from_bits_retain(record.state);
                bits.insert(PlaceholderState::IN_SYNC);
                record.state = bits.bits();
                record.size = size;
                record.mtime_secs = mtime_secs;
            }
            None => {
                // converting a plain local file into a placeholder
                state.table.insert(
                    key,
                    Record {
                        state: (PlaceholderState::PLACEHOLDER
                            | PlaceholderState::IN_SYNC
                            | PlaceholderState::HYDRATED)
                            .bits(),
                        size,
                        mtime_secs,
                    },
                );
            }
        }
        Self::save(&state)
    }

    fn mark_dirty(&self, local: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()> {
        // dehydrate: discard content, adopt the advertised metadata
        let file = File::create(local)?;
        file.set_modified(meta.mtime)?;
        drop(file);

        let mut state = self.inner.lock().unwrap();
        let key = Self::rel_key(&state, local)?;
        let disk = std::fs::metadata(local)?;
        let (size, mtime_secs) = fingerprint(&disk);
        state.table.insert(
            key,
            Record {
                state: PlaceholderState::PLACEHOLDER.bits(),
                size,
                mtime_secs,
            },
        );
        Self::save(&state)
    }

    fn begin_transfer(&self, local: &Path) -> anyhow::Result<Box<dyn TransferSink>> {
        let file = OpenOptions::new().write(true).open(local)?;
        Ok(Box::new(PortableSink {
            inner: self.inner.clone(),
            path: local.to_path_buf(),
            file,
        }))
    }
}

struct PortableSink {
    inner: Arc<Mutex<FilterState>>,
    path: PathBuf,
    file: File,
}

impl TransferSink for PortableSink {
    fn transfer(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;

        let mut state = self.inner.lock().unwrap();
        let key = DirectoryFilter::rel_key(&state, &self.path)?;
        let disk = std::fs::metadata(&self.path)?;
        let (size, mtime_secs) = fingerprint(&disk);
        let bits = match state.table.get(&key) {
            Some(record) => {
                PlaceholderState::from_bits_retain(record.state)
                    | PlaceholderState::HYDRATED
                    | PlaceholderState::IN_SYNC
            }
            None => {
                PlaceholderState::PLACEHOLDER
                    | PlaceholderState::HYDRATED
                    | PlaceholderState::IN_SYNC
            }
        };
        state.table.insert(
            key,
            Record {
                state: bits.bits(),
                size,
                mtime_secs,
            },
        );
        if let Err(e) = DirectoryFilter::save(&state) {
            warn!(path = %self.path.display(), "failed to persist placeholder table: {e}");
        }
        Ok(())
    }
}
