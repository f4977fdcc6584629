//! Notification plumbing: one emit helper per transition.

use std::path::Path;

use stratus_core::types::{FileSyncState, FileSyncStatus};

use crate::instance::VirtualizationInstance;

impl VirtualizationInstance {
    fn emit(&self, path: &Path, status: FileSyncStatus, progress: Option<u8>, error: Option<String>) {
        let callbacks = self.shared.callbacks.read().unwrap().clone();
        if let Some(callbacks) = callbacks {
            callbacks.file_state(FileSyncState {
                path: path.to_path_buf(),
                status,
                progress,
                error,
            });
        }
    }

    pub(crate) fn file_synchronizing(&self, path: &Path) {
        self.emit(path, FileSyncStatus::Dirty, None, None);
    }

    pub(crate) fn file_done(&self, path: &Path) {
        self.emit(path, FileSyncStatus::Done, Some(100), None);
    }

    pub(crate) fn file_removed(&self, path: &Path) {
        self.emit(path, FileSyncStatus::Deleted, None, None);
    }

    pub(crate) fn file_error(&self, path: &Path, error: &anyhow::Error) {
        self.emit(path, FileSyncStatus::Error, None, Some(format!("{error:#}")));
    }

    pub(crate) fn file_downloading(&self, path: &Path, progress: u8) {
        self.emit(path, FileSyncStatus::Downloading, Some(progress), None);
    }

    pub(crate) fn file_uploading(&self, path: &Path, progress: u8) {
        self.emit(path, FileSyncStatus::Uploading, Some(progress), None);
    }
}
