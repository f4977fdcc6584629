//! Windows Cloud Filter API provider.
//!
//! Thin façade over the CfApi entry points; the only mutable state is the
//! sync-root connection key. Everything engine-shaped (what to create, when
//! to dirty, what to fetch) stays on the other side of [`SyncFilter`].
//!
//! Requires Windows 10 1809+ (build 17763).

#![cfg(target_os = "windows")]

use std::ffi::c_void;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use tracing::{debug, error};
use windows::core::{GUID, HSTRING, PCWSTR};
use windows::Win32::Foundation::{
    ERROR_FILE_NOT_FOUND, ERROR_PATH_NOT_FOUND, HANDLE, NTSTATUS, STATUS_SUCCESS,
    STATUS_UNSUCCESSFUL,
};
use windows::Win32::Storage::CloudFilters::{
    CfCloseHandle, CfConnectSyncRoot, CfConvertToPlaceholder, CfCreatePlaceholders,
    CfDisconnectSyncRoot, CfExecute, CfGetPlaceholderStateFromFindData, CfGetTransferKey,
    CfOpenFileWithOplock, CfRegisterSyncRoot, CfReleaseTransferKey, CfSetInSyncState,
    CfUnregisterSyncRoot, CfUpdatePlaceholder, CF_CALLBACK_INFO, CF_CALLBACK_PARAMETERS,
    CF_CALLBACK_REGISTRATION, CF_CALLBACK_TYPE_FETCH_DATA, CF_CALLBACK_TYPE_NONE,
    CF_CONNECTION_KEY, CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH, CF_CONVERT_FLAG_NONE,
    CF_CREATE_FLAG_NONE, CF_FILE_RANGE, CF_FS_METADATA, CF_HARDLINK_POLICY_NONE,
    CF_HYDRATION_POLICY_FULL, CF_HYDRATION_POLICY_MODIFIER_AUTO_DEHYDRATION_ALLOWED,
    CF_HYDRATION_POLICY_MODIFIER_USHORT, CF_HYDRATION_POLICY_PRIMARY_USHORT,
    CF_INSYNC_POLICY_TRACK_ALL, CF_IN_SYNC_STATE_IN_SYNC, CF_OPEN_FILE_FLAG_EXCLUSIVE,
    CF_OPEN_FILE_FLAG_WRITE_ACCESS, CF_OPERATION_INFO, CF_OPERATION_PARAMETERS,
    CF_OPERATION_PARAMETERS_0, CF_OPERATION_PARAMETERS_0_6, CF_OPERATION_TYPE_TRANSFER_DATA,
    CF_OPERATION_TRANSFER_DATA_FLAG_NONE, CF_PLACEHOLDER_CREATE_FLAG_DISABLE_ON_DEMAND_POPULATION,
    CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC, CF_PLACEHOLDER_CREATE_FLAG_NONE,
    CF_PLACEHOLDER_CREATE_INFO, CF_PLACEHOLDER_MANAGEMENT_POLICY_DEFAULT,
    CF_PLACEHOLDER_STATE_IN_SYNC, CF_PLACEHOLDER_STATE_PARTIAL,
    CF_PLACEHOLDER_STATE_PARTIALLY_ON_DISK, CF_PLACEHOLDER_STATE_PLACEHOLDER,
    CF_PLACEHOLDER_STATE_SYNC_ROOT, CF_POPULATION_POLICY_ALWAYS_FULL, CF_REGISTER_FLAG_NONE,
    CF_SET_IN_SYNC_FLAG_NONE, CF_SYNC_POLICIES, CF_SYNC_REGISTRATION, CF_TRANSFER_KEY,
    CF_UPDATE_FLAG_CLEAR_IN_SYNC, CF_UPDATE_FLAG_DEHYDRATE,
};
use windows::Win32::Storage::FileSystem::{
    FindClose, FindFirstFileW, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_NORMAL, FILE_BASIC_INFO,
    WIN32_FIND_DATAW,
};

use crate::{
    FetchHandler, FetchRange, PlaceholderMeta, PlaceholderState, SyncFilter, SyncRootIdentity,
    TransferSink,
};

const PROVIDER_NAME: &str = "Stratus";
const PROVIDER_VERSION: &str = "0.3";

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_DIFF_SECS: u64 = 11_644_473_600;

fn to_filetime(t: SystemTime) -> i64 {
    let unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    ((unix.as_secs() + FILETIME_UNIX_DIFF_SECS) * 10_000_000 + unix.subsec_nanos() as u64 / 100)
        as i64
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

struct CallbackContext {
    handler: Arc<dyn FetchHandler>,
}

#[derive(Default)]
struct WinState {
    connection: Option<CF_CONNECTION_KEY>,
    /// Leaked `Box<CallbackContext>`, reclaimed on disconnect
    context: usize,
}

/// [`SyncFilter`] over the Windows Cloud Filter API.
#[derive(Default)]
pub struct CloudFilter {
    state: Mutex<WinState>,
}

impl CloudFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove the sync-root registration entirely; existing placeholders
    /// lose their cloud state.
    pub fn unregister(root: &Path) -> anyhow::Result<()> {
        let path = HSTRING::from(root.as_os_str());
        unsafe { CfUnregisterSyncRoot(&path) }.context("CfUnregisterSyncRoot")?;
        Ok(())
    }

    fn connection_key(&self) -> anyhow::Result<CF_CONNECTION_KEY> {
        self.state
            .lock()
            .unwrap()
            .connection
            .ok_or_else(|| anyhow::anyhow!("sync root not connected"))
    }
}

impl SyncFilter for CloudFilter {
    fn register(&self, root: &Path, identity: &SyncRootIdentity) -> anyhow::Result<()> {
        std::fs::create_dir_all(root)?;

        let name = wide(PROVIDER_NAME);
        let version = wide(PROVIDER_VERSION);
        let mut registration = CF_SYNC_REGISTRATION {
            StructSize: std::mem::size_of::<CF_SYNC_REGISTRATION>() as u32,
            ProviderName: PCWSTR::from_raw(name.as_ptr()),
            ProviderVersion: PCWSTR::from_raw(version.as_ptr()),
            ProviderId: GUID::from_u128(identity.id().as_u128()),
            ..Default::default()
        };

        let mut policies = CF_SYNC_POLICIES {
            StructSize: std::mem::size_of::<CF_SYNC_POLICIES>() as u32,
            ..Default::default()
        };
        policies.Hydration.Primary = CF_HYDRATION_POLICY_PRIMARY_USHORT {
            us: CF_HYDRATION_POLICY_FULL.0 as u16,
        };
        policies.Hydration.Modifier = CF_HYDRATION_POLICY_MODIFIER_USHORT {
            us: CF_HYDRATION_POLICY_MODIFIER_AUTO_DEHYDRATION_ALLOWED.0 as u16,
        };
        policies.Population.Primary.us = CF_POPULATION_POLICY_ALWAYS_FULL.0 as u16;
        policies.InSync = CF_INSYNC_POLICY_TRACK_ALL;
        policies.HardLink = CF_HARDLINK_POLICY_NONE;
        policies.PlaceholderManagement = CF_PLACEHOLDER_MANAGEMENT_POLICY_DEFAULT;

        debug!(root = %root.display(), id = %identity, "registering sync root");
        let path = HSTRING::from(root.as_os_str());
        unsafe { CfRegisterSyncRoot(&path, &mut registration, &policies, CF_REGISTER_FLAG_NONE) }
            .context("CfRegisterSyncRoot")?;
        Ok(())
    }

    fn connect(&self, root: &Path, handler: Arc<dyn FetchHandler>) -> anyhow::Result<()> {
        let context = Box::into_raw(Box::new(CallbackContext { handler }));

        let table = [
            CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_FETCH_DATA,
                Callback: Some(fetch_data_callback),
            },
            CF_CALLBACK_REGISTRATION {
                Type: CF_CALLBACK_TYPE_NONE,
                Callback: None,
            },
        ];

        let path = HSTRING::from(root.as_os_str());
        let key = unsafe {
            CfConnectSyncRoot(
                &path,
                table.as_ptr(),
                Some(context as *const c_void),
                CF_CONNECT_FLAG_REQUIRE_FULL_FILE_PATH,
            )
        }
        .context("CfConnectSyncRoot")?;

        let mut state = self.state.lock().unwrap();
        state.connection = Some(key);
        state.context = context as usize;
        Ok(())
    }

    fn disconnect(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let key = state
            .connection
            .take()
            .ok_or_else(|| anyhow::anyhow!("sync root not connected"))?;
        unsafe { CfDisconnectSyncRoot(key) }.context("CfDisconnectSyncRoot")?;
        if state.context != 0 {
            // callbacks are disconnected; reclaim the leaked context
            drop(unsafe { Box::from_raw(state.context as *mut CallbackContext) });
            state.context = 0;
        }
        Ok(())
    }

    fn placeholder_state(&self, local: &Path) -> io::Result<PlaceholderState> {
        let path = wide(&local.to_string_lossy());
        let mut find_data = WIN32_FIND_DATAW::default();
        let handle = unsafe { FindFirstFileW(PCWSTR::from_raw(path.as_ptr()), &mut find_data) }
            .map_err(|e| {
                if e.code() == ERROR_FILE_NOT_FOUND.to_hresult()
                    || e.code() == ERROR_PATH_NOT_FOUND.to_hresult()
                {
                    io::Error::new(io::ErrorKind::NotFound, e)
                } else {
                    io::Error::other(e)
                }
            })?;
        let raw = unsafe {
            CfGetPlaceholderStateFromFindData(&find_data as *const WIN32_FIND_DATAW as *const c_void)
        };
        unsafe {
            let _ = FindClose(handle);
        }

        let mut state = PlaceholderState::empty();
        if raw.0 == -1 {
            return Ok(PlaceholderState::INVALID);
        }
        if raw.0 & CF_PLACEHOLDER_STATE_PLACEHOLDER.0 != 0 {
            state.insert(PlaceholderState::PLACEHOLDER);
        }
        if raw.0 & CF_PLACEHOLDER_STATE_SYNC_ROOT.0 != 0 {
            state.insert(PlaceholderState::SYNC_ROOT);
        }
        if raw.0 & CF_PLACEHOLDER_STATE_IN_SYNC.0 != 0 {
            state.insert(PlaceholderState::IN_SYNC);
        }
        if raw.0 & CF_PLACEHOLDER_STATE_PARTIALLY_ON_DISK.0 != 0 {
            state.insert(PlaceholderState::PARTIALLY_ON_DISK);
        }
        if state.is_placeholder() && raw.0 & CF_PLACEHOLDER_STATE_PARTIAL.0 == 0 {
            state.insert(PlaceholderState::HYDRATED);
        }
        Ok(state)
    }

    fn create_placeholder(&self, parent: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()> {
        let name = wide(&meta.name);
        let ftime = to_filetime(meta.mtime);
        let mut info = CF_PLACEHOLDER_CREATE_INFO {
            RelativeFileName: PCWSTR::from_raw(name.as_ptr()),
            FsMetadata: CF_FS_METADATA {
                BasicInfo: FILE_BASIC_INFO {
                    CreationTime: ftime,
                    LastAccessTime: ftime,
                    LastWriteTime: ftime,
                    ChangeTime: ftime,
                    FileAttributes: if meta.is_dir {
                        FILE_ATTRIBUTE_DIRECTORY.0
                    } else {
                        FILE_ATTRIBUTE_NORMAL.0
                    },
                },
                FileSize: if meta.is_dir { 0 } else { meta.size as i64 },
            },
            FileIdentity: meta.identity.as_ptr() as *const c_void,
            FileIdentityLength: meta.identity.len() as u32,
            Flags: if meta.is_dir {
                CF_PLACEHOLDER_CREATE_FLAG_NONE
            } else {
                CF_PLACEHOLDER_CREATE_FLAG_DISABLE_ON_DEMAND_POPULATION
                    | CF_PLACEHOLDER_CREATE_FLAG_MARK_IN_SYNC
            },
            ..Default::default()
        };

        let parent_path = HSTRING::from(parent.as_os_str());
        let mut processed = 0u32;
        unsafe {
            CfCreatePlaceholders(
                &parent_path,
                std::slice::from_mut(&mut info),
                CF_CREATE_FLAG_NONE,
                Some(&mut processed),
            )
        }
        .context("CfCreatePlaceholders")?;
        if processed != 1 {
            anyhow::bail!("unexpected number of entries processed: {processed}");
        }
        Ok(())
    }

    fn set_in_sync(&self, local: &Path) -> anyhow::Result<()> {
        let state = self.placeholder_state(local)?;
        let handle = OplockHandle::open(local)?;

        if !state.is_placeholder() {
            let identity = local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned().into_bytes())
                .unwrap_or_default();
            unsafe {
                CfConvertToPlaceholder(
                    handle.0,
                    Some(identity.as_ptr() as *const c_void),
                    identity.len() as u32,
                    CF_CONVERT_FLAG_NONE,
                    None,
                    None,
                )
            }
            .context("CfConvertToPlaceholder")?;
        }
        if !state.is_in_sync() {
            unsafe { CfSetInSyncState(handle.0, CF_IN_SYNC_STATE_IN_SYNC, CF_SET_IN_SYNC_FLAG_NONE, None) }
                .context("CfSetInSyncState")?;
        }
        Ok(())
    }

    fn mark_dirty(&self, local: &Path, meta: &PlaceholderMeta) -> anyhow::Result<()> {
        let state = self.placeholder_state(local)?;
        let disk_len = std::fs::metadata(local)?.len();
        let handle = OplockHandle::open(local)?;

        if !state.is_placeholder() {
            unsafe {
                CfConvertToPlaceholder(
                    handle.0,
                    Some(meta.identity.as_ptr() as *const c_void),
                    meta.identity.len() as u32,
                    CF_CONVERT_FLAG_NONE,
                    None,
                    None,
                )
            }
            .context("CfConvertToPlaceholder")?;
        }
        if !state.is_in_sync() {
            // updating a placeholder only works while it is marked in-sync
            unsafe { CfSetInSyncState(handle.0, CF_IN_SYNC_STATE_IN_SYNC, CF_SET_IN_SYNC_FLAG_NONE, None) }
                .context("CfSetInSyncState")?;
        }

        let ftime = to_filetime(meta.mtime);
        let fs_metadata = CF_FS_METADATA {
            BasicInfo: FILE_BASIC_INFO {
                CreationTime: ftime,
                LastAccessTime: ftime,
                LastWriteTime: ftime,
                ChangeTime: ftime,
                FileAttributes: FILE_ATTRIBUTE_NORMAL.0,
            },
            FileSize: meta.size as i64,
        };
        let range = CF_FILE_RANGE {
            StartingOffset: 0,
            Length: disk_len as i64,
        };
        unsafe {
            CfUpdatePlaceholder(
                handle.0,
                Some(&fs_metadata),
                Some(meta.identity.as_ptr() as *const c_void),
                meta.identity.len() as u32,
                Some(std::slice::from_ref(&range)),
                CF_UPDATE_FLAG_CLEAR_IN_SYNC | CF_UPDATE_FLAG_DEHYDRATE,
                None,
                None,
            )
        }
        .context("CfUpdatePlaceholder")?;
        Ok(())
    }

    fn begin_transfer(&self, local: &Path) -> anyhow::Result<Box<dyn TransferSink>> {
        let connection = self.connection_key()?;
        let handle = OplockHandle::open(local)?;
        let key = unsafe { CfGetTransferKey(handle.0) }.context("CfGetTransferKey")?;
        Ok(Box::new(KeyedSink {
            connection,
            transfer_key: key,
            handle: Some(handle),
        }))
    }
}

/// Placeholder handle with an exclusive oplock, closed on drop.
struct OplockHandle(HANDLE);

impl OplockHandle {
    fn open(local: &Path) -> anyhow::Result<Self> {
        let path = HSTRING::from(local.as_os_str());
        let handle = unsafe {
            CfOpenFileWithOplock(
                &path,
                CF_OPEN_FILE_FLAG_WRITE_ACCESS | CF_OPEN_FILE_FLAG_EXCLUSIVE,
            )
        }
        .with_context(|| format!("CfOpenFileWithOplock: {}", local.display()))?;
        Ok(Self(handle))
    }
}

impl Drop for OplockHandle {
    fn drop(&mut self) {
        unsafe { CfCloseHandle(self.0) };
    }
}

fn transfer_op(
    connection: CF_CONNECTION_KEY,
    transfer_key: CF_TRANSFER_KEY,
    status: NTSTATUS,
    buffer: *const c_void,
    offset: i64,
    length: i64,
) -> anyhow::Result<()> {
    let op_info = CF_OPERATION_INFO {
        StructSize: std::mem::size_of::<CF_OPERATION_INFO>() as u32,
        Type: CF_OPERATION_TYPE_TRANSFER_DATA,
        ConnectionKey: connection,
        TransferKey: transfer_key,
        ..Default::default()
    };
    let mut params = CF_OPERATION_PARAMETERS {
        ParamSize: std::mem::size_of::<CF_OPERATION_PARAMETERS>() as u32,
        Anonymous: CF_OPERATION_PARAMETERS_0 {
            TransferData: CF_OPERATION_PARAMETERS_0_6 {
                Flags: CF_OPERATION_TRANSFER_DATA_FLAG_NONE,
                CompletionStatus: status,
                Buffer: buffer,
                Offset: offset,
                Length: length,
            },
        },
    };
    unsafe { CfExecute(&op_info, &mut params) }.context("CfExecute(TRANSFER_DATA)")?;
    Ok(())
}

/// Sink writing into OS placeholder storage through a transfer key.
struct KeyedSink {
    connection: CF_CONNECTION_KEY,
    transfer_key: CF_TRANSFER_KEY,
    /// Held only for engine-initiated transfers; callback transfers borrow
    /// the key owned by the OS request.
    handle: Option<OplockHandle>,
}

impl TransferSink for KeyedSink {
    fn transfer(&mut self, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        transfer_op(
            self.connection,
            self.transfer_key,
            STATUS_SUCCESS,
            data.as_ptr() as *const c_void,
            offset as i64,
            data.len() as i64,
        )
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        if let Some(handle) = self.handle.take() {
            unsafe { CfReleaseTransferKey(handle.0, &self.transfer_key) };
        }
        Ok(())
    }
}

unsafe extern "system" fn fetch_data_callback(
    info: *const CF_CALLBACK_INFO,
    params: *const CF_CALLBACK_PARAMETERS,
) {
    let info = &*info;
    let context = &*(info.CallbackContext as *const CallbackContext);

    let volume = info.VolumeDosName.to_string().unwrap_or_default();
    let normalized = info.NormalizedPath.to_string().unwrap_or_default();
    let local_path = PathBuf::from(format!("{volume}{normalized}"));

    let fetch = &(*params).Anonymous.FetchData;
    let range = FetchRange {
        required_offset: fetch.RequiredFileOffset as u64,
        required_length: fetch.RequiredLength as u64,
        optional_offset: fetch.OptionalFileOffset as u64,
        optional_length: fetch.OptionalLength as u64,
    };

    let mut sink = KeyedSink {
        connection: info.ConnectionKey,
        transfer_key: info.TransferKey,
        handle: None,
    };

    if let Err(e) = context.handler.fetch(&local_path, range, &mut sink) {
        error!(path = %local_path.display(), "fetch callback failed: {e:#}");
        // report the failure so the requesting application sees an I/O error
        let _ = transfer_op(
            info.ConnectionKey,
            info.TransferKey,
            STATUS_UNSUCCESSFUL,
            std::ptr::null(),
            fetch.RequiredFileOffset,
            fetch.RequiredLength,
        );
    }
}
