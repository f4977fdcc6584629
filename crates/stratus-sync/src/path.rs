//! Local placeholder path ↔ remote logical path translation.
//!
//! OS callbacks may report a path in either its long or short (8.3) form,
//! so both root prefixes are stripped. Remote paths are `/`-separated with
//! no leading separator; `""` is the remote root.

use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
    long_prefix: String,
    short_prefix: String,
}

impl PathMapper {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            long_prefix: platform::to_long_path(root),
            short_prefix: platform::to_short_path(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a local path under the root to its remote logical path.
    pub fn local_to_remote(&self, local: &Path) -> String {
        let p = platform::to_long_path(local);
        let p = p.strip_prefix(&self.short_prefix).unwrap_or(&p);
        let p = p.strip_prefix(&self.long_prefix).unwrap_or(p);
        let p = p.replace('\\', "/");
        p.trim_start_matches('/').to_string()
    }

    /// Map a remote logical path back under the local root.
    pub fn remote_to_local(&self, remote: &str) -> PathBuf {
        let p = remote.trim_start_matches('/');
        if p.is_empty() {
            return self.root.clone();
        }
        let mut local = self.root.clone();
        for part in p.split('/') {
            local.push(part);
        }
        local
    }

    /// Base name of a remote logical path.
    pub fn remote_file_name(remote: &str) -> &str {
        remote
            .trim_start_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }
}

#[cfg(target_os = "windows")]
mod platform {
    use std::path::Path;
    use windows::core::PCWSTR;
    use windows::Win32::Storage::FileSystem::{GetLongPathNameW, GetShortPathNameW};

    fn wide(p: &Path) -> Vec<u16> {
        use std::os::windows::ffi::OsStrExt;
        p.as_os_str().encode_wide().chain(std::iter::once(0)).collect()
    }

    pub fn to_long_path(p: &Path) -> String {
        let input = wide(p);
        let mut buf = vec![0u16; 512];
        let len =
            unsafe { GetLongPathNameW(PCWSTR::from_raw(input.as_ptr()), Some(&mut buf)) } as usize;
        if len == 0 || len > buf.len() {
            // conversion is best-effort; an unconvertible path passes through
            return p.to_string_lossy().into_owned();
        }
        String::from_utf16_lossy(&buf[..len])
    }

    pub fn to_short_path(p: &Path) -> String {
        let input = wide(p);
        let mut buf = vec![0u16; 512];
        let len =
            unsafe { GetShortPathNameW(PCWSTR::from_raw(input.as_ptr()), Some(&mut buf)) } as usize;
        if len == 0 || len > buf.len() {
            return p.to_string_lossy().into_owned();
        }
        String::from_utf16_lossy(&buf[..len])
    }
}

#[cfg(not(target_os = "windows"))]
mod platform {
    use std::path::Path;

    pub fn to_long_path(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }

    pub fn to_short_path(p: &Path) -> String {
        p.to_string_lossy().into_owned()
    }
}
