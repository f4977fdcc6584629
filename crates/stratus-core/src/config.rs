use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StratusError, StratusResult};

/// Top-level configuration (loaded from stratus.toml).
///
/// One entry per mounted root. The periodic driver that actually calls
/// `perform_synchronization` lives outside this workspace; `sync_interval_secs`
/// is carried here for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StratusConfig {
    pub mounts: Vec<MountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Stable mount identifier (also used for the sync root display identity)
    pub id: String,
    /// Local directory to register as the sync root
    pub local_root: PathBuf,
    /// Remote backend the root is projected from
    pub storage: StorageConfig,
    /// Interval between synchronization runs, for the external driver
    pub sync_interval_secs: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            local_root: PathBuf::new(),
            storage: StorageConfig::default(),
            sync_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// S3-compatible endpoint URL
    pub endpoint: String,
    /// Region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix within the bucket ("" = bucket root)
    pub prefix: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Refuse plaintext HTTP endpoints when set
    pub enforce_tls: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            region: "us-east-1".into(),
            bucket: String::new(),
            prefix: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            enforce_tls: false,
        }
    }
}

impl StratusConfig {
    pub fn load(path: &Path) -> StratusResult<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| StratusError::Config(format!("{}: {e}", path.display())))
    }

    pub fn save(&self, path: &Path) -> StratusResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| StratusError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = StratusConfig::default();
        assert!(cfg.mounts.is_empty());

        let mount = MountConfig::default();
        assert_eq!(mount.sync_interval_secs, 60);
        assert_eq!(mount.storage.region, "us-east-1");
    }

    #[test]
    fn roundtrip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.toml");

        let cfg = StratusConfig {
            mounts: vec![MountConfig {
                id: "docs".into(),
                local_root: PathBuf::from("/home/user/Stratus"),
                storage: StorageConfig {
                    endpoint: "http://localhost:8333".into(),
                    bucket: "docs".into(),
                    prefix: "mirror".into(),
                    ..Default::default()
                },
                sync_interval_secs: 30,
            }],
        };
        cfg.save(&path).unwrap();

        let loaded = StratusConfig::load(&path).unwrap();
        assert_eq!(loaded.mounts.len(), 1);
        assert_eq!(loaded.mounts[0].id, "docs");
        assert_eq!(loaded.mounts[0].sync_interval_secs, 30);
        assert_eq!(loaded.mounts[0].storage.bucket, "docs");
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stratus.toml");
        std::fs::write(
            &path,
            r#"
[[mounts]]
id = "photos"
local_root = "/data/photos"
"#,
        )
        .unwrap();

        let loaded = StratusConfig::load(&path).unwrap();
        assert_eq!(loaded.mounts[0].sync_interval_secs, 60);
        assert!(loaded.mounts[0].storage.endpoint.is_empty());
    }
}
