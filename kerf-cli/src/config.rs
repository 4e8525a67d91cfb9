//! Resolved runtime configuration: lock path, kernel pseudo-filesystem mount
//! point, and lock-acquisition retry/backoff. Loadable from an optional TOML
//! file and overridable by environment variables, in the shape of the
//! workspace's other `serde::Deserialize` + `Default` config structs.

use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Resolved `kerf` configuration after merging defaults, an optional TOML
/// file, and environment variable overrides.
#[derive(Debug, Clone)]
pub struct KerfConfig {
    /// Mount point of the `multikernel` pseudo-filesystem.
    pub mount_point: PathBuf,
    /// Primary host-wide lock path.
    pub lock_path: PathBuf,
    /// Fallback lock path, used when the primary can't be opened.
    pub fallback_lock_path: PathBuf,
}

impl Default for KerfConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/sys/fs/multikernel"),
            lock_path: PathBuf::from(kerf_runtime::PRIMARY_LOCK_PATH),
            fallback_lock_path: PathBuf::from(kerf_runtime::FALLBACK_LOCK_PATH),
        }
    }
}

/// On-disk TOML shape; every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    mount_point: Option<PathBuf>,
    lock_path: Option<PathBuf>,
    fallback_lock_path: Option<PathBuf>,
}

impl KerfConfig {
    /// Builds the resolved configuration: defaults, then an optional TOML
    /// file at `path`, then `KERF_*` environment variable overrides, then
    /// the two CLI-flag overrides `cli_mount_point`/`cli_config` already
    /// parsed out of global arguments.
    pub fn resolve(path: Option<&Path>, cli_mount_point: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("reading config file {path:?}: {e}"))?;
            let file: FileConfig = toml::from_str(&text)
                .map_err(|e| anyhow::anyhow!("parsing config file {path:?}: {e}"))?;
            if let Some(mount_point) = file.mount_point {
                config.mount_point = mount_point;
            }
            if let Some(lock_path) = file.lock_path {
                config.lock_path = lock_path;
            }
            if let Some(fallback_lock_path) = file.fallback_lock_path {
                config.fallback_lock_path = fallback_lock_path;
            }
        }

        if let Ok(value) = std::env::var("KERF_MOUNT_POINT") {
            config.mount_point = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("KERF_LOCK_PATH") {
            config.lock_path = PathBuf::from(value);
        }
        if let Ok(value) = std::env::var("KERF_FALLBACK_LOCK_PATH") {
            config.fallback_lock_path = PathBuf::from(value);
        }

        if let Some(mount_point) = cli_mount_point {
            config.mount_point = mount_point.to_path_buf();
        }

        Ok(config)
    }
}
