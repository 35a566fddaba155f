//! Cross-process lock per cache key
//!
//! Two runs touching the same bootstrap/build tiers would race on the
//! transaction scratch directories, so every command takes an exclusive
//! `flock` on `<cache_root>/.locks/<bootstrap name>.lock` first. Distinct
//! keys never contend.

use crate::error::{MultipackError, MultipackResult};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Exclusive lock on one cache key, released on drop
#[derive(Debug)]
pub struct CacheLock {
    // kept open to hold the lock
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
}

impl CacheLock {
    /// Directory holding the lock files under the cache root
    pub const LOCK_DIR: &'static str = ".locks";

    /// Lock file path for a bootstrap tier name
    pub fn path_for(cache_root: &Path, name: &str) -> PathBuf {
        cache_root.join(Self::LOCK_DIR).join(format!("{}.lock", name))
    }

    fn open(path: &Path) -> MultipackResult<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MultipackError::CacheLock {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }
        File::create(path).map_err(|e| MultipackError::CacheLock {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Acquire the lock, blocking until the holder releases it
    pub fn acquire(path: impl AsRef<Path>) -> MultipackResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        file.lock_exclusive().map_err(|e| MultipackError::CacheLock {
            path: path.clone(),
            reason: e.to_string(),
        })?;

        info!("Acquired cache lock {}", path.display());
        Ok(Self { file, path })
    }

    /// Try to acquire the lock; `Ok(None)` when another process holds it
    pub fn try_acquire(path: impl AsRef<Path>) -> MultipackResult<Option<Self>> {
        let path = path.as_ref().to_path_buf();
        let file = Self::open(&path)?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!("Acquired cache lock {}", path.display());
                Ok(Some(Self { file, path }))
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("Cache lock {} already held", path.display());
                Ok(None)
            }
            Err(e) => Err(MultipackError::CacheLock {
                path,
                reason: e.to_string(),
            }),
        }
    }

    /// Blocking acquisition moved off the async runtime
    pub async fn acquire_async(path: PathBuf) -> MultipackResult<Self> {
        tokio::task::spawn_blocking(move || Self::acquire(path))
            .await
            .map_err(|e| MultipackError::Internal(format!("lock task failed: {}", e)))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
