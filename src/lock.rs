//! Host-wide single-flight guard for runtime reconfiguration.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::io::AsyncWriteExt;

use crate::error::{BootstrapError, Result};

/// Exclusive lock file holding the owner's pid. Released on drop.
#[derive(Debug)]
pub struct ApplyLock {
    path: PathBuf,
}

impl ApplyLock {
    /// Take the lock, reclaiming it if the recorded owner is gone.
    pub async fn acquire(path: &Path) -> Result<Self> {
        match Self::create(path).await {
            Err(BootstrapError::Busy { pid, .. }) if !process_alive(&pid) => {
                warn!("Reclaiming stale lock {} from pid {}", path.display(), pid);
                tokio::fs::remove_file(path)
                    .await
                    .map_err(|e| BootstrapError::io("remove stale lock", path, e))?;
                Self::create(path).await
            }
            other => other,
        }
    }

    async fn create(path: &Path) -> Result<Self> {
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await;

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let pid = tokio::fs::read_to_string(path)
                    .await
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                return Err(BootstrapError::Busy {
                    path: path.to_path_buf(),
                    pid,
                });
            }
            Err(e) => return Err(BootstrapError::io("create lock", path, e)),
        };

        file.write_all(std::process::id().to_string().as_bytes())
            .await
            .map_err(|e| BootstrapError::io("write lock", path, e))?;
        file.flush()
            .await
            .map_err(|e| BootstrapError::io("write lock", path, e))?;
        debug!("Acquired {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
        })
    }
}

impl Drop for ApplyLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("Failed to release lock {}: {}", self.path.display(), e);
        }
    }
}

/// An empty or unparsable pid is treated as a live owner; only a pid with
/// no `/proc` entry is considered gone.
fn process_alive(pid: &str) -> bool {
    match pid.parse::<u32>() {
        Ok(pid) => Path::new("/proc").join(pid.to_string()).exists(),
        Err(_) => true,
    }
}
