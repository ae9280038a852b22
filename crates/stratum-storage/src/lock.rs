use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::error::StorageError;

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    holder: String,
    acquired_at: jiff::Timestamp,
}

/// Exclusive hold on a state directory.
///
/// Released explicitly with [`StateLock::release`] on the happy path; the
/// `Drop` impl removes the lock file on every other exit path. Either way
/// the file is only removed while it still names this holder: once another
/// run has taken over a stale lock, the file is theirs.
#[derive(Debug)]
pub struct StateLock {
    path: PathBuf,
    holder: String,
    released: bool,
}

impl StateLock {
    /// Take the lock at `path`, replacing a lock older than `stale_after`.
    pub(crate) async fn acquire(
        path: &Path,
        holder: &str,
        stale_after: Duration,
    ) -> Result<Self, StorageError> {
        match Self::try_create(path, holder).await {
            Ok(lock) => Ok(lock),
            Err(StorageError::Io(e)) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let existing = read_info(path).await?;
                let age_secs = jiff::Timestamp::now().as_second() - existing.acquired_at.as_second();
                if age_secs < stale_after.as_secs() as i64 {
                    return Err(StorageError::Locked {
                        holder: existing.holder,
                        since: existing.acquired_at.to_string(),
                    });
                }

                tracing::warn!(
                    holder = %existing.holder,
                    since = %existing.acquired_at,
                    "removing stale state lock"
                );
                fs::remove_file(path).await?;
                Self::try_create(path, holder).await
            }
            Err(e) => Err(e),
        }
    }

    async fn try_create(path: &Path, holder: &str) -> Result<Self, StorageError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await?;

        let info = LockInfo {
            holder: holder.to_string(),
            acquired_at: jiff::Timestamp::now(),
        };
        file.write_all(&serde_json::to_vec_pretty(&info)?).await?;
        file.flush().await?;

        tracing::debug!(path = %path.display(), holder = %holder, "acquired state lock");
        Ok(Self {
            path: path.to_path_buf(),
            holder: holder.to_string(),
            released: false,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub async fn release(mut self) -> Result<(), StorageError> {
        self.released = true;
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if !self.is_holder_in(&bytes) {
            tracing::warn!(
                path = %self.path.display(),
                holder = %self.holder,
                "state lock was taken over by another run, leaving it in place"
            );
            return Ok(());
        }
        match fs::remove_file(&self.path).await {
            Ok(()) => {
                tracing::debug!(path = %self.path.display(), "released state lock");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_holder_in(&self, bytes: &[u8]) -> bool {
        serde_json::from_slice::<LockInfo>(bytes).is_ok_and(|info| info.holder == self.holder)
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        // Synchronous: Drop cannot await.
        let ours = std::fs::read(&self.path).is_ok_and(|bytes| self.is_holder_in(&bytes));
        if ours {
            let _ = std::fs::remove_file(&self.path);
        } else {
            tracing::warn!(path = %self.path.display(), holder = %self.holder, "dropped state lock no longer ours");
        }
    }
}

async fn read_info(path: &Path) -> Result<LockInfo, StorageError> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| StorageError::Malformed(format!("lock file {}: {e}", path.display())))
}
