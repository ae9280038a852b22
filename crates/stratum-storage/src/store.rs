use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use crate::error::StorageError;
use crate::lock::StateLock;
use crate::snapshot::{Snapshot, SNAPSHOT_VERSION};

const STATE_FILE: &str = "state.json";
const STATE_TMP: &str = "state.json.tmp";
const STATE_BACKUP: &str = "state.json.backup";
const LOCK_FILE: &str = "state.lock";

/// Snapshot storage rooted at a state directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(STATE_BACKUP)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE)
    }

    /// Take the exclusive lock on this state directory.
    pub async fn lock(&self, holder: &str, stale_after: Duration) -> Result<StateLock, StorageError> {
        fs::create_dir_all(&self.dir).await?;
        StateLock::acquire(&self.lock_path(), holder, stale_after).await
    }

    /// Load the snapshot, or an empty one if none has been written yet.
    pub async fn load(&self) -> Result<Snapshot, StorageError> {
        let path = self.state_path();
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no existing state found, starting fresh");
                return Ok(Snapshot::default());
            }
            Err(e) => return Err(e.into()),
        };

        let snapshot = Snapshot::from_slice(&bytes)?;
        tracing::debug!(
            path = %path.display(),
            serial = snapshot.serial,
            resources = snapshot.resources.len(),
            "state loaded"
        );
        Ok(snapshot)
    }

    /// Write the snapshot atomically (tmp + rename), keeping the previous
    /// file as a backup. Stamps version, serial and timestamp.
    pub async fn save(&self, snapshot: &mut Snapshot) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;

        snapshot.version = SNAPSHOT_VERSION;
        snapshot.serial += 1;
        snapshot.updated_at = Some(jiff::Timestamp::now());

        let json = serde_json::to_vec_pretty(snapshot)?;
        let path = self.state_path();
        let tmp_path = self.dir.join(STATE_TMP);
        fs::write(&tmp_path, &json).await?;

        if fs::try_exists(&path).await? {
            fs::copy(&path, self.backup_path()).await?;
        }
        fs::rename(&tmp_path, &path).await?;

        tracing::debug!(
            path = %path.display(),
            serial = snapshot.serial,
            resources = snapshot.resources.len(),
            "state flushed to disk"
        );
        Ok(())
    }
}
