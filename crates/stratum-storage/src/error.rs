use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("state is locked by {holder} since {since}")]
    Locked { holder: String, since: String },

    #[error("state version {found} is newer than this build supports ({supported})")]
    VersionTooNew { found: u32, supported: u32 },

    #[error("malformed state file: {0}")]
    Malformed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
