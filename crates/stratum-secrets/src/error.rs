use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecretError {
    /// A secret that already has versions was about to be regenerated or
    /// overwritten. Only an explicit rotation may add a version.
    #[error("secret {name} already exists; rotate it to add a version")]
    Conflict { name: String },

    #[error("secret not found: {name}")]
    NotFound { name: String },

    #[error("secret {name} has no version {version}")]
    VersionNotFound { name: String, version: u32 },

    #[error("invalid generation policy: {0}")]
    InvalidPolicy(String),

    #[error("secret store error: {0}")]
    Backend(String),
}
