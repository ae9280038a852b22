use thiserror::Error;

use crate::state::ResourceStatus;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown resource kind: {0}")]
    UnknownKind(String),

    #[error("invalid secret reference: {0}")]
    InvalidSecretRef(String),

    #[error("illegal status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ResourceStatus,
        to: ResourceStatus,
    },
}
