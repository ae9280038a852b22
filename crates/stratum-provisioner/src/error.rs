use thiserror::Error;

/// Structural problems in the graph input. Raised before any provider call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("duplicate resource id: {0}")]
    DuplicateId(String),

    #[error("{resource} depends on undeclared resource {dependency}")]
    DanglingDependency { resource: String, dependency: String },

    #[error("{resource}.{key} references {target}.{attribute}, which a {kind} does not produce")]
    UnknownAttribute {
        resource: String,
        key: String,
        target: String,
        kind: String,
        attribute: String,
    },

    #[error("{resource} references secret {secret}, which no secret-version resource manages")]
    UnknownSecret { resource: String, secret: String },

    #[error("secret {secret} is managed by both {first} and {second}")]
    DuplicateSecret {
        secret: String,
        first: String,
        second: String,
    },

    #[error("{resource}: {reason}")]
    InvalidSpec { resource: String, reason: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Failure reported by a provider client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Rate limiting, temporary unavailability. Retried with backoff.
    #[error("transient provider error: {0}")]
    Transient(String),

    /// Bad configuration, quota, or authorization. Never retried.
    #[error("{class} error: {message}")]
    Permanent {
        class: PermanentClass,
        message: String,
    },
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient(message.into())
    }

    pub fn permanent(class: PermanentClass, message: impl Into<String>) -> Self {
        ProviderError::Permanent {
            class,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermanentClass {
    InvalidConfig,
    Quota,
    Unauthorized,
    Other,
}

impl std::fmt::Display for PermanentClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PermanentClass::InvalidConfig => "invalid configuration",
            PermanentClass::Quota => "quota",
            PermanentClass::Unauthorized => "authorization",
            PermanentClass::Other => "provider",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum ProvisionerError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// An engine invariant did not hold. Indicates a bug, not bad input.
    #[error("internal invariant violated: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state error: {0}")]
    Storage(#[from] stratum_storage::StorageError),

    #[error("secret error: {0}")]
    Secret(#[from] stratum_secrets::SecretError),

    #[error(transparent)]
    Core(#[from] stratum_core::CoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Walk the full error chain and join all causes into one string.
pub fn format_err_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}
