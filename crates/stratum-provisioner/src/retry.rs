use std::future::Future;
use std::time::Duration;

use stratum_core::{FailureKind, ResourceError};
use thiserror::Error;

use crate::config::RetryConfig;
use crate::error::ProviderError;
use crate::events::{ApplyEvent, EventSink};

/// Why a provider operation gave up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OperationError {
    #[error("{0}")]
    Permanent(ProviderError),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: ProviderError },

    #[error("operation did not finish within {0:?}")]
    Timeout(Duration),
}

impl OperationError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            OperationError::Permanent(_) => FailureKind::Permanent,
            OperationError::RetriesExhausted { .. } => FailureKind::RetriesExhausted,
            OperationError::Timeout(_) => FailureKind::OperationTimeout,
        }
    }

    pub fn into_resource_error(self, op: &str) -> ResourceError {
        ResourceError::new(self.failure_kind(), format!("{op}: {self}"))
    }
}

/// Run one provider operation with bounded exponential backoff.
///
/// Only transient errors are retried. The whole sequence, backoff sleeps
/// included, must finish within `deadline`.
pub async fn with_retry<T, F, Fut>(
    resource: &str,
    op: &str,
    retry: &RetryConfig,
    deadline: Duration,
    events: &EventSink,
    mut call: F,
) -> Result<T, OperationError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
{
    let attempts = async {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => {
                    tracing::warn!(resource, op, error = %e, "provider rejected request");
                    return Err(OperationError::Permanent(e));
                }
                Err(e) if attempt >= retry.max_attempts => {
                    tracing::warn!(resource, op, attempts = attempt, error = %e, "retries exhausted");
                    return Err(OperationError::RetriesExhausted {
                        attempts: attempt,
                        last: e,
                    });
                }
                Err(e) => {
                    let delay = retry.delay_for_attempt(attempt - 1);
                    tracing::warn!(
                        resource,
                        op,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient provider error, retrying"
                    );
                    events.emit(ApplyEvent::Retrying {
                        resource: resource.to_string(),
                        attempt,
                        delay,
                        error: e.to_string(),
                    });
                    tokio::time::sleep(delay).await;
                }
            }
        }
    };

    match tokio::time::timeout(deadline, attempts).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(resource, op, deadline_secs = deadline.as_secs(), "operation timed out");
            Err(OperationError::Timeout(deadline))
        }
    }
}
