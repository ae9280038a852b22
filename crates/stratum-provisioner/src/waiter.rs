use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::config::WaitConfig;
use crate::error::ProviderError;
use crate::events::{ApplyEvent, EventSink, WaitStrategyKind};

/// How an eventually consistent resource was judged ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The provider's readiness check returned true.
    PredicateSatisfied { elapsed: Duration, polls: u32 },
    /// No readiness check exists; a fixed delay was slept instead. The
    /// resource is assumed, not known, to be ready.
    DelayElapsed { delay: Duration },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("not ready after {elapsed:?} ({polls} checks)")]
    Timeout { elapsed: Duration, polls: u32 },

    #[error("readiness check failed: {0}")]
    Check(ProviderError),
}

/// Poll `check` until it reports ready or the wait times out.
///
/// Checks run at t=0, after every `interval`, and once more at the
/// deadline itself (the last sleep is shortened to land on it). A false
/// result at the deadline check is a timeout. Transient check errors count
/// as not ready; permanent ones end the wait immediately. Each check is
/// bounded by one interval and by the time left until the deadline, so the
/// wait never overruns its timeout. The deadline check itself only gets
/// an answer that is ready on first poll.
///
/// With no check available the waiter sleeps `fallback_delay` and reports
/// [`WaitOutcome::DelayElapsed`].
pub async fn wait_until_ready<F, Fut>(
    resource: &str,
    check: Option<F>,
    config: &WaitConfig,
    events: &EventSink,
) -> Result<WaitOutcome, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, ProviderError>>,
{
    let Some(mut check) = check else {
        let delay = config.fallback_delay();
        events.emit(ApplyEvent::WaitStrategy {
            resource: resource.to_string(),
            strategy: WaitStrategyKind::FixedDelay,
        });
        tracing::warn!(
            resource,
            delay_secs = delay.as_secs(),
            "no readiness check available, falling back to fixed delay"
        );
        tokio::time::sleep(delay).await;
        return Ok(WaitOutcome::DelayElapsed { delay });
    };

    events.emit(ApplyEvent::WaitStrategy {
        resource: resource.to_string(),
        strategy: WaitStrategyKind::Predicate,
    });

    let interval = config.interval();
    let start = Instant::now();
    let deadline = start + config.timeout();
    let mut polls = 0u32;

    loop {
        polls += 1;
        let budget = interval.min(deadline.saturating_duration_since(Instant::now()));
        match tokio::time::timeout(budget, check()).await {
            Ok(Ok(true)) => {
                let elapsed = start.elapsed();
                tracing::debug!(resource, polls, elapsed_ms = elapsed.as_millis() as u64, "resource ready");
                return Ok(WaitOutcome::PredicateSatisfied { elapsed, polls });
            }
            Ok(Ok(false)) => {}
            Ok(Err(e)) if e.is_retryable() => {
                tracing::debug!(resource, error = %e, "readiness check failed transiently");
            }
            Ok(Err(e)) => return Err(WaitError::Check(e)),
            Err(_) => {
                tracing::debug!(
                    resource,
                    budget_ms = budget.as_millis() as u64,
                    "readiness check did not answer in time"
                );
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                elapsed: now - start,
                polls,
            });
        }
        tokio::time::sleep_until((now + interval).min(deadline)).await;
    }
}
