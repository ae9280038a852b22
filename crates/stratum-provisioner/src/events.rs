use std::time::Duration;

use serde::Serialize;
use stratum_core::ResourceStatus;
use tokio::sync::mpsc::UnboundedSender;

use crate::plan::Action;

/// Progress notifications for an external reporter. The engine never
/// renders these itself.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ApplyEvent {
    WaveStarted {
        index: usize,
        resources: Vec<String>,
    },
    /// The reconciler decided what to do with a resource.
    ActionChosen {
        resource: String,
        action: Action,
    },
    Transition {
        resource: String,
        from: ResourceStatus,
        to: ResourceStatus,
    },
    Retrying {
        resource: String,
        attempt: u32,
        #[serde(with = "millis")]
        delay: Duration,
        error: String,
    },
    WaitStrategy {
        resource: String,
        strategy: WaitStrategyKind,
    },
    /// Not attempted because a dependency is not Ready.
    Skipped {
        resource: String,
        blocked_by: String,
    },
    Cancelled {
        remaining_waves: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategyKind {
    Predicate,
    FixedDelay,
}

mod millis {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Optional event channel. Sending never blocks and a dropped receiver is
/// ignored; reporting must not influence the run.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<ApplyEvent>>,
}

impl EventSink {
    pub fn new(tx: UnboundedSender<ApplyEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: ApplyEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }

    pub(crate) fn transition(&self, resource: &str, from: ResourceStatus, to: ResourceStatus) {
        self.emit(ApplyEvent::Transition {
            resource: resource.to_string(),
            from,
            to,
        });
    }
}
