use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::kind::ResourceKind;
use crate::value::Observed;

/// Lifecycle status of a resource within one apply run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Not yet attempted. Resources blocked by a failed dependency stay here.
    Pending,
    /// A create or update call is in flight.
    Creating,
    /// Created, waiting for the backend to become consistent.
    Waiting,
    Ready,
    Failed,
    Destroying,
    Destroyed,
}

impl ResourceStatus {
    /// Transitions allowed within a single run. Ready, Failed and Destroyed
    /// are terminal; nothing regresses to an earlier stage.
    pub fn can_transition_to(self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        matches!(
            (self, next),
            (Pending, Creating)
                | (Pending, Destroying)
                | (Pending, Ready)
                | (Pending, Failed)
                | (Creating, Waiting)
                | (Creating, Ready)
                | (Creating, Failed)
                | (Waiting, Ready)
                | (Waiting, Failed)
                | (Destroying, Destroyed)
                | (Destroying, Creating)
                | (Destroying, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ResourceStatus::Ready | ResourceStatus::Failed | ResourceStatus::Destroyed
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Creating => "creating",
            ResourceStatus::Waiting => "waiting",
            ResourceStatus::Ready => "ready",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Destroying => "destroying",
            ResourceStatus::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Why a resource ended up Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Provider rejected the request (bad config, quota, authorization).
    Permanent,
    /// Transient provider errors outlasted the retry budget.
    RetriesExhausted,
    /// The provider operation exceeded its deadline.
    OperationTimeout,
    /// The readiness predicate never held within the wait timeout.
    ConsistencyTimeout,
    /// A secret would have been overwritten without an explicit rotation.
    SecretConflict,
    /// Secret store failure other than a conflict.
    Secret,
    /// A desired attribute could not be resolved from its dependencies.
    Resolution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceError {
    pub kind: FailureKind,
    pub message: String,
    pub at: jiff::Timestamp,
}

impl ResourceError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: jiff::Timestamp::now(),
        }
    }
}

impl fmt::Display for ResourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Per-run state of one resource. Mutated only by the reconciler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub id: String,
    pub kind: ResourceKind,
    pub status: ResourceStatus,
    /// Populated once Ready. A Failed resource keeps whatever was last
    /// observed so the failure can be diagnosed.
    #[serde(default)]
    pub observed: Observed,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<ResourceError>,
}

impl ResourceState {
    pub fn pending(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            status: ResourceStatus::Pending,
            observed: Observed::new(),
            last_error: None,
        }
    }

    /// Move to `next`, rejecting transitions that would break monotonicity.
    pub fn transition(&mut self, next: ResourceStatus) -> Result<ResourceStatus, CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        let prev = self.status;
        self.status = next;
        Ok(prev)
    }

    pub fn is_ready(&self) -> bool {
        self.status == ResourceStatus::Ready
    }

    /// Pending at the end of a run means the resource was never attempted.
    pub fn was_attempted(&self) -> bool {
        self.status != ResourceStatus::Pending
    }
}
