use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use stratum_core::ResourceKind;

/// What the reconciler will do with a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    NoOp,
    Create,
    Update,
    /// Destroy followed by Create, required when an immutable attribute
    /// changes. Both halves run in the resource's own slot.
    Replace,
    Destroy,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::NoOp => "no-op",
            Action::Create => "create",
            Action::Update => "update",
            Action::Replace => "replace",
            Action::Destroy => "destroy",
        };
        f.write_str(s)
    }
}

/// Why an action was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    InSync,
    /// Never applied before.
    FirstProvision,
    /// The desired spec differs from what was last applied.
    SpecChanged,
    /// The live resource differs from what was last applied.
    Drift,
    /// Tracked in state but gone from the provider.
    Missing,
    /// A previous run left the resource half-provisioned.
    Tainted,
    /// The identifier now names a resource of a different kind.
    KindChanged,
    /// In state but no longer in the graph.
    Orphaned,
}

/// Structured before/after for one attribute that doesn't match desired
/// state. Secret-typed values appear only as `name@version` tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDrift {
    pub field: String,
    pub expected: Value,
    pub actual: Value,
    /// Changing this field forces a replacement.
    pub immutable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub resource_id: String,
    pub kind: ResourceKind,
    pub action: Action,
    pub cause: Cause,
    pub drift: Vec<FieldDrift>,
    /// Desired attributes as they will be sent. Secrets appear as
    /// `name@version` (`name@pending` before generation); values produced
    /// by resources not yet created appear as `(known after apply)`.
    pub attributes: BTreeMap<String, Value>,
    /// Scheduler wave; `None` for orphans, which run after every wave.
    pub wave: Option<usize>,
}

/// Ordered actions needed to reach desired state: graph resources in wave
/// order, then orphans dependents-first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

impl Plan {
    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action != Action::NoOp)
    }

    pub fn entry(&self, resource_id: &str) -> Option<&PlanEntry> {
        self.entries.iter().find(|e| e.resource_id == resource_id)
    }

    pub fn action_for(&self, resource_id: &str) -> Option<Action> {
        self.entry(resource_id).map(|e| e.action)
    }

    pub fn by_action(&self, action: Action) -> impl Iterator<Item = &PlanEntry> {
        self.entries.iter().filter(move |e| e.action == action)
    }

    pub fn summary(&self) -> PlanSummary {
        let count = |a| self.by_action(a).count();
        PlanSummary {
            create: count(Action::Create),
            update: count(Action::Update),
            replace: count(Action::Replace),
            destroy: count(Action::Destroy),
            unchanged: count(Action::NoOp),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub replace: usize,
    pub destroy: usize,
    pub unchanged: usize,
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to replace, {} to destroy, {} unchanged",
            self.create, self.update, self.replace, self.destroy, self.unchanged
        )
    }
}
